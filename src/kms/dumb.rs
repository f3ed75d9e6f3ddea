//! CPU-mappable dumb framebuffers
//!
//! Release order is always unmap, remove framebuffer, destroy the GEM object.

use std::os::fd::{AsFd, AsRawFd};

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{framebuffer, Device as ControlDevice};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use super::Card;
use crate::error::{Error, Result};

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_map_dumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

nix::ioctl_readwrite!(drm_ioctl_mode_map_dumb, b'd', 0xB3, drm_mode_map_dumb);

/// A dumb buffer registered as a framebuffer and mapped into our address space
///
/// Any partially created state is released on drop, so an early `?` during
/// creation never leaks kernel objects.
pub struct DumbFb {
    card: Card,
    buffer: Option<DumbBuffer>,
    fb: Option<framebuffer::Handle>,
    map: Option<MmapMut>,
    width: u32,
    height: u32,
    pitch: u32,
}

impl std::fmt::Debug for DumbFb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumbFb")
            .field("fb", &self.fb)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

impl DumbFb {
    /// ARGB8888 buffer for overlays
    pub fn create_argb(card: &Card, width: u32, height: u32, fill_argb: u32) -> Result<Self> {
        Self::create(card, width, height, DrmFourcc::Argb8888, 32, fill_argb)
    }

    /// XRGB8888 buffer, used for the solid filler on the video plane
    pub fn create_xrgb(card: &Card, width: u32, height: u32, fill_xrgb: u32) -> Result<Self> {
        Self::create(card, width, height, DrmFourcc::Xrgb8888, 24, fill_xrgb)
    }

    fn create(
        card: &Card,
        width: u32,
        height: u32,
        format: DrmFourcc,
        depth: u32,
        fill: u32,
    ) -> Result<Self> {
        let buffer = card
            .create_dumb_buffer((width, height), format, 32)
            .map_err(Error::FramebufferCreationFailed)?;
        let pitch = buffer.pitch();

        let mut dumb = DumbFb {
            card: card.clone(),
            buffer: Some(buffer),
            fb: None,
            map: None,
            width,
            height,
            pitch,
        };

        let Some(buffer) = dumb.buffer.as_ref() else {
            return Err(Error::FramebufferCreationFailed(std::io::Error::other(
                "dumb buffer vanished",
            )));
        };
        let fb = card.add_framebuffer(buffer, depth, 32).map_err(|e| {
            debug!("AddFB {:?} {}x{} failed: {}", format, width, height, e);
            match format {
                DrmFourcc::Argb8888 => Error::UnsupportedFormat("ARGB8888"),
                _ => Error::FramebufferCreationFailed(e),
            }
        })?;
        dumb.fb = Some(fb);

        let mut req = drm_mode_map_dumb {
            handle: u32::from(buffer.handle()),
            ..Default::default()
        };
        unsafe { drm_ioctl_mode_map_dumb(card.as_fd().as_raw_fd(), &mut req) }
            .map_err(|e| Error::FramebufferCreationFailed(e.into()))?;

        let len = pitch as usize * height as usize;
        let map = unsafe {
            MmapOptions::new()
                .offset(req.offset)
                .len(len)
                .map_mut(card.file())
        }
        .map_err(Error::FramebufferCreationFailed)?;
        dumb.map = Some(map);

        dumb.fill(fill);
        Ok(dumb)
    }

    /// Store `argb` into every pixel word of the mapping
    pub fn fill(&mut self, argb: u32) {
        if let Some(map) = self.map.as_mut() {
            fill_words(map, argb);
        }
    }

    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.fb
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Mapped pixels, empty once destroyed
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match self.map.as_mut() {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Release everything; calling this again is a no-op
    pub fn destroy(&mut self) {
        drop(self.map.take());
        if let Some(fb) = self.fb.take() {
            if let Err(e) = self.card.destroy_framebuffer(fb) {
                warn!("RMFB failed: {}", e);
            }
        }
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.card.destroy_dumb_buffer(buffer) {
                warn!("Destroy dumb buffer failed: {}", e);
            }
        }
    }
}

impl Drop for DumbFb {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub(crate) fn fill_words(buf: &mut [u8], word: u32) {
    let bytes = word.to_le_bytes();
    for px in buf.chunks_exact_mut(4) {
        px.copy_from_slice(&bytes);
    }
}
