//! Plane discovery: video plane, primary plane and the overlay picker

use drm::buffer::DrmFourcc;
use drm::control::atomic::AtomicModeReq;
use drm::control::{
    crtc, plane, AtomicCommitFlags, Device as ControlDevice, ResourceHandles,
};
use tracing::{debug, info, warn};

use super::props::{PlaneKind, PlaneProps, PropertySet};
use super::{Card, DumbFb};
use crate::error::{Error, Result};

/// Probe framebuffer size for overlay test commits
const PROBE_SIZE: (u32, u32) = (64, 32);
const PROBE_FILL: u32 = 0x80FF_FFFF;

/// What we learnt about one plane
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub handle: plane::Handle,
    pub kind: PlaneKind,
    /// The plane can scan out to the CRTC in question
    pub on_crtc: bool,
    pub formats: Vec<u32>,
    pub zpos: Option<(u64, u64)>,
}

impl PlaneInfo {
    pub fn id(&self) -> u32 {
        u32::from(self.handle)
    }

    fn supports(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&(format as u32))
    }
}

/// Enumerate planes along with their type, formats and zpos range
pub fn enumerate(card: &Card, res: &ResourceHandles, crtc: crtc::Handle) -> Result<Vec<PlaneInfo>> {
    let mut planes = Vec::new();
    for handle in card.plane_handles()? {
        let info = match card.get_plane(handle) {
            Ok(info) => info,
            Err(e) => {
                debug!("GetPlane {} failed: {}", u32::from(handle), e);
                continue;
            }
        };
        let props = PropertySet::query(card, handle, "plane")?;
        planes.push(PlaneInfo {
            handle,
            kind: props
                .value("type")
                .map(PlaneKind::from_raw)
                .unwrap_or(PlaneKind::Unknown),
            on_crtc: res.filter_crtcs(info.possible_crtcs()).contains(&crtc),
            formats: info.formats().to_vec(),
            zpos: props
                .lookup_range("zpos")
                .ok()
                .flatten()
                .map(|(_, min, max)| (min, max)),
        });
    }
    Ok(planes)
}

/// Score a plane for NV12 video; `None` if it cannot carry video on this CRTC
fn video_score(plane: &PlaneInfo) -> Option<u32> {
    if !plane.on_crtc || !plane.supports(DrmFourcc::Nv12) {
        return None;
    }
    let kind = match plane.kind {
        PlaneKind::Primary => 200,
        PlaneKind::Overlay => 100,
        _ => 0,
    };
    Some(kind + plane.formats.len() as u32)
}

/// Choose the video plane
///
/// A usable `preferred` plane is taken as is. Otherwise the best NV12 plane wins,
/// staying off `avoid` (a forced overlay plane) unless nothing else fits.
pub fn choose_video_plane(
    planes: &[PlaneInfo],
    preferred: u32,
    avoid: u32,
) -> Option<plane::Handle> {
    if preferred != 0 {
        match planes.iter().find(|p| p.id() == preferred) {
            Some(p) if video_score(p).is_some() => return Some(p.handle),
            _ => warn!("Video plane {} cannot carry NV12 on this CRTC, auto-selecting", preferred),
        }
    }
    for allow_avoided in [false, true] {
        let mut best: Option<(u32, plane::Handle)> = None;
        for p in planes {
            if !allow_avoided && avoid != 0 && p.id() == avoid {
                continue;
            }
            if let Some(score) = video_score(p) {
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, p.handle));
                }
            }
        }
        if let Some((_, handle)) = best {
            return Some(handle);
        }
    }
    None
}

/// Primary plane of the CRTC, other than `exclude`
pub fn find_primary(planes: &[PlaneInfo], exclude: plane::Handle) -> Option<plane::Handle> {
    planes
        .iter()
        .find(|p| p.on_crtc && p.kind == PlaneKind::Primary && p.handle != exclude)
        .map(|p| p.handle)
}

/// Overlay candidate rank: zpos capability dominates, overlays edge out primaries
fn overlay_score(plane: &PlaneInfo) -> u64 {
    let mut score = 0;
    if let Some((_, zmax)) = plane.zpos {
        score += 100 + zmax;
    }
    if plane.kind == PlaneKind::Overlay {
        score += 1;
    }
    score
}

/// Pick the highest-scoring plane among those that passed the probe; first wins ties
pub fn choose_overlay<'a>(
    candidates: impl IntoIterator<Item = &'a PlaneInfo>,
) -> Option<&'a PlaneInfo> {
    let mut best: Option<(&PlaneInfo, u64)> = None;
    for plane in candidates {
        let score = overlay_score(plane);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((plane, score));
        }
    }
    best.map(|(plane, _)| plane)
}

/// Whether the plane is even worth probing for the overlay
fn overlay_candidate(plane: &PlaneInfo, avoid: plane::Handle) -> bool {
    plane.on_crtc && plane.handle != avoid && plane.kind != PlaneKind::Cursor
}

/// TEST_ONLY commit of a small ARGB framebuffer stretched over the mode
pub fn probe_argb(
    card: &Card,
    plane: plane::Handle,
    crtc: crtc::Handle,
    mode_size: (u32, u32),
) -> Result<()> {
    let props = PlaneProps::resolve(&PropertySet::query(card, plane, "plane")?)?;
    let fb = DumbFb::create_argb(card, PROBE_SIZE.0, PROBE_SIZE.1, PROBE_FILL)?;
    let Some(fb_handle) = fb.framebuffer() else {
        return Err(Error::UnsupportedFormat("ARGB8888"));
    };
    let mut req = AtomicModeReq::new();
    props.attach(&mut req, plane, fb_handle, crtc, PROBE_SIZE, mode_size);
    card.atomic_commit(AtomicCommitFlags::TEST_ONLY, req)
        .map_err(Error::CommitRejected)
}

/// Select the overlay plane, returning it with its zpos maximum
///
/// A non-zero `requested` plane is validated first; if it is rejected the picker
/// falls back to automatic selection with a warning.
pub fn pick_osd_plane(
    card: &Card,
    crtc: crtc::Handle,
    avoid: plane::Handle,
    requested: u32,
    mode_size: (u32, u32),
) -> Result<(plane::Handle, u64)> {
    let res = card.resource_handles()?;
    let planes = enumerate(card, &res, crtc)?;
    let zmax = |p: &PlaneInfo| p.zpos.map(|(_, max)| max).unwrap_or(0);

    if requested != 0 {
        match planes.iter().find(|p| p.id() == requested) {
            Some(p) if p.kind == PlaneKind::Cursor => {
                warn!("OSD plane {} is a cursor plane, auto-selecting", requested)
            }
            Some(p) => match probe_argb(card, p.handle, crtc, mode_size) {
                Ok(()) => {
                    info!("OSD using requested plane {}", requested);
                    return Ok((p.handle, zmax(p)));
                }
                Err(e) => warn!("OSD plane {} rejected ARGB probe ({}), auto-selecting", requested, e),
            },
            None => warn!("OSD plane {} not found, auto-selecting", requested),
        }
    }

    let mut passed = Vec::new();
    for plane in planes.iter().filter(|p| overlay_candidate(p, avoid)) {
        match probe_argb(card, plane.handle, crtc, mode_size) {
            Ok(()) => passed.push(plane),
            Err(e) => debug!("Plane {} failed overlay probe: {}", plane.id(), e),
        }
    }

    let chosen = choose_overlay(passed).ok_or(Error::NoSuitablePlane)?;
    info!(
        "OSD auto-selected plane {} ({:?}, zpos max {})",
        chosen.id(),
        chosen.kind,
        zmax(chosen)
    );
    Ok((chosen.handle, zmax(chosen)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(id: u32, kind: PlaneKind, on_crtc: bool, formats: &[DrmFourcc], zpos: Option<(u64, u64)>) -> PlaneInfo {
        PlaneInfo {
            handle: drm::control::from_u32(id).unwrap(),
            kind,
            on_crtc,
            formats: formats.iter().map(|f| *f as u32).collect(),
            zpos,
        }
    }

    #[test]
    fn test_video_plane_prefers_primary_with_nv12() {
        let planes = [
            plane(31, PlaneKind::Overlay, true, &[DrmFourcc::Nv12, DrmFourcc::Argb8888, DrmFourcc::Xrgb8888], None),
            plane(41, PlaneKind::Primary, true, &[DrmFourcc::Nv12], None),
            plane(51, PlaneKind::Cursor, true, &[DrmFourcc::Argb8888], None),
        ];
        assert_eq!(choose_video_plane(&planes, 0, 0).map(u32::from), Some(41));
    }

    #[test]
    fn test_video_plane_respects_crtc_and_format() {
        let planes = [
            plane(31, PlaneKind::Primary, false, &[DrmFourcc::Nv12], None),
            plane(41, PlaneKind::Primary, true, &[DrmFourcc::Xrgb8888], None),
            plane(51, PlaneKind::Overlay, true, &[DrmFourcc::Nv12], None),
        ];
        assert_eq!(choose_video_plane(&planes, 0, 0).map(u32::from), Some(51));
        assert_eq!(choose_video_plane(&planes[..2], 0, 0), None);
    }

    #[test]
    fn test_video_plane_avoids_overlay_until_last_resort() {
        let planes = [
            plane(41, PlaneKind::Primary, true, &[DrmFourcc::Nv12], None),
            plane(51, PlaneKind::Overlay, true, &[DrmFourcc::Nv12], None),
        ];
        assert_eq!(choose_video_plane(&planes, 0, 41).map(u32::from), Some(51));
        assert_eq!(choose_video_plane(&planes[..1], 0, 41).map(u32::from), Some(41));
    }

    #[test]
    fn test_video_plane_preferred_and_fallback() {
        let planes = [
            plane(41, PlaneKind::Primary, true, &[DrmFourcc::Nv12], None),
            plane(51, PlaneKind::Overlay, true, &[DrmFourcc::Nv12], None),
            plane(61, PlaneKind::Overlay, true, &[DrmFourcc::Argb8888], None),
        ];
        assert_eq!(choose_video_plane(&planes, 51, 0).map(u32::from), Some(51));
        assert_eq!(choose_video_plane(&planes, 61, 0).map(u32::from), Some(41));
        assert_eq!(choose_video_plane(&planes, 99, 0).map(u32::from), Some(41));
    }

    #[test]
    fn test_overlay_score_prefers_zpos() {
        let primary = plane(41, PlaneKind::Primary, true, &[], Some((0, 2)));
        let overlay = plane(51, PlaneKind::Overlay, true, &[], None);
        let high = plane(61, PlaneKind::Overlay, true, &[], Some((0, 5)));
        assert_eq!(overlay_score(&primary), 102);
        assert_eq!(overlay_score(&overlay), 1);
        assert_eq!(overlay_score(&high), 106);
        let chosen = choose_overlay([&overlay, &primary, &high]).unwrap();
        assert_eq!(chosen.id(), 61);
    }

    #[test]
    fn test_overlay_ties_keep_first() {
        let a = plane(51, PlaneKind::Overlay, true, &[], Some((0, 3)));
        let b = plane(52, PlaneKind::Overlay, true, &[], Some((0, 3)));
        assert_eq!(choose_overlay([&a, &b]).unwrap().id(), 51);
        assert!(choose_overlay(std::iter::empty()).is_none());
    }

    #[test]
    fn test_overlay_candidates_exclude_cursor_and_video() {
        let video = drm::control::from_u32::<plane::Handle>(41).unwrap();
        assert!(!overlay_candidate(&plane(41, PlaneKind::Primary, true, &[], None), video));
        assert!(!overlay_candidate(&plane(71, PlaneKind::Cursor, true, &[], None), video));
        assert!(!overlay_candidate(&plane(51, PlaneKind::Overlay, false, &[], None), video));
        assert!(overlay_candidate(&plane(51, PlaneKind::Overlay, true, &[], None), video));
    }

    #[test]
    fn test_find_primary_skips_video_plane() {
        let planes = [
            plane(41, PlaneKind::Primary, true, &[DrmFourcc::Nv12], None),
            plane(42, PlaneKind::Primary, false, &[], None),
        ];
        let h41 = planes[0].handle;
        assert_eq!(find_primary(&planes, h41), None);
        let other: plane::Handle = drm::control::from_u32(51).unwrap();
        assert_eq!(find_primary(&planes, other), Some(h41));
    }
}
