//! Connector/mode selection and the atomic modeset commit

use std::io;
use std::thread;
use std::time::Duration;

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice,
    Mode, ResourceHandles,
};
use tracing::{debug, info, warn};

use super::modes::{best_mode, connector_name, ModeInfo};
use super::planes;
use super::props::{PlaneProps, PropertySet};
use super::{Card, DumbFb};
use crate::error::{Error, Result};

/// Solid blue shown on the video plane until the decoder takes over
const FILLER_XRGB: u32 = 0x0000_00FF;

/// Connector, CRTC and mode chosen for the next commit
#[derive(Debug, Clone)]
pub struct Selection {
    pub connector: connector::Handle,
    pub connector_name: String,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    pub info: ModeInfo,
}

/// Outcome of a successful modeset
#[derive(Debug, Clone)]
pub struct ModesetResult {
    pub connector: connector::Handle,
    pub connector_name: String,
    pub crtc: crtc::Handle,
    pub video_plane: plane::Handle,
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

impl ModesetResult {
    pub fn connector_id(&self) -> u32 {
        u32::from(self.connector)
    }

    pub fn crtc_id(&self) -> u32 {
        u32::from(self.crtc)
    }

    pub fn video_plane_id(&self) -> u32 {
        u32::from(self.video_plane)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModesetOptions {
    /// Configured video plane, 0 for automatic
    pub video_plane: u32,
    /// Detach the CRTC's primary plane in the same commit
    pub blank_primary: bool,
    /// Keep the top zpos slot free for the overlay
    pub pre_reserve_osd: bool,
    /// Forced overlay plane, 0 for automatic
    pub osd_plane: u32,
    /// How long the blue filler stays up after the commit
    pub blue_hold: Duration,
}

/// Mode blob that lives for exactly one commit
struct ModeBlob<'a> {
    card: &'a Card,
    id: u64,
}

impl<'a> ModeBlob<'a> {
    fn create(card: &'a Card, mode: &Mode) -> Result<Self> {
        match card.create_property_blob(mode) {
            Ok(property::Value::Blob(id)) => Ok(Self { card, id }),
            Ok(other) => Err(Error::BlobCreationFailed(io::Error::other(format!(
                "unexpected blob value {:?}",
                other
            )))),
            Err(e) => Err(Error::BlobCreationFailed(e)),
        }
    }

    fn value(&self) -> property::Value<'static> {
        property::Value::Blob(self.id)
    }
}

impl Drop for ModeBlob<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.card.destroy_property_blob(self.id) {
            warn!("Destroy mode blob {} failed: {}", self.id, e);
        }
    }
}

fn name_matches(info: &connector::Info, wanted: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(name) => connector_name(info.interface(), info.interface_id()) == name,
    }
}

/// Connected connectors with at least one mode, optionally filtered by name
fn connected(card: &Card, res: &ResourceHandles, wanted: Option<&str>) -> Vec<connector::Info> {
    res.connectors()
        .iter()
        .filter_map(|&handle| match card.get_connector(handle, true) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("GetConnector {} failed: {}", u32::from(handle), e);
                None
            }
        })
        .filter(|info| {
            info.state() == connector::State::Connected
                && !info.modes().is_empty()
                && name_matches(info, wanted)
        })
        .collect()
}

/// Whether any matching display is plugged in
pub fn is_any_connected(card: &Card, wanted: Option<&str>) -> bool {
    match card.resource_handles() {
        Ok(res) => !connected(card, &res, wanted).is_empty(),
        Err(e) => {
            warn!("GetResources failed: {}", e);
            false
        }
    }
}

fn resolve_crtc(card: &Card, res: &ResourceHandles, info: &connector::Info) -> Option<crtc::Handle> {
    if let Some(crtc) = info
        .current_encoder()
        .and_then(|enc| card.get_encoder(enc).ok())
        .and_then(|enc| enc.crtc())
    {
        return Some(crtc);
    }
    info.encoders()
        .iter()
        .filter_map(|&enc| card.get_encoder(enc).ok())
        .find_map(|enc| res.filter_crtcs(enc.possible_crtcs()).first().copied())
}

/// Pick connector, best mode and CRTC
pub fn select(card: &Card, wanted: Option<&str>) -> Result<Selection> {
    card.enable_atomic();
    let res = card.resource_handles()?;

    let Some(conn) = connected(card, &res, wanted).into_iter().next() else {
        return Err(Error::NoConnectedSink);
    };

    let modes: Vec<ModeInfo> = conn.modes().iter().map(ModeInfo::from_drm).collect();
    let best = best_mode(&modes).ok_or(Error::NoConnectedSink)?;
    let crtc = resolve_crtc(card, &res, &conn)
        .ok_or_else(|| Error::NoAdmissibleCrtc(u32::from(conn.handle())))?;

    Ok(Selection {
        connector: conn.handle(),
        connector_name: connector_name(conn.interface(), conn.interface_id()),
        crtc,
        mode: conn.modes()[best],
        info: modes[best],
    })
}

/// Commit CRTC, connector and video plane in one atomic request
pub fn commit_modeset(
    card: &Card,
    sel: &Selection,
    video_plane: plane::Handle,
    opts: &ModesetOptions,
) -> Result<ModesetResult> {
    let (w, h) = (sel.info.width, sel.info.height);

    let conn_props = PropertySet::query(card, sel.connector, "connector")?;
    let conn_crtc_id = conn_props.require("CRTC_ID")?;

    let crtc_props = PropertySet::query(card, sel.crtc, "crtc")?;
    let active = crtc_props.require("ACTIVE")?;
    let mode_id = crtc_props.require("MODE_ID")?;

    let video = PlaneProps::resolve(&PropertySet::query(card, video_plane, "plane")?)?;

    let filler = DumbFb::create_xrgb(card, w, h, FILLER_XRGB)?;
    let filler_fb = filler
        .framebuffer()
        .ok_or_else(|| Error::FramebufferCreationFailed(io::Error::other("no filler fb")))?;

    let mut req = AtomicModeReq::new();
    req.add_property(sel.crtc, active, property::Value::Boolean(true));
    req.add_property(sel.connector, conn_crtc_id, property::Value::CRTC(Some(sel.crtc)));
    video.attach(&mut req, video_plane, filler_fb, sel.crtc, (w, h), (w, h));

    let mut osd_zpos = None;
    if let Some((_, zmin, zmax)) = video.zpos {
        let z = if opts.pre_reserve_osd && zmax > zmin {
            osd_zpos = Some(zmax);
            zmax - 1
        } else {
            zmax
        };
        video.set_zpos(&mut req, video_plane, z);
    }

    let planes = if opts.blank_primary || opts.pre_reserve_osd {
        let res = card.resource_handles()?;
        planes::enumerate(card, &res, sel.crtc)?
    } else {
        Vec::new()
    };

    if opts.blank_primary {
        match planes::find_primary(&planes, video_plane) {
            Some(primary) => match PropertySet::query(card, primary, "plane") {
                Ok(set) => match (set.lookup("FB_ID"), set.lookup("CRTC_ID")) {
                    (Some(fb_id), Some(crtc_id)) => {
                        req.add_property(primary, fb_id, property::Value::Framebuffer(None));
                        req.add_property(primary, crtc_id, property::Value::CRTC(None));
                        debug!("Blanking primary plane {}", u32::from(primary));
                    }
                    _ => {
                        set.dump();
                        warn!("Primary plane {} lacks FB_ID/CRTC_ID, not blanking", u32::from(primary));
                    }
                },
                Err(e) => warn!("Primary plane {} properties unavailable: {}", u32::from(primary), e),
            },
            None => debug!("No separate primary plane to blank"),
        }
    }

    // Transparent placeholder so the overlay slot is part of the initial z-stack
    let mut placeholder = None;
    if opts.pre_reserve_osd && opts.osd_plane != 0 && opts.osd_plane != u32::from(video_plane) {
        if let Some(osd) = planes.iter().find(|p| p.id() == opts.osd_plane && p.on_crtc) {
            let props = PropertySet::query(card, osd.handle, "plane").and_then(|s| PlaneProps::resolve(&s));
            match (props, DumbFb::create_argb(card, 64, 32, 0)) {
                (Ok(props), Ok(fb)) => {
                    if let Some(fb_handle) = fb.framebuffer() {
                        props.attach(&mut req, osd.handle, fb_handle, sel.crtc, (64, 32), (w, h));
                        if let Some(z) = osd_zpos {
                            props.set_zpos(&mut req, osd.handle, z);
                        }
                        placeholder = Some(fb);
                    }
                }
                (Err(e), _) | (_, Err(e)) => warn!("Cannot reserve OSD plane {}: {}", opts.osd_plane, e),
            }
        }
    }

    let blob = ModeBlob::create(card, &sel.mode)?;
    req.add_property(sel.crtc, mode_id, blob.value());
    let committed = card.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req);
    drop(blob);
    committed.map_err(Error::CommitRejected)?;

    info!(
        "Modeset {} {}x{}@{} on CRTC {}, video plane {}",
        sel.connector_name,
        w,
        h,
        sel.info.refresh_hz,
        u32::from(sel.crtc),
        u32::from(video_plane)
    );

    if !opts.blue_hold.is_zero() {
        debug!("Holding filler for {:?}", opts.blue_hold);
        thread::sleep(opts.blue_hold);
    }
    drop(placeholder);
    drop(filler);

    Ok(ModesetResult {
        connector: sel.connector,
        connector_name: sel.connector_name.clone(),
        crtc: sel.crtc,
        video_plane,
        width: w,
        height: h,
        refresh_hz: sel.info.refresh_hz,
    })
}

/// Select, resolve the video plane and commit
pub fn perform(card: &Card, wanted: Option<&str>, opts: &ModesetOptions) -> Result<ModesetResult> {
    let sel = select(card, wanted)?;
    let res = card.resource_handles()?;
    let planes = planes::enumerate(card, &res, sel.crtc)?;
    let video_plane = planes::choose_video_plane(&planes, opts.video_plane, opts.osd_plane)
        .ok_or_else(|| Error::NoVideoPlane(u32::from(sel.crtc)))?;
    commit_modeset(card, &sel, video_plane, opts)
}
