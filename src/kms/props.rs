//! Name-based property lookup on connectors, CRTCs and planes
//!
//! Property ids are re-resolved on every modeset since driver reloads can change them.

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    crtc, framebuffer, plane, property, Device as ControlDevice, ResourceHandle,
};
use tracing::debug;

use super::Card;
use crate::error::{Error, Result};

/// Names that drivers export with inconsistent case
const CASE_FOLDED: &[&str] = &["zpos", "alpha"];

/// Shape of a property's value domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropKind {
    Range { min: u64, max: u64 },
    Enum(Vec<(String, u64)>),
    Other,
}

#[derive(Debug, Clone)]
pub struct Prop {
    pub handle: property::Handle,
    pub name: String,
    pub value: u64,
    pub kind: PropKind,
}

/// Snapshot of every property exported by one DRM object
#[derive(Debug, Clone)]
pub struct PropertySet {
    object: &'static str,
    id: u32,
    props: Vec<Prop>,
}

impl PropertySet {
    /// Read all properties of `handle` with their current values
    pub fn query<H>(card: &Card, handle: H, object: &'static str) -> Result<Self>
    where
        H: ResourceHandle + Into<u32>,
    {
        let mut props = Vec::new();
        for (prop, value) in card.get_properties(handle)? {
            let info = card.get_property(prop)?;
            let kind = match info.value_type() {
                property::ValueType::UnsignedRange(min, max) => PropKind::Range { min, max },
                property::ValueType::SignedRange(min, max) => PropKind::Range {
                    min: min.max(0) as u64,
                    max: max.max(0) as u64,
                },
                property::ValueType::Enum(values) => {
                    let (_, entries) = values.values();
                    PropKind::Enum(
                        entries
                            .iter()
                            .map(|e| (e.name().to_string_lossy().into_owned(), e.value()))
                            .collect(),
                    )
                }
                _ => PropKind::Other,
            };
            props.push(Prop {
                handle: prop,
                name: info.name().to_string_lossy().into_owned(),
                value,
                kind,
            });
        }
        Ok(Self::from_props(object, handle.into(), props))
    }

    pub fn from_props(object: &'static str, id: u32, props: Vec<Prop>) -> Self {
        Self { object, id, props }
    }

    pub fn object(&self) -> &'static str {
        self.object
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn find(&self, name: &str) -> Option<&Prop> {
        self.props.iter().find(|p| p.name == name).or_else(|| {
            if CASE_FOLDED.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                self.props.iter().find(|p| p.name.eq_ignore_ascii_case(name))
            } else {
                None
            }
        })
    }

    /// Property id by name
    pub fn lookup(&self, name: &str) -> Option<property::Handle> {
        self.find(name).map(|p| p.handle)
    }

    /// Property id plus inclusive bounds; `Ok(None)` if absent
    pub fn lookup_range(&self, name: &str) -> Result<Option<(property::Handle, u64, u64)>> {
        match self.find(name) {
            None => Ok(None),
            Some(Prop {
                handle,
                kind: PropKind::Range { min, max },
                ..
            }) => Ok(Some((*handle, *min, *max))),
            Some(p) => Err(Error::NotRangeProperty(p.name.clone())),
        }
    }

    /// Current value of a property
    pub fn value(&self, name: &str) -> Option<u64> {
        self.find(name).map(|p| p.value)
    }

    /// Numeric code of a named enum entry
    pub fn resolve_enum_value(&self, prop: property::Handle, enum_name: &str) -> Option<u64> {
        self.props
            .iter()
            .find(|p| p.handle == prop)
            .and_then(|p| match &p.kind {
                PropKind::Enum(entries) => entries
                    .iter()
                    .find(|(name, _)| name == enum_name)
                    .map(|(_, v)| *v),
                _ => None,
            })
    }

    /// Like `lookup`, but a missing property is an error and triggers a property dump
    pub fn require(&self, name: &str) -> Result<property::Handle> {
        self.lookup(name).ok_or_else(|| {
            self.dump();
            Error::missing(self.object, self.id, name)
        })
    }

    pub fn dump(&self) {
        debug!("Properties of {} {}:", self.object, self.id);
        for p in &self.props {
            debug!("  {} (id {}) = {}", p.name, u32::from(p.handle), p.value);
        }
    }
}

/// Plane type as reported by the `type` enum property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Overlay,
    Primary,
    Cursor,
    Unknown,
}

impl PlaneKind {
    pub fn from_raw(value: u64) -> Self {
        match value {
            0 => PlaneKind::Overlay,
            1 => PlaneKind::Primary,
            2 => PlaneKind::Cursor,
            _ => PlaneKind::Unknown,
        }
    }
}

/// Resolved property ids of a plane
#[derive(Debug, Clone)]
pub struct PlaneProps {
    pub fb_id: property::Handle,
    pub crtc_id: property::Handle,
    pub crtc_x: property::Handle,
    pub crtc_y: property::Handle,
    pub crtc_w: property::Handle,
    pub crtc_h: property::Handle,
    pub src_x: property::Handle,
    pub src_y: property::Handle,
    pub src_w: property::Handle,
    pub src_h: property::Handle,
    pub zpos: Option<(property::Handle, u64, u64)>,
    pub alpha: Option<(property::Handle, u64, u64)>,
    /// Blend mode property and its "Pre-multiplied" code
    pub blend: Option<(property::Handle, u64)>,
    pub kind: PlaneKind,
}

impl PlaneProps {
    pub fn resolve(set: &PropertySet) -> Result<Self> {
        let blend = set.lookup("pixel blend mode").and_then(|prop| {
            set.resolve_enum_value(prop, "Pre-multiplied")
                .map(|code| (prop, code))
        });
        Ok(Self {
            fb_id: set.require("FB_ID")?,
            crtc_id: set.require("CRTC_ID")?,
            crtc_x: set.require("CRTC_X")?,
            crtc_y: set.require("CRTC_Y")?,
            crtc_w: set.require("CRTC_W")?,
            crtc_h: set.require("CRTC_H")?,
            src_x: set.require("SRC_X")?,
            src_y: set.require("SRC_Y")?,
            src_w: set.require("SRC_W")?,
            src_h: set.require("SRC_H")?,
            zpos: set.lookup_range("zpos").ok().flatten(),
            alpha: set.lookup_range("alpha").ok().flatten(),
            blend,
            kind: set
                .value("type")
                .map(PlaneKind::from_raw)
                .unwrap_or(PlaneKind::Unknown),
        })
    }

    /// Bind `fb` to `crtc`, scaling the `src` buffer size onto a `dst` rect at the origin
    pub fn attach(
        &self,
        req: &mut AtomicModeReq,
        plane: plane::Handle,
        fb: framebuffer::Handle,
        crtc: crtc::Handle,
        src: (u32, u32),
        dst: (u32, u32),
    ) {
        req.add_property(plane, self.fb_id, property::Value::Framebuffer(Some(fb)));
        req.add_property(plane, self.crtc_id, property::Value::CRTC(Some(crtc)));
        req.add_property(plane, self.crtc_x, property::Value::SignedRange(0));
        req.add_property(plane, self.crtc_y, property::Value::SignedRange(0));
        req.add_property(plane, self.crtc_w, property::Value::UnsignedRange(dst.0 as u64));
        req.add_property(plane, self.crtc_h, property::Value::UnsignedRange(dst.1 as u64));
        // source rect is 16.16 fixed point
        req.add_property(plane, self.src_x, property::Value::UnsignedRange(0));
        req.add_property(plane, self.src_y, property::Value::UnsignedRange(0));
        req.add_property(plane, self.src_w, property::Value::UnsignedRange((src.0 as u64) << 16));
        req.add_property(plane, self.src_h, property::Value::UnsignedRange((src.1 as u64) << 16));
    }

    /// Unbind the plane (`FB_ID=0, CRTC_ID=0`)
    pub fn detach(&self, req: &mut AtomicModeReq, plane: plane::Handle) {
        req.add_property(plane, self.fb_id, property::Value::Framebuffer(None));
        req.add_property(plane, self.crtc_id, property::Value::CRTC(None));
    }

    pub fn set_zpos(&self, req: &mut AtomicModeReq, plane: plane::Handle, zpos: u64) {
        if let Some((prop, _, _)) = self.zpos {
            req.add_property(plane, prop, property::Value::UnsignedRange(zpos));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn handle(id: u32) -> property::Handle {
        drm::control::from_u32(id).unwrap()
    }

    pub(crate) fn prop(id: u32, name: &str, kind: PropKind) -> Prop {
        Prop {
            handle: handle(id),
            name: name.to_string(),
            value: 0,
            kind,
        }
    }

    fn plane_set(extra: Vec<Prop>) -> PropertySet {
        let names = [
            "FB_ID", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W",
            "SRC_H",
        ];
        let mut props: Vec<Prop> = names
            .iter()
            .enumerate()
            .map(|(i, n)| prop(i as u32 + 1, n, PropKind::Other))
            .collect();
        props.extend(extra);
        PropertySet::from_props("plane", 40, props)
    }

    #[test]
    fn test_exact_match_wins_over_case_fold() {
        let set = PropertySet::from_props(
            "plane",
            1,
            vec![
                prop(10, "ZPOS", PropKind::Range { min: 0, max: 3 }),
                prop(11, "zpos", PropKind::Range { min: 0, max: 7 }),
            ],
        );
        assert_eq!(set.lookup("zpos"), Some(handle(11)));
        assert_eq!(set.lookup("ZPOS"), Some(handle(10)));
    }

    #[test]
    fn test_case_fold_only_for_known_names() {
        let set = PropertySet::from_props(
            "plane",
            1,
            vec![
                prop(10, "ZPOS", PropKind::Range { min: 0, max: 3 }),
                prop(12, "fb_id", PropKind::Other),
            ],
        );
        assert_eq!(set.lookup("zpos"), Some(handle(10)));
        assert_eq!(set.lookup("FB_ID"), None);
    }

    #[test]
    fn test_lookup_range() {
        let set = PropertySet::from_props(
            "plane",
            1,
            vec![
                prop(10, "alpha", PropKind::Range { min: 0, max: 65535 }),
                prop(11, "type", PropKind::Enum(vec![("Primary".into(), 1)])),
            ],
        );
        assert_eq!(set.lookup_range("ALPHA").unwrap(), Some((handle(10), 0, 65535)));
        assert!(matches!(
            set.lookup_range("type"),
            Err(Error::NotRangeProperty(name)) if name == "type"
        ));
        assert_eq!(set.lookup_range("zpos").unwrap(), None);
    }

    #[test]
    fn test_resolve_enum_value() {
        let blend = PropKind::Enum(vec![
            ("None".into(), 0),
            ("Pre-multiplied".into(), 1),
            ("Coverage".into(), 2),
        ]);
        let set = PropertySet::from_props("plane", 1, vec![prop(20, "pixel blend mode", blend)]);
        assert_eq!(set.resolve_enum_value(handle(20), "Pre-multiplied"), Some(1));
        assert_eq!(set.resolve_enum_value(handle(20), "pre-multiplied"), None);
        assert_eq!(set.resolve_enum_value(handle(21), "Coverage"), None);
    }

    #[test]
    fn test_require_reports_object() {
        let set = PropertySet::from_props("crtc", 55, vec![prop(1, "ACTIVE", PropKind::Other)]);
        assert!(set.require("ACTIVE").is_ok());
        match set.require("MODE_ID") {
            Err(Error::MissingProperty { object, id, name }) => {
                assert_eq!((object, id, name.as_str()), ("crtc", 55, "MODE_ID"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plane_props_optional_set() {
        let mut type_prop = prop(30, "type", PropKind::Enum(vec![("Overlay".into(), 0)]));
        type_prop.value = 0;
        let set = plane_set(vec![
            type_prop,
            prop(31, "zpos", PropKind::Range { min: 0, max: 5 }),
            prop(
                32,
                "pixel blend mode",
                PropKind::Enum(vec![("None".into(), 2), ("Pre-multiplied".into(), 0)]),
            ),
        ]);
        let props = PlaneProps::resolve(&set).unwrap();
        assert_eq!(props.kind, PlaneKind::Overlay);
        assert_eq!(props.zpos, Some((handle(31), 0, 5)));
        assert_eq!(props.blend, Some((handle(32), 0)));
        assert!(props.alpha.is_none());
    }

    #[test]
    fn test_plane_props_missing_required() {
        let set = PropertySet::from_props("plane", 9, vec![prop(1, "FB_ID", PropKind::Other)]);
        assert!(matches!(
            PlaneProps::resolve(&set),
            Err(Error::MissingProperty { name, .. }) if name == "CRTC_ID"
        ));
    }
}
