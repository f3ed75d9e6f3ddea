//! Mode ordering and connector naming

use std::cmp::Ordering;

use drm::control::{connector, Mode, ModeTypeFlags};

/// The parts of a display mode that selection cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub clock_khz: u32,
    pub preferred: bool,
}

impl ModeInfo {
    pub fn from_drm(mode: &Mode) -> Self {
        let (width, height) = mode.size();
        let (_, _, htotal) = mode.hsync();
        let (_, _, vtotal) = mode.vsync();
        Self {
            width: width as u32,
            height: height as u32,
            refresh_hz: refresh_hz(mode.vrefresh(), mode.clock(), htotal as u32, vtotal as u32),
            clock_khz: mode.clock(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        }
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Refresh, then area, then the preferred bit, then pixel clock
    pub fn rank(&self, other: &Self) -> Ordering {
        self.refresh_hz
            .cmp(&other.refresh_hz)
            .then_with(|| self.area().cmp(&other.area()))
            .then_with(|| self.preferred.cmp(&other.preferred))
            .then_with(|| self.clock_khz.cmp(&other.clock_khz))
    }
}

/// Reported refresh, or one derived from the timings when the driver reports 0
pub fn refresh_hz(vrefresh: u32, clock_khz: u32, htotal: u32, vtotal: u32) -> u32 {
    if vrefresh != 0 || htotal == 0 || vtotal == 0 {
        return vrefresh;
    }
    let hz = clock_khz as f64 * 1000.0 / (htotal as f64 * vtotal as f64);
    hz.round() as u32
}

/// Index of the best mode; earlier entries win ties
pub fn best_mode(modes: &[ModeInfo]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, mode) in modes.iter().enumerate() {
        match best {
            Some(b) if mode.rank(&modes[b]) != Ordering::Greater => {}
            _ => best = Some(i),
        }
    }
    best
}

/// `KIND-INDEX` name such as `HDMI-A-1`
pub fn connector_name(interface: connector::Interface, index: u32) -> String {
    let kind = match interface {
        connector::Interface::HDMIA => "HDMI-A",
        connector::Interface::HDMIB => "HDMI-B",
        connector::Interface::DisplayPort => "DP",
        connector::Interface::EmbeddedDisplayPort => "eDP",
        connector::Interface::VGA => "VGA",
        _ => "UNKNOWN",
    };
    format!("{}-{}", kind, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32, refresh_hz: u32, preferred: bool, clock_khz: u32) -> ModeInfo {
        ModeInfo {
            width,
            height,
            refresh_hz,
            clock_khz,
            preferred,
        }
    }

    #[test]
    fn test_refresh_beats_preferred() {
        let modes = [
            mode(3840, 2160, 60, true, 594_000),
            mode(1920, 1080, 120, false, 297_000),
        ];
        assert_eq!(best_mode(&modes), Some(1));
    }

    #[test]
    fn test_area_then_preferred_then_clock() {
        let modes = [
            mode(1280, 720, 60, true, 74_250),
            mode(1920, 1080, 60, false, 148_500),
        ];
        assert_eq!(best_mode(&modes), Some(1));

        let modes = [
            mode(1920, 1080, 60, false, 148_500),
            mode(1920, 1080, 60, true, 148_350),
        ];
        assert_eq!(best_mode(&modes), Some(1));

        let modes = [
            mode(1920, 1080, 60, false, 148_350),
            mode(1920, 1080, 60, false, 148_500),
        ];
        assert_eq!(best_mode(&modes), Some(1));
    }

    #[test]
    fn test_ties_keep_first() {
        let a = mode(1920, 1080, 60, false, 148_500);
        assert_eq!(best_mode(&[a, a, a]), Some(0));
        assert_eq!(best_mode(&[]), None);
    }

    #[test]
    fn test_selected_mode_is_maximal() {
        let modes = [
            mode(720, 480, 60, false, 27_000),
            mode(1920, 1080, 50, false, 148_500),
            mode(1920, 1080, 60, true, 148_500),
            mode(1280, 720, 60, false, 74_250),
            mode(640, 480, 75, false, 31_500),
            mode(1920, 1080, 60, false, 148_500),
        ];
        let best = best_mode(&modes).unwrap();
        assert_eq!(best, 4);
        assert!(modes
            .iter()
            .all(|m| m.rank(&modes[best]) != Ordering::Greater));
    }

    #[test]
    fn test_refresh_fallback_from_timings() {
        // CEA 1080p60: 148.5 MHz over 2200x1125
        assert_eq!(refresh_hz(0, 148_500, 2200, 1125), 60);
        assert_eq!(refresh_hz(0, 148_500, 0, 1125), 0);
        assert_eq!(refresh_hz(50, 148_500, 2200, 1125), 50);
        // 59.94 rounds to 60
        assert_eq!(refresh_hz(0, 148_352, 2200, 1125), 60);
    }

    #[test]
    fn test_connector_names() {
        assert_eq!(connector_name(connector::Interface::HDMIA, 1), "HDMI-A-1");
        assert_eq!(connector_name(connector::Interface::DisplayPort, 2), "DP-2");
        assert_eq!(connector_name(connector::Interface::EmbeddedDisplayPort, 1), "eDP-1");
        assert_eq!(connector_name(connector::Interface::DSI, 1), "UNKNOWN-1");
    }
}
