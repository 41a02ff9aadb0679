//! Protocol-level types and constants shared by cameras and stations.
//!
//! Key types:
//! - [`Resolution`]: ordered enumeration of supported stream resolutions
//! - [`LightStatus`]: flashlight state carried on the wire
//! - [`CameraStatus`]: bit-flag set describing camera health
//!
//! The fixed port assignments live here as well; configuration may override
//! them (port 0 selects an ephemeral port, which the tests rely on).

use serde::{Deserialize, Serialize};
use std::fmt;

/// TCP port carrying stream packets (camera -> station)
pub const STREAM_PORT: u16 = 1100;

/// UDP port receiving command datagrams (station -> camera)
pub const COMMAND_PORT: u16 = 1101;

/// UDP port carrying discovery announcements (camera -> stations)
pub const BROADCAST_PORT: u16 = 1102;

/// UDP port receiving subscription requests (station -> camera)
pub const REQUEST_PORT: u16 = 1103;

/// Lowest frame rate a camera will stream at
pub const MIN_FPS: u8 = 10;

/// Highest frame rate a camera will stream at
pub const MAX_FPS: u8 = 60;

/// Maximum byte length of a camera name or group on the wire
pub const MAX_NAME_LEN: usize = 255;

/// Clamp a requested frame rate into the supported range.
///
/// Whoever *receives* a frame rate (from the wire, from config, from a
/// public setter) clamps it at the boundary; out-of-range values are never
/// an error.
#[inline]
pub fn clamp_fps(fps: i32) -> u8 {
    fps.clamp(MIN_FPS as i32, MAX_FPS as i32) as u8
}

/// Truncate a string to at most `max` bytes without splitting a character.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ============================================================================
// Light status
// ============================================================================

/// Flashlight state, one byte on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LightStatus {
    Off = 0,
    On = 1,
}

impl LightStatus {
    /// Decode from a wire byte (any non-zero value means on)
    #[inline]
    pub fn from_wire(byte: u8) -> Self {
        if byte == 0 {
            LightStatus::Off
        } else {
            LightStatus::On
        }
    }

    #[inline]
    pub fn is_on(self) -> bool {
        self == LightStatus::On
    }
}

impl From<bool> for LightStatus {
    fn from(on: bool) -> Self {
        if on {
            LightStatus::On
        } else {
            LightStatus::Off
        }
    }
}

// ============================================================================
// Camera status flags
// ============================================================================

/// Bit-flag set describing camera health, one byte on the wire.
///
/// The empty set means the camera is operating normally. Only the low five
/// bits are defined; the remaining bits are masked off when decoding.
///
/// `DISCONNECTED` is special: a station keeps it set ("sticky") from the
/// moment its watchdog expires until the next successfully parsed stream
/// packet. It is the unique source of truth for peer presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraStatus(u8);

impl CameraStatus {
    pub const OK: CameraStatus = CameraStatus(0);
    pub const LOW_BATTERY: CameraStatus = CameraStatus(0x01);
    pub const DISCHARGING_BATTERY: CameraStatus = CameraStatus(0x02);
    pub const VIDEO_FAILURE: CameraStatus = CameraStatus(0x04);
    pub const LIGHT_FAILURE: CameraStatus = CameraStatus(0x08);
    pub const DISCONNECTED: CameraStatus = CameraStatus(0x10);

    const MASK: u8 = 0x1F;

    /// Decode from a wire byte, ignoring undefined bits
    #[inline]
    pub fn from_wire(byte: u8) -> Self {
        CameraStatus(byte & Self::MASK)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, flag: CameraStatus) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, flag: CameraStatus) {
        self.0 |= flag.0;
    }

    #[inline]
    pub fn remove(&mut self, flag: CameraStatus) {
        self.0 &= !flag.0;
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_disconnected(self) -> bool {
        self.contains(Self::DISCONNECTED)
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        let mut first = true;
        let mut push = |f: &mut fmt::Formatter<'_>, label: &str| -> fmt::Result {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", label)
        };
        if self.contains(Self::DISCONNECTED) {
            push(f, "Disconnected")?;
        }
        if self.contains(Self::VIDEO_FAILURE) {
            push(f, "Video failure")?;
        }
        if self.contains(Self::LIGHT_FAILURE) {
            push(f, "Light failure")?;
        }
        if self.contains(Self::LOW_BATTERY) {
            push(f, "Low battery")?;
        }
        if self.contains(Self::DISCHARGING_BATTERY) {
            push(f, "Discharging battery")?;
        }
        Ok(())
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Ordered enumeration of supported stream resolutions.
///
/// The ordering matters: the adaptive regulator steps through neighbouring
/// levels with [`Resolution::step_down`] / [`Resolution::step_up`], and the
/// wire index is the variant's position in this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Resolution {
    Qcif = 0,
    Cif = 1,
    Qvga = 2,
    Vga = 3,
    Svga = 4,
    Xga = 5,
    Hd720 = 6,
    Hd1080 = 7,
}

impl Resolution {
    pub const ALL: [Resolution; 8] = [
        Resolution::Qcif,
        Resolution::Cif,
        Resolution::Qvga,
        Resolution::Vga,
        Resolution::Svga,
        Resolution::Xga,
        Resolution::Hd720,
        Resolution::Hd1080,
    ];

    /// Pixel dimensions (width, height)
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::Qcif => (176, 144),
            Resolution::Cif => (352, 288),
            Resolution::Qvga => (320, 240),
            Resolution::Vga => (640, 480),
            Resolution::Svga => (800, 600),
            Resolution::Xga => (1024, 768),
            Resolution::Hd720 => (1280, 720),
            Resolution::Hd1080 => (1920, 1080),
        }
    }

    /// Wire index of this resolution (0..=7)
    #[inline]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Decode a wire index, clamping out-of-range values to the top level
    #[inline]
    pub fn from_wire(index: u8) -> Self {
        Resolution::ALL[(index as usize).min(Resolution::ALL.len() - 1)]
    }

    /// The next lower level, or `self` when already at the floor
    #[inline]
    pub fn step_down(self) -> Self {
        Resolution::ALL[(self as usize).saturating_sub(1)]
    }

    /// The next higher level, or `self` when already at the ceiling
    #[inline]
    pub fn step_up(self) -> Self {
        Resolution::ALL[(self as usize + 1).min(Resolution::ALL.len() - 1)]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Qcif => "QCIF",
            Resolution::Cif => "CIF",
            Resolution::Qvga => "QVGA",
            Resolution::Vga => "VGA",
            Resolution::Svga => "SVGA",
            Resolution::Xga => "XGA",
            Resolution::Hd720 => "HD720",
            Resolution::Hd1080 => "HD1080",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_clamp() {
        assert_eq!(clamp_fps(0), 10);
        assert_eq!(clamp_fps(9), 10);
        assert_eq!(clamp_fps(10), 10);
        assert_eq!(clamp_fps(24), 24);
        assert_eq!(clamp_fps(60), 60);
        assert_eq!(clamp_fps(61), 60);
        assert_eq!(clamp_fps(1000), 60);
        assert_eq!(clamp_fps(-5), 10);
    }

    #[test]
    fn test_status_flags() {
        let mut status = CameraStatus::OK;
        assert!(status.is_ok());
        assert!(!status.contains(CameraStatus::VIDEO_FAILURE));

        status.insert(CameraStatus::VIDEO_FAILURE);
        status.insert(CameraStatus::LOW_BATTERY);
        assert!(status.contains(CameraStatus::VIDEO_FAILURE));
        assert!(status.contains(CameraStatus::LOW_BATTERY));
        assert!(!status.is_disconnected());

        status.remove(CameraStatus::VIDEO_FAILURE);
        assert!(!status.contains(CameraStatus::VIDEO_FAILURE));
        assert_eq!(status.bits(), 0x01);
    }

    #[test]
    fn test_status_wire_masks_undefined_bits() {
        let status = CameraStatus::from_wire(0xFF);
        assert_eq!(status.bits(), 0x1F);
        assert!(status.is_disconnected());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(CameraStatus::OK.to_string(), "OK");
        let mut status = CameraStatus::OK;
        status.insert(CameraStatus::LOW_BATTERY);
        assert_eq!(status.to_string(), "Low battery");
    }

    #[test]
    fn test_resolution_order_and_steps() {
        assert_eq!(Resolution::Qcif.step_down(), Resolution::Qcif);
        assert_eq!(Resolution::Vga.step_down(), Resolution::Qvga);
        assert_eq!(Resolution::Xga.step_down(), Resolution::Svga);
        assert_eq!(Resolution::Hd1080.step_up(), Resolution::Hd1080);
        assert_eq!(Resolution::Svga.step_up(), Resolution::Xga);
    }

    #[test]
    fn test_resolution_wire_roundtrip() {
        for res in Resolution::ALL {
            assert_eq!(Resolution::from_wire(res.index()), res);
        }
        // Out-of-range indices clamp to the top level
        assert_eq!(Resolution::from_wire(8), Resolution::Hd1080);
        assert_eq!(Resolution::from_wire(255), Resolution::Hd1080);
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // 'é' is two bytes; never split in the middle
        assert_eq!(truncate_utf8("caméra", 4), "cam");
        assert_eq!(truncate_utf8("caméra", 5), "camé");
    }
}
