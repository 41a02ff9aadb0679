//! Command datagrams (station -> camera, UDP).
//!
//! Exactly six bytes, no framing:
//!
//! ```text
//! ┌────────┬─────────┬─────────┬─────────┬───────────────┬─────────┐
//! │ u8 fps │ u8 res  │ u8 light│ u8 focus│ u8 auto_reg   │ u8 flags│
//! └────────┴─────────┴─────────┴─────────┴───────────────┴─────────┘
//! ```
//!
//! Cameras accept trailing bytes for forward compatibility. A datagram is
//! self-contained state, not a delta, so applying the same tuple twice is a
//! no-op and the station needs no sequence numbers.

use crate::types::{clamp_fps, LightStatus, Resolution};

/// Encoded size of a command datagram
pub const COMMAND_LEN: usize = 6;

/// `flags` bit asking the camera to save a still photo now
pub const FLAG_SAVE_PHOTO: u8 = 0x01;

/// One decoded command datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub fps: u8,
    pub resolution: Resolution,
    pub light: LightStatus,
    pub focus: bool,
    pub auto_regulate: bool,
    pub save_photo: bool,
}

impl CommandPacket {
    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        [
            self.fps,
            self.resolution.index(),
            self.light as u8,
            self.focus as u8,
            self.auto_regulate as u8,
            if self.save_photo { FLAG_SAVE_PHOTO } else { 0 },
        ]
    }

    /// Decode a datagram. Short datagrams are rejected; trailing bytes are
    /// ignored; the frame rate is clamped at the boundary.
    pub fn decode(data: &[u8]) -> Option<CommandPacket> {
        if data.len() < COMMAND_LEN {
            return None;
        }
        Some(CommandPacket {
            fps: clamp_fps(data[0] as i32),
            resolution: Resolution::from_wire(data[1]),
            light: LightStatus::from_wire(data[2]),
            focus: data[3] != 0,
            auto_regulate: data[4] != 0,
            save_photo: data[5] & FLAG_SAVE_PHOTO != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CommandPacket {
        CommandPacket {
            fps: 30,
            resolution: Resolution::Svga,
            light: LightStatus::On,
            focus: true,
            auto_regulate: false,
            save_photo: false,
        }
    }

    #[test]
    fn test_roundtrip() {
        let cmd = sample();
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), COMMAND_LEN);
        assert_eq!(CommandPacket::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(CommandPacket::decode(&[30, 3, 0, 0, 0]).is_none());
        assert!(CommandPacket::decode(&[]).is_none());
    }

    #[test]
    fn test_trailing_bytes_accepted() {
        let mut bytes = sample().encode().to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(CommandPacket::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_fps_clamped_on_decode() {
        let mut bytes = sample().encode();
        bytes[0] = 5;
        assert_eq!(CommandPacket::decode(&bytes).unwrap().fps, 10);
        bytes[0] = 200;
        assert_eq!(CommandPacket::decode(&bytes).unwrap().fps, 60);
    }

    #[test]
    fn test_save_photo_flag() {
        let mut bytes = sample().encode();
        bytes[5] = FLAG_SAVE_PHOTO | 0x80;
        let cmd = CommandPacket::decode(&bytes).unwrap();
        assert!(cmd.save_photo);
    }
}
