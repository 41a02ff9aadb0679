//! Stream packet framing and parsing (camera -> station, over TCP).
//!
//! # Wire Format
//!
//! All integers are big-endian. The body:
//!
//! ```text
//! ┌────────────┬─────────────┬────────────┬──────────────┬────────────────┐
//! │ u8 name_len│ name bytes  │u8 group_len│ group bytes  │ u8 fps         │
//! ├────────────┼─────────────┼────────────┼──────────────┼────────────────┤
//! │ u8 res_idx │ u8 light    │ u8 status  │ u32 image_len│ JPEG bytes     │
//! └────────────┴─────────────┴────────────┴──────────────┴────────────────┘
//! ```
//!
//! Framing wraps the body in a 4-byte big-endian length prefix and a 4-byte
//! big-endian CRC32 trailer computed over the body:
//!
//! ```text
//! ┌──────────────────────┬──────────────────┬─────────────────────┐
//! │ u32 packet_length    │ body             │ u32 crc32(body)     │
//! └──────────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! # Resynchronization
//!
//! TCP delivers a byte stream, so a corrupted length prefix desynchronizes
//! every following packet. [`StreamParser`] recovers by dropping a single
//! byte and retrying whenever the CRC (or a length sanity check) fails;
//! each dropped byte counts as one resync event. Callers watch the event
//! rate to detect genuinely corrupt peers.

use super::crc32::crc32;
use crate::types::{truncate_utf8, CameraStatus, LightStatus, Resolution, MAX_NAME_LEN};

/// Bytes in the length prefix and in the CRC trailer
pub const FRAME_OVERHEAD: usize = 8;

/// Smallest possible body: empty name, empty group, four status bytes and a
/// zero-length image
pub const MIN_BODY_LEN: usize = 10;

/// Sanity cap on the advertised body length; anything larger is treated as
/// a corrupted prefix (a 1080p JPEG stays well below this)
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// One decoded stream packet
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    pub name: String,
    pub group: String,
    pub fps: u8,
    pub resolution: Resolution,
    pub light: LightStatus,
    pub status: CameraStatus,
    pub image: Vec<u8>,
}

impl StreamPacket {
    /// Serialize the body into `out` (cleared first). Names longer than 255
    /// bytes are truncated on a character boundary.
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        out.clear();
        let name = truncate_utf8(&self.name, MAX_NAME_LEN);
        let group = truncate_utf8(&self.group, MAX_NAME_LEN);

        out.reserve(MIN_BODY_LEN + name.len() + group.len() + self.image.len());
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(group.len() as u8);
        out.extend_from_slice(group.as_bytes());
        out.push(self.fps);
        out.push(self.resolution.index());
        out.push(self.light as u8);
        out.push(self.status.bits());
        out.extend_from_slice(&(self.image.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.image);
    }

    /// Serialize the full frame: length prefix + body + CRC trailer
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode_body(&mut body);

        let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32(&body).to_be_bytes());
        frame
    }

    /// Parse a CRC-validated body. Returns `None` when an inner length
    /// field overruns the body (PacketTooShort).
    pub fn parse_body(body: &[u8]) -> Option<StreamPacket> {
        let mut pos = 0usize;

        let name_len = *body.get(pos)? as usize;
        pos += 1;
        let name = body.get(pos..pos + name_len)?;
        pos += name_len;

        let group_len = *body.get(pos)? as usize;
        pos += 1;
        let group = body.get(pos..pos + group_len)?;
        pos += group_len;

        let tail = body.get(pos..pos + 8)?;
        let fps = tail[0];
        let resolution = Resolution::from_wire(tail[1]);
        let light = LightStatus::from_wire(tail[2]);
        let status = CameraStatus::from_wire(tail[3]);
        let image_len = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]) as usize;
        pos += 8;

        let image = body.get(pos..pos + image_len)?;
        if pos + image_len != body.len() {
            return None;
        }

        Some(StreamPacket {
            name: String::from_utf8_lossy(name).into_owned(),
            group: String::from_utf8_lossy(group).into_owned(),
            fps,
            resolution,
            light,
            status,
            image: image.to_vec(),
        })
    }
}

/// Incremental parser over the TCP byte stream
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
    resync_events: u64,
    bad_crc_count: u64,
    short_packet_count: u64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next valid packet, resynchronizing past corruption.
    /// Returns `None` once more bytes are needed.
    pub fn next_packet(&mut self) -> Option<StreamPacket> {
        loop {
            if self.buf.len() < 4 {
                return None;
            }

            let body_len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
                self.resync();
                continue;
            }

            let total = 4 + body_len + 4;
            if self.buf.len() < total {
                return None;
            }

            let body = &self.buf[4..4 + body_len];
            let trailer = u32::from_be_bytes([
                self.buf[4 + body_len],
                self.buf[5 + body_len],
                self.buf[6 + body_len],
                self.buf[7 + body_len],
            ]);

            if crc32(body) != trailer {
                self.bad_crc_count += 1;
                self.resync();
                continue;
            }

            match StreamPacket::parse_body(body) {
                Some(packet) => {
                    self.buf.drain(..total);
                    return Some(packet);
                }
                None => {
                    self.short_packet_count += 1;
                    self.resync();
                }
            }
        }
    }

    /// Drop one byte and count the event
    fn resync(&mut self) {
        self.buf.remove(0);
        self.resync_events += 1;
    }

    /// Resync events since construction
    pub fn resync_events(&self) -> u64 {
        self.resync_events
    }

    /// CRC mismatches since construction
    pub fn bad_crc_count(&self) -> u64 {
        self.bad_crc_count
    }

    /// Truncated-body rejections since construction
    pub fn short_packet_count(&self) -> u64 {
        self.short_packet_count
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(image_len: usize) -> StreamPacket {
        StreamPacket {
            name: "cam1".into(),
            group: "default".into(),
            fps: 24,
            resolution: Resolution::Vga,
            light: LightStatus::Off,
            status: CameraStatus::OK,
            image: (0..image_len).map(|i| (i * 7) as u8).collect(),
        }
    }

    #[test]
    fn test_framing_roundtrip() {
        let packet = sample_packet(1024);
        let mut parser = StreamParser::new();
        parser.push(&packet.encode_frame());

        let decoded = parser.next_packet().expect("one packet");
        assert_eq!(decoded, packet);
        assert_eq!(parser.resync_events(), 0);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_partial_delivery() {
        let packet = sample_packet(512);
        let frame = packet.encode_frame();
        let mut parser = StreamParser::new();

        // Feed one byte at a time; the packet appears only once complete
        for (i, &byte) in frame.iter().enumerate() {
            parser.push(&[byte]);
            if i + 1 < frame.len() {
                assert!(parser.next_packet().is_none());
            }
        }
        assert_eq!(parser.next_packet().unwrap(), packet);
    }

    #[test]
    fn test_crc_corruption_rejected() {
        let packet = sample_packet(256);
        let mut frame = packet.encode_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let mut parser = StreamParser::new();
        parser.push(&frame);
        assert!(parser.next_packet().is_none());
        assert_eq!(parser.bad_crc_count(), 1);
        assert!(parser.resync_events() >= 1);
    }

    #[test]
    fn test_resync_recovers_following_packets() {
        let a = sample_packet(128);
        let b = sample_packet(64);
        let junk = [0xDE, 0xAD, 0xBE, 0xEF, 0x42];

        let mut stream = a.encode_frame();
        stream.extend_from_slice(&junk);
        stream.extend_from_slice(&b.encode_frame());

        let mut parser = StreamParser::new();
        parser.push(&stream);

        assert_eq!(parser.next_packet().unwrap(), a);
        assert_eq!(parser.next_packet().unwrap(), b);
        assert!(parser.next_packet().is_none());
        // At most junk_len + 1 resync events
        assert!(parser.resync_events() <= junk.len() as u64 + 1);
    }

    #[test]
    fn test_junk_before_first_packet() {
        let packet = sample_packet(32);
        let mut stream = vec![0xFFu8; 16];
        stream.extend_from_slice(&packet.encode_frame());

        let mut parser = StreamParser::new();
        parser.push(&stream);
        assert_eq!(parser.next_packet().unwrap(), packet);
        assert!(parser.resync_events() <= 17);
    }

    #[test]
    fn test_name_truncation_on_encode() {
        let mut packet = sample_packet(0);
        packet.name = "x".repeat(300);
        let mut parser = StreamParser::new();
        parser.push(&packet.encode_frame());

        let decoded = parser.next_packet().unwrap();
        assert_eq!(decoded.name.len(), 255);
    }

    #[test]
    fn test_inner_overrun_counts_short_packet() {
        // Hand-build a body whose name_len points past the end, with a
        // valid CRC so only the inner parse can reject it
        let body = [200u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32(&body).to_be_bytes());

        let mut parser = StreamParser::new();
        parser.push(&frame);
        assert!(parser.next_packet().is_none());
        assert_eq!(parser.short_packet_count(), 1);
    }

    #[test]
    fn test_status_and_light_roundtrip() {
        let mut packet = sample_packet(16);
        packet.light = LightStatus::On;
        let mut status = CameraStatus::OK;
        status.insert(CameraStatus::LOW_BATTERY);
        status.insert(CameraStatus::VIDEO_FAILURE);
        packet.status = status;

        let mut parser = StreamParser::new();
        parser.push(&packet.encode_frame());
        let decoded = parser.next_packet().unwrap();
        assert!(decoded.light.is_on());
        assert!(decoded.status.contains(CameraStatus::LOW_BATTERY));
        assert!(decoded.status.contains(CameraStatus::VIDEO_FAILURE));
        assert!(!decoded.status.is_disconnected());
    }
}
