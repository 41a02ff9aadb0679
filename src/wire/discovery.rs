//! Discovery datagrams: camera announcements and station requests.
//!
//! Announcements (camera -> stations, BROADCAST_PORT) carry
//! `name_utf8 0x00 group_utf8`, at most 512 bytes total. Stations use them
//! purely to build the human-visible camera list; subscribing still takes
//! the request/TCP exchange.
//!
//! Requests (station -> camera, REQUEST_PORT) are the raw UTF-8 group
//! bytes, at most 255. The camera matches them byte-exactly against its
//! own group.

use crate::types::{truncate_utf8, MAX_NAME_LEN};

/// Upper bound on an announcement datagram
pub const MAX_ANNOUNCEMENT_LEN: usize = 512;

/// Serialize an announcement; name and group are truncated to 255 bytes
/// each, which keeps the datagram under the 512-byte cap.
pub fn encode_announcement(name: &str, group: &str) -> Vec<u8> {
    let name = truncate_utf8(name, MAX_NAME_LEN);
    let group = truncate_utf8(group, MAX_NAME_LEN);

    let mut out = Vec::with_capacity(name.len() + 1 + group.len());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(group.as_bytes());
    out
}

/// Parse an announcement into (name, group). Datagrams without a NUL
/// separator or over the size cap are ignored.
pub fn parse_announcement(data: &[u8]) -> Option<(String, String)> {
    if data.len() > MAX_ANNOUNCEMENT_LEN {
        return None;
    }
    let nul = data.iter().position(|&b| b == 0)?;
    let name = String::from_utf8_lossy(&data[..nul]).into_owned();
    let group = String::from_utf8_lossy(&data[nul + 1..]).into_owned();
    Some((name, group))
}

/// Serialize a subscription request for `group`
pub fn encode_request(group: &str) -> Vec<u8> {
    truncate_utf8(group, MAX_NAME_LEN).as_bytes().to_vec()
}

/// Byte-exact group match for an incoming request datagram
pub fn request_matches(data: &[u8], group: &str) -> bool {
    data == group.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_roundtrip() {
        let bytes = encode_announcement("cam1", "default");
        let (name, group) = parse_announcement(&bytes).unwrap();
        assert_eq!(name, "cam1");
        assert_eq!(group, "default");
    }

    #[test]
    fn test_announcement_without_separator_rejected() {
        assert!(parse_announcement(b"no separator here").is_none());
    }

    #[test]
    fn test_announcement_stays_under_cap() {
        let bytes = encode_announcement(&"n".repeat(400), &"g".repeat(400));
        assert!(bytes.len() <= MAX_ANNOUNCEMENT_LEN);
        let (name, group) = parse_announcement(&bytes).unwrap();
        assert_eq!(name.len(), 255);
        assert_eq!(group.len(), 255);
    }

    #[test]
    fn test_request_match_is_byte_exact() {
        let req = encode_request("default");
        assert!(request_matches(&req, "default"));
        assert!(!request_matches(&req, "Default"));
        assert!(!request_matches(&req, "default "));
        assert!(!request_matches(b"", "default"));
    }
}
