//! Status Codec
//!
//! Wire-compact encodings shared with the tunnel engine and the
//! extension process. Everything here is pure string handling; fields are
//! opaque to this layer and no numeric parsing happens during decode.
//!
//! # Formats
//!
//! ```text
//! identity:  <name>{||}<id>          legacy: <id>
//! status:    <duration>_<lastPacketReceiveAt>_<bytesIn>_<bytesOut>
//! profile:   "0" => not loaded, anything else => loaded
//! expiry:    yyyy-MM-dd HH:mm:ss
//! ```

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the name and id of a persisted identity
pub const IDENTITY_SEPARATOR: &str = "{||}";

/// Separator between the fields of a connection-update value
pub const STATUS_SEPARATOR: char = '_';

/// The only profile-status value that means "no profile loaded"
pub const PROFILE_NOT_LOADED: &str = "0";

/// Format of absolute expiry timestamps exchanged with the engine
pub const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const STATUS_FIELDS: usize = 4;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Identity field {field} contains the reserved separator")]
    Encoding { field: &'static str },

    #[error("Expected {expected} status fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("Empty value")]
    Empty,
}

/// Identity of the active session as the UI knows it
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// UI-level label (e.g. "work-vpn")
    pub name: String,
    /// Stable identifier of the profile
    pub id: String,
}

impl SessionIdentity {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Encode for storage
    pub fn encode(&self) -> Result<String, CodecError> {
        encode_identity(&self.name, &self.id)
    }

    /// Decode a stored value
    pub fn decode(value: &str) -> Self {
        decode_identity(value)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// Join name and id with [`IDENTITY_SEPARATOR`].
pub fn encode_identity(name: &str, id: &str) -> Result<String, CodecError> {
    if name.contains(IDENTITY_SEPARATOR) {
        return Err(CodecError::Encoding { field: "name" });
    }
    if id.contains(IDENTITY_SEPARATOR) {
        return Err(CodecError::Encoding { field: "id" });
    }
    Ok(format!("{name}{IDENTITY_SEPARATOR}{id}"))
}

/// Split a stored identity.
///
/// Values written before the name existed carry no separator; the whole
/// value is then the id and the name is empty. Decoding never fails.
pub fn decode_identity(value: &str) -> SessionIdentity {
    match value.split_once(IDENTITY_SEPARATOR) {
        Some((name, id)) => SessionIdentity::new(name, id),
        None => SessionIdentity::new("", value),
    }
}

/// One connection-update sample written by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Connected duration as formatted by the engine
    pub duration: String,
    /// Timestamp of the last received packet
    pub last_packet_receive_at: String,
    /// Bytes received
    pub bytes_in: String,
    /// Bytes sent
    pub bytes_out: String,
}

impl StatusEvent {
    /// Encode in the engine's wire form
    pub fn encode(&self) -> String {
        [
            self.duration.as_str(),
            self.last_packet_receive_at.as_str(),
            self.bytes_in.as_str(),
            self.bytes_out.as_str(),
        ]
        .join(&STATUS_SEPARATOR.to_string())
    }

    /// Bytes received, if the engine wrote a plain integer
    pub fn bytes_in_u64(&self) -> Option<u64> {
        self.bytes_in.trim().parse().ok()
    }

    /// Bytes sent, if the engine wrote a plain integer
    pub fn bytes_out_u64(&self) -> Option<u64> {
        self.bytes_out.trim().parse().ok()
    }
}

/// Split a connection-update value into its four fields.
pub fn decode_status_event(value: &str) -> Result<StatusEvent, CodecError> {
    let fields: Vec<&str> = value.split(STATUS_SEPARATOR).collect();
    if fields.len() != STATUS_FIELDS {
        return Err(CodecError::FieldCount {
            expected: STATUS_FIELDS,
            found: fields.len(),
        });
    }

    Ok(StatusEvent {
        duration: fields[0].to_string(),
        last_packet_receive_at: fields[1].to_string(),
        bytes_in: fields[2].to_string(),
        bytes_out: fields[3].to_string(),
    })
}

/// Decode the profile-status sentinel. Fails open: only `"0"` is false.
pub fn decode_profile_flag(value: &str) -> bool {
    value != PROFILE_NOT_LOADED
}

/// Format an expiry timestamp for the engine
pub fn format_expiry(at: &NaiveDateTime) -> String {
    at.format(EXPIRY_FORMAT).to_string()
}

/// Parse an expiry timestamp reported by the engine
pub fn parse_expiry(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), EXPIRY_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let encoded = encode_identity("work-vpn", "42").unwrap();
        assert_eq!(encoded, "work-vpn{||}42");
        assert_eq!(decode_identity(&encoded), SessionIdentity::new("work-vpn", "42"));
    }

    #[test]
    fn test_identity_empty_fields() {
        let encoded = encode_identity("", "").unwrap();
        assert_eq!(decode_identity(&encoded), SessionIdentity::new("", ""));

        let encoded = encode_identity("home", "").unwrap();
        assert_eq!(decode_identity(&encoded), SessionIdentity::new("home", ""));
    }

    #[test]
    fn test_identity_rejects_separator() {
        assert_eq!(
            encode_identity("a{||}b", "1"),
            Err(CodecError::Encoding { field: "name" })
        );
        assert_eq!(
            encode_identity("a", "{||}"),
            Err(CodecError::Encoding { field: "id" })
        );
    }

    #[test]
    fn test_identity_legacy_form() {
        assert_eq!(decode_identity("abc"), SessionIdentity::new("", "abc"));
    }

    #[test]
    fn test_identity_partial_separator_is_data() {
        // "{|" alone is not the separator
        let identity = decode_identity("a{|b");
        assert_eq!(identity, SessionIdentity::new("", "a{|b"));
    }

    #[test]
    fn test_status_event_decode() {
        let event = decode_status_event("1_2_3_4").unwrap();
        assert_eq!(event.duration, "1");
        assert_eq!(event.last_packet_receive_at, "2");
        assert_eq!(event.bytes_in, "3");
        assert_eq!(event.bytes_out, "4");
    }

    #[test]
    fn test_status_event_field_count() {
        assert_eq!(
            decode_status_event("1_2_3"),
            Err(CodecError::FieldCount { expected: 4, found: 3 })
        );
        assert!(decode_status_event("1_2_3_4_5").is_err());
        assert!(decode_status_event("").is_err());
    }

    #[test]
    fn test_status_event_opaque_fields() {
        let event = decode_status_event("12:03_2024-12-31 23:59:00_lots_").unwrap();
        assert_eq!(event.duration, "12:03");
        assert_eq!(event.last_packet_receive_at, "2024-12-31 23:59:00");
        assert_eq!(event.bytes_in, "lots");
        assert_eq!(event.bytes_out, "");
        assert_eq!(event.bytes_in_u64(), None);
    }

    #[test]
    fn test_status_event_encode() {
        let event = decode_status_event("00:01_never_10_20").unwrap();
        assert_eq!(event.encode(), "00:01_never_10_20");
        assert_eq!(event.bytes_out_u64(), Some(20));
    }

    #[test]
    fn test_expiry_format() {
        let at = chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(format_expiry(&at), "2025-01-01 00:00:00");
        assert_eq!(parse_expiry("2025-01-01 00:00:00"), Some(at));
        assert_eq!(parse_expiry("2025-01-01T00:00:00"), None);
        assert_eq!(parse_expiry(""), None);
    }

    #[test]
    fn test_profile_flag_fail_open() {
        assert!(!decode_profile_flag("0"));
        assert!(decode_profile_flag(""));
        assert!(decode_profile_flag("1"));
        assert!(decode_profile_flag("true"));
        assert!(decode_profile_flag("00"));
    }
}
