// Scalar helpers for JSON payloads, shared by the typed LightDB getters.

use crate::error::{GolResult, Status};

pub fn payload_as_int(payload: &[u8]) -> GolResult<i64> {
  serde_json::from_slice(payload).map_err(|_| Status::InvalidFormat)
}

pub fn payload_as_float(payload: &[u8]) -> GolResult<f64> {
  serde_json::from_slice(payload).map_err(|_| Status::InvalidFormat)
}

pub fn payload_as_bool(payload: &[u8]) -> GolResult<bool> {
  serde_json::from_slice(payload).map_err(|_| Status::InvalidFormat)
}

pub fn payload_as_string(payload: &[u8]) -> GolResult<String> {
  serde_json::from_slice(payload).map_err(|_| Status::InvalidFormat)
}

/// True for an absent value: empty payload or JSON `null`.
pub fn payload_is_null(payload: &[u8]) -> bool {
  payload.is_empty() || payload == b"null"
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalars_parse() {
    assert_eq!(payload_as_int(b"42").unwrap(), 42);
    assert_eq!(payload_as_int(b"-3").unwrap(), -3);
    assert_eq!(payload_as_float(b"4.25").unwrap(), 4.25);
    assert!(payload_as_bool(b"true").unwrap());
    assert!(!payload_as_bool(b"false").unwrap());
    assert_eq!(payload_as_string(b"\"hello\"").unwrap(), "hello");
  }

  #[test]
  fn mismatched_types_are_rejected() {
    assert_eq!(payload_as_int(b"4.2"), Err(Status::InvalidFormat));
    assert_eq!(payload_as_int(b"\"42\""), Err(Status::InvalidFormat));
    assert_eq!(payload_as_bool(b"1"), Err(Status::InvalidFormat));
    assert_eq!(payload_as_string(b"42"), Err(Status::InvalidFormat));
  }

  #[test]
  fn null_detection() {
    assert!(payload_is_null(b""));
    assert!(payload_is_null(b"null"));
    assert!(!payload_is_null(b"0"));
  }
}
