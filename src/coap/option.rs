use bytes::{Buf, BufMut, BytesMut};

use crate::error::Status;

/// Option numbers used by this client.
pub mod number {
  pub const OBSERVE: u16 = 6;
  pub const URI_PATH: u16 = 11;
  pub const CONTENT_FORMAT: u16 = 12;
  pub const MAX_AGE: u16 = 14;
  pub const URI_QUERY: u16 = 15;
  pub const ACCEPT: u16 = 17;
  pub const BLOCK2: u16 = 23;
  pub const BLOCK1: u16 = 27;
  pub const SIZE2: u16 = 28;
  pub const SIZE1: u16 = 60;
}

/// One decoded CoAP option.
///
/// Values are opaque bytes here; uint-typed options go through
/// [`encode_uint`]/[`decode_uint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
  pub number: u16,
  pub value: Vec<u8>,
}

impl CoapOption {
  pub fn new(number: u16, value: Vec<u8>) -> CoapOption {
    CoapOption { number, value }
  }

  pub fn uint(number: u16, value: u64) -> CoapOption {
    CoapOption {
      number,
      value: encode_uint(value),
    }
  }

  pub fn value_as_uint(&self) -> Result<u64, Status> {
    decode_uint(&self.value)
  }
}

/// Minimal-length big-endian encoding of a CoAP uint option value.
/// Zero encodes as the empty string.
pub fn encode_uint(mut value: u64) -> Vec<u8> {
  let mut out = Vec::with_capacity(8);
  while value > 0 {
    out.push((value & 0xff) as u8);
    value >>= 8;
  }
  out.reverse();
  out
}

pub fn decode_uint(bytes: &[u8]) -> Result<u64, Status> {
  if bytes.len() > 8 {
    return Err(Status::InvalidFormat);
  }
  let mut value = 0u64;
  for b in bytes {
    value = (value << 8) | u64::from(*b);
  }
  Ok(value)
}

// Delta/length nibble encoding per RFC 7252 section 3.1. 13 means one
// extension byte (value - 13), 14 means two extension bytes (value - 269),
// 15 is reserved for the payload marker.

fn put_nibble_ext(buf: &mut BytesMut, value: u16) {
  if value >= 269 {
    buf.put_u16(value - 269);
  } else if value >= 13 {
    buf.put_u8((value - 13) as u8);
  }
}

fn nibble_of(value: u16) -> u8 {
  if value >= 269 {
    14
  } else if value >= 13 {
    13
  } else {
    value as u8
  }
}

/// Serialize options into `buf`. `options` must already be sorted by
/// ascending option number; repeated numbers keep their relative order.
pub(crate) fn encode_options(buf: &mut BytesMut, options: &[CoapOption]) -> Result<(), Status> {
  let mut previous = 0u16;
  for opt in options {
    if opt.number < previous {
      return Err(Status::InvalidFormat);
    }
    let delta = opt.number - previous;
    let length = opt.value.len();
    if length > u16::MAX as usize {
      return Err(Status::InvalidFormat);
    }
    buf.put_u8((nibble_of(delta) << 4) | nibble_of(length as u16));
    put_nibble_ext(buf, delta);
    put_nibble_ext(buf, length as u16);
    buf.put_slice(&opt.value);
    previous = opt.number;
  }
  Ok(())
}

fn take_nibble_ext(buf: &mut &[u8], nibble: u8) -> Result<u16, Status> {
  match nibble {
    0..=12 => Ok(u16::from(nibble)),
    13 => {
      if buf.remaining() < 1 {
        return Err(Status::InvalidFormat);
      }
      Ok(u16::from(buf.get_u8()) + 13)
    }
    14 => {
      if buf.remaining() < 2 {
        return Err(Status::InvalidFormat);
      }
      let v = buf.get_u16();
      v.checked_add(269).ok_or(Status::InvalidFormat)
    }
    _ => Err(Status::InvalidFormat),
  }
}

/// Parse the option block of a message. `buf` starts right after the token
/// and is left positioned at the payload (after the 0xFF marker), or empty.
pub(crate) fn decode_options(buf: &mut &[u8]) -> Result<Vec<CoapOption>, Status> {
  let mut options = Vec::new();
  let mut previous = 0u16;
  while buf.has_remaining() {
    let first = buf[0];
    if first == 0xff {
      buf.advance(1);
      if !buf.has_remaining() {
        // marker with no payload is a message format error
        return Err(Status::InvalidFormat);
      }
      break;
    }
    buf.advance(1);
    let delta = take_nibble_ext(buf, first >> 4)?;
    let length = take_nibble_ext(buf, first & 0x0f)? as usize;
    if buf.remaining() < length {
      return Err(Status::InvalidFormat);
    }
    let number = previous.checked_add(delta).ok_or(Status::InvalidFormat)?;
    let value = buf[..length].to_vec();
    buf.advance(length);
    options.push(CoapOption { number, value });
    previous = number;
  }
  Ok(options)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uint_values_are_minimal() {
    assert_eq!(encode_uint(0), Vec::<u8>::new());
    assert_eq!(encode_uint(5), vec![5]);
    assert_eq!(encode_uint(0x0100), vec![0x01, 0x00]);
    assert_eq!(encode_uint(0x012345), vec![0x01, 0x23, 0x45]);
    assert_eq!(decode_uint(&[]).unwrap(), 0);
    assert_eq!(decode_uint(&[0x01, 0x00]).unwrap(), 256);
    assert!(decode_uint(&[0; 9]).is_err());
  }

  #[test]
  fn short_deltas_encode_in_one_byte() {
    let mut buf = BytesMut::new();
    encode_options(
      &mut buf,
      &[
        CoapOption::new(number::URI_PATH, b".d".to_vec()),
        CoapOption::new(number::URI_PATH, b"counter".to_vec()),
      ],
    )
    .unwrap();
    assert_eq!(
      &buf[..],
      &[0xb2, 0x2e, 0x64, 0x07, 0x63, 0x6f, 0x75, 0x6e, 0x74, 0x65, 0x72]
    );
  }

  #[test]
  fn extended_delta_and_length() {
    // Size1 (60): delta nibble 13, extension byte 60 - 13 = 47
    let mut buf = BytesMut::new();
    encode_options(&mut buf, &[CoapOption::uint(number::SIZE1, 1024)]).unwrap();
    assert_eq!(&buf[..], &[0xd2, 0x2f, 0x04, 0x00]);

    // a long value forces the 14-nibble length form
    let big = vec![0xaa; 300];
    let mut buf = BytesMut::new();
    encode_options(&mut buf, &[CoapOption::new(3, big.clone())]).unwrap();
    assert_eq!(buf[0], 0x3e);
    assert_eq!(&buf[1..3], &(300u16 - 269).to_be_bytes());
    assert_eq!(&buf[3..], &big[..]);
  }

  #[test]
  fn decode_round_trip() {
    let options = vec![
      CoapOption::uint(number::OBSERVE, 0),
      CoapOption::new(number::URI_PATH, b".u".to_vec()),
      CoapOption::new(number::URI_PATH, b"desired".to_vec()),
      CoapOption::uint(number::ACCEPT, 60),
      CoapOption::uint(number::BLOCK2, 0x2e),
      CoapOption::uint(number::SIZE1, 20480),
    ];
    let mut buf = BytesMut::new();
    encode_options(&mut buf, &options).unwrap();
    let mut slice: &[u8] = &buf;
    let decoded = decode_options(&mut slice).unwrap();
    assert_eq!(decoded, options);
    assert!(slice.is_empty());
  }

  #[test]
  fn unsorted_options_are_rejected() {
    let mut buf = BytesMut::new();
    let r = encode_options(
      &mut buf,
      &[
        CoapOption::uint(number::ACCEPT, 60),
        CoapOption::new(number::URI_PATH, b"x".to_vec()),
      ],
    );
    assert_eq!(r, Err(Status::InvalidFormat));
  }

  #[test]
  fn truncated_option_is_rejected() {
    // claims 2 value bytes, provides 1
    let mut slice: &[u8] = &[0xb2, 0x2e];
    assert_eq!(decode_options(&mut slice), Err(Status::InvalidFormat));
  }

  #[test]
  fn marker_without_payload_is_rejected() {
    let mut slice: &[u8] = &[0xff];
    assert_eq!(decode_options(&mut slice), Err(Status::InvalidFormat));
  }
}
