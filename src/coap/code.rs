use crate::error::Status;

/// CoAP message type, from the 2-bit T field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
  Confirmable,
  NonConfirmable,
  Acknowledgement,
  Reset,
}

impl MessageType {
  pub(crate) fn to_bits(self) -> u8 {
    match self {
      MessageType::Confirmable => 0,
      MessageType::NonConfirmable => 1,
      MessageType::Acknowledgement => 2,
      MessageType::Reset => 3,
    }
  }

  pub(crate) fn from_bits(bits: u8) -> MessageType {
    match bits & 0x3 {
      0 => MessageType::Confirmable,
      1 => MessageType::NonConfirmable,
      2 => MessageType::Acknowledgement,
      _ => MessageType::Reset,
    }
  }
}

/// CoAP code byte: 3-bit class, 5-bit detail, written `c.dd`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
  pub const EMPTY: Code = Code(0x00);

  pub const GET: Code = Code::request(1);
  pub const POST: Code = Code::request(2);
  pub const PUT: Code = Code::request(3);
  pub const DELETE: Code = Code::request(4);

  pub const CREATED: Code = Code::new(2, 1);
  pub const DELETED: Code = Code::new(2, 2);
  pub const VALID: Code = Code::new(2, 3);
  pub const CHANGED: Code = Code::new(2, 4);
  pub const CONTENT: Code = Code::new(2, 5);
  pub const CONTINUE: Code = Code::new(2, 31);

  pub const BAD_REQUEST: Code = Code::new(4, 0);
  pub const NOT_FOUND: Code = Code::new(4, 4);
  pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
  pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
  pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

  pub const fn new(class: u8, detail: u8) -> Code {
    Code((class << 5) | (detail & 0x1f))
  }

  const fn request(detail: u8) -> Code {
    Code::new(0, detail)
  }

  pub fn class(self) -> u8 {
    self.0 >> 5
  }

  pub fn detail(self) -> u8 {
    self.0 & 0x1f
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn is_request(self) -> bool {
    self.class() == 0 && !self.is_empty()
  }

  pub fn is_response(self) -> bool {
    matches!(self.class(), 2..=5)
  }

  pub fn is_success(self) -> bool {
    self.class() == 2
  }
}

impl std::fmt::Debug for Code {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{:02}", self.class(), self.detail())
  }
}

impl std::fmt::Display for Code {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self:?}")
  }
}

/// Payload serialization formats the cloud speaks, as CoAP Content-Format
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
  TextPlain,
  OctetStream,
  Json,
  Cbor,
  /// No Accept option is emitted; the server chooses.
  Any,
}

impl ContentType {
  pub fn to_wire(self) -> Option<u16> {
    match self {
      ContentType::TextPlain => Some(0),
      ContentType::OctetStream => Some(42),
      ContentType::Json => Some(50),
      ContentType::Cbor => Some(60),
      ContentType::Any => None,
    }
  }

  pub fn from_wire(number: u16) -> Result<ContentType, Status> {
    match number {
      0 => Ok(ContentType::TextPlain),
      42 => Ok(ContentType::OctetStream),
      50 => Ok(ContentType::Json),
      60 => Ok(ContentType::Cbor),
      _ => Err(Status::InvalidFormat),
    }
  }
}
