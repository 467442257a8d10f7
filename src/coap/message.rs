use bytes::{BufMut, Bytes, BytesMut};

use crate::{
  coap::{
    block::BlockValue,
    code::{Code, ContentType, MessageType},
    option::{self, number, CoapOption},
  },
  error::Status,
};

const COAP_VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
pub(crate) const MAX_TOKEN_LEN: usize = 8;

/// CoAP token: 0 to 8 bytes matching a response (or notification) to its
/// request (or observation).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
  len: u8,
  bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
  pub const EMPTY: Token = Token {
    len: 0,
    bytes: [0; MAX_TOKEN_LEN],
  };

  pub fn new(slice: &[u8]) -> Result<Token, Status> {
    if slice.len() > MAX_TOKEN_LEN {
      return Err(Status::InvalidFormat);
    }
    let mut bytes = [0; MAX_TOKEN_LEN];
    bytes[..slice.len()].copy_from_slice(slice);
    Ok(Token {
      len: slice.len() as u8,
      bytes,
    })
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.bytes[..self.len as usize]
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
}

impl std::fmt::Debug for Token {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Token({})", hex::encode(self.as_slice()))
  }
}

/// One CoAP message, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub message_type: MessageType,
  pub code: Code,
  pub message_id: u16,
  pub token: Token,
  /// Sorted by option number.
  pub options: Vec<CoapOption>,
  pub payload: Bytes,
}

impl Message {
  /// An empty message: ACK, RST or ping. Carries no token, options or
  /// payload.
  pub fn empty(message_type: MessageType, message_id: u16) -> Message {
    Message {
      message_type,
      code: Code::EMPTY,
      message_id,
      token: Token::EMPTY,
      options: Vec::new(),
      payload: Bytes::new(),
    }
  }

  /// The ACK for a received confirmable message.
  pub fn ack_for(incoming: &Message) -> Message {
    Message::empty(MessageType::Acknowledgement, incoming.message_id)
  }

  /// The RST for a received message we cannot process.
  pub fn reset_for(incoming: &Message) -> Message {
    Message::empty(MessageType::Reset, incoming.message_id)
  }

  pub fn encode(&self) -> Result<Bytes, Status> {
    let token = self.token.as_slice();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + token.len() + 16 + self.payload.len());
    buf.put_u8((COAP_VERSION << 6) | (self.message_type.to_bits() << 4) | token.len() as u8);
    buf.put_u8(self.code.0);
    buf.put_u16(self.message_id);
    buf.put_slice(token);
    option::encode_options(&mut buf, &self.options)?;
    if !self.payload.is_empty() {
      buf.put_u8(0xff);
      buf.put_slice(&self.payload);
    }
    Ok(buf.freeze())
  }

  pub fn decode(datagram: &[u8]) -> Result<Message, Status> {
    if datagram.len() < HEADER_LEN {
      return Err(Status::InvalidFormat);
    }
    let b0 = datagram[0];
    if b0 >> 6 != COAP_VERSION {
      return Err(Status::InvalidFormat);
    }
    let message_type = MessageType::from_bits(b0 >> 4);
    let token_len = (b0 & 0x0f) as usize;
    if token_len > MAX_TOKEN_LEN || datagram.len() < HEADER_LEN + token_len {
      return Err(Status::InvalidFormat);
    }
    let code = Code(datagram[1]);
    let message_id = u16::from_be_bytes([datagram[2], datagram[3]]);
    let token = Token::new(&datagram[HEADER_LEN..HEADER_LEN + token_len])?;

    let mut rest = &datagram[HEADER_LEN + token_len..];
    if code.is_empty() && !rest.is_empty() {
      // an empty message is exactly 4 bytes plus token
      return Err(Status::InvalidFormat);
    }
    let options = option::decode_options(&mut rest)?;
    Ok(Message {
      message_type,
      code,
      message_id,
      token,
      options,
      payload: Bytes::copy_from_slice(rest),
    })
  }

  // ---- option accessors ----

  fn first_option(&self, number: u16) -> Option<&CoapOption> {
    self.options.iter().find(|o| o.number == number)
  }

  pub fn option_uint(&self, number: u16) -> Option<u64> {
    self
      .first_option(number)
      .and_then(|o| o.value_as_uint().ok())
  }

  pub fn observe(&self) -> Option<u64> {
    self.option_uint(number::OBSERVE)
  }

  pub fn block1(&self) -> Option<BlockValue> {
    self
      .first_option(number::BLOCK1)
      .and_then(|o| BlockValue::from_wire(&o.value).ok())
  }

  pub fn block2(&self) -> Option<BlockValue> {
    self
      .first_option(number::BLOCK2)
      .and_then(|o| BlockValue::from_wire(&o.value).ok())
  }

  pub fn size1(&self) -> Option<u64> {
    self.option_uint(number::SIZE1)
  }

  pub fn size2(&self) -> Option<u64> {
    self.option_uint(number::SIZE2)
  }

  pub fn content_format(&self) -> Option<ContentType> {
    self
      .option_uint(number::CONTENT_FORMAT)
      .and_then(|v| u16::try_from(v).ok())
      .and_then(|v| ContentType::from_wire(v).ok())
  }

  /// Uri-Path segments joined with '/'.
  pub fn uri_path(&self) -> String {
    let mut path = String::new();
    for o in self.options.iter().filter(|o| o.number == number::URI_PATH) {
      if !path.is_empty() {
        path.push('/');
      }
      path.push_str(&String::from_utf8_lossy(&o.value));
    }
    path
  }
}

/// Fluent construction of outgoing messages. Options may be added in any
/// order; `build` sorts them into wire order.
pub struct MessageBuilder {
  message: Message,
}

impl MessageBuilder {
  pub fn request(message_type: MessageType, code: Code) -> MessageBuilder {
    MessageBuilder {
      message: Message {
        message_type,
        code,
        message_id: 0,
        token: Token::EMPTY,
        options: Vec::new(),
        payload: Bytes::new(),
      },
    }
  }

  pub fn message_id(mut self, message_id: u16) -> Self {
    self.message.message_id = message_id;
    self
  }

  pub fn token(mut self, token: Token) -> Self {
    self.message.token = token;
    self
  }

  /// Split `path` on '/' into Uri-Path options. Empty segments are skipped,
  /// so a leading slash is harmless.
  pub fn path(mut self, path: &str) -> Self {
    for segment in path.split('/').filter(|s| !s.is_empty()) {
      self
        .message
        .options
        .push(CoapOption::new(number::URI_PATH, segment.as_bytes().to_vec()));
    }
    self
  }

  pub fn query(mut self, query: &str) -> Self {
    self
      .message
      .options
      .push(CoapOption::new(number::URI_QUERY, query.as_bytes().to_vec()));
    self
  }

  pub fn content_format(mut self, content_type: ContentType) -> Self {
    if let Some(wire) = content_type.to_wire() {
      self
        .message
        .options
        .push(CoapOption::uint(number::CONTENT_FORMAT, u64::from(wire)));
    }
    self
  }

  pub fn accept(mut self, content_type: ContentType) -> Self {
    if let Some(wire) = content_type.to_wire() {
      self
        .message
        .options
        .push(CoapOption::uint(number::ACCEPT, u64::from(wire)));
    }
    self
  }

  pub fn observe(mut self, value: u64) -> Self {
    self
      .message
      .options
      .push(CoapOption::uint(number::OBSERVE, value));
    self
  }

  pub fn block1(mut self, block: BlockValue) -> Self {
    self
      .message
      .options
      .push(CoapOption::new(number::BLOCK1, block.to_wire()));
    self
  }

  pub fn block2(mut self, block: BlockValue) -> Self {
    self
      .message
      .options
      .push(CoapOption::new(number::BLOCK2, block.to_wire()));
    self
  }

  pub fn size1(mut self, size: u64) -> Self {
    self
      .message
      .options
      .push(CoapOption::uint(number::SIZE1, size));
    self
  }

  pub fn payload(mut self, payload: Bytes) -> Self {
    self.message.payload = payload;
    self
  }

  pub fn build(mut self) -> Message {
    // stable sort keeps repeated Uri-Path segments in insertion order
    self.message.options.sort_by_key(|o| o.number);
    self.message
  }
}

#[cfg(test)]
mod tests {
  use hex_literal::hex;

  use super::*;

  #[test]
  fn encode_get_with_path_and_accept() {
    let m = MessageBuilder::request(MessageType::Confirmable, Code::GET)
      .message_id(0x1234)
      .token(Token::new(&[0xc0, 0x01]).unwrap())
      .path(".d/counter")
      .accept(ContentType::Cbor)
      .build();
    assert_eq!(
      m.encode().unwrap().as_ref(),
      hex!("42 01 1234 c001 b2 2e64 07 636f756e746572 61 3c")
    );
  }

  #[test]
  fn decode_piggybacked_response() {
    let bytes = hex!("61 45 0010 ab 61 05 61 32 ff 3432");
    let m = Message::decode(&bytes).unwrap();
    assert_eq!(m.message_type, MessageType::Acknowledgement);
    assert_eq!(m.code, Code::CONTENT);
    assert_eq!(m.message_id, 0x0010);
    assert_eq!(m.token, Token::new(&[0xab]).unwrap());
    assert_eq!(m.observe(), Some(5));
    assert_eq!(m.content_format(), Some(ContentType::Json));
    assert_eq!(m.payload.as_ref(), b"42");
  }

  #[test]
  fn round_trip_observe_request() {
    let m = MessageBuilder::request(MessageType::Confirmable, Code::GET)
      .message_id(7)
      .token(Token::new(&[1, 2, 3, 4]).unwrap())
      .path(".u/desired")
      .observe(0)
      .accept(ContentType::Cbor)
      .build();
    let decoded = Message::decode(&m.encode().unwrap()).unwrap();
    assert_eq!(decoded, m);
    assert_eq!(decoded.uri_path(), ".u/desired");
    assert_eq!(decoded.observe(), Some(0));
  }

  #[test]
  fn empty_messages() {
    let ping = Message::empty(MessageType::Confirmable, 0xbeef);
    let bytes = ping.encode().unwrap();
    assert_eq!(bytes.as_ref(), hex!("40 00 beef"));
    let back = Message::decode(&bytes).unwrap();
    assert!(back.code.is_empty());

    let rst = Message::reset_for(&back);
    assert_eq!(rst.message_type, MessageType::Reset);
    assert_eq!(rst.message_id, 0xbeef);
    assert_eq!(rst.encode().unwrap().as_ref(), hex!("70 00 beef"));
  }

  #[test]
  fn builder_sorts_options() {
    let m = MessageBuilder::request(MessageType::Confirmable, Code::GET)
      .accept(ContentType::Json)
      .observe(0)
      .path("a/b")
      .build();
    let numbers: Vec<u16> = m.options.iter().map(|o| o.number).collect();
    assert_eq!(
      numbers,
      vec![number::OBSERVE, number::URI_PATH, number::URI_PATH, number::ACCEPT]
    );
    // path segments kept in order through the sort
    assert_eq!(m.uri_path(), "a/b");
  }

  #[test]
  fn malformed_inputs_are_rejected() {
    assert!(Message::decode(&[]).is_err());
    assert!(Message::decode(&hex!("40 00")).is_err()); // truncated header
    assert!(Message::decode(&hex!("82 01 0000 aa")).is_err()); // wrong version
    assert!(Message::decode(&hex!("49 01 0000 aabbccddeeff00112233")).is_err()); // TKL 9
    assert!(Message::decode(&hex!("40 00 0000 ff41")).is_err()); // empty code with extra bytes
  }

  #[test]
  fn block_options_surface_as_values() {
    let b = BlockValue::new(3, true, 512).unwrap();
    let m = MessageBuilder::request(MessageType::Confirmable, Code::GET)
      .path(".u/c/main@1.2.4")
      .block2(b)
      .build();
    let decoded = Message::decode(&m.encode().unwrap()).unwrap();
    assert_eq!(decoded.block2(), Some(b));
    assert_eq!(decoded.block1(), None);
  }
}
