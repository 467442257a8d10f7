// CoAP message model and binary codec (the RFC 7252 subset the cloud
// services use, plus the RFC 7959 block options).

pub(crate) mod block;
pub(crate) mod code;
pub(crate) mod message;
pub mod option;

pub use block::BlockValue;
pub use code::{Code, ContentType, MessageType};
pub use message::{Message, MessageBuilder, Token};
pub use option::CoapOption;
