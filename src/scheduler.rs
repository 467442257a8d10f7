// The request scheduler: one I/O thread owning the transport, serializing
// requests one-in-flight, pumping observation notifications between them,
// and supervising retransmission, keepalive, deadlines and reconnect.

#[allow(dead_code)] // We allow this, since extra constants are not too harmful.
pub(crate) mod constant;

pub(crate) mod event_loop;
pub(crate) mod observations;
pub(crate) mod request;

pub use request::CoapResponse;
pub(crate) use request::{ReplyCallback, RequestKind};
