use std::time::Instant;

use bytes::Bytes;

use crate::{
  coap::{BlockValue, Code, ContentType},
  error::{GolResult, Status},
};

/// Completion of a single request: invoked exactly once, on the I/O thread.
pub(crate) type ReplyCallback = Box<dyn FnOnce(GolResult<CoapResponse>) + Send>;

/// Observation notification sink: invoked once per notification, on the I/O
/// thread. Must not block and must not issue synchronous requests.
pub(crate) type ObserveCallback = Box<dyn FnMut(&CoapResponse) + Send>;

/// What a request asks the server to do.
pub(crate) enum RequestKind {
  Get,
  Post,
  Put,
  Delete,
  /// GET with Observe=0; registers `observe_cb` under a fresh token.
  Observe,
  /// GET with Observe=1 for the active observation on `path`.
  CancelObserve,
  /// Empty CON; the pong is an RST (or empty ACK) with the same message ID.
  Ping,
  /// Single block of a blockwise download.
  BlockGet { block2: BlockValue },
  /// Single block of a blockwise upload.
  BlockPost {
    block1: BlockValue,
    /// Total payload size, sent as Size1 on the first block.
    size1: Option<u64>,
  },
}

impl RequestKind {
  pub fn code(&self) -> Code {
    match self {
      RequestKind::Get
      | RequestKind::Observe
      | RequestKind::CancelObserve
      | RequestKind::BlockGet { .. } => Code::GET,
      RequestKind::Post | RequestKind::BlockPost { .. } => Code::POST,
      RequestKind::Put => Code::PUT,
      RequestKind::Delete => Code::DELETE,
      RequestKind::Ping => Code::EMPTY,
    }
  }
}

/// One queued unit of work for the I/O thread.
pub(crate) struct QueuedRequest {
  pub kind: RequestKind,
  pub path: String,
  /// Content-Format of `payload`, for payload-carrying kinds.
  pub content_type: ContentType,
  /// Accept option for GETs; `Any` emits none.
  pub accept: ContentType,
  pub payload: Bytes,
  pub completion: Option<ReplyCallback>,
  pub observe_cb: Option<ObserveCallback>,
  /// Absolute deadline, computed (and capped) at enqueue time.
  pub deadline: Instant,
  pub enqueued_at: Instant,
}

impl QueuedRequest {
  /// Consume the completion slot and deliver the terminal result.
  pub fn complete(&mut self, result: GolResult<CoapResponse>) {
    if let Some(completion) = self.completion.take() {
      completion(result);
    }
  }
}

/// Out-of-band commands to the I/O thread. These travel on an unbounded
/// channel so a full request mailbox cannot delay them.
pub(crate) enum ControlCommand {
  Start,
  Stop,
  Shutdown,
  SetPacketLossPercent(u8),
}

/// Decoded server response (or observation notification), as delivered to
/// completions and observation callbacks.
#[derive(Debug, Clone)]
pub struct CoapResponse {
  /// Response code, e.g. 2.05.
  pub code: Code,
  /// Request path this response answers; for notifications, the observed
  /// path.
  pub path: String,
  pub payload: Bytes,
  pub content_type: Option<ContentType>,
  pub block1: Option<BlockValue>,
  pub block2: Option<BlockValue>,
  /// Total representation size from Size2, when the server sent one.
  pub size2: Option<u64>,
  /// Observe sequence number, present on notifications.
  pub observe_seq: Option<u64>,
}

impl CoapResponse {
  pub fn is_success(&self) -> bool {
    self.code.is_success()
  }

  /// Collapse the response class into the status taxonomy.
  pub fn ok(&self) -> GolResult<()> {
    if self.is_success() {
      Ok(())
    } else {
      Err(Status::Fail)
    }
  }
}
