use std::io;

/// Status of every fallible operation in this crate.
///
/// The same set of codes travels all the way from the transport up to the
/// service APIs, so a caller can match on one enum regardless of which layer
/// produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
  /// Generic failure not covered by a more specific code.
  #[error("operation failed")]
  Fail,
  /// Operation refused, e.g. cancelling an observation for an unknown token.
  #[error("operation not allowed")]
  NotAllowed,
  /// A payload was required but missing or empty.
  #[error("missing or null payload")]
  Null,
  /// A decoder rejected the payload.
  #[error("invalid format")]
  InvalidFormat,
  /// Transport-level send or receive failed.
  #[error("transport i/o error")]
  IoError,
  /// The deadline elapsed before a response arrived.
  #[error("timeout")]
  Timeout,
  /// The request mailbox was full at enqueue time.
  #[error("request queue full")]
  QueueFull,
  /// The client is not running, or the call was made in the wrong phase.
  #[error("invalid client state")]
  InvalidState,
  /// Allocation or capacity failure inside the core (e.g. a bounded
  /// registry is full).
  #[error("out of memory or table space")]
  MemAlloc,
  /// A blockwise stream producer has no more data to give.
  #[error("no more data")]
  NoMoreData,
  /// The feature is disabled in this build.
  #[error("not implemented in this build")]
  NotImplemented,
}

impl Status {
  /// Short identifier, for log lines and cloud status reports.
  pub fn as_str(self) -> &'static str {
    match self {
      Status::Fail => "FAIL",
      Status::NotAllowed => "NOT_ALLOWED",
      Status::Null => "NULL",
      Status::InvalidFormat => "INVALID_FORMAT",
      Status::IoError => "IO_ERROR",
      Status::Timeout => "TIMEOUT",
      Status::QueueFull => "QUEUE_FULL",
      Status::InvalidState => "INVALID_STATE",
      Status::MemAlloc => "MEM_ALLOC",
      Status::NoMoreData => "NO_MORE_DATA",
      Status::NotImplemented => "NOT_IMPLEMENTED",
    }
  }
}

impl From<io::Error> for Status {
  fn from(e: io::Error) -> Status {
    match e.kind() {
      io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Status::Timeout,
      _ => Status::IoError,
    }
  }
}

pub type GolResult<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_error_mapping() {
    assert_eq!(
      Status::from(io::Error::new(io::ErrorKind::TimedOut, "t")),
      Status::Timeout
    );
    assert_eq!(
      Status::from(io::Error::new(io::ErrorKind::ConnectionReset, "r")),
      Status::IoError
    );
  }

  #[test]
  fn status_strings_are_stable() {
    assert_eq!(Status::QueueFull.as_str(), "QUEUE_FULL");
    assert_eq!(Status::Timeout.to_string(), "timeout");
  }
}
