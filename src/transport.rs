// Datagram transport under the CoAP session: plaintext UDP, or DTLS 1.2
// when the `dtls` feature (default) is enabled.

use std::os::unix::io::RawFd;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{config::ClientConfig, error::GolResult};

#[cfg(feature = "dtls")]
pub(crate) mod dtls;
pub(crate) mod udp;

/// A connected datagram channel. Implementations perform their handshake in
/// their constructor; a value of this type is always ready to carry
/// datagrams until it reports an error.
pub(crate) trait Transport: Send {
  /// Send one datagram.
  fn send(&mut self, datagram: &[u8]) -> GolResult<()>;

  /// Non-blocking receive. `Ok(None)` when no datagram is pending.
  fn recv(&mut self, buf: &mut [u8]) -> GolResult<Option<usize>>;

  /// The socket fd, for poll registration.
  fn raw_fd(&self) -> RawFd;

  /// Best-effort orderly shutdown.
  fn close(&mut self);
}

/// Connect and handshake according to the configured credentials.
pub(crate) fn connect(config: &ClientConfig) -> GolResult<Box<dyn Transport>> {
  if config.nosec {
    return Ok(Box::new(udp::UdpTransport::connect(config)?));
  }

  #[cfg(feature = "dtls")]
  {
    Ok(Box::new(dtls::DtlsTransport::connect(config)?))
  }

  #[cfg(not(feature = "dtls"))]
  {
    error!("secure transport requested but the dtls feature is disabled");
    Err(crate::error::Status::NotImplemented)
  }
}
