use std::{io, net::UdpSocket, os::unix::io::AsRawFd, os::unix::io::RawFd};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::ClientConfig,
  error::{GolResult, Status},
  transport::Transport,
};

/// Plaintext UDP. No handshake, no privacy: test rigs and NoSec networks
/// only.
pub(crate) struct UdpTransport {
  socket: UdpSocket,
}

impl UdpTransport {
  pub fn connect(config: &ClientConfig) -> GolResult<UdpTransport> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| {
      error!("UDP bind failed: {e}");
      Status::IoError
    })?;
    socket
      .connect((config.host.as_str(), config.port))
      .map_err(|e| {
        error!("UDP connect to {}:{} failed: {e}", config.host, config.port);
        Status::IoError
      })?;
    socket.set_nonblocking(true).map_err(|_| Status::IoError)?;
    info!("UDP transport up: {}:{}", config.host, config.port);
    Ok(UdpTransport { socket })
  }
}

impl Transport for UdpTransport {
  fn send(&mut self, datagram: &[u8]) -> GolResult<()> {
    match self.socket.send(datagram) {
      Ok(n) if n == datagram.len() => Ok(()),
      Ok(n) => {
        warn!("short UDP send: {n} of {}", datagram.len());
        Err(Status::IoError)
      }
      Err(e) => {
        warn!("UDP send: {e}");
        Err(Status::IoError)
      }
    }
  }

  fn recv(&mut self, buf: &mut [u8]) -> GolResult<Option<usize>> {
    match self.socket.recv(buf) {
      Ok(n) => Ok(Some(n)),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(e) => {
        warn!("UDP recv: {e}");
        Err(Status::IoError)
      }
    }
  }

  fn raw_fd(&self) -> RawFd {
    self.socket.as_raw_fd()
  }

  fn close(&mut self) {
    // nothing to tear down for UDP
  }
}
