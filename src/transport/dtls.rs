use std::{
  io,
  io::{Read, Write},
  net::UdpSocket,
  os::unix::io::{AsRawFd, RawFd},
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use openssl::{
  pkey::PKey,
  ssl::{ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode},
  x509::X509,
};

use crate::{
  config::{ClientConfig, Credentials},
  error::{GolResult, Status},
  transport::Transport,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
// With a connected UDP socket OpenSSL cannot query the path MTU, so pick a
// safe ceiling for handshake fragmentation.
const DTLS_MTU: u32 = 1500;

// Ciphersuites offered in PSK mode; the server picks.
const PSK_CIPHER_LIST: &str = "PSK-AES128-GCM-SHA256:PSK-AES128-CCM8:PSK-AES128-CBC-SHA256";

/// DTLS 1.2 over a connected UDP socket, via OpenSSL.
pub(crate) struct DtlsTransport {
  stream: SslStream<UdpChannel>,
}

/// Read/Write adapter so OpenSSL can drive the datagram socket.
#[derive(Debug)]
struct UdpChannel {
  socket: UdpSocket,
}

impl Read for UdpChannel {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.socket.recv(buf)
  }
}

impl Write for UdpChannel {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.socket.send(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn ssl_context(config: &ClientConfig) -> GolResult<SslContext> {
  let mut builder =
    SslContextBuilder::new(SslMethod::dtls()).map_err(|e| stack_error("context", &e))?;

  match &config.credentials {
    Credentials::Psk { id, key } => {
      let id = id.clone();
      let key = key.clone();
      builder
        .set_cipher_list(PSK_CIPHER_LIST)
        .map_err(|e| stack_error("cipher list", &e))?;
      builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
        // identity must be copied NUL-terminated
        if id.len() + 1 > identity_buf.len() || key.len() > psk_buf.len() {
          warn!("PSK material does not fit the OpenSSL buffers");
          return Ok(0);
        }
        identity_buf[..id.len()].copy_from_slice(id.as_bytes());
        identity_buf[id.len()] = 0;
        psk_buf[..key.len()].copy_from_slice(&key);
        Ok(key.len())
      });
    }
    Credentials::Pki {
      ca,
      client_cert,
      client_key,
      secondary_ca,
    } => {
      let ca = X509::from_der(ca).map_err(|e| stack_error("CA cert", &e))?;
      builder
        .cert_store_mut()
        .add_cert(ca)
        .map_err(|e| stack_error("CA store", &e))?;
      if let Some(secondary) = secondary_ca {
        let secondary = X509::from_der(secondary).map_err(|e| stack_error("secondary CA", &e))?;
        builder
          .cert_store_mut()
          .add_cert(secondary)
          .map_err(|e| stack_error("CA store", &e))?;
      }
      let cert = X509::from_der(client_cert).map_err(|e| stack_error("client cert", &e))?;
      builder
        .set_certificate(&cert)
        .map_err(|e| stack_error("client cert", &e))?;
      let key =
        PKey::private_key_from_der(client_key).map_err(|e| stack_error("client key", &e))?;
      builder
        .set_private_key(&key)
        .map_err(|e| stack_error("client key", &e))?;
      builder
        .check_private_key()
        .map_err(|e| stack_error("key/cert mismatch", &e))?;
      builder.set_verify(SslVerifyMode::PEER);
    }
    Credentials::Tag(tag) => {
      // keystore-tag credentials need a platform keystore backend,
      // which the OpenSSL transport does not have
      error!("credential tag {tag} is not usable with the OpenSSL transport");
      return Err(Status::NotImplemented);
    }
  }

  Ok(builder.build())
}

fn stack_error(what: &str, e: &openssl::error::ErrorStack) -> Status {
  error!("DTLS {what}: {e}");
  Status::IoError
}

impl DtlsTransport {
  pub fn connect(config: &ClientConfig) -> GolResult<DtlsTransport> {
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
    // blocking with a timeout for the handshake only
    socket
      .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
      .map_err(|_| Status::IoError)?;

    let context = ssl_context(config)?;
    let mut ssl = Ssl::new(&context).map_err(|e| stack_error("session", &e))?;
    ssl.set_mtu(DTLS_MTU).map_err(|e| stack_error("mtu", &e))?;
    if let Credentials::Pki { .. } = config.credentials {
      ssl
        .set_hostname(&config.host)
        .map_err(|e| stack_error("SNI", &e))?;
      ssl
        .param_mut()
        .set_host(&config.host)
        .map_err(|e| stack_error("hostname verification", &e))?;
    }
    if config.use_connection_id {
      // rust-openssl does not expose the DTLS CID extension; the handshake
      // proceeds without offering one
      debug!("Connection-ID requested; transport backend cannot offer it");
    }

    let stream = ssl
      .connect(UdpChannel { socket })
      .map_err(|e| {
        error!("DTLS handshake with {} failed: {e}", config.host);
        Status::IoError
      })?;

    let socket = &stream.get_ref().socket;
    socket.set_read_timeout(None).map_err(|_| Status::IoError)?;
    socket.set_nonblocking(true).map_err(|_| Status::IoError)?;

    info!(
      "DTLS session up: {}:{} ({})",
      config.host,
      config.port,
      stream.ssl().current_cipher().map_or("?", |c| c.name())
    );
    Ok(DtlsTransport { stream })
  }
}

impl Transport for DtlsTransport {
  fn send(&mut self, datagram: &[u8]) -> GolResult<()> {
    match self.stream.ssl_write(datagram) {
      Ok(n) if n == datagram.len() => Ok(()),
      Ok(n) => {
        warn!("short DTLS write: {n} of {}", datagram.len());
        Err(Status::IoError)
      }
      Err(e) => {
        warn!("DTLS write: {e}");
        Err(Status::IoError)
      }
    }
  }

  fn recv(&mut self, buf: &mut [u8]) -> GolResult<Option<usize>> {
    match self.stream.ssl_read(buf) {
      Ok(n) => Ok(Some(n)),
      Err(e) if e.code() == ErrorCode::WANT_READ => Ok(None),
      Err(e)
        if e
          .io_error()
          .is_some_and(|io| io.kind() == io::ErrorKind::WouldBlock) =>
      {
        Ok(None)
      }
      Err(e) => {
        // fatal alert, close-notify, or socket error: session is dead
        warn!("DTLS read: {e}");
        Err(Status::IoError)
      }
    }
  }

  fn raw_fd(&self) -> RawFd {
    self.stream.get_ref().socket.as_raw_fd()
  }

  fn close(&mut self) {
    let _ = self.stream.shutdown();
  }
}
