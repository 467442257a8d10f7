use std::time::Duration;

use static_assertions::const_assert;

/// Default server endpoint.
pub const DEFAULT_HOST_URI: &str = "coaps://coap.golioth.io";
/// Default CoAP/DTLS port.
pub const DEFAULT_PORT: u16 = 5684;

/// How long to wait for a server response to a single request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long an application thread may block on a full request mailbox.
pub const REQUEST_QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Capacity of the request mailbox.
pub const REQUEST_QUEUE_MAX_ITEMS: usize = 10;
/// Stack size of the I/O thread.
pub const COAP_THREAD_STACK_SIZE: usize = 6 * 1024;
/// Idle time after which a keepalive ping is sent.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(9);
/// Time after an unanswered ping at which the session is declared dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum number of simultaneously active observations.
pub const MAX_NUM_OBSERVATIONS: usize = 8;
/// Block size used for blockwise uploads.
pub const BLOCKWISE_UPLOAD_BLOCK_SIZE: usize = 1024;
/// Buffer size for blockwise downloads. Also the largest block size the
/// client will offer to the server.
pub const BLOCKWISE_DOWNLOAD_BUFFER_SIZE: usize = 1024;
/// Longest accepted Uri-Path, in bytes, not counting the leading service
/// segment.
pub const COAP_MAX_PATH_LEN: usize = 39;
/// Maximum number of registered settings.
pub const MAX_NUM_SETTINGS: usize = 16;
/// Upper bound for an encoded settings status report.
pub const SETTINGS_MAX_RESPONSE_LEN: usize = 256;
/// Maximum number of registered RPC methods.
pub const RPC_MAX_NUM_METHODS: usize = 8;
/// Upper bound for an encoded RPC response.
pub const RPC_MAX_RESPONSE_LEN: usize = 256;

/// Maximum number of components in one OTA manifest.
pub const OTA_MAX_NUM_COMPONENTS: usize = 1;
/// Maximum length of an OTA package name.
pub const OTA_MAX_PACKAGE_NAME_LEN: usize = 16;
/// Maximum length of an OTA component version string.
pub const OTA_MAX_VERSION_LEN: usize = 16;
/// Cap for the manifest observation retry backoff.
pub const OTA_OBSERVATION_RETRY_MAX_DELAY: Duration = Duration::from_secs(3600);

// Block sizes are wire-encoded as SZX = log2(size) - 4, so they must be
// powers of two within [16, 1024].
const_assert!(BLOCKWISE_UPLOAD_BLOCK_SIZE.is_power_of_two());
const_assert!(BLOCKWISE_UPLOAD_BLOCK_SIZE >= 16 && BLOCKWISE_UPLOAD_BLOCK_SIZE <= 1024);
const_assert!(BLOCKWISE_DOWNLOAD_BUFFER_SIZE.is_power_of_two());
const_assert!(BLOCKWISE_DOWNLOAD_BUFFER_SIZE >= 16 && BLOCKWISE_DOWNLOAD_BUFFER_SIZE <= 1024);

/// Client authentication material.
///
/// The server end decides which modes it accepts; devices normally use
/// pre-shared keys, fleets with provisioning infrastructure use
/// certificates.
#[derive(Clone)]
pub enum Credentials {
  /// DTLS in pre-shared-key mode.
  Psk {
    /// ASCII identity, registered with the cloud project.
    id: String,
    /// Opaque key material, up to 64 bytes.
    key: Vec<u8>,
  },
  /// DTLS with client certificates. All material is DER encoded.
  Pki {
    /// CA used to authenticate the server.
    ca: Vec<u8>,
    /// Device certificate.
    client_cert: Vec<u8>,
    /// Device private key.
    client_key: Vec<u8>,
    /// Optional second CA, accepted during CA rotation.
    secondary_ca: Option<Vec<u8>>,
  },
  /// Reference into a platform keystore, for operating systems that do not
  /// hand out raw key material.
  Tag(u32),
}

impl std::fmt::Debug for Credentials {
  // Never prints key material.
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Credentials::Psk { id, .. } => write!(f, "Psk {{ id: {id:?} }}"),
      Credentials::Pki { secondary_ca, .. } => write!(
        f,
        "Pki {{ secondary_ca: {} }}",
        if secondary_ca.is_some() { "yes" } else { "no" }
      ),
      Credentials::Tag(t) => write!(f, "Tag({t})"),
    }
  }
}

/// Everything needed to create a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// Server host name or address. The `coaps://` scheme prefix is accepted
  /// and stripped.
  pub host: String,
  pub port: u16,
  pub credentials: Credentials,
  /// Offer a DTLS Connection-ID during the handshake, where the transport
  /// backend supports it. A server that does not reply with a CID is fine.
  pub use_connection_id: bool,
  /// Forward local log records at or above the cloud log level to the
  /// logging service.
  pub log_to_cloud: bool,
  /// Per-request response timeout. `None` means the crate default.
  pub response_timeout: Option<Duration>,
  /// Keepalive idle interval. `None` means the crate default.
  pub keepalive_interval: Option<Duration>,
  /// Speak plaintext UDP instead of DTLS. Only for test rigs and NoSec
  /// networks; the credentials are ignored.
  pub nosec: bool,
}

impl ClientConfig {
  pub fn new(credentials: Credentials) -> Self {
    Self::with_host(DEFAULT_HOST_URI, DEFAULT_PORT, credentials)
  }

  pub fn with_host(host: &str, port: u16, credentials: Credentials) -> Self {
    let host = host
      .strip_prefix("coaps://")
      .or_else(|| host.strip_prefix("coap://"))
      .unwrap_or(host)
      .to_string();
    ClientConfig {
      host,
      port,
      credentials,
      use_connection_id: false,
      log_to_cloud: false,
      response_timeout: None,
      keepalive_interval: None,
      nosec: false,
    }
  }

  pub fn response_timeout(&self) -> Duration {
    self.response_timeout.unwrap_or(RESPONSE_TIMEOUT)
  }

  pub fn keepalive_interval(&self) -> Duration {
    self.keepalive_interval.unwrap_or(KEEPALIVE_INTERVAL)
  }

  /// Cap a caller-supplied wait so that a wedged server cannot park a
  /// caller forever. `None` means "wait forever", which is capped at the
  /// response timeout.
  pub(crate) fn cap_timeout(&self, timeout: Option<Duration>) -> Duration {
    let cap = self.response_timeout();
    match timeout {
      None => cap,
      Some(t) => t.min(cap),
    }
  }
}
