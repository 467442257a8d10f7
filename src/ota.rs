//! Over-the-air update primitives: manifest observation and parsing,
//! component block downloads (resumable), and state reporting.
//!
//! The policy lives in [`fw_update`](crate::fw_update); this module only
//! moves bytes and documents.

use std::time::Duration;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{
  blockwise::{self, DownloadedBlock},
  client::Client,
  coap::ContentType,
  config::{
    BLOCKWISE_DOWNLOAD_BUFFER_SIZE, OTA_MAX_NUM_COMPONENTS, OTA_MAX_PACKAGE_NAME_LEN,
    OTA_MAX_VERSION_LEN,
  },
  error::{GolResult, Status},
  scheduler::{CoapResponse, RequestKind},
};

/// Manifest resource, observed for update offers.
pub const MANIFEST_PATH: &str = ".u/desired";
const COMPONENT_PATH_PREFIX: &str = ".u/c";

/// Block size requested for component downloads.
pub const BLOCKSIZE: usize = BLOCKWISE_DOWNLOAD_BUFFER_SIZE;

pub const COMPONENT_HASH_LEN: usize = 32;

/// Device-side update state, as reported to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OtaState {
  Idle = 0,
  Downloading = 1,
  Downloaded = 2,
  Updating = 3,
}

/// Why the state is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OtaReason {
  Ready = 0,
  FirmwareUpdatedSuccessfully = 1,
  NotEnoughFlash = 2,
  OutOfRam = 3,
  ConnectionLost = 4,
  IntegrityCheckFailure = 5,
  UnsupportedPackage = 6,
  InvalidManifest = 7,
  FirmwareUpdateFailed = 8,
  AwaitRetry = 9,
  Io = 10,
}

/// One downloadable artifact offered by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaComponent {
  pub package: String,
  pub version: String,
  pub size: u64,
  pub hash: [u8; COMPONENT_HASH_LEN],
  pub uri: String,
  pub bootloader: Option<String>,
}

impl OtaComponent {
  /// Resource path the component's blocks are served from.
  pub fn block_path(&self) -> String {
    format!("{COMPONENT_PATH_PREFIX}/{}@{}", self.package, self.version)
  }

  fn status_path(package: &str) -> String {
    format!("{COMPONENT_PATH_PREFIX}/{package}/status")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OtaManifest {
  pub sequence_number: u64,
  pub components: Vec<OtaComponent>,
}

impl OtaManifest {
  pub fn find_component(&self, package: &str) -> Option<&OtaComponent> {
    self.components.iter().find(|c| c.package == package)
  }
}

#[derive(Deserialize)]
struct ComponentWire {
  package: String,
  version: String,
  #[serde(default)]
  size: u64,
  hash: String,
  #[serde(default)]
  uri: Option<String>,
  #[serde(default)]
  bootloader: Option<String>,
}

#[derive(Deserialize)]
struct ManifestWire {
  #[serde(rename = "sequenceNumber", default)]
  sequence_number: u64,
  #[serde(default)]
  components: Vec<ComponentWire>,
}

/// Number of download blocks a component of `size` bytes spans. An
/// estimate: the server's size field and the actual block count may
/// disagree by one.
pub fn size_to_nblocks(size: u64) -> u64 {
  (size / BLOCKSIZE as u64) + 1
}

/// Parse a manifest notification payload.
pub fn payload_as_manifest(payload: &[u8]) -> GolResult<OtaManifest> {
  let wire: ManifestWire =
    ciborium::de::from_reader(payload).map_err(|_| Status::InvalidFormat)?;

  let mut components = Vec::new();
  for component in wire.components {
    if components.len() >= OTA_MAX_NUM_COMPONENTS {
      warn!(
        "manifest {} offers more than {OTA_MAX_NUM_COMPONENTS} components, extras ignored",
        wire.sequence_number
      );
      break;
    }
    if component.package.len() > OTA_MAX_PACKAGE_NAME_LEN
      || component.version.len() > OTA_MAX_VERSION_LEN
    {
      return Err(Status::InvalidFormat);
    }
    let hash_bytes = hex::decode(&component.hash).map_err(|_| Status::InvalidFormat)?;
    let hash: [u8; COMPONENT_HASH_LEN] =
      hash_bytes.try_into().map_err(|_| Status::InvalidFormat)?;
    let uri = component.uri.unwrap_or_else(|| {
      format!(
        "{COMPONENT_PATH_PREFIX}/{}@{}",
        component.package, component.version
      )
    });
    components.push(OtaComponent {
      package: component.package,
      version: component.version,
      size: component.size,
      hash,
      uri,
      bootloader: component.bootloader,
    });
  }

  Ok(OtaManifest {
    sequence_number: wire.sequence_number,
    components,
  })
}

/// Observe the manifest resource. The callback runs on the I/O thread with
/// each parsed manifest (or the parse error) and must hand the work off to
/// another thread instead of blocking.
pub fn observe_manifest<F>(client: &Client, mut callback: F) -> GolResult<()>
where
  F: FnMut(GolResult<OtaManifest>) + Send + 'static,
{
  client.enqueue_async(
    RequestKind::Observe,
    MANIFEST_PATH,
    ContentType::Any,
    ContentType::Cbor,
    Bytes::new(),
    Some(Box::new(move |notification: &CoapResponse| {
      if notification.payload.is_empty() {
        return;
      }
      callback(payload_as_manifest(&notification.payload));
    })),
    None,
    None,
  )
}

/// Report the update state machine's position to the cloud. The version
/// fields are included exactly when given.
pub fn report_state_sync(
  client: &Client,
  state: OtaState,
  reason: OtaReason,
  package: &str,
  current_version: Option<&str>,
  target_version: Option<&str>,
  timeout: Option<Duration>,
) -> GolResult<()> {
  #[derive(serde::Serialize)]
  struct Report<'a> {
    state: OtaState,
    reason: OtaReason,
    package: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
  }
  let report = Report {
    state,
    reason,
    package,
    version: current_version,
    target: target_version,
  };
  let mut payload = Vec::new();
  ciborium::ser::into_writer(&report, &mut payload).map_err(|_| Status::InvalidFormat)?;
  client
    .request_sync(
      RequestKind::Post,
      &OtaComponent::status_path(package),
      ContentType::Cbor,
      ContentType::Any,
      Bytes::from(payload),
      timeout,
    )?
    .ok()
}

/// Fetch a single component block. Returns the block bytes, whether it was
/// the last one, the server's negotiated block size, and Size2 if present.
pub fn get_block_sync(
  client: &Client,
  package: &str,
  version: &str,
  block_index: u32,
  timeout: Option<Duration>,
) -> GolResult<(Bytes, bool, usize, Option<u64>)> {
  let path = format!("{COMPONENT_PATH_PREFIX}/{package}@{version}");
  let response = blockwise::fetch_block(
    client,
    &path,
    ContentType::OctetStream,
    block_index,
    BLOCKSIZE,
    timeout,
  )?;
  let (is_last, negotiated) = match response.block2 {
    Some(block) => (!block.more, block.size()),
    None => (true, BLOCKSIZE),
  };
  Ok((response.payload, is_last, negotiated, response.size2))
}

/// Per-block sink for [`download_component`]. Gets the component, block
/// index, payload, last-block flag and negotiated block size; an error
/// return aborts the attempt at this block.
pub type BlockCallback<'a> =
  dyn FnMut(&OtaComponent, u32, &[u8], bool, usize) -> GolResult<()> + 'a;

/// Download `component` starting at `start_block`, feeding every received
/// block to `on_block` in order.
///
/// On failure the error carries the failing block index; call again with
/// `start_block` set to it to resume the transfer.
pub fn download_component(
  client: &Client,
  component: &OtaComponent,
  start_block: u32,
  on_block: &mut BlockCallback<'_>,
) -> Result<(), (u32, Status)> {
  let path = component.block_path();
  debug!(
    "downloading {} from block {start_block} (about {} blocks)",
    path,
    size_to_nblocks(component.size)
  );
  blockwise::download(
    client,
    &path,
    ContentType::OctetStream,
    start_block,
    None,
    &mut |block: DownloadedBlock<'_>| {
      on_block(
        component,
        block.index,
        block.data,
        block.is_last,
        block.negotiated_size,
      )
    },
  )
}
