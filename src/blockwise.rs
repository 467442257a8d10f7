// Blockwise transfer drivers: Block1 uploads and Block2 downloads, built
// from single-block synchronous exchanges so the scheduler's one-in-flight
// rule holds across the whole transfer.

use std::time::Duration;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  client::Client,
  coap::{BlockValue, ContentType},
  config::{BLOCKWISE_DOWNLOAD_BUFFER_SIZE, BLOCKWISE_UPLOAD_BLOCK_SIZE},
  error::{GolResult, Status},
  scheduler::{CoapResponse, RequestKind},
};

/// Retries of a single block exchange before the transfer fails over to
/// the caller.
const BLOCK_RETRIES: u32 = 3;
const BLOCK_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Supplies successive chunks of a blockwise upload.
pub trait ChunkSource {
  /// Fill `buf` with payload bytes starting at `offset`. Returns the byte
  /// count written and whether this chunk is the final one.
  fn read(&mut self, offset: usize, buf: &mut [u8]) -> GolResult<(usize, bool)>;

  /// Total payload size, if known up front; sent as Size1 on the first
  /// block.
  fn total_size(&self) -> Option<u64> {
    None
  }

  /// Rewind to offset 0. Called when the server negotiates a smaller block
  /// size and the upload restarts.
  fn reset(&mut self) -> GolResult<()>;
}

/// The common case: the whole payload is already in memory.
pub struct SliceSource<'a> {
  data: &'a [u8],
}

impl<'a> SliceSource<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    SliceSource { data }
  }
}

impl ChunkSource for SliceSource<'_> {
  fn read(&mut self, offset: usize, buf: &mut [u8]) -> GolResult<(usize, bool)> {
    if offset > self.data.len() {
      return Err(Status::NoMoreData);
    }
    let remaining = &self.data[offset..];
    let n = remaining.len().min(buf.len());
    buf[..n].copy_from_slice(&remaining[..n]);
    Ok((n, offset + n >= self.data.len()))
  }

  fn total_size(&self) -> Option<u64> {
    Some(self.data.len() as u64)
  }

  fn reset(&mut self) -> GolResult<()> {
    Ok(())
  }
}

/// Drive a full Block1 upload. Returns the final response (2.01/2.04).
pub(crate) fn upload(
  client: &Client,
  path: &str,
  content_type: ContentType,
  source: &mut dyn ChunkSource,
  timeout: Option<Duration>,
) -> GolResult<CoapResponse> {
  let mut block_size = BLOCKWISE_UPLOAD_BLOCK_SIZE;
  let mut index: u32 = 0;
  let mut buf = vec![0u8; block_size];

  loop {
    let offset = index as usize * block_size;
    let (n, is_last) = source.read(offset, &mut buf[..block_size])?;
    let block1 = BlockValue::new(index, !is_last, block_size)?;
    let size1 = if index == 0 { source.total_size() } else { None };

    trace!("uploading block {index} to {path} ({n} bytes, last: {is_last})");
    let response = client.request_sync(
      RequestKind::BlockPost { block1, size1 },
      path,
      content_type,
      ContentType::Any,
      Bytes::copy_from_slice(&buf[..n]),
      timeout,
    )?;
    response.ok()?;

    if let Some(acked) = response.block1 {
      if acked.size() < block_size {
        // the server negotiated down; the whole upload restarts at its size
        info!(
          "server negotiated upload block size {} (was {block_size}), restarting",
          acked.size()
        );
        block_size = acked.size();
        index = 0;
        source.reset()?;
        continue;
      }
    }

    if is_last {
      return Ok(response);
    }
    index += 1;
  }
}

/// One received download block, handed to the sink callback.
pub struct DownloadedBlock<'a> {
  pub index: u32,
  pub data: &'a [u8],
  pub is_last: bool,
  /// Block size the server is actually serving.
  pub negotiated_size: usize,
  /// Total representation size, when the server sent Size2.
  pub total_size: Option<u64>,
}

/// Fetch a single block. `index` and `size` follow the server's negotiated
/// numbering.
pub(crate) fn fetch_block(
  client: &Client,
  path: &str,
  accept: ContentType,
  index: u32,
  size: usize,
  timeout: Option<Duration>,
) -> GolResult<CoapResponse> {
  let block2 = BlockValue::new(index, false, size)?;
  let mut last_error = Status::Fail;
  for attempt in 0..BLOCK_RETRIES {
    if attempt > 0 {
      std::thread::sleep(BLOCK_RETRY_DELAY);
    }
    match client.request_sync(
      RequestKind::BlockGet { block2 },
      path,
      ContentType::Any,
      accept,
      Bytes::new(),
      timeout,
    ) {
      Ok(response) => {
        if response.is_success() {
          return Ok(response);
        }
        warn!("block {index} of {path}: server said {}", response.code);
        return Err(Status::Fail);
      }
      Err(e) => {
        debug!("block {index} of {path} failed ({e}), attempt {}", attempt + 1);
        last_error = e;
      }
    }
  }
  Err(last_error)
}

/// Drive a Block2 download from `start_index`, feeding each block to
/// `on_block` in order. On failure returns the failing block index, so the
/// caller can resume from there.
pub(crate) fn download(
  client: &Client,
  path: &str,
  accept: ContentType,
  start_index: u32,
  timeout: Option<Duration>,
  on_block: &mut dyn FnMut(DownloadedBlock<'_>) -> GolResult<()>,
) -> Result<(), (u32, Status)> {
  let mut size = BLOCKWISE_DOWNLOAD_BUFFER_SIZE;
  let mut index = start_index;

  loop {
    let response =
      fetch_block(client, path, accept, index, size, timeout).map_err(|e| (index, e))?;

    let (is_last, served_size) = match response.block2 {
      Some(served) => {
        if served.size() != size {
          debug!(
            "server serves {path} in {}-byte blocks (asked for {size})",
            served.size()
          );
        }
        if served.num != index && served.offset() != index as usize * size {
          warn!(
            "block numbering drifted on {path}: asked {index}, got {}",
            served.num
          );
        }
        (!served.more, served.size())
      }
      // no Block2 option: the whole representation fit one response
      None => (true, size),
    };

    let block = DownloadedBlock {
      index,
      data: &response.payload,
      is_last,
      negotiated_size: served_size,
      total_size: response.size2,
    };
    on_block(block).map_err(|e| (index, e))?;

    if is_last {
      return Ok(());
    }
    size = served_size;
    index += 1;
  }
}
