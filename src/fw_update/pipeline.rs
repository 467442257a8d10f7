use sha2::{Digest, Sha256};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{error::GolResult, fw_update::FwPlatform, ota::COMPONENT_HASH_LEN};

// Downloaded blocks pass through zero or more transform stages before
// reaching the platform write hook. The verification hash is computed on
// the delivered stream, after every transform.

enum Stage {
  #[cfg(feature = "ota-decompress")]
  Inflate(Box<miniz_oxide::inflate::stream::InflateState>),
  #[cfg(feature = "ota-patch")]
  Patch(PatchBuffer),
}

#[cfg(feature = "ota-patch")]
struct PatchBuffer {
  diff: Vec<u8>,
}

impl Stage {
  /// Feed `input` through this stage, producing zero or more output bytes.
  fn transform(&mut self, input: Vec<u8>) -> GolResult<Vec<u8>> {
    match self {
      #[cfg(feature = "ota-decompress")]
      Stage::Inflate(state) => inflate_chunk(state, &input),
      #[cfg(feature = "ota-patch")]
      Stage::Patch(buffer) => {
        // bsdiff needs the whole diff before it can produce anything
        buffer.diff.extend_from_slice(&input);
        Ok(Vec::new())
      }
      #[allow(unreachable_patterns)]
      _ => Ok(input),
    }
  }

  /// Flush at end of stream.
  fn finish(&mut self, platform: &mut dyn FwPlatform) -> GolResult<Vec<u8>> {
    match self {
      #[cfg(feature = "ota-decompress")]
      Stage::Inflate(_) => Ok(Vec::new()),
      #[cfg(feature = "ota-patch")]
      Stage::Patch(buffer) => apply_patch(platform, &buffer.diff),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = platform;
        Ok(Vec::new())
      }
    }
  }
}

#[cfg(feature = "ota-decompress")]
fn inflate_chunk(
  state: &mut miniz_oxide::inflate::stream::InflateState,
  input: &[u8],
) -> GolResult<Vec<u8>> {
  use miniz_oxide::{inflate::stream::inflate, MZFlush, MZStatus};

  use crate::error::Status;

  let mut out = Vec::new();
  let mut buf = [0u8; 4096];
  let mut consumed = 0;
  loop {
    let result = inflate(state, &input[consumed..], &mut buf, MZFlush::None);
    consumed += result.bytes_consumed;
    out.extend_from_slice(&buf[..result.bytes_written]);
    match result.status {
      Ok(MZStatus::Ok) | Ok(MZStatus::StreamEnd) => {
        if consumed >= input.len() && result.bytes_written < buf.len() {
          return Ok(out);
        }
      }
      Ok(_) => return Err(Status::Fail),
      Err(e) => {
        error!("inflate error: {e:?}");
        return Err(Status::Fail);
      }
    }
  }
}

#[cfg(feature = "ota-patch")]
fn apply_patch(platform: &mut dyn FwPlatform, diff: &[u8]) -> GolResult<Vec<u8>> {
  use crate::error::Status;

  // assemble the running image as the patch base
  let mut old = Vec::new();
  let mut chunk = [0u8; 4096];
  loop {
    let n = platform.read_current_image_at_offset(&mut chunk, old.len())?;
    if n == 0 {
      break;
    }
    old.extend_from_slice(&chunk[..n]);
  }
  info!("applying {}-byte patch against {}-byte image", diff.len(), old.len());

  let mut new = Vec::new();
  let mut reader = diff;
  bsdiff::patch(&old, &mut reader, &mut new).map_err(|e| {
    error!("patch failed: {e}");
    Status::Fail
  })?;
  Ok(new)
}

/// The assembled pipeline: transforms, hash, platform write offset
/// bookkeeping.
pub(crate) struct BlockPipeline<'a> {
  stages: Vec<Stage>,
  platform: &'a mut dyn FwPlatform,
  offset: usize,
  total: usize,
  sha: Sha256,
}

impl<'a> BlockPipeline<'a> {
  pub fn new(platform: &'a mut dyn FwPlatform, total: usize) -> BlockPipeline<'a> {
    #[allow(unused_mut)]
    let mut stages = Vec::new();
    #[cfg(feature = "ota-decompress")]
    stages.push(Stage::Inflate(
      miniz_oxide::inflate::stream::InflateState::new_boxed(miniz_oxide::DataFormat::Zlib),
    ));
    #[cfg(feature = "ota-patch")]
    stages.push(Stage::Patch(PatchBuffer { diff: Vec::new() }));
    BlockPipeline {
      stages,
      platform,
      offset: 0,
      total,
      sha: Sha256::new(),
    }
  }

  pub fn bytes_delivered(&self) -> usize {
    self.offset
  }

  pub fn write(&mut self, data: &[u8]) -> GolResult<()> {
    let mut current = data.to_vec();
    for stage in &mut self.stages {
      current = stage.transform(current)?;
    }
    self.deliver(current)
  }

  fn deliver(&mut self, data: Vec<u8>) -> GolResult<()> {
    if data.is_empty() {
      return Ok(());
    }
    self.sha.update(&data);
    self
      .platform
      .handle_block(&data, self.offset, self.total)?;
    self.offset += data.len();
    Ok(())
  }

  /// Flush every stage and return the SHA-256 of the delivered stream.
  pub fn finish(mut self) -> GolResult<[u8; COMPONENT_HASH_LEN]> {
    for i in 0..self.stages.len() {
      let flushed = {
        let (stage, platform) = (&mut self.stages[i], &mut *self.platform);
        stage.finish(platform)?
      };
      let mut current = flushed;
      for stage in &mut self.stages[i + 1..] {
        current = stage.transform(current)?;
      }
      self.deliver(current)?;
    }
    Ok(self.sha.finalize().into())
  }
}
