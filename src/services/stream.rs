//! Stream: one-way time-series uploads. Nothing is stored per path on the
//! server side the way LightDB state is; each POST appends an event.

use std::time::Duration;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::{
  blockwise::{self, SliceSource},
  client::Client,
  coap::ContentType,
  config::BLOCKWISE_UPLOAD_BLOCK_SIZE,
  error::{GolResult, Status},
  scheduler::RequestKind,
};

const PATH_PREFIX: &str = ".s/";

fn stream_path(path: &str) -> String {
  format!("{PATH_PREFIX}{path}")
}

pub fn set_async<F>(
  client: &Client,
  path: &str,
  content_type: ContentType,
  data: &[u8],
  on_complete: F,
) -> GolResult<()>
where
  F: FnOnce(GolResult<()>) + Send + 'static,
{
  client.enqueue_async(
    RequestKind::Post,
    &stream_path(path),
    content_type,
    ContentType::Any,
    Bytes::copy_from_slice(data),
    None,
    Some(Box::new(move |result| {
      on_complete(result.and_then(|response| response.ok()))
    })),
    None,
  )
}

pub fn set_sync(
  client: &Client,
  path: &str,
  content_type: ContentType,
  data: &[u8],
  timeout: Option<Duration>,
) -> GolResult<()> {
  client
    .request_sync(
      RequestKind::Post,
      &stream_path(path),
      content_type,
      ContentType::Any,
      Bytes::copy_from_slice(data),
      timeout,
    )?
    .ok()
}

pub fn set_json_sync<T: Serialize>(
  client: &Client,
  path: &str,
  value: &T,
  timeout: Option<Duration>,
) -> GolResult<()> {
  let payload = serde_json::to_vec(value).map_err(|_| Status::InvalidFormat)?;
  set_sync(client, path, ContentType::Json, &payload, timeout)
}

/// Upload a payload of any size; payloads beyond one block go blockwise.
pub fn set_blockwise_sync(
  client: &Client,
  path: &str,
  content_type: ContentType,
  data: &[u8],
  timeout: Option<Duration>,
) -> GolResult<()> {
  if data.len() <= BLOCKWISE_UPLOAD_BLOCK_SIZE {
    return set_sync(client, path, content_type, data, timeout);
  }
  let mut source = SliceSource::new(data);
  blockwise::upload(client, &stream_path(path), content_type, &mut source, timeout)?.ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn paths_gain_the_service_prefix() {
    assert_eq!(stream_path("multi_upload"), ".s/multi_upload");
  }
}
