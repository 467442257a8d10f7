//! Network-info uploads: the same radio-environment document as the
//! location query, shipped to the net-info resource for fleet-side use.
//! Documents larger than one block go up blockwise.

use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  blockwise::{self, SliceSource},
  client::Client,
  coap::ContentType,
  config::BLOCKWISE_UPLOAD_BLOCK_SIZE,
  error::GolResult,
  scheduler::RequestKind,
  services::location::NetworkInfo,
};

const NET_INFO_PATH: &str = "loc/net";

/// Upload a finished [`NetworkInfo`] document.
pub fn upload_sync(
  client: &Client,
  info: &NetworkInfo,
  timeout: Option<Duration>,
) -> GolResult<()> {
  let payload = info.to_cbor()?;
  if payload.len() <= BLOCKWISE_UPLOAD_BLOCK_SIZE {
    return client
      .request_sync(
        RequestKind::Post,
        NET_INFO_PATH,
        ContentType::Cbor,
        ContentType::Any,
        payload,
        timeout,
      )?
      .ok();
  }
  debug!("net info document is {} bytes, uploading blockwise", payload.len());
  let mut source = SliceSource::new(&payload);
  blockwise::upload(client, NET_INFO_PATH, ContentType::Cbor, &mut source, timeout)?.ok()
}
