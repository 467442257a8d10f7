//! LightDB state: persistent key/value documents addressed by path.
//!
//! Set/get/delete operate on JSON by default; `raw` variants carry any
//! content type. `observe` subscribes to server-side changes.

use std::time::Duration;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::{
  client::Client,
  coap::ContentType,
  error::{GolResult, Status},
  payload,
  scheduler::{CoapResponse, RequestKind},
};

const PATH_PREFIX: &str = ".d/";

fn db_path(path: &str) -> String {
  format!("{PATH_PREFIX}{path}")
}

fn json_payload<T: Serialize>(value: &T) -> GolResult<Bytes> {
  serde_json::to_vec(value)
    .map(Bytes::from)
    .map_err(|_| Status::InvalidFormat)
}

/// Adapt a unit-result user callback to the scheduler's completion shape.
fn set_completion<F>(on_complete: F) -> crate::scheduler::ReplyCallback
where
  F: FnOnce(GolResult<()>) + Send + 'static,
{
  Box::new(move |result| on_complete(result.and_then(|response| response.ok())))
}

// ---- set ----

/// Write a JSON-serializable value, asynchronously.
pub fn set_async<T, F>(client: &Client, path: &str, value: &T, on_complete: F) -> GolResult<()>
where
  T: Serialize,
  F: FnOnce(GolResult<()>) + Send + 'static,
{
  client.enqueue_async(
    RequestKind::Post,
    &db_path(path),
    ContentType::Json,
    ContentType::Any,
    json_payload(value)?,
    None,
    Some(set_completion(on_complete)),
    None,
  )
}

/// Write a JSON-serializable value and wait for the server's answer.
pub fn set_sync<T: Serialize>(
  client: &Client,
  path: &str,
  value: &T,
  timeout: Option<Duration>,
) -> GolResult<()> {
  client
    .request_sync(
      RequestKind::Post,
      &db_path(path),
      ContentType::Json,
      ContentType::Any,
      json_payload(value)?,
      timeout,
    )?
    .ok()
}

pub fn set_int_sync(
  client: &Client,
  path: &str,
  value: i64,
  timeout: Option<Duration>,
) -> GolResult<()> {
  set_sync(client, path, &value, timeout)
}

pub fn set_bool_sync(
  client: &Client,
  path: &str,
  value: bool,
  timeout: Option<Duration>,
) -> GolResult<()> {
  set_sync(client, path, &value, timeout)
}

pub fn set_float_sync(
  client: &Client,
  path: &str,
  value: f64,
  timeout: Option<Duration>,
) -> GolResult<()> {
  set_sync(client, path, &value, timeout)
}

pub fn set_string_sync(
  client: &Client,
  path: &str,
  value: &str,
  timeout: Option<Duration>,
) -> GolResult<()> {
  set_sync(client, path, &value, timeout)
}

pub fn set_int_async<F>(client: &Client, path: &str, value: i64, on_complete: F) -> GolResult<()>
where
  F: FnOnce(GolResult<()>) + Send + 'static,
{
  set_async(client, path, &value, on_complete)
}

/// Write pre-encoded bytes with an explicit content type.
pub fn set_raw_sync(
  client: &Client,
  path: &str,
  content_type: ContentType,
  data: &[u8],
  timeout: Option<Duration>,
) -> GolResult<()> {
  client
    .request_sync(
      RequestKind::Post,
      &db_path(path),
      content_type,
      ContentType::Any,
      Bytes::copy_from_slice(data),
      timeout,
    )?
    .ok()
}

// ---- get ----

/// Fetch the raw document and its content-type hint.
pub fn get_raw_sync(
  client: &Client,
  path: &str,
  accept: ContentType,
  timeout: Option<Duration>,
) -> GolResult<CoapResponse> {
  let response = client.request_sync(
    RequestKind::Get,
    &db_path(path),
    ContentType::Any,
    accept,
    Bytes::new(),
    timeout,
  )?;
  response.ok()?;
  Ok(response)
}

fn get_scalar_payload(
  client: &Client,
  path: &str,
  timeout: Option<Duration>,
) -> GolResult<Bytes> {
  let response = get_raw_sync(client, path, ContentType::Json, timeout)?;
  if payload::payload_is_null(&response.payload) {
    return Err(Status::Null);
  }
  Ok(response.payload)
}

pub fn get_int_sync(client: &Client, path: &str, timeout: Option<Duration>) -> GolResult<i64> {
  payload::payload_as_int(&get_scalar_payload(client, path, timeout)?)
}

pub fn get_bool_sync(client: &Client, path: &str, timeout: Option<Duration>) -> GolResult<bool> {
  payload::payload_as_bool(&get_scalar_payload(client, path, timeout)?)
}

pub fn get_float_sync(client: &Client, path: &str, timeout: Option<Duration>) -> GolResult<f64> {
  payload::payload_as_float(&get_scalar_payload(client, path, timeout)?)
}

pub fn get_string_sync(
  client: &Client,
  path: &str,
  timeout: Option<Duration>,
) -> GolResult<String> {
  payload::payload_as_string(&get_scalar_payload(client, path, timeout)?)
}

pub fn get_json_sync(
  client: &Client,
  path: &str,
  timeout: Option<Duration>,
) -> GolResult<serde_json::Value> {
  let payload = get_scalar_payload(client, path, timeout)?;
  serde_json::from_slice(&payload).map_err(|_| Status::InvalidFormat)
}

// ---- delete ----

pub fn delete_sync(client: &Client, path: &str, timeout: Option<Duration>) -> GolResult<()> {
  client
    .request_sync(
      RequestKind::Delete,
      &db_path(path),
      ContentType::Any,
      ContentType::Any,
      Bytes::new(),
      timeout,
    )?
    .ok()
}

pub fn delete_async<F>(client: &Client, path: &str, on_complete: F) -> GolResult<()>
where
  F: FnOnce(GolResult<()>) + Send + 'static,
{
  client.enqueue_async(
    RequestKind::Delete,
    &db_path(path),
    ContentType::Any,
    ContentType::Any,
    Bytes::new(),
    None,
    Some(set_completion(on_complete)),
    None,
  )
}

// ---- observe ----

/// Subscribe to changes of `path`. The callback runs on the I/O thread
/// with the observed path (without the service prefix) and the raw
/// payload; it must not block or issue synchronous requests.
pub fn observe<F>(client: &Client, path: &str, accept: ContentType, mut callback: F) -> GolResult<()>
where
  F: FnMut(&str, &[u8]) + Send + 'static,
{
  let user_path = path.to_string();
  client.enqueue_async(
    RequestKind::Observe,
    &db_path(path),
    ContentType::Any,
    accept,
    Bytes::new(),
    Some(Box::new(move |response: &CoapResponse| {
      callback(&user_path, &response.payload);
    })),
    None,
    None,
  )
}

/// Cancel the observation on `path`. Asynchronous and idempotent: an
/// unknown path completes with `NotAllowed` but enqueues fine.
pub fn stop_observing(client: &Client, path: &str) -> GolResult<()> {
  client.enqueue_async(
    RequestKind::CancelObserve,
    &db_path(path),
    ContentType::Any,
    ContentType::Any,
    Bytes::new(),
    None,
    None,
    None,
  )
}
