//! Remote procedure calls: the device observes the RPC resource, the cloud
//! pushes invocations, the device answers with a status code and an
//! optional detail map.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ciborium::value::Value;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
  client::{Client, RequestSender},
  coap::ContentType,
  config::{RPC_MAX_NUM_METHODS, RPC_MAX_RESPONSE_LEN},
  error::{GolResult, Status},
  scheduler::{CoapResponse, RequestKind},
};

const RPC_PATH: &str = ".rpc";
const RPC_STATUS_PATH: &str = ".rpc/status";

/// Status code carried in the RPC response, mirroring the gRPC code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RpcStatus {
  Ok = 0,
  Canceled = 1,
  Unknown = 2,
  InvalidArgument = 3,
  DeadlineExceeded = 4,
  NotFound = 5,
  AlreadyExists = 6,
  PermissionDenied = 7,
  ResourceExhausted = 8,
  FailedPrecondition = 9,
  Aborted = 10,
  OutOfRange = 11,
  Unimplemented = 12,
  Internal = 13,
  Unavailable = 14,
  DataLoss = 15,
  Unauthenticated = 16,
}

/// Builder for the `detail` map of an RPC response.
#[derive(Default)]
pub struct RpcResponseDetail {
  entries: Vec<(Value, Value)>,
}

impl RpcResponseDetail {
  pub fn insert(&mut self, key: &str, value: Value) {
    self.entries.push((Value::Text(key.to_string()), value));
  }

  fn into_value(self) -> Value {
    Value::Map(self.entries)
  }
}

/// A registered method: invoked with the decoded parameter array, fills
/// the response detail map, returns the status code.
pub type MethodFn = Box<dyn FnMut(&[Value], &mut RpcResponseDetail) -> RpcStatus + Send>;

struct Method {
  name: String,
  callback: MethodFn,
}

#[derive(Deserialize)]
struct RpcInvocation {
  id: u64,
  method: String,
  #[serde(default)]
  params: Vec<Value>,
}

#[derive(Serialize)]
struct RpcReply {
  id: u64,
  #[serde(rename = "statusCode")]
  status_code: u32,
  detail: Value,
}

/// Handle to the RPC dispatcher. Creating it observes the RPC resource;
/// methods registered afterwards become callable from the cloud.
pub struct Rpc {
  registry: Arc<Mutex<Vec<Method>>>,
}

impl Rpc {
  pub fn new(client: &Client) -> GolResult<Rpc> {
    let registry: Arc<Mutex<Vec<Method>>> = Arc::new(Mutex::new(Vec::new()));
    let dispatcher_registry = Arc::clone(&registry);
    let sender = client.sender();
    client.enqueue_async(
      RequestKind::Observe,
      RPC_PATH,
      ContentType::Any,
      ContentType::Cbor,
      Bytes::new(),
      Some(Box::new(move |notification: &CoapResponse| {
        dispatch(&sender, &dispatcher_registry, notification);
      })),
      None,
      None,
    )?;
    Ok(Rpc { registry })
  }

  /// Register `method`. Method names are unique; the table holds at most
  /// [`RPC_MAX_NUM_METHODS`] entries.
  pub fn register<F>(&self, method: &str, callback: F) -> GolResult<()>
  where
    F: FnMut(&[Value], &mut RpcResponseDetail) -> RpcStatus + Send + 'static,
  {
    let mut registry = self.registry.lock().unwrap();
    if registry.iter().any(|m| m.name == method) {
      return Err(Status::NotAllowed);
    }
    if registry.len() >= RPC_MAX_NUM_METHODS {
      return Err(Status::MemAlloc);
    }
    registry.push(Method {
      name: method.to_string(),
      callback: Box::new(callback),
    });
    Ok(())
  }
}

fn dispatch(sender: &RequestSender, registry: &Mutex<Vec<Method>>, notification: &CoapResponse) {
  if notification.payload.is_empty() {
    return;
  }
  let invocation: RpcInvocation =
    match ciborium::de::from_reader(notification.payload.as_ref()) {
      Ok(invocation) => invocation,
      Err(e) => {
        warn!("undecodable RPC invocation: {e}");
        return;
      }
    };
  debug!("RPC request {}: {}", invocation.id, invocation.method);

  let mut detail = RpcResponseDetail::default();
  let status = {
    let mut registry = registry.lock().unwrap();
    match registry.iter_mut().find(|m| m.name == invocation.method) {
      Some(method) => (method.callback)(&invocation.params, &mut detail),
      None => {
        warn!("RPC method {} not registered", invocation.method);
        RpcStatus::NotFound
      }
    }
  };

  let mut reply = RpcReply {
    id: invocation.id,
    status_code: status as u32,
    detail: detail.into_value(),
  };
  let mut encoded = Vec::new();
  if ciborium::ser::into_writer(&reply, &mut encoded).is_err() {
    error!("failed to encode RPC reply {}", invocation.id);
    return;
  }
  if encoded.len() > RPC_MAX_RESPONSE_LEN {
    warn!(
      "RPC reply {} is {} bytes, over the {RPC_MAX_RESPONSE_LEN}-byte cap; detail dropped",
      invocation.id,
      encoded.len()
    );
    reply.detail = Value::Map(Vec::new());
    reply.status_code = RpcStatus::ResourceExhausted as u32;
    encoded.clear();
    if ciborium::ser::into_writer(&reply, &mut encoded).is_err() {
      return;
    }
  }

  if let Err(e) = sender.enqueue_nowait(
    RequestKind::Post,
    RPC_STATUS_PATH,
    ContentType::Cbor,
    Bytes::from(encoded),
  ) {
    warn!("could not enqueue RPC reply {}: {e}", invocation.id);
  }
}

// Decode helpers for method implementations.

pub fn param_as_i64(value: &Value) -> GolResult<i64> {
  match value {
    Value::Integer(i) => i64::try_from(i128::from(*i)).map_err(|_| Status::InvalidFormat),
    _ => Err(Status::InvalidFormat),
  }
}

pub fn param_as_f64(value: &Value) -> GolResult<f64> {
  match value {
    Value::Float(f) => Ok(*f),
    Value::Integer(i) => i64::try_from(i128::from(*i))
      .map(|v| v as f64)
      .map_err(|_| Status::InvalidFormat),
    _ => Err(Status::InvalidFormat),
  }
}

pub fn param_as_str(value: &Value) -> GolResult<&str> {
  match value {
    Value::Text(s) => Ok(s.as_str()),
    _ => Err(Status::InvalidFormat),
  }
}
