//! Remote settings: the cloud pushes a versioned map of name/value pairs;
//! each value is routed to its registered, typed handler, and a status
//! report for the whole batch goes back up.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ciborium::value::Value;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
  client::{Client, RequestSender},
  coap::ContentType,
  config::{MAX_NUM_SETTINGS, SETTINGS_MAX_RESPONSE_LEN},
  error::{GolResult, Status},
  scheduler::{CoapResponse, RequestKind},
};

const SETTINGS_PATH: &str = ".c";
const SETTINGS_STATUS_PATH: &str = ".c/status";
/// Longest accepted setting name.
pub const MAX_NAME_LEN: usize = 15;

/// Per-setting result code reported back to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SettingsStatus {
  Success = 0,
  KeyNotRecognized = 1,
  KeyNotValid = 2,
  ValueFormatNotValid = 3,
  ValueOutsideRange = 4,
  ValueStringTooLong = 5,
  GeneralError = 6,
}

enum Handler {
  Int {
    callback: Box<dyn FnMut(i64) -> SettingsStatus + Send>,
    min: Option<i64>,
    max: Option<i64>,
  },
  Bool(Box<dyn FnMut(bool) -> SettingsStatus + Send>),
  Float(Box<dyn FnMut(f64) -> SettingsStatus + Send>),
  Str(Box<dyn FnMut(&str) -> SettingsStatus + Send>),
}

struct Setting {
  name: String,
  handler: Handler,
}

#[derive(Deserialize)]
struct SettingsPush {
  version: u64,
  settings: std::collections::BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct SettingsReport {
  version_ack: u64,
  errors: Vec<SettingError>,
}

#[derive(Serialize)]
struct SettingError {
  setting_key: String,
  error_code: u32,
}

/// Handle to the settings service. Creating it observes the settings
/// resource; handlers registered afterwards receive pushed values.
///
/// Dropping the handle deregisters: the registry empties and the
/// observation on the settings resource is cancelled.
pub struct Settings {
  registry: Arc<Mutex<Vec<Setting>>>,
  sender: RequestSender,
}

impl Settings {
  pub fn new(client: &Client) -> GolResult<Settings> {
    let registry: Arc<Mutex<Vec<Setting>>> = Arc::new(Mutex::new(Vec::new()));
    let dispatcher_registry = Arc::clone(&registry);
    let sender = client.sender();
    let dispatcher_sender = sender.clone();
    client.enqueue_async(
      RequestKind::Observe,
      SETTINGS_PATH,
      ContentType::Any,
      ContentType::Cbor,
      Bytes::new(),
      Some(Box::new(move |notification: &CoapResponse| {
        dispatch(&dispatcher_sender, &dispatcher_registry, notification);
      })),
      None,
      None,
    )?;
    Ok(Settings { registry, sender })
  }

  fn add(&self, name: &str, handler: Handler) -> GolResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
      return Err(Status::InvalidFormat);
    }
    let mut registry = self.registry.lock().unwrap();
    if registry.iter().any(|s| s.name == name) {
      return Err(Status::NotAllowed);
    }
    if registry.len() >= MAX_NUM_SETTINGS {
      return Err(Status::MemAlloc);
    }
    registry.push(Setting {
      name: name.to_string(),
      handler,
    });
    Ok(())
  }

  pub fn register_int<F>(&self, name: &str, callback: F) -> GolResult<()>
  where
    F: FnMut(i64) -> SettingsStatus + Send + 'static,
  {
    self.add(
      name,
      Handler::Int {
        callback: Box::new(callback),
        min: None,
        max: None,
      },
    )
  }

  /// Like [`register_int`](Self::register_int), but values outside
  /// `[min, max]` are rejected before the callback runs.
  pub fn register_int_with_range<F>(
    &self,
    name: &str,
    min: i64,
    max: i64,
    callback: F,
  ) -> GolResult<()>
  where
    F: FnMut(i64) -> SettingsStatus + Send + 'static,
  {
    self.add(
      name,
      Handler::Int {
        callback: Box::new(callback),
        min: Some(min),
        max: Some(max),
      },
    )
  }

  pub fn register_bool<F>(&self, name: &str, callback: F) -> GolResult<()>
  where
    F: FnMut(bool) -> SettingsStatus + Send + 'static,
  {
    self.add(name, Handler::Bool(Box::new(callback)))
  }

  pub fn register_float<F>(&self, name: &str, callback: F) -> GolResult<()>
  where
    F: FnMut(f64) -> SettingsStatus + Send + 'static,
  {
    self.add(name, Handler::Float(Box::new(callback)))
  }

  pub fn register_string<F>(&self, name: &str, callback: F) -> GolResult<()>
  where
    F: FnMut(&str) -> SettingsStatus + Send + 'static,
  {
    self.add(name, Handler::Str(Box::new(callback)))
  }
}

impl Drop for Settings {
  fn drop(&mut self) {
    // batches arriving before the cancel goes through see an empty table
    self.registry.lock().unwrap().clear();
    if let Err(e) = self.sender.enqueue_nowait(
      RequestKind::CancelObserve,
      SETTINGS_PATH,
      ContentType::Any,
      Bytes::new(),
    ) {
      // nothing left to cancel against a stopped or destroyed client
      debug!("settings observation not cancelled: {e}");
    }
  }
}

fn apply(setting: &mut Setting, value: &Value) -> SettingsStatus {
  match &mut setting.handler {
    Handler::Int { callback, min, max } => match value {
      Value::Integer(i) => match i64::try_from(i128::from(*i)) {
        Ok(v) => {
          if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
            SettingsStatus::ValueOutsideRange
          } else {
            callback(v)
          }
        }
        Err(_) => SettingsStatus::ValueFormatNotValid,
      },
      _ => SettingsStatus::ValueFormatNotValid,
    },
    Handler::Bool(callback) => match value {
      Value::Bool(b) => callback(*b),
      _ => SettingsStatus::ValueFormatNotValid,
    },
    Handler::Float(callback) => match value {
      Value::Float(f) => callback(*f),
      Value::Integer(i) => match i64::try_from(i128::from(*i)) {
        Ok(v) => callback(v as f64),
        Err(_) => SettingsStatus::ValueFormatNotValid,
      },
      _ => SettingsStatus::ValueFormatNotValid,
    },
    Handler::Str(callback) => match value {
      Value::Text(s) => callback(s),
      _ => SettingsStatus::ValueFormatNotValid,
    },
  }
}

/// Apply one pushed batch against the registry. Exposed to the dispatch
/// path and to tests; the registry lock is held for the whole scan so a
/// batch is applied atomically with respect to registration.
fn process_batch(registry: &Mutex<Vec<Setting>>, push: &SettingsPush) -> SettingsReport {
  let mut errors = Vec::new();
  let mut registry = registry.lock().unwrap();
  for (name, value) in &push.settings {
    let status = if name.len() > MAX_NAME_LEN {
      SettingsStatus::KeyNotValid
    } else {
      match registry.iter_mut().find(|s| &s.name == name) {
        Some(setting) => apply(setting, value),
        None => {
          debug!("pushed setting {name} is not registered");
          SettingsStatus::KeyNotRecognized
        }
      }
    };
    if status != SettingsStatus::Success {
      errors.push(SettingError {
        setting_key: name.clone(),
        error_code: status as u32,
      });
    }
  }
  SettingsReport {
    version_ack: push.version,
    errors,
  }
}

fn dispatch(sender: &RequestSender, registry: &Mutex<Vec<Setting>>, notification: &CoapResponse) {
  if notification.payload.is_empty() {
    return;
  }
  let push: SettingsPush = match ciborium::de::from_reader(notification.payload.as_ref()) {
    Ok(push) => push,
    Err(e) => {
      warn!("undecodable settings push: {e}");
      return;
    }
  };
  debug!(
    "settings push version {} with {} entries",
    push.version,
    push.settings.len()
  );

  let report = process_batch(registry, &push);
  let mut encoded = Vec::new();
  if ciborium::ser::into_writer(&report, &mut encoded).is_err() {
    error!("failed to encode settings report");
    return;
  }
  if encoded.len() > SETTINGS_MAX_RESPONSE_LEN {
    warn!(
      "settings report is {} bytes, over the {SETTINGS_MAX_RESPONSE_LEN}-byte cap",
      encoded.len()
    );
  }
  if let Err(e) = sender.enqueue_nowait(
    RequestKind::Post,
    SETTINGS_STATUS_PATH,
    ContentType::Cbor,
    Bytes::from(encoded),
  ) {
    warn!("could not enqueue settings report: {e}");
  }
}
