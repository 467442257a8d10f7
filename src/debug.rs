// The only module-wide state in the crate: the cloud-log switches and the
// active client used by the log bridge. Set in Client::create, cleared in
// Client::destroy; the service modules never touch these directly.

use std::sync::{
  atomic::{AtomicBool, AtomicU8, Ordering},
  Mutex,
};

use log::Level;

use crate::client::RequestSender;

static CLOUD_LOG_ENABLED: AtomicBool = AtomicBool::new(false);
// log::Level as u8 (Error = 1 .. Trace = 5)
static CLOUD_LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static ACTIVE_CLIENT: Mutex<Option<RequestSender>> = Mutex::new(None);

/// Turn forwarding of local log records to the cloud on or off.
pub fn set_cloud_log_enabled(enabled: bool) {
  CLOUD_LOG_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn cloud_log_enabled() -> bool {
  CLOUD_LOG_ENABLED.load(Ordering::SeqCst)
}

/// Minimum level a record needs to be forwarded. Default: Info.
pub fn set_cloud_log_level(level: Level) {
  CLOUD_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn cloud_log_level() -> Level {
  match CLOUD_LOG_LEVEL.load(Ordering::SeqCst) {
    1 => Level::Error,
    2 => Level::Warn,
    3 => Level::Info,
    4 => Level::Debug,
    _ => Level::Trace,
  }
}

pub(crate) fn set_active_client(sender: RequestSender) {
  *ACTIVE_CLIENT.lock().unwrap() = Some(sender);
}

pub(crate) fn clear_active_client() {
  *ACTIVE_CLIENT.lock().unwrap() = None;
}

pub(crate) fn active_client() -> Option<RequestSender> {
  ACTIVE_CLIENT.lock().unwrap().clone()
}

/// A `log::Log` sink that mirrors records to stderr and, when enabled,
/// ships them to the cloud logging service through the active client.
///
/// Install with [`install_cloud_logger`]; applications with their own
/// logger can instead call
/// [`remote_log`](crate::services::remote_log) explicitly.
pub struct CloudLogger;

pub static CLOUD_LOGGER: CloudLogger = CloudLogger;

/// Install [`CLOUD_LOGGER`] as the process-wide logger.
pub fn install_cloud_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
  log::set_logger(&CLOUD_LOGGER)?;
  log::set_max_level(max_level);
  Ok(())
}

impl log::Log for CloudLogger {
  fn enabled(&self, metadata: &log::Metadata) -> bool {
    metadata.level() <= log::max_level()
  }

  fn log(&self, record: &log::Record) {
    if !self.enabled(record.metadata()) {
      return;
    }
    eprintln!(
      "[{:<5}] ({}) {}",
      record.level(),
      record.target(),
      record.args()
    );
    if cloud_log_enabled() && record.level() <= cloud_log_level() {
      crate::services::remote_log::forward(
        record.level(),
        record.target(),
        &record.args().to_string(),
      );
    }
  }

  fn flush(&self) {}
}
