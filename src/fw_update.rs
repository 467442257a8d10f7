//! The firmware-update state machine: observes manifests, downloads and
//! verifies new images, drives the platform's boot-slot swap, and
//! supervises first-boot rollback.
//!
//! Runs on its own thread; the manifest observation callback only parses
//! and forwards, every blocking step (downloads, state reports) happens
//! here.

use std::{
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use enumflags2::{bitflags, BitFlags};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  client::Client,
  config::OTA_OBSERVATION_RETRY_MAX_DELAY,
  error::{GolResult, Status},
  ota::{self, OtaComponent, OtaManifest, OtaReason, OtaState},
};

pub(crate) mod pipeline;

use pipeline::BlockPipeline;

pub const DEFAULT_PACKAGE_NAME: &str = "main";

/// Resumes allowed within one download before it is declared failed.
const MAX_BLOCK_RESUME_BEFORE_FAIL: u32 = 15;
const RESUME_DELAY: Duration = Duration::from_secs(15);

const REPORT_MAX_RETRIES: u32 = 5;
const REPORT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);
const REPORT_BACKOFF_MAX: Duration = Duration::from_secs(180);

const BACKOFF_DURATION_INITIAL: Duration = Duration::from_secs(60);
const BACKOFF_DURATION_MAX: Duration = Duration::from_secs(24 * 60 * 60);

const MANIFEST_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// How long a pending-verify image may wait for a connection before the
/// rollback fires.
const ROLLBACK_TIMER: Duration = Duration::from_secs(300);

const REBOOT_COUNTDOWN_S: u32 = 5;

/// Which identity fields a state report carries.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportField {
  Package = 1,
  CurrentVersion = 2,
  TargetVersion = 4,
}

/// Everything the updater needs from the platform: slot bookkeeping, flash
/// writes, and reboot. Mirrors the bootloader-facing half of the port
/// layer.
pub trait FwPlatform: Send {
  /// True on the first boot of a not-yet-confirmed image.
  fn is_pending_verify(&mut self) -> bool;

  /// Commit to the running image; no rollback will happen.
  fn cancel_rollback(&mut self) -> GolResult<()>;

  /// Request a rollback to the previous image on next boot.
  fn rollback(&mut self) -> GolResult<()>;

  /// Store one block of the incoming image at `offset`.
  fn handle_block(&mut self, block: &[u8], offset: usize, total: usize) -> GolResult<()>;

  /// Read the running image, for binary patching. Returns 0 at the end.
  fn read_current_image_at_offset(&mut self, buf: &mut [u8], offset: usize) -> GolResult<usize>;

  /// Validate the staged image before attempting to boot it.
  fn validate(&mut self) -> GolResult<()>;

  /// Mark the staged image for boot.
  fn change_boot_image(&mut self) -> GolResult<()>;

  /// Restart the device. On real hardware this does not return.
  fn reboot(&mut self);

  /// SHA-256 of the first `size` bytes already present in the staging
  /// slot, when the platform can compute it. Lets a re-offered component
  /// skip a download that already completed.
  fn staged_image_sha256(&mut self, size: u64) -> Option<[u8; 32]> {
    let _ = size;
    None
  }

  /// Hook after the last block was delivered.
  fn post_download(&mut self) {}

  /// Hook when an update attempt ends, successful or not.
  fn end(&mut self) {}
}

/// Listener for state transitions, called before each cloud report.
pub type StateChangeCallback = Box<dyn FnMut(OtaState, OtaReason) + Send>;

#[derive(Debug, Clone)]
pub struct FwUpdateConfig {
  /// Version of the running firmware, e.g. "1.2.3".
  pub current_version: String,
  /// Manifest package to track.
  pub package_name: String,
}

impl FwUpdateConfig {
  pub fn new(current_version: &str) -> FwUpdateConfig {
    FwUpdateConfig {
      current_version: current_version.to_string(),
      package_name: DEFAULT_PACKAGE_NAME.to_string(),
    }
  }
}

/// Failure backoff: 60 s doubling to 24 h, armed by a failed attempt.
struct Backoff {
  duration: Option<Duration>,
  last_fail: Instant,
}

impl Backoff {
  fn new() -> Backoff {
    Backoff {
      duration: None,
      last_fail: Instant::now(),
    }
  }

  fn reset(&mut self) {
    self.duration = None;
  }

  fn increment(&mut self) {
    self.duration = Some(match self.duration {
      None => BACKOFF_DURATION_INITIAL,
      Some(d) => (d * 2).min(BACKOFF_DURATION_MAX),
    });
    self.last_fail = Instant::now();
  }

  fn is_armed(&self) -> bool {
    self.duration.is_some()
  }

  /// Time left before a retry is due; zero once expired.
  fn remaining(&self) -> Duration {
    match self.duration {
      None => Duration::ZERO,
      Some(d) => d.saturating_sub(self.last_fail.elapsed()),
    }
  }
}

/// Spawn the updater thread.
pub fn spawn(
  client: &Client,
  config: FwUpdateConfig,
  platform: Box<dyn FwPlatform>,
  state_callback: Option<StateChangeCallback>,
) -> GolResult<thread::JoinHandle<()>> {
  let runner = FwUpdate {
    client: client.clone(),
    config,
    platform,
    state_callback,
    target: None,
    backoff: Backoff::new(),
  };
  thread::Builder::new()
    .name("golioth-fw".to_string())
    .spawn(move || runner.run())
    .map_err(|e| {
      error!("fw update thread spawn failed: {e}");
      Status::MemAlloc
    })
}

/// Run the state machine on the calling thread. Returns after a reboot
/// request or when the client is destroyed.
pub fn run(
  client: &Client,
  config: FwUpdateConfig,
  platform: Box<dyn FwPlatform>,
  state_callback: Option<StateChangeCallback>,
) {
  FwUpdate {
    client: client.clone(),
    config,
    platform,
    state_callback,
    target: None,
    backoff: Backoff::new(),
  }
  .run()
}

struct FwUpdate {
  client: Client,
  config: FwUpdateConfig,
  platform: Box<dyn FwPlatform>,
  state_callback: Option<StateChangeCallback>,
  target: Option<OtaComponent>,
  backoff: Backoff,
}

enum DownloadOutcome {
  Complete([u8; 32]),
  Failed(OtaReason),
}

impl FwUpdate {
  fn run(mut self) {
    info!(
      "firmware updater starting: {} - {}",
      self.config.package_name, self.config.current_version
    );

    if self.platform.is_pending_verify() && !self.supervise_rollback() {
      return;
    }

    let manifest_rx = match self.observe_manifest() {
      Some(rx) => rx,
      None => return,
    };

    loop {
      if !self.client.is_alive() {
        return;
      }

      let Some(component) = self.wait_for_work(&manifest_rx) else {
        continue;
      };

      // a staged image from an earlier attempt may already be the one
      if self
        .platform
        .staged_image_sha256(component.size)
        .is_some_and(|hash| hash == component.hash)
      {
        info!("target component already staged, skipping download");
        self.update_and_reboot();
        return;
      }

      info!("state = Downloading");
      self.report(
        OtaState::Downloading,
        OtaReason::Ready,
        ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
      );

      let started = Instant::now();
      match self.download(&component) {
        DownloadOutcome::Failed(reason) => {
          self.backoff.increment();
          self.report(
            OtaState::Downloading,
            reason,
            ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
          );
          self.platform.end();
          continue;
        }
        DownloadOutcome::Complete(digest) => {
          if digest != component.hash {
            error!("downloaded image hash does not match the manifest");
            self.backoff.increment();
            self.report(
              OtaState::Downloading,
              OtaReason::IntegrityCheckFailure,
              ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
            );
            self.platform.end();
            continue;
          }
          debug!("image hash matches the manifest");
        }
      }
      info!(
        "downloaded {} in {:?}",
        self.target.as_ref().map_or("?", |t| t.package.as_str()),
        started.elapsed()
      );

      self.platform.post_download();
      if let Err(e) = self.platform.validate() {
        warn!("platform rejected the staged image: {e}");
        self.backoff.increment();
        self.report(
          OtaState::Downloading,
          OtaReason::FirmwareUpdateFailed,
          ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
        );
        self.platform.end();
        continue;
      }

      info!("state = Downloaded");
      self.report(
        OtaState::Downloaded,
        OtaReason::Ready,
        ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
      );
      self.backoff.reset();
      self.update_and_reboot();
      return;
    }
  }

  /// First boot of an unconfirmed image: connect within the rollback
  /// window or revert. Returns false when the updater must stop.
  fn supervise_rollback(&mut self) -> bool {
    info!("pending-verify image, waiting for a connection before confirming");
    match self.client.wait_for_connect(Some(ROLLBACK_TIMER)) {
      Ok(()) => {
        info!("connected; confirming the new image");
        if let Err(e) = self.platform.cancel_rollback() {
          error!("cancel_rollback failed: {e}");
        }
        self.report(
          OtaState::Updating,
          OtaReason::FirmwareUpdatedSuccessfully,
          ReportField::Package | ReportField::CurrentVersion,
        );
        true
      }
      Err(_) => {
        warn!("no connection within {ROLLBACK_TIMER:?}; rolling back and rebooting");
        if let Err(e) = self.platform.rollback() {
          error!("rollback failed: {e}");
        }
        self.platform.reboot();
        false
      }
    }
  }

  /// Subscribe to the manifest resource, retrying with backoff until the
  /// request is accepted.
  fn observe_manifest(&mut self) -> Option<mpsc::Receiver<OtaManifest>> {
    let (manifest_tx, manifest_rx) = mpsc::channel();
    let mut retry_delay = MANIFEST_RETRY_INITIAL_DELAY;
    loop {
      if !self.client.is_alive() {
        return None;
      }
      let tx = manifest_tx.clone();
      let result = ota::observe_manifest(&self.client, move |manifest| match manifest {
        Ok(manifest) => {
          let _ = tx.send(manifest);
        }
        Err(e) => warn!("ignoring undecodable manifest: {e}"),
      });
      match result {
        Ok(()) => return Some(manifest_rx),
        Err(e) => {
          warn!("manifest observation failed ({e}), retry in {retry_delay:?}");
          thread::sleep(retry_delay);
          retry_delay = (retry_delay * 2).min(OTA_OBSERVATION_RETRY_MAX_DELAY);
        }
      }
    }
  }

  /// Idle until there is something to do: a manifest offering a new
  /// version, or an armed backoff expiring (retry of the stored target).
  fn wait_for_work(&mut self, manifest_rx: &mpsc::Receiver<OtaManifest>) -> Option<OtaComponent> {
    loop {
      if !self.client.is_alive() {
        return None;
      }
      info!("state = Idle");
      if self.backoff.is_armed() {
        self.report(
          OtaState::Idle,
          OtaReason::AwaitRetry,
          ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
        );
      } else {
        self.report(
          OtaState::Idle,
          OtaReason::Ready,
          ReportField::Package | ReportField::CurrentVersion,
        );
      }

      let wait = if self.backoff.is_armed() {
        self.backoff.remaining()
      } else {
        // no retry pending; just wake up periodically to check liveness
        Duration::from_secs(3600)
      };

      match manifest_rx.recv_timeout(wait.max(Duration::from_millis(10))) {
        Ok(manifest) => {
          info!("received manifest, sequence {}", manifest.sequence_number);
          if let Some(component) = self.pick_new_target(&manifest) {
            return Some(component);
          }
          debug!("manifest offers nothing new");
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
          if self.backoff.is_armed() && self.backoff.remaining().is_zero() {
            if let Some(target) = self.target.clone() {
              info!("retrying download of {}@{}", target.package, target.version);
              return Some(target);
            }
            self.backoff.reset();
          }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => return None,
      }
    }
  }

  /// Apply the manifest-selection rules: right package, different version,
  /// not already being retried.
  fn pick_new_target(&mut self, manifest: &OtaManifest) -> Option<OtaComponent> {
    let component = match manifest.find_component(&self.config.package_name) {
      Some(component) => component,
      None => {
        info!(
          "manifest has no component for package {}",
          self.config.package_name
        );
        return None;
      }
    };
    info!(
      "current version = {}, target version = {}",
      self.config.current_version, component.version
    );
    if component.version == self.config.current_version {
      info!("already running the target version");
      return None;
    }
    if self.backoff.is_armed()
      && self
        .target
        .as_ref()
        .is_some_and(|t| t.version == component.version)
    {
      info!("update to this version is already in progress");
      return None;
    }
    self.target = Some(component.clone());
    self.backoff.reset();
    Some(component.clone())
  }

  /// Resumable download of `component` through the block pipeline.
  fn download(&mut self, component: &OtaComponent) -> DownloadOutcome {
    let mut pipeline = BlockPipeline::new(self.platform.as_mut(), component.size as usize);
    let mut start_block: u32 = 0;
    let mut resumes: u32 = 0;

    loop {
      let result = ota::download_component(
        &self.client,
        component,
        start_block,
        &mut |_component, index, data, is_last, _negotiated| {
          trace!("block {index} ({} bytes, last: {is_last})", data.len());
          pipeline.write(data)
        },
      );
      match result {
        Ok(()) => {
          return match pipeline.finish() {
            Ok(digest) => DownloadOutcome::Complete(digest),
            Err(e) => {
              error!("pipeline flush failed: {e}");
              DownloadOutcome::Failed(OtaReason::FirmwareUpdateFailed)
            }
          };
        }
        Err((failed_block, Status::IoError)) => {
          // local storage trouble is not recoverable by retrying the
          // download
          error!("i/o failure while storing block {failed_block}");
          return DownloadOutcome::Failed(OtaReason::Io);
        }
        Err((failed_block, e)) => {
          resumes += 1;
          if resumes > MAX_BLOCK_RESUME_BEFORE_FAIL {
            error!("giving up after {MAX_BLOCK_RESUME_BEFORE_FAIL} resumes: {e}");
            return DownloadOutcome::Failed(OtaReason::FirmwareUpdateFailed);
          }
          warn!(
            "block {failed_block} failed ({e}), resume {resumes}/{MAX_BLOCK_RESUME_BEFORE_FAIL} in {RESUME_DELAY:?}"
          );
          thread::sleep(RESUME_DELAY);
          start_block = failed_block;
        }
      }
    }
  }

  fn update_and_reboot(&mut self) {
    info!("state = Updating");
    self.report(
      OtaState::Updating,
      OtaReason::Ready,
      ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion,
    );
    if let Err(e) = self.platform.change_boot_image() {
      error!("changing the boot image failed: {e}");
      return;
    }
    let mut countdown = REBOOT_COUNTDOWN_S;
    while countdown > 0 {
      info!("rebooting into the new image in {countdown} s");
      thread::sleep(Duration::from_secs(1));
      countdown -= 1;
    }
    self.platform.reboot();
  }

  /// Notify the listener and report to the cloud, with retries.
  fn report(&mut self, state: OtaState, reason: OtaReason, fields: BitFlags<ReportField>) {
    if let Some(callback) = self.state_callback.as_mut() {
      callback(state, reason);
    }

    let mut delay = REPORT_RETRY_INITIAL_DELAY;
    for _attempt in 0..REPORT_MAX_RETRIES {
      if !self.client.is_alive() {
        return;
      }
      let current = fields
        .contains(ReportField::CurrentVersion)
        .then_some(self.config.current_version.as_str());
      let target = if fields.contains(ReportField::TargetVersion) {
        self.target.as_ref().map(|t| t.version.as_str())
      } else {
        None
      };
      let package = if fields.contains(ReportField::Package) {
        self.config.package_name.as_str()
      } else {
        ""
      };
      match ota::report_state_sync(
        &self.client,
        state,
        reason,
        package,
        current,
        target,
        None,
      ) {
        Ok(()) => {
          debug!("state/reason reported");
          return;
        }
        Err(e) => {
          warn!("state report failed ({e}), retry in {delay:?}");
          thread::sleep(delay);
          delay = (delay * 2).min(REPORT_BACKOFF_MAX);
        }
      }
    }
    error!("state report abandoned after {REPORT_MAX_RETRIES} attempts");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::new();
    assert!(!backoff.is_armed());
    assert_eq!(backoff.remaining(), Duration::ZERO);

    backoff.increment();
    assert_eq!(backoff.duration, Some(Duration::from_secs(60)));
    backoff.increment();
    assert_eq!(backoff.duration, Some(Duration::from_secs(120)));
    for _ in 0..20 {
      backoff.increment();
    }
    assert_eq!(backoff.duration, Some(BACKOFF_DURATION_MAX));
    assert!(backoff.remaining() <= BACKOFF_DURATION_MAX);

    backoff.reset();
    assert!(!backoff.is_armed());
  }

  #[test]
  fn report_field_masks_compose() {
    let all = ReportField::Package | ReportField::CurrentVersion | ReportField::TargetVersion;
    assert!(all.contains(ReportField::Package));
    let some = ReportField::Package | ReportField::CurrentVersion;
    assert!(!some.contains(ReportField::TargetVersion));
  }

  #[test]
  fn config_defaults_to_main_package() {
    let config = FwUpdateConfig::new("1.2.3");
    assert_eq!(config.package_name, "main");
    assert_eq!(config.current_version, "1.2.3");
  }
}
