use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Mutex,
  },
  thread,
  time::{Duration, Instant},
};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;

use crate::{
  coap::ContentType,
  config::{ClientConfig, COAP_MAX_PATH_LEN, COAP_THREAD_STACK_SIZE, REQUEST_QUEUE_MAX_ITEMS,
    REQUEST_QUEUE_TIMEOUT},
  debug as cloud_debug,
  error::{GolResult, Status},
  scheduler::{
    constant::{FLAG_CONNECTED, FLAG_STOPPED},
    event_loop::EventLoop,
    request::{ControlCommand, CoapResponse, ObserveCallback, QueuedRequest, ReplyCallback,
      RequestKind},
  },
  sync_io::{
    mailbox::{self, SendError},
    EventFlags, MailboxSender,
  },
};

/// Connection state transitions, delivered on the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
  Connected,
  Disconnected,
}

pub(crate) type EventCallback = Box<dyn FnMut(ClientEvent) + Send>;
pub(crate) type EventCallbackSlot = Arc<Mutex<Option<EventCallback>>>;

/// State shared between the client handle and its I/O thread.
pub(crate) struct SharedState {
  running: AtomicBool,
  alive: AtomicBool,
  pub flags: EventFlags,
}

impl SharedState {
  fn new() -> SharedState {
    SharedState {
      running: AtomicBool::new(true),
      alive: AtomicBool::new(true),
      flags: EventFlags::new(),
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }
}

/// Lightweight enqueue-only handle, safe to capture in service callbacks:
/// it holds no reference to the [`Client`] itself, so callbacks can never
/// keep a destroyed client alive.
#[derive(Clone)]
pub(crate) struct RequestSender {
  request_tx: MailboxSender<QueuedRequest>,
  shared: Arc<SharedState>,
  response_timeout: Duration,
}

impl RequestSender {
  /// Non-blocking enqueue, for use on the I/O thread itself (a full
  /// mailbox drops the item instead of deadlocking the thread).
  pub fn enqueue_nowait(
    &self,
    kind: RequestKind,
    path: &str,
    content_type: ContentType,
    payload: Bytes,
  ) -> GolResult<()> {
    if !self.shared.is_alive() || !self.shared.is_running() {
      return Err(Status::InvalidState);
    }
    if path.len() > COAP_MAX_PATH_LEN {
      return Err(Status::InvalidFormat);
    }
    let now = Instant::now();
    let request = QueuedRequest {
      kind,
      path: path.to_string(),
      content_type,
      accept: ContentType::Any,
      payload,
      completion: None,
      observe_cb: None,
      deadline: now + self.response_timeout,
      enqueued_at: now,
    };
    match self.request_tx.try_send(request) {
      Ok(()) => Ok(()),
      Err(SendError::Full(_)) => Err(Status::QueueFull),
      Err(SendError::Disconnected(_)) => Err(Status::InvalidState),
    }
  }
}

#[cfg(test)]
impl RequestSender {
  /// A sender wired to nothing, for registry-level unit tests.
  pub(crate) fn detached() -> RequestSender {
    let (request_tx, _receiver) = mailbox::mailbox(1).unwrap();
    RequestSender {
      request_tx,
      shared: Arc::new(SharedState::new()),
      response_timeout: Duration::from_secs(1),
    }
  }
}

struct ClientCore {
  config: ClientConfig,
  request_tx: MailboxSender<QueuedRequest>,
  control_tx: Mutex<mio_channel::Sender<ControlCommand>>,
  event_cb: EventCallbackSlot,
  shared: Arc<SharedState>,
  io_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Handle to one cloud connection. Cheap to clone; all clones refer to the
/// same session and request queue.
///
/// Created with [`Client::create`], torn down with [`Client::destroy`] (or
/// on drop of the last clone).
#[derive(Clone)]
pub struct Client {
  core: Arc<ClientCore>,
}

impl Client {
  /// Start the I/O thread and return immediately. The thread connects in
  /// the background; register an event callback or use
  /// [`wait_for_connect`](Self::wait_for_connect) to learn when the
  /// session is up.
  pub fn create(config: ClientConfig) -> GolResult<Client> {
    let (request_tx, request_rx) = mailbox::mailbox(REQUEST_QUEUE_MAX_ITEMS)
      .map_err(|e| {
        error!("mailbox creation failed: {e}");
        Status::MemAlloc
      })?;
    let (control_tx, control_rx) = mio_channel::channel();
    let event_cb: EventCallbackSlot = Arc::new(Mutex::new(None));
    let shared = Arc::new(SharedState::new());

    let event_loop = EventLoop::new(
      config.clone(),
      request_rx,
      control_rx,
      Arc::clone(&event_cb),
      Arc::clone(&shared),
    )
    .map_err(|e| {
      error!("event loop creation failed: {e}");
      Status::MemAlloc
    })?;

    let io_thread = thread::Builder::new()
      .name("golioth-io".to_string())
      .stack_size(COAP_THREAD_STACK_SIZE)
      .spawn(move || event_loop.run())
      .map_err(|e| {
        error!("I/O thread spawn failed: {e}");
        Status::MemAlloc
      })?;

    let client = Client {
      core: Arc::new(ClientCore {
        config,
        request_tx,
        control_tx: Mutex::new(control_tx),
        event_cb,
        shared,
        io_thread: Mutex::new(Some(io_thread)),
      }),
    };
    if client.core.config.log_to_cloud {
      cloud_debug::set_active_client(client.sender());
      cloud_debug::set_cloud_log_enabled(true);
    }
    Ok(client)
  }

  /// Replace the connection-event callback. It runs on the I/O thread and
  /// must not issue synchronous requests.
  pub fn register_event_callback<F>(&self, callback: F)
  where
    F: FnMut(ClientEvent) + Send + 'static,
  {
    *self.core.event_cb.lock().unwrap() = Some(Box::new(callback));
  }

  /// Resume mailbox processing after a [`stop`](Self::stop).
  pub fn start(&self) -> GolResult<()> {
    if !self.core.shared.is_alive() {
      return Err(Status::InvalidState);
    }
    self.core.shared.running.store(true, Ordering::SeqCst);
    self.send_control(ControlCommand::Start)
  }

  /// Pause mailbox processing. Queued requests are dropped with
  /// `InvalidState`, pending sync callers are unblocked, and no further
  /// callbacks fire until [`start`](Self::start).
  pub fn stop(&self) -> GolResult<()> {
    if !self.core.shared.is_alive() {
      return Err(Status::InvalidState);
    }
    self.core.shared.running.store(false, Ordering::SeqCst);
    self.send_control(ControlCommand::Stop)
  }

  pub fn is_running(&self) -> bool {
    self.core.shared.is_alive() && self.core.shared.is_running()
  }

  pub fn is_connected(&self) -> bool {
    self.core.shared.flags.current() & FLAG_CONNECTED != 0
  }

  /// Block until the session is connected. `None` waits indefinitely.
  pub fn wait_for_connect(&self, timeout: Option<Duration>) -> GolResult<()> {
    match timeout {
      Some(t) => {
        let flags = self.core.shared.flags.wait_any(FLAG_CONNECTED, false, t);
        if flags & FLAG_CONNECTED != 0 {
          Ok(())
        } else {
          Err(Status::Timeout)
        }
      }
      None => loop {
        if !self.core.shared.is_alive() {
          return Err(Status::InvalidState);
        }
        let flags =
          self
            .core
            .shared
            .flags
            .wait_any(FLAG_CONNECTED, false, Duration::from_secs(1));
        if flags & FLAG_CONNECTED != 0 {
          return Ok(());
        }
      },
    }
  }

  /// Stop the I/O thread, close the transport and invalidate the handle.
  /// Every clone of this client becomes unusable.
  pub fn destroy(&self) {
    if !self.core.shared.alive.swap(false, Ordering::SeqCst) {
      return; // already destroyed
    }
    cloud_debug::clear_active_client();
    self.core.shared.running.store(false, Ordering::SeqCst);
    let _ = self.send_control_unchecked(ControlCommand::Shutdown);
    if let Some(handle) = self.core.io_thread.lock().unwrap().take() {
      if handle.join().is_err() {
        error!("I/O thread panicked");
      }
    }
    self.core.shared.flags.set(FLAG_STOPPED);
  }

  /// Drop a percentage of outgoing datagrams. Test instrumentation for
  /// exercising retransmission; 0 disables.
  pub fn set_packet_loss_percent(&self, percent: u8) -> GolResult<()> {
    self.send_control(ControlCommand::SetPacketLossPercent(percent))
  }

  pub(crate) fn config(&self) -> &ClientConfig {
    &self.core.config
  }

  pub(crate) fn is_alive(&self) -> bool {
    self.core.shared.is_alive()
  }

  pub(crate) fn sender(&self) -> RequestSender {
    RequestSender {
      request_tx: self.core.request_tx.clone(),
      shared: Arc::clone(&self.core.shared),
      response_timeout: self.core.config.response_timeout(),
    }
  }

  fn send_control(&self, command: ControlCommand) -> GolResult<()> {
    if !self.core.shared.is_alive() {
      return Err(Status::InvalidState);
    }
    self.send_control_unchecked(command)
  }

  fn send_control_unchecked(&self, command: ControlCommand) -> GolResult<()> {
    self
      .core
      .control_tx
      .lock()
      .unwrap()
      .send(command)
      .map_err(|_| Status::InvalidState)
  }

  // ---- request submission (used by the service modules) ----

  pub(crate) fn enqueue(&self, request: QueuedRequest) -> GolResult<()> {
    if !self.core.shared.is_alive() || !self.core.shared.is_running() {
      return Err(Status::InvalidState);
    }
    if request.path.len() > COAP_MAX_PATH_LEN {
      warn!(
        "path {} exceeds the {COAP_MAX_PATH_LEN}-byte limit",
        request.path
      );
      return Err(Status::InvalidFormat);
    }
    match self
      .core
      .request_tx
      .send_timeout(request, REQUEST_QUEUE_TIMEOUT)
    {
      Ok(()) => Ok(()),
      Err(SendError::Full(_)) => Err(Status::QueueFull),
      Err(SendError::Disconnected(_)) => Err(Status::InvalidState),
    }
  }

  /// Enqueue a fire-and-forget or callback-completed request.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn enqueue_async(
    &self,
    kind: RequestKind,
    path: &str,
    content_type: ContentType,
    accept: ContentType,
    payload: Bytes,
    observe_cb: Option<ObserveCallback>,
    completion: Option<ReplyCallback>,
    timeout: Option<Duration>,
  ) -> GolResult<()> {
    let now = Instant::now();
    self.enqueue(QueuedRequest {
      kind,
      path: path.to_string(),
      content_type,
      accept,
      payload,
      completion,
      observe_cb,
      deadline: now + self.core.config.cap_timeout(timeout),
      enqueued_at: now,
    })
  }

  /// Enqueue and block until the completion arrives (or the capped timeout
  /// elapses).
  pub(crate) fn request_sync(
    &self,
    kind: RequestKind,
    path: &str,
    content_type: ContentType,
    accept: ContentType,
    payload: Bytes,
    timeout: Option<Duration>,
  ) -> GolResult<CoapResponse> {
    let capped = self.core.config.cap_timeout(timeout);
    let (result_tx, result_rx) = mpsc::sync_channel::<GolResult<CoapResponse>>(1);
    let completion: ReplyCallback = Box::new(move |result| {
      // the waiter may already have given up; that is fine
      let _ = result_tx.try_send(result);
    });
    self.enqueue_async(
      kind,
      path,
      content_type,
      accept,
      payload,
      None,
      Some(completion),
      Some(capped),
    )?;
    // small grace on top of the request deadline, so the scheduler's own
    // timeout is the one that normally fires
    match result_rx.recv_timeout(capped + Duration::from_millis(500)) {
      Ok(result) => result,
      Err(_) => Err(Status::Timeout),
    }
  }
}

impl Drop for ClientCore {
  fn drop(&mut self) {
    // last clone gone without an explicit destroy(); the thread still needs
    // shutting down, but the usual path is destroy()
    self.shared.alive.store(false, Ordering::SeqCst);
    let _ = self.control_tx.lock().unwrap().send(ControlCommand::Shutdown);
    if let Some(handle) = self.io_thread.lock().unwrap().take() {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Credentials;

  fn config() -> ClientConfig {
    let mut c = ClientConfig::with_host(
      "127.0.0.1",
      1, // nothing listens here; connection attempts just fail
      Credentials::Psk {
        id: "dev".to_string(),
        key: vec![0; 16],
      },
    );
    c.nosec = true;
    c
  }

  #[test]
  fn create_and_destroy() {
    let client = Client::create(config()).unwrap();
    assert!(client.is_running());
    client.destroy();
    assert!(!client.is_running());
    client.destroy(); // idempotent
  }

  #[test]
  fn requests_fail_after_destroy() {
    let client = Client::create(config()).unwrap();
    client.destroy();
    let r = client.enqueue_async(
      RequestKind::Get,
      ".d/x",
      ContentType::Json,
      ContentType::Json,
      Bytes::new(),
      None,
      None,
      None,
    );
    assert_eq!(r, Err(Status::InvalidState));
  }

  #[test]
  fn long_paths_are_rejected_at_enqueue() {
    let client = Client::create(config()).unwrap();
    let path = "x".repeat(COAP_MAX_PATH_LEN + 1);
    let r = client.enqueue_async(
      RequestKind::Get,
      &path,
      ContentType::Json,
      ContentType::Json,
      Bytes::new(),
      None,
      None,
      None,
    );
    assert_eq!(r, Err(Status::InvalidFormat));

    let path = "x".repeat(COAP_MAX_PATH_LEN);
    let r = client.enqueue_async(
      RequestKind::Get,
      &path,
      ContentType::Json,
      ContentType::Json,
      Bytes::new(),
      None,
      None,
      None,
    );
    assert_eq!(r, Ok(()));
    client.destroy();
  }

  #[test]
  fn stop_unblocks_sync_waiters_quickly() {
    // a silent "server": the request stays pending until stop() fails it
    let silent = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    let port = silent.local_addr().unwrap().port();
    let mut cfg = config();
    cfg.port = port;
    let client = Client::create(cfg).unwrap();
    let waiter = {
      let client = client.clone();
      std::thread::spawn(move || {
        client.request_sync(
          RequestKind::Post,
          ".s/x",
          ContentType::Json,
          ContentType::Any,
          Bytes::from_static(b"{}"),
          Some(Duration::from_secs(30)),
        )
      })
    };
    std::thread::sleep(Duration::from_millis(100));
    client.stop().unwrap();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(Status::InvalidState) | Err(Status::Timeout)));
    client.destroy();
  }
}
