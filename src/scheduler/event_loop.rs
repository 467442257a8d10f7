use std::{
  collections::VecDeque,
  sync::Arc,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_06::{unix::EventedFd, Events, Poll, PollOpt, Ready};
use mio_extras::{
  channel as mio_channel,
  timer::{Builder as TimerBuilder, Timeout, Timer},
};
use rand::Rng;

use crate::{
  client::{ClientEvent, EventCallbackSlot, SharedState},
  coap::{Code, ContentType, Message, MessageBuilder, MessageType, Token},
  config::{ClientConfig, PING_TIMEOUT},
  error::{GolResult, Status},
  scheduler::{
    constant::*,
    observations::ObservationRegistry,
    request::{ControlCommand, CoapResponse, QueuedRequest, RequestKind},
  },
  sync_io::MailboxReceiver,
  transport::{self, Transport},
};

// Large enough for a full 1024-byte block plus header and options.
const RECV_BUF_SIZE: usize = 2048;

const RETRANSMIT_INITIAL: Duration = Duration::from_secs(2);
const RETRANSMIT_FACTOR: f64 = 1.5;
const MAX_TRANSMIT_ATTEMPTS: u32 = 4;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Base delay for the next retransmission; jitter is applied separately.
fn next_retransmit_delay(previous: Duration) -> Duration {
  previous.mul_f64(RETRANSMIT_FACTOR)
}

fn jittered<R: Rng>(base: Duration, rng: &mut R) -> Duration {
  base.mul_f64(rng.random_range(0.5..=1.5))
}

fn doubled_capped(previous: Duration, cap: Duration) -> Duration {
  (previous * 2).min(cap)
}

enum TimerEvent {
  Retransmit,
  ResponseDeadline,
  Keepalive,
  Reconnect,
}

/// Why this request is on the wire; re-subscriptions are internal and do
/// not count as user requests.
enum Purpose {
  User,
  Resubscribe,
}

struct InFlight {
  token: Token,
  message_id: u16,
  datagram: bytes::Bytes,
  /// Separate-response mode: the empty ACK arrived, retransmission stopped,
  /// the real response will come later in its own message.
  separate_acked: bool,
  attempts_left: u32,
  retransmit_delay: Duration,
  retransmit_handle: Option<Timeout>,
  deadline_handle: Timeout,
  purpose: Purpose,
  request: QueuedRequest,
}

pub(crate) struct EventLoop {
  config: ClientConfig,
  poll: Poll,
  timer: Timer<TimerEvent>,
  request_rx: MailboxReceiver<QueuedRequest>,
  control_rx: mio_channel::Receiver<ControlCommand>,
  event_cb: EventCallbackSlot,
  shared: Arc<SharedState>,

  transport: Option<Box<dyn Transport>>,
  observations: ObservationRegistry,
  /// Tokens awaiting re-subscription after a reconnect, in registry
  /// insertion order. Drained before the mailbox.
  resubscribe: VecDeque<Token>,
  in_flight: Option<InFlight>,

  next_message_id: u16,
  last_traffic: Instant,
  keepalive_handle: Option<Timeout>,
  reconnect_handle: Option<Timeout>,
  reconnect_backoff: Duration,
  packet_loss_percent: u8,
  packets_dropped: u64,
  shutdown: bool,
}

impl EventLoop {
  pub fn new(
    config: ClientConfig,
    request_rx: MailboxReceiver<QueuedRequest>,
    control_rx: mio_channel::Receiver<ControlCommand>,
    event_cb: EventCallbackSlot,
    shared: Arc<SharedState>,
  ) -> std::io::Result<EventLoop> {
    let poll = Poll::new()?;
    poll.register(
      request_rx.pollable(),
      REQUEST_MAILBOX_TOKEN,
      Ready::readable(),
      PollOpt::edge(),
    )?;
    poll.register(
      &control_rx,
      CONTROL_CHANNEL_TOKEN,
      Ready::readable(),
      PollOpt::edge(),
    )?;
    let timer = TimerBuilder::default().build();
    poll.register(&timer, TIMER_TOKEN, Ready::readable(), PollOpt::edge())?;

    Ok(EventLoop {
      config,
      poll,
      timer,
      request_rx,
      control_rx,
      event_cb,
      shared,
      transport: None,
      observations: ObservationRegistry::new(),
      resubscribe: VecDeque::new(),
      in_flight: None,
      next_message_id: rand::rng().random::<u16>(),
      last_traffic: Instant::now(),
      keepalive_handle: None,
      reconnect_handle: None,
      reconnect_backoff: RECONNECT_BACKOFF_INITIAL,
      packet_loss_percent: 0,
      packets_dropped: 0,
      shutdown: false,
    })
  }

  pub fn run(mut self) {
    debug!("I/O thread starting");
    self.schedule_reconnect(Duration::from_millis(0));

    let mut events = Events::with_capacity(8);
    while !self.shutdown {
      if let Err(e) = self.poll.poll(&mut events, None) {
        error!("poll failed, I/O thread exiting: {e}");
        break;
      }
      for event in events.iter() {
        match event.token() {
          SOCKET_TOKEN => self.pump_socket(),
          REQUEST_MAILBOX_TOKEN => self.request_rx.acknowledge_signal(),
          CONTROL_CHANNEL_TOKEN => self.pump_control(),
          TIMER_TOKEN => self.pump_timers(),
          other => trace!("spurious poll token {other:?}"),
        }
      }
      self.maybe_dispatch();
    }
    self.teardown();
    debug!("I/O thread exiting");
  }

  // ---- connection lifecycle ----

  fn schedule_reconnect(&mut self, delay: Duration) {
    if self.reconnect_handle.is_none() {
      self.reconnect_handle = Some(self.timer.set_timeout(delay, TimerEvent::Reconnect));
    }
  }

  fn try_connect(&mut self) {
    match transport::connect(&self.config) {
      Ok(t) => {
        if let Err(e) = self.poll.register(
          &EventedFd(&t.raw_fd()),
          SOCKET_TOKEN,
          Ready::readable(),
          PollOpt::edge(),
        ) {
          error!("socket registration failed: {e}");
          self.schedule_next_reconnect();
          return;
        }
        self.transport = Some(t);
        self.reconnect_backoff = RECONNECT_BACKOFF_INITIAL;
        self.last_traffic = Instant::now();
        self.arm_keepalive();
        // every observation is re-subscribed before the mailbox is served
        self.resubscribe = self.observations.tokens().into();
        self.shared.flags.set(FLAG_CONNECTED);
        self.emit_event(ClientEvent::Connected);
        info!("session established");
      }
      Err(e) => {
        warn!(
          "connect failed ({e}), retrying in {:?}",
          self.reconnect_backoff
        );
        self.schedule_next_reconnect();
      }
    }
  }

  fn schedule_next_reconnect(&mut self) {
    let delay = self.reconnect_backoff;
    self.reconnect_backoff = doubled_capped(self.reconnect_backoff, RECONNECT_BACKOFF_MAX);
    self.schedule_reconnect(delay);
  }

  /// Tear the session down after a transport-level failure and start the
  /// reconnect backoff. Queued and in-flight work is failed, observations
  /// stay registered but become inactive until re-subscribed.
  fn disconnect(&mut self, cause: Status) {
    warn!("session lost: {cause}");
    if let Some(mut t) = self.transport.take() {
      let _ = self.poll.deregister(&EventedFd(&t.raw_fd()));
      t.close();
    }
    if let Some(handle) = self.keepalive_handle.take() {
      self.timer.cancel_timeout(&handle);
    }
    self.shared.flags.clear(FLAG_CONNECTED);

    if let Some(mut in_flight) = self.in_flight.take() {
      self.cancel_in_flight_timers(&mut in_flight);
      self.conclude(in_flight, Err(cause));
    }
    for mut request in self.request_rx.drain() {
      request.complete(Err(Status::InvalidState));
    }
    self.resubscribe.clear();
    self.observations.mark_all_inactive();
    self.emit_event(ClientEvent::Disconnected);
    self.schedule_next_reconnect();
  }

  fn teardown(&mut self) {
    if let Some(mut in_flight) = self.in_flight.take() {
      self.cancel_in_flight_timers(&mut in_flight);
      self.conclude(in_flight, Err(Status::InvalidState));
    }
    for mut request in self.request_rx.drain() {
      request.complete(Err(Status::InvalidState));
    }
    self.observations.clear();
    if let Some(mut t) = self.transport.take() {
      let _ = self.poll.deregister(&EventedFd(&t.raw_fd()));
      t.close();
    }
    self.shared.flags.clear(FLAG_CONNECTED);
  }

  fn emit_event(&self, event: ClientEvent) {
    if !self.shared.is_running() {
      return;
    }
    if let Some(cb) = self.event_cb.lock().unwrap().as_mut() {
      cb(event);
    }
  }

  // ---- pumps ----

  fn pump_socket(&mut self) {
    let mut buf = [0u8; RECV_BUF_SIZE];
    loop {
      let received = match self.transport.as_mut() {
        None => return,
        Some(t) => t.recv(&mut buf),
      };
      match received {
        Ok(None) => return,
        Ok(Some(n)) => {
          self.last_traffic = Instant::now();
          self.arm_keepalive();
          match Message::decode(&buf[..n]) {
            Ok(message) => self.handle_message(message),
            Err(_) => debug!("dropping undecodable datagram of {n} bytes"),
          }
        }
        Err(e) => {
          self.disconnect(e);
          return;
        }
      }
    }
  }

  fn pump_control(&mut self) {
    while let Ok(command) = self.control_rx.try_recv() {
      match command {
        ControlCommand::Start => {
          debug!("client started");
          self.shared.flags.clear(FLAG_STOPPED);
        }
        ControlCommand::Stop => {
          debug!("client stopped, dropping queued work");
          if let Some(mut in_flight) = self.in_flight.take() {
            self.cancel_in_flight_timers(&mut in_flight);
            self.conclude(in_flight, Err(Status::InvalidState));
          }
          for mut request in self.request_rx.drain() {
            request.complete(Err(Status::InvalidState));
          }
          self.shared.flags.set(FLAG_STOPPED);
        }
        ControlCommand::Shutdown => {
          self.shutdown = true;
        }
        ControlCommand::SetPacketLossPercent(percent) => {
          info!("packet loss simulation: {percent}%");
          self.packet_loss_percent = percent.min(100);
        }
      }
    }
  }

  fn pump_timers(&mut self) {
    while let Some(event) = self.timer.poll() {
      match event {
        TimerEvent::Reconnect => {
          self.reconnect_handle = None;
          if self.transport.is_none() && !self.shutdown {
            self.try_connect();
          }
        }
        TimerEvent::Keepalive => {
          self.keepalive_handle = None;
          self.handle_keepalive();
        }
        TimerEvent::Retransmit => self.handle_retransmit(),
        TimerEvent::ResponseDeadline => {
          if let Some(mut in_flight) = self.in_flight.take() {
            debug!(
              "request to {} timed out (waited {:?})",
              in_flight.request.path,
              in_flight.request.enqueued_at.elapsed()
            );
            self.cancel_in_flight_timers(&mut in_flight);
            let was_ping = matches!(in_flight.request.kind, RequestKind::Ping);
            self.conclude(in_flight, Err(Status::Timeout));
            if was_ping {
              warn!("keepalive ping unanswered, declaring the session dead");
              self.disconnect(Status::Timeout);
            }
          }
        }
      }
    }
  }

  // ---- keepalive ----

  fn arm_keepalive(&mut self) {
    if let Some(handle) = self.keepalive_handle.take() {
      self.timer.cancel_timeout(&handle);
    }
    self.keepalive_handle = Some(
      self
        .timer
        .set_timeout(self.config.keepalive_interval(), TimerEvent::Keepalive),
    );
  }

  fn handle_keepalive(&mut self) {
    if self.transport.is_none() {
      return;
    }
    if self.in_flight.is_some() || self.last_traffic.elapsed() < self.config.keepalive_interval() {
      // traffic happened in the meantime
      self.arm_keepalive();
      return;
    }
    trace!("sending keepalive ping");
    let request = QueuedRequest {
      kind: RequestKind::Ping,
      path: String::new(),
      content_type: ContentType::Any,
      accept: ContentType::Any,
      payload: bytes::Bytes::new(),
      completion: None,
      observe_cb: None,
      deadline: Instant::now() + PING_TIMEOUT,
      enqueued_at: Instant::now(),
    };
    self.send_request(request, Purpose::User);
    self.arm_keepalive();
  }

  // ---- dispatch ----

  fn maybe_dispatch(&mut self) {
    while self.transport.is_some() && self.in_flight.is_none() && !self.shutdown {
      // re-subscriptions first, then user requests
      if let Some(token) = self.resubscribe.pop_front() {
        if let Some(request) = self.resubscribe_request(token) {
          self.send_request(request, Purpose::Resubscribe);
        }
        continue;
      }
      if !self.shared.is_running() {
        return;
      }
      let Some(mut request) = self.request_rx.try_recv() else {
        return;
      };
      if request.deadline <= Instant::now() {
        request.complete(Err(Status::Timeout));
        continue;
      }
      self.prepare_and_send(request);
    }
  }

  fn resubscribe_request(&mut self, token: Token) -> Option<QueuedRequest> {
    let observation = self.observations.find_by_token_mut(token)?;
    debug!("re-subscribing {}", observation.path);
    Some(QueuedRequest {
      kind: RequestKind::Observe,
      path: observation.path.clone(),
      content_type: ContentType::Any,
      accept: observation.accept,
      payload: bytes::Bytes::new(),
      completion: None,
      observe_cb: None, // the registry entry already owns the callback
      deadline: Instant::now() + self.config.response_timeout(),
      enqueued_at: Instant::now(),
    })
  }

  /// Registry bookkeeping that must happen between dequeue and send.
  fn prepare_and_send(&mut self, mut request: QueuedRequest) {
    match request.kind {
      RequestKind::Observe => {
        let token = self.allocate_token();
        let Some(callback) = request.observe_cb.take() else {
          request.complete(Err(Status::Null));
          return;
        };
        if let Err(e) = self
          .observations
          .add(&request.path, request.accept, token, callback)
        {
          request.complete(Err(e));
          return;
        }
        self.send_request_with_token(request, token, Purpose::User);
      }
      RequestKind::CancelObserve => {
        // the entry leaves the table before the deregister goes out
        match self.observations.remove_by_path(&request.path) {
          None => request.complete(Err(Status::NotAllowed)),
          Some(observation) if self.transport.is_some() => {
            self.send_request_with_token(request, observation.token, Purpose::User);
          }
          Some(_) => request.complete(Ok(empty_response(&request.path))),
        }
      }
      _ => self.send_request(request, Purpose::User),
    }
  }

  fn send_request(&mut self, request: QueuedRequest, purpose: Purpose) {
    let token = match request.kind {
      RequestKind::Ping => Token::EMPTY,
      RequestKind::Observe => match self.observations.find_by_path(&request.path) {
        // re-subscription reuses the registered token
        Some(observation) => observation.token,
        None => self.allocate_token(),
      },
      _ => self.allocate_token(),
    };
    self.send_request_with_token(request, token, purpose);
  }

  fn send_request_with_token(&mut self, mut request: QueuedRequest, token: Token, purpose: Purpose) {
    let message_id = self.allocate_message_id();
    let message = build_message(&request, token, message_id);
    let datagram = match message.encode() {
      Ok(d) => d,
      Err(e) => {
        request.complete(Err(e));
        return;
      }
    };

    let deadline_in = request
      .deadline
      .saturating_duration_since(Instant::now())
      .min(self.config.response_timeout());
    let deadline_handle = self
      .timer
      .set_timeout(deadline_in, TimerEvent::ResponseDeadline);
    let retransmit_delay = jittered(RETRANSMIT_INITIAL, &mut rand::rng());
    let retransmit_handle = Some(
      self
        .timer
        .set_timeout(retransmit_delay, TimerEvent::Retransmit),
    );

    let in_flight = InFlight {
      token,
      message_id,
      datagram: datagram.clone(),
      separate_acked: false,
      attempts_left: MAX_TRANSMIT_ATTEMPTS - 1,
      retransmit_delay: RETRANSMIT_INITIAL,
      retransmit_handle,
      deadline_handle,
      purpose,
      request,
    };
    self.in_flight = Some(in_flight);
    self.transmit(&datagram);
  }

  fn transmit(&mut self, datagram: &[u8]) {
    if self.packet_loss_percent > 0
      && rand::rng().random_range(0..100u8) < self.packet_loss_percent
    {
      self.packets_dropped += 1;
      trace!(
        "packet loss simulation dropped datagram #{}",
        self.packets_dropped
      );
      return;
    }
    let result = match self.transport.as_mut() {
      None => return,
      Some(t) => t.send(datagram),
    };
    match result {
      Ok(()) => {
        self.last_traffic = Instant::now();
        self.arm_keepalive();
      }
      Err(e) => self.disconnect(e),
    }
  }

  fn handle_retransmit(&mut self) {
    let Some(in_flight) = self.in_flight.as_mut() else {
      return;
    };
    if in_flight.separate_acked {
      return; // ACKed already; we are waiting for the separate response
    }
    if in_flight.attempts_left == 0 {
      let mut in_flight = self.in_flight.take().unwrap();
      debug!(
        "no ACK for {} after {} attempts",
        in_flight.request.path, MAX_TRANSMIT_ATTEMPTS
      );
      self.cancel_in_flight_timers(&mut in_flight);
      let was_ping = matches!(in_flight.request.kind, RequestKind::Ping);
      self.conclude(in_flight, Err(Status::Timeout));
      if was_ping {
        warn!("keepalive ping unanswered, declaring the session dead");
        self.disconnect(Status::Timeout);
      }
      return;
    }
    in_flight.attempts_left -= 1;
    in_flight.retransmit_delay = next_retransmit_delay(in_flight.retransmit_delay);
    let delay = jittered(in_flight.retransmit_delay, &mut rand::rng());
    in_flight.retransmit_handle = Some(self.timer.set_timeout(delay, TimerEvent::Retransmit));
    let datagram = in_flight.datagram.clone();
    trace!("retransmitting message id {}", in_flight.message_id);
    self.transmit(&datagram);
  }

  // ---- incoming messages ----

  fn handle_message(&mut self, message: Message) {
    if message.code.is_empty() {
      self.handle_empty(message);
    } else if message.code.is_response() {
      self.handle_response(message);
    } else {
      // we are not a server; reject confirmable requests
      debug!("unexpected request {} from server", message.code);
      if message.message_type == MessageType::Confirmable {
        self.send_plain(Message::reset_for(&message));
      }
    }
  }

  fn handle_empty(&mut self, message: Message) {
    let matches_in_flight = self
      .in_flight
      .as_ref()
      .is_some_and(|f| f.message_id == message.message_id);
    if !matches_in_flight {
      trace!("stray empty message id {}", message.message_id);
      return;
    }
    match message.message_type {
      MessageType::Acknowledgement => {
        let in_flight = self.in_flight.as_mut().unwrap();
        if matches!(in_flight.request.kind, RequestKind::Ping) {
          let mut in_flight = self.in_flight.take().unwrap();
          self.cancel_in_flight_timers(&mut in_flight);
          self.conclude(in_flight, Ok(empty_response("")));
        } else {
          // separate-response mode: stop retransmitting, keep the deadline
          trace!("empty ACK, awaiting separate response");
          in_flight.separate_acked = true;
          if let Some(handle) = in_flight.retransmit_handle.take() {
            self.timer.cancel_timeout(&handle);
          }
        }
      }
      MessageType::Reset => {
        let mut in_flight = self.in_flight.take().unwrap();
        self.cancel_in_flight_timers(&mut in_flight);
        if matches!(in_flight.request.kind, RequestKind::Ping) {
          // an RST pong is the normal reply to a keepalive ping
          trace!("keepalive pong");
          self.conclude(in_flight, Ok(empty_response("")));
        } else {
          debug!("server reset message id {}", in_flight.message_id);
          self.conclude(in_flight, Err(Status::Fail));
        }
      }
      _ => debug!("empty {:?} message ignored", message.message_type),
    }
  }

  fn handle_response(&mut self, message: Message) {
    if message.message_type == MessageType::Confirmable {
      self.send_plain(Message::ack_for(&message));
    }

    let token = message.token;
    if self
      .in_flight
      .as_ref()
      .is_some_and(|f| f.token == token && !token.is_empty())
    {
      let mut in_flight = self.in_flight.take().unwrap();
      self.cancel_in_flight_timers(&mut in_flight);
      let response = decode_response(&message, &in_flight.request.path);
      self.conclude(in_flight, Ok(response));
      return;
    }

    // not the in-flight request: an observation notification, or stale
    let observed_path = self
      .observations
      .find_by_token_mut(token)
      .map(|o| o.path.clone());
    match observed_path {
      Some(path) => {
        if !self.shared.is_running() {
          trace!("dropping notification while stopped");
          return;
        }
        let mut response = decode_response(&message, "");
        response.path = path;
        self.observations.deliver(token, &response);
      }
      None => {
        debug!("response with unknown token {token:?}, rejecting");
        if message.message_type == MessageType::Confirmable {
          self.send_plain(Message::reset_for(&message));
        }
      }
    }
  }

  /// Terminal bookkeeping for an in-flight request, then completion.
  fn conclude(&mut self, mut in_flight: InFlight, result: GolResult<CoapResponse>) {
    if let RequestKind::Observe = in_flight.request.kind {
      match &result {
        Ok(response) if response.is_success() => {
          if let Some(observation) = self.observations.find_by_token_mut(in_flight.token) {
            observation.active = true;
          }
          // the registration response doubles as the first notification
          if self.shared.is_running() {
            self.observations.deliver(in_flight.token, response);
          }
        }
        _ => {
          if self.observations.remove_by_token(in_flight.token).is_some() {
            match in_flight.purpose {
              Purpose::Resubscribe => {
                warn!("re-subscription of {} failed, dropping it", in_flight.request.path);
              }
              Purpose::User => debug!("observe of {} failed", in_flight.request.path),
            }
          }
        }
      }
    }
    in_flight.request.complete(result);
  }

  fn cancel_in_flight_timers(&mut self, in_flight: &mut InFlight) {
    if let Some(handle) = in_flight.retransmit_handle.take() {
      self.timer.cancel_timeout(&handle);
    }
    self.timer.cancel_timeout(&in_flight.deadline_handle);
  }

  /// Fire-and-forget transmission of ACK/RST housekeeping messages.
  fn send_plain(&mut self, message: Message) {
    match message.encode() {
      Ok(datagram) => self.transmit(&datagram),
      Err(e) => error!("failed to encode housekeeping message: {e}"),
    }
  }

  // ---- allocation ----

  fn allocate_message_id(&mut self) -> u16 {
    self.next_message_id = self.next_message_id.wrapping_add(1);
    self.next_message_id
  }

  /// Fresh 8-byte token, distinct from the in-flight request and every
  /// active observation.
  fn allocate_token(&mut self) -> Token {
    let mut rng = rand::rng();
    loop {
      let bytes: [u8; 8] = rng.random();
      let token = Token::new(&bytes).unwrap_or(Token::EMPTY);
      let in_use = self.observations.contains_token(token)
        || self.in_flight.as_ref().is_some_and(|f| f.token == token);
      if !in_use && !token.is_empty() {
        return token;
      }
    }
  }
}

fn empty_response(path: &str) -> CoapResponse {
  CoapResponse {
    code: Code::EMPTY,
    path: path.to_string(),
    payload: bytes::Bytes::new(),
    content_type: None,
    block1: None,
    block2: None,
    size2: None,
    observe_seq: None,
  }
}

fn decode_response(message: &Message, path: &str) -> CoapResponse {
  let echoed = message.uri_path();
  CoapResponse {
    code: message.code,
    path: if echoed.is_empty() {
      path.to_string()
    } else {
      echoed
    },
    payload: message.payload.clone(),
    content_type: message.content_format(),
    block1: message.block1(),
    block2: message.block2(),
    size2: message.size2(),
    observe_seq: message.observe(),
  }
}

fn build_message(request: &QueuedRequest, token: Token, message_id: u16) -> Message {
  if matches!(request.kind, RequestKind::Ping) {
    return Message::empty(MessageType::Confirmable, message_id);
  }

  let mut builder = MessageBuilder::request(MessageType::Confirmable, request.kind.code())
    .message_id(message_id)
    .token(token)
    .path(&request.path);

  match &request.kind {
    RequestKind::Get | RequestKind::BlockGet { .. } => {
      builder = builder.accept(request.accept);
    }
    RequestKind::Observe => {
      builder = builder.observe(0).accept(request.accept);
    }
    RequestKind::CancelObserve => {
      builder = builder.observe(1).accept(request.accept);
    }
    RequestKind::Post | RequestKind::Put | RequestKind::BlockPost { .. } | RequestKind::Delete => {
      if !request.payload.is_empty() {
        builder = builder.content_format(request.content_type);
      }
    }
    RequestKind::Ping => unreachable!(),
  }

  match &request.kind {
    RequestKind::BlockGet { block2 } => {
      builder = builder.block2(*block2);
    }
    RequestKind::BlockPost { block1, size1 } => {
      builder = builder.block1(*block1);
      if let Some(size) = size1 {
        builder = builder.size1(*size);
      }
    }
    _ => {}
  }

  if !request.payload.is_empty() {
    builder = builder.payload(request.payload.clone());
  }
  builder.build()
}
