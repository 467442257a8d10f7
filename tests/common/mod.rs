// In-process CoAP "cloud" for loopback testing: one UDP socket, a scripted
// handler, and a log of every decoded request.
#![allow(dead_code)] // each test binary uses a different subset of helpers

use std::{
  net::{SocketAddr, UdpSocket},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  thread,
  time::Duration,
};

use bytes::Bytes;
use golioth_client::{
  coap::{option::number, BlockValue, Code, CoapOption, ContentType, Message, MessageType, Token},
  ClientConfig, Credentials,
};

pub struct MockServer {
  pub addr: SocketAddr,
  /// Every successfully decoded incoming message, in arrival order.
  pub log: Arc<Mutex<Vec<Message>>>,
  /// While true, incoming messages are logged but not answered.
  pub mute: Arc<AtomicBool>,
  socket: Arc<UdpSocket>,
  peer: Arc<Mutex<Option<SocketAddr>>>,
  stop: Arc<AtomicBool>,
  handle: Option<thread::JoinHandle<()>>,
}

impl MockServer {
  pub fn start<H>(mut handler: H) -> MockServer
  where
    H: FnMut(&Message) -> Vec<Message> + Send + 'static,
  {
    let socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).unwrap());
    socket
      .set_read_timeout(Some(Duration::from_millis(50)))
      .unwrap();
    let addr = socket.local_addr().unwrap();

    let log: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let mute = Arc::new(AtomicBool::new(false));
    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));

    let handle = {
      let socket = Arc::clone(&socket);
      let log = Arc::clone(&log);
      let mute = Arc::clone(&mute);
      let peer = Arc::clone(&peer);
      let stop = Arc::clone(&stop);
      thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while !stop.load(Ordering::SeqCst) {
          let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(_) => continue, // timeout tick
          };
          *peer.lock().unwrap() = Some(from);
          let message = match Message::decode(&buf[..n]) {
            Ok(message) => message,
            Err(_) => continue,
          };
          log.lock().unwrap().push(message.clone());
          if mute.load(Ordering::SeqCst) {
            continue;
          }
          for reply in handler(&message) {
            let datagram = reply.encode().unwrap();
            let _ = socket.send_to(&datagram, from);
          }
        }
      })
    };

    MockServer {
      addr,
      log,
      mute,
      socket,
      peer,
      stop,
      handle: Some(handle),
    }
  }

  /// Send a server-initiated message (e.g. an observation notification) to
  /// the most recent client.
  pub fn push(&self, message: Message) {
    let peer = self.peer.lock().unwrap().expect("no client seen yet");
    let datagram = message.encode().unwrap();
    self.socket.send_to(&datagram, peer).unwrap();
  }

  pub fn requests_matching<F: Fn(&Message) -> bool>(&self, predicate: F) -> Vec<Message> {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|m| predicate(m))
      .cloned()
      .collect()
  }
}

impl Drop for MockServer {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::SeqCst);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

pub fn test_config(server: &MockServer) -> ClientConfig {
  let mut config = ClientConfig::with_host(
    "127.0.0.1",
    server.addr.port(),
    Credentials::Psk {
      id: "dev".to_string(),
      key: vec![0u8; 16],
    },
  );
  config.nosec = true;
  config
}

// ---- reply builders ----

/// Piggy-backed response: ACK with the request's message id and token.
pub fn piggyback(request: &Message, code: Code, payload: &[u8]) -> Message {
  Message {
    message_type: MessageType::Acknowledgement,
    code,
    message_id: request.message_id,
    token: request.token,
    options: Vec::new(),
    payload: Bytes::copy_from_slice(payload),
  }
}

pub fn with_content_format(mut message: Message, content_type: ContentType) -> Message {
  if let Some(wire) = content_type.to_wire() {
    message
      .options
      .push(CoapOption::uint(number::CONTENT_FORMAT, u64::from(wire)));
    message.options.sort_by_key(|o| o.number);
  }
  message
}

pub fn with_observe(mut message: Message, sequence: u64) -> Message {
  message
    .options
    .push(CoapOption::uint(number::OBSERVE, sequence));
  message.options.sort_by_key(|o| o.number);
  message
}

pub fn with_block1(mut message: Message, block: BlockValue) -> Message {
  message
    .options
    .push(CoapOption::new(number::BLOCK1, block.to_wire()));
  message.options.sort_by_key(|o| o.number);
  message
}

pub fn with_block2(mut message: Message, block: BlockValue) -> Message {
  message
    .options
    .push(CoapOption::new(number::BLOCK2, block.to_wire()));
  message.options.sort_by_key(|o| o.number);
  message
}

/// A NON notification for an active observation.
pub fn notification(token: Token, message_id: u16, sequence: u64, payload: &[u8]) -> Message {
  let base = Message {
    message_type: MessageType::NonConfirmable,
    code: Code::CONTENT,
    message_id,
    token,
    options: Vec::new(),
    payload: Bytes::copy_from_slice(payload),
  };
  with_content_format(with_observe(base, sequence), ContentType::Json)
}

/// Wait (with timeout) until `predicate` holds.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
  let deadline = std::time::Instant::now() + timeout;
  while std::time::Instant::now() < deadline {
    if predicate() {
      return true;
    }
    thread::sleep(Duration::from_millis(20));
  }
  predicate()
}
