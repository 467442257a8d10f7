// End-to-end exercises of the client against a scripted in-process CoAP
// server on loopback UDP (the plaintext transport).

mod common;

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicU16, AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use bytes::Bytes;
use ciborium::value::Value;
use golioth_client::{
  coap::{BlockValue, Code, ContentType, Message, MessageType, Token},
  lightdb, remote_log, stream, Client, Status,
};

use common::*;

fn connect_client(server: &MockServer) -> Client {
  let client = Client::create(test_config(server)).unwrap();
  client
    .wait_for_connect(Some(Duration::from_secs(5)))
    .unwrap();
  client
}

#[test_log::test]
fn hello_log_reaches_the_logs_resource() {
  let server = MockServer::start(|request| {
    if request.code == Code::POST && request.uri_path() == "logs" {
      vec![piggyback(request, Code::CHANGED, b"")]
    } else {
      vec![]
    }
  });
  let client = connect_client(&server);

  remote_log::info_sync(&client, "boot", "hello", Some(Duration::from_secs(10))).unwrap();

  let posts = server.requests_matching(|m| m.uri_path() == "logs");
  assert_eq!(posts.len(), 1);
  assert_eq!(posts[0].content_format(), Some(ContentType::Cbor));

  let entry: Value = ciborium::de::from_reader(posts[0].payload.as_ref()).unwrap();
  let map = entry.as_map().unwrap();
  let get = |key: &str| {
    map
      .iter()
      .find(|(k, _)| k.as_text() == Some(key))
      .map(|(_, v)| v.clone())
  };
  assert_eq!(get("level"), Some(Value::Text("info".to_string())));
  assert_eq!(get("module"), Some(Value::Text("boot".to_string())));
  assert_eq!(get("msg"), Some(Value::Text("hello".to_string())));

  client.destroy();
}

#[test]
fn set_then_get_round_trips_an_int() {
  let store: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
  let server_store = Arc::clone(&store);
  let server = MockServer::start(move |request| {
    let path = request.uri_path();
    match request.code {
      Code::POST => {
        server_store
          .lock()
          .unwrap()
          .insert(path, request.payload.to_vec());
        vec![piggyback(request, Code::CHANGED, b"")]
      }
      Code::GET => match server_store.lock().unwrap().get(&path) {
        Some(stored) => vec![with_content_format(
          piggyback(request, Code::CONTENT, stored),
          ContentType::Json,
        )],
        None => vec![piggyback(request, Code::NOT_FOUND, b"")],
      },
      _ => vec![],
    }
  });
  let client = connect_client(&server);

  lightdb::set_int_sync(&client, "counter", 42, None).unwrap();
  assert_eq!(lightdb::get_int_sync(&client, "counter", None).unwrap(), 42);

  // a missing path surfaces as a plain failure
  assert!(lightdb::get_int_sync(&client, "absent", None).is_err());

  client.destroy();
}

#[test]
fn delete_round_trips() {
  let server = MockServer::start(|request| match request.code {
    Code::DELETE => vec![piggyback(request, Code::DELETED, b"")],
    _ => vec![],
  });
  let client = connect_client(&server);
  lightdb::delete_sync(&client, "counter", None).unwrap();
  assert_eq!(
    server
      .requests_matching(|m| m.code == Code::DELETE && m.uri_path() == ".d/counter")
      .len(),
    1
  );
  client.destroy();
}

#[test]
fn observation_delivers_notifications_in_order() {
  let observed_token: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));
  let server_token = Arc::clone(&observed_token);
  let server = MockServer::start(move |request| {
    if request.code == Code::GET && request.observe() == Some(0) {
      *server_token.lock().unwrap() = Some(request.token);
      vec![with_content_format(
        with_observe(piggyback(request, Code::CONTENT, b"0"), 1),
        ContentType::Json,
      )]
    } else {
      vec![]
    }
  });

  let client = connect_client(&server);
  let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
  let seen_cb = Arc::clone(&seen);
  lightdb::observe(&client, "counter", ContentType::Json, move |path, payload| {
    assert_eq!(path, "counter");
    let value: i64 = serde_json::from_slice(payload).unwrap();
    seen_cb.lock().unwrap().push(value);
  })
  .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    observed_token.lock().unwrap().is_some()
  }));
  let token = observed_token.lock().unwrap().unwrap();

  // initial value from the registration response
  assert!(wait_until(Duration::from_secs(5), || {
    !seen.lock().unwrap().is_empty()
  }));

  for sequence in 1..=5u64 {
    let payload = sequence.to_string();
    server.push(notification(
      token,
      0x4000 + sequence as u16,
      sequence + 1,
      payload.as_bytes(),
    ));
  }

  assert!(wait_until(Duration::from_secs(5), || {
    seen.lock().unwrap().len() >= 6
  }));
  assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);

  client.destroy();
}

#[test]
fn blockwise_upload_chunks_as_specified() {
  // 4321 bytes at a 1024-byte block size: five exchanges, the last one
  // carrying 225 bytes with more=false
  let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
  let exchanges: Arc<Mutex<Vec<(u32, bool, usize)>>> = Arc::new(Mutex::new(Vec::new()));
  let server_received = Arc::clone(&received);
  let server_exchanges = Arc::clone(&exchanges);

  let server = MockServer::start(move |request| {
    let Some(block1) = request.block1() else {
      return vec![];
    };
    server_exchanges
      .lock()
      .unwrap()
      .push((block1.num, block1.more, request.payload.len()));
    server_received
      .lock()
      .unwrap()
      .extend_from_slice(&request.payload);
    if block1.more {
      vec![with_block1(
        piggyback(request, Code::CONTINUE, b""),
        block1,
      )]
    } else {
      vec![with_block1(piggyback(request, Code::CHANGED, b""), block1)]
    }
  });

  let client = connect_client(&server);
  let payload: Vec<u8> = (0..4321u32).map(|i| (i % 251) as u8).collect();
  stream::set_blockwise_sync(
    &client,
    "multi_upload",
    ContentType::Cbor,
    &payload,
    None,
  )
  .unwrap();

  let exchanges = exchanges.lock().unwrap().clone();
  assert_eq!(
    exchanges,
    vec![
      (0, true, 1024),
      (1, true, 1024),
      (2, true, 1024),
      (3, true, 1024),
      (4, false, 225),
    ]
  );
  assert_eq!(*received.lock().unwrap(), payload);

  client.destroy();
}

#[test]
fn upload_restarts_when_the_server_negotiates_down() {
  let sizes_seen: Arc<Mutex<Vec<(u32, usize)>>> = Arc::new(Mutex::new(Vec::new()));
  let server_sizes = Arc::clone(&sizes_seen);
  let server = MockServer::start(move |request| {
    let Some(block1) = request.block1() else {
      return vec![];
    };
    server_sizes
      .lock()
      .unwrap()
      .push((block1.num, block1.size()));
    // the first 1024-byte attempt is answered with a 512-byte counteroffer
    let negotiated = BlockValue::new(block1.num, block1.more, 512).unwrap();
    let code = if block1.more { Code::CONTINUE } else { Code::CHANGED };
    vec![with_block1(piggyback(request, code, b""), negotiated)]
  });

  let client = connect_client(&server);
  let payload = vec![9u8; 1500];
  stream::set_blockwise_sync(&client, "nego", ContentType::OctetStream, &payload, None).unwrap();

  let sizes = sizes_seen.lock().unwrap().clone();
  // one 1024-byte attempt, then a full restart at 512
  assert_eq!(sizes[0], (0, 1024));
  assert_eq!(
    sizes[1..],
    [(0, 512), (1, 512), (2, 512)]
  );
  client.destroy();
}

#[test]
fn separate_response_completes_the_request() {
  let mid = Arc::new(AtomicU16::new(0x7000));
  let server_mid = Arc::clone(&mid);
  let server = MockServer::start(move |request| {
    match (request.code, request.message_type) {
      (Code::POST, _) => {
        // empty ACK now, the real response as its own confirmable message
        let ack = Message::ack_for(request);
        let response = Message {
          message_type: MessageType::Confirmable,
          code: Code::CHANGED,
          message_id: server_mid.fetch_add(1, Ordering::SeqCst),
          token: request.token,
          options: Vec::new(),
          payload: Bytes::new(),
        };
        vec![ack, response]
      }
      _ => vec![],
    }
  });

  let client = connect_client(&server);
  stream::set_sync(&client, "sep", ContentType::Json, b"{}", None).unwrap();

  // the client must have ACKed the separate confirmable response
  assert!(wait_until(Duration::from_secs(2), || {
    !server
      .requests_matching(|m| m.message_type == MessageType::Acknowledgement && m.code.is_empty())
      .is_empty()
  }));
  client.destroy();
}

#[test]
fn lost_datagram_is_retransmitted() {
  let deliveries = Arc::new(AtomicUsize::new(0));
  let server_deliveries = Arc::clone(&deliveries);
  let server = MockServer::start(move |request| {
    if request.code != Code::POST {
      return vec![];
    }
    // drop the first transmission on the floor
    if server_deliveries.fetch_add(1, Ordering::SeqCst) == 0 {
      return vec![];
    }
    vec![piggyback(request, Code::CHANGED, b"")]
  });

  let client = connect_client(&server);
  stream::set_sync(
    &client,
    "retry",
    ContentType::Json,
    b"{}",
    Some(Duration::from_secs(8)),
  )
  .unwrap();
  assert!(deliveries.load(Ordering::SeqCst) >= 2);
  client.destroy();
}

#[test]
fn keepalive_ping_keeps_an_idle_session_alive() {
  let server = MockServer::start(move |request| {
    if request.code.is_empty() && request.message_type == MessageType::Confirmable {
      // CoAP pong
      return vec![Message::reset_for(request)];
    }
    if request.code == Code::POST {
      return vec![piggyback(request, Code::CHANGED, b"")];
    }
    vec![]
  });

  let mut config = test_config(&server);
  config.keepalive_interval = Some(Duration::from_millis(500));
  let client = Client::create(config).unwrap();
  client
    .wait_for_connect(Some(Duration::from_secs(5)))
    .unwrap();

  // idle long enough for several keepalive rounds
  assert!(wait_until(Duration::from_secs(5), || {
    !server
      .requests_matching(|m| m.code.is_empty() && m.message_type == MessageType::Confirmable)
      .is_empty()
  }));
  assert!(client.is_connected());

  // and the session still works
  stream::set_sync(&client, "alive", ContentType::Json, b"1", None).unwrap();
  client.destroy();
}

#[test_log::test]
fn observations_are_resubscribed_before_queued_requests_after_reconnect() {
  let server = MockServer::start(move |request| {
    if request.code == Code::GET && request.observe() == Some(0) {
      return vec![with_content_format(
        with_observe(piggyback(request, Code::CONTENT, b"1"), 1),
        ContentType::Json,
      )];
    }
    if request.code.is_empty() && request.message_type == MessageType::Confirmable {
      return vec![Message::reset_for(request)];
    }
    match request.code {
      Code::GET => vec![with_content_format(
        piggyback(request, Code::CONTENT, b"7"),
        ContentType::Json,
      )],
      Code::POST => vec![piggyback(request, Code::CHANGED, b"")],
      _ => vec![],
    }
  });

  let mut config = test_config(&server);
  config.keepalive_interval = Some(Duration::from_millis(300));
  let client = Client::create(config).unwrap();
  client
    .wait_for_connect(Some(Duration::from_secs(5)))
    .unwrap();

  lightdb::observe(&client, "counter", ContentType::Json, |_, _| ()).unwrap();
  assert!(wait_until(Duration::from_secs(3), || {
    !server
      .requests_matching(|m| m.observe() == Some(0))
      .is_empty()
  }));

  // go silent: the unanswered keepalive ping kills the session
  server.mute.store(true, Ordering::SeqCst);
  assert!(wait_until(Duration::from_secs(15), || !client.is_connected()));
  let requests_before_reconnect = server.log.lock().unwrap().len();

  // queue work while disconnected; it must run only after re-subscription
  let _ = lightdb::set_int_async(&client, "other", 1, |_| ());
  server.mute.store(false, Ordering::SeqCst);
  assert!(wait_until(Duration::from_secs(10), || client.is_connected()));
  assert!(wait_until(Duration::from_secs(5), || {
    !server
      .requests_matching(|m| m.code == Code::POST && m.uri_path() == ".d/other")
      .is_empty()
  }));

  let log = server.log.lock().unwrap();
  let after: Vec<_> = log[requests_before_reconnect..]
    .iter()
    .filter(|m| m.code == Code::GET || m.code == Code::POST)
    .collect();
  let resubscribe_pos = after
    .iter()
    .position(|m| m.observe() == Some(0) && m.uri_path() == ".d/counter")
    .expect("no re-subscription seen");
  let post_pos = after
    .iter()
    .position(|m| m.code == Code::POST && m.uri_path() == ".d/other")
    .expect("no queued request seen");
  assert!(
    resubscribe_pos < post_pos,
    "re-subscription must precede queued user requests"
  );
  drop(log);

  client.destroy();
}

#[test]
fn dropping_the_settings_service_cancels_its_observation() {
  use golioth_client::settings::{Settings, SettingsStatus};

  let server = MockServer::start(|request| {
    if request.code == Code::GET && request.observe() == Some(0) {
      return vec![with_content_format(
        with_observe(piggyback(request, Code::CONTENT, b""), 1),
        ContentType::Cbor,
      )];
    }
    if request.code == Code::GET && request.observe() == Some(1) {
      return vec![piggyback(request, Code::CONTENT, b"")];
    }
    vec![]
  });

  let client = connect_client(&server);
  let settings = Settings::new(&client).unwrap();
  settings
    .register_bool("ENABLED", |_| SettingsStatus::Success)
    .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    !server
      .requests_matching(|m| m.observe() == Some(0) && m.uri_path() == ".c")
      .is_empty()
  }));

  drop(settings);

  // the deregister GET (Observe=1) goes out for the settings resource
  assert!(wait_until(Duration::from_secs(5), || {
    !server
      .requests_matching(|m| m.observe() == Some(1) && m.uri_path() == ".c")
      .is_empty()
  }));

  client.destroy();
}

#[test]
fn rpc_invocation_round_trips_through_the_dispatcher() {
  use golioth_client::rpc::{self, Rpc, RpcStatus};

  let observed_token: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));
  let server_token = Arc::clone(&observed_token);
  let server = MockServer::start(move |request| {
    if request.code == Code::GET && request.observe() == Some(0) && request.uri_path() == ".rpc" {
      *server_token.lock().unwrap() = Some(request.token);
      return vec![with_content_format(
        with_observe(piggyback(request, Code::CONTENT, b""), 1),
        ContentType::Cbor,
      )];
    }
    if request.code == Code::POST {
      return vec![piggyback(request, Code::CHANGED, b"")];
    }
    vec![]
  });

  let client = connect_client(&server);
  let dispatcher = Rpc::new(&client).unwrap();
  dispatcher
    .register("double", |params, detail| {
      let Ok(x) = rpc::param_as_i64(&params[0]) else {
        return RpcStatus::InvalidArgument;
      };
      detail.insert("value", Value::Integer((x * 2).into()));
      RpcStatus::Ok
    })
    .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    observed_token.lock().unwrap().is_some()
  }));
  let token = observed_token.lock().unwrap().unwrap();

  let invocation = |id: u64, method: &str, params: Vec<Value>| {
    let mut body = Vec::new();
    ciborium::ser::into_writer(
      &Value::Map(vec![
        (Value::Text("id".into()), Value::Integer(id.into())),
        (Value::Text("method".into()), Value::Text(method.into())),
        (Value::Text("params".into()), Value::Array(params)),
      ]),
      &mut body,
    )
    .unwrap();
    body
  };

  let push_invocation = |mid: u16, seq: u64, body: &[u8]| {
    let message = with_content_format(
      with_observe(
        Message {
          message_type: MessageType::NonConfirmable,
          code: Code::CONTENT,
          message_id: mid,
          token,
          options: Vec::new(),
          payload: bytes::Bytes::copy_from_slice(body),
        },
        seq,
      ),
      ContentType::Cbor,
    );
    server.push(message);
  };

  push_invocation(0x6001, 2, &invocation(9, "double", vec![Value::Integer(21.into())]));
  push_invocation(0x6002, 3, &invocation(10, "missing", vec![]));

  assert!(wait_until(Duration::from_secs(5), || {
    server
      .requests_matching(|m| m.code == Code::POST && m.uri_path() == ".rpc/status")
      .len()
      >= 2
  }));

  let replies = server.requests_matching(|m| m.uri_path() == ".rpc/status");
  let decode = |m: &Message| -> (u64, u64) {
    let value: Value = ciborium::de::from_reader(m.payload.as_ref()).unwrap();
    let map = value.as_map().unwrap();
    let field = |key: &str| -> u64 {
      map
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .and_then(|(_, v)| v.as_integer())
        .map(|i| u64::try_from(i128::from(i)).unwrap())
        .unwrap()
    };
    (field("id"), field("statusCode"))
  };
  let decoded: Vec<(u64, u64)> = replies.iter().map(decode).collect();
  assert!(decoded.contains(&(9, RpcStatus::Ok as u64)));
  assert!(decoded.contains(&(10, RpcStatus::NotFound as u64)));

  client.destroy();
}

#[test]
fn queue_full_is_reported_to_the_producer() {
  // server never answers, so requests pile up
  let server = MockServer::start(|_| vec![]);
  let client = connect_client(&server);

  let mut statuses = Vec::new();
  for _ in 0..13 {
    let result = lightdb::set_int_async(&client, "x", 1, |_| ());
    statuses.push(result);
  }
  assert!(statuses
    .iter()
    .any(|r| matches!(r, Err(Status::QueueFull))));
  client.destroy();
}
