use std::{
  collections::VecDeque,
  sync::{Arc, Condvar, Mutex},
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::poll_channel::{make_poll_channel, PollEventSender, PollEventSource};

// Bounded multi-producer single-consumer queue.
//
// Producers block (with a timeout) on a condvar while the ring is full;
// the consumer never blocks here at all: it polls the signal fd and then
// calls `try_recv` until empty.

struct Ring<T> {
  items: VecDeque<T>,
  capacity: usize,
  receiver_alive: bool,
}

struct Shared<T> {
  ring: Mutex<Ring<T>>,
  space_available: Condvar,
  signal: PollEventSender,
}

pub(crate) fn mailbox<T>(capacity: usize) -> std::io::Result<(MailboxSender<T>, MailboxReceiver<T>)> {
  let (signal_source, signal_sender) = make_poll_channel()?;
  let shared = Arc::new(Shared {
    ring: Mutex::new(Ring {
      items: VecDeque::with_capacity(capacity),
      capacity,
      receiver_alive: true,
    }),
    space_available: Condvar::new(),
    signal: signal_sender,
  });
  Ok((
    MailboxSender {
      shared: Arc::clone(&shared),
    },
    MailboxReceiver {
      shared,
      signal_source,
    },
  ))
}

pub(crate) struct MailboxSender<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for MailboxSender<T> {
  fn clone(&self) -> Self {
    MailboxSender {
      shared: Arc::clone(&self.shared),
    }
  }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SendError<T> {
  Full(T),
  Disconnected(T),
}

impl<T> MailboxSender<T> {
  /// Non-blocking enqueue.
  pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
    let mut ring = self.shared.ring.lock().unwrap();
    if !ring.receiver_alive {
      return Err(SendError::Disconnected(item));
    }
    if ring.items.len() >= ring.capacity {
      return Err(SendError::Full(item));
    }
    ring.items.push_back(item);
    drop(ring);
    self.shared.signal.send();
    Ok(())
  }

  /// Enqueue, waiting up to `timeout` for space.
  pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), SendError<T>> {
    let deadline = Instant::now() + timeout;
    let mut ring = self.shared.ring.lock().unwrap();
    loop {
      if !ring.receiver_alive {
        return Err(SendError::Disconnected(item));
      }
      if ring.items.len() < ring.capacity {
        ring.items.push_back(item);
        drop(ring);
        self.shared.signal.send();
        return Ok(());
      }
      let now = Instant::now();
      if now >= deadline {
        return Err(SendError::Full(item));
      }
      let (guard, wait) = self
        .shared
        .space_available
        .wait_timeout(ring, deadline - now)
        .unwrap();
      ring = guard;
      if wait.timed_out() && ring.items.len() >= ring.capacity {
        return Err(SendError::Full(item));
      }
    }
  }
}

pub(crate) struct MailboxReceiver<T> {
  shared: Arc<Shared<T>>,
  signal_source: PollEventSource,
}

impl<T> MailboxReceiver<T> {
  pub fn try_recv(&self) -> Option<T> {
    let mut ring = self.shared.ring.lock().unwrap();
    let item = ring.items.pop_front();
    if item.is_some() {
      self.shared.space_available.notify_one();
    }
    item
  }

  pub fn len(&self) -> usize {
    self.shared.ring.lock().unwrap().items.len()
  }

  /// Remove every queued item, e.g. to fail them on stop.
  pub fn drain(&self) -> Vec<T> {
    let mut ring = self.shared.ring.lock().unwrap();
    let items: Vec<T> = ring.items.drain(..).collect();
    self.shared.space_available.notify_all();
    items
  }

  /// The pollable side of the mailbox. Drain with
  /// [`acknowledge_signal`](Self::acknowledge_signal) on every readable
  /// event.
  pub fn pollable(&self) -> &PollEventSource {
    &self.signal_source
  }

  pub fn acknowledge_signal(&self) {
    self.signal_source.drain();
  }
}

impl<T> Drop for MailboxReceiver<T> {
  fn drop(&mut self) {
    let mut ring = self.shared.ring.lock().unwrap();
    ring.receiver_alive = false;
    self.shared.space_available.notify_all();
  }
}
