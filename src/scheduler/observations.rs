#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  coap::{ContentType, Token},
  config::MAX_NUM_OBSERVATIONS,
  error::{GolResult, Status},
  scheduler::request::{CoapResponse, ObserveCallback},
};

/// One server-push subscription.
pub(crate) struct Observation {
  pub path: String,
  pub accept: ContentType,
  pub token: Token,
  pub callback: ObserveCallback,
  /// Notifications delivered so far. The server enforces monotonic observe
  /// sequence numbers; we only count.
  pub notify_count: u64,
  /// False until the registration (or re-registration) GET is acknowledged
  /// with a success response.
  pub active: bool,
}

/// Table of active observations, in insertion order. Owned by the I/O
/// thread; never locked across I/O.
#[derive(Default)]
pub(crate) struct ObservationRegistry {
  entries: Vec<Observation>,
}

impl ObservationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new observation under a fresh token. Fails when the table
  /// is full, or when the path is already observed.
  pub fn add(
    &mut self,
    path: &str,
    accept: ContentType,
    token: Token,
    callback: ObserveCallback,
  ) -> GolResult<()> {
    if self.entries.len() >= MAX_NUM_OBSERVATIONS {
      warn!("observation table full ({MAX_NUM_OBSERVATIONS}), rejecting {path}");
      return Err(Status::MemAlloc);
    }
    if self.find_by_path(path).is_some() {
      return Err(Status::NotAllowed);
    }
    debug_assert!(self.entries.iter().all(|o| o.token != token));
    self.entries.push(Observation {
      path: path.to_string(),
      accept,
      token,
      callback,
      notify_count: 0,
      active: false,
    });
    Ok(())
  }

  pub fn find_by_path(&self, path: &str) -> Option<&Observation> {
    self.entries.iter().find(|o| o.path == path)
  }

  pub fn find_by_token_mut(&mut self, token: Token) -> Option<&mut Observation> {
    self.entries.iter_mut().find(|o| o.token == token)
  }

  /// Remove the observation for `path`, returning it (tokenless cancel
  /// paths report `NotAllowed` upstream when this is `None`).
  pub fn remove_by_path(&mut self, path: &str) -> Option<Observation> {
    let idx = self.entries.iter().position(|o| o.path == path)?;
    Some(self.entries.remove(idx))
  }

  pub fn remove_by_token(&mut self, token: Token) -> Option<Observation> {
    let idx = self.entries.iter().position(|o| o.token == token)?;
    Some(self.entries.remove(idx))
  }

  pub fn contains_token(&self, token: Token) -> bool {
    self.entries.iter().any(|o| o.token == token)
  }

  /// Deliver a notification to the matching entry. Returns false when no
  /// entry owns the token (the caller then rejects the message).
  pub fn deliver(&mut self, token: Token, response: &CoapResponse) -> bool {
    match self.find_by_token_mut(token) {
      Some(observation) => {
        if !observation.active {
          trace!(
            "notification for {} before its (re-)subscription completed",
            observation.path
          );
        }
        observation.notify_count += 1;
        (observation.callback)(response);
        true
      }
      None => false,
    }
  }

  /// Tokens of every entry, in insertion order. Used for the re-subscribe
  /// walk after a reconnect.
  pub fn tokens(&self) -> Vec<Token> {
    self.entries.iter().map(|o| o.token).collect()
  }

  pub fn mark_all_inactive(&mut self) {
    for o in self.entries.iter_mut() {
      o.active = false;
    }
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}
