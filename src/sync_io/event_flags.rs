use std::{
  sync::{Condvar, Mutex},
  time::{Duration, Instant},
};

// Bitmap + condvar. Waiters ask for any-of a bit set; the returned value is
// the bitmap as it was before an optional clear, so a waiter can tell which
// bits actually fired.

#[derive(Default)]
pub(crate) struct EventFlags {
  bitmap: Mutex<u32>,
  changed: Condvar,
}

impl EventFlags {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, bits: u32) {
    let mut bitmap = self.bitmap.lock().unwrap();
    *bitmap |= bits;
    self.changed.notify_all();
  }

  pub fn clear(&self, bits: u32) {
    let mut bitmap = self.bitmap.lock().unwrap();
    *bitmap &= !bits;
  }

  pub fn current(&self) -> u32 {
    *self.bitmap.lock().unwrap()
  }

  /// Wait until any of `bits` is set, or until `timeout` elapses. Returns
  /// the pre-clear bitmap snapshot; the caller checks it against `bits`.
  pub fn wait_any(&self, bits: u32, clear_set_bits: bool, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;
    let mut bitmap = self.bitmap.lock().unwrap();
    loop {
      let snapshot = *bitmap;
      if snapshot & bits != 0 {
        if clear_set_bits {
          *bitmap &= !bits;
        }
        return snapshot;
      }
      let now = Instant::now();
      if now >= deadline {
        return snapshot;
      }
      let (guard, _) = self
        .changed
        .wait_timeout(bitmap, deadline - now)
        .unwrap();
      bitmap = guard;
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;

  const BIT_A: u32 = 1 << 0;
  const BIT_B: u32 = 1 << 1;

  #[test]
  fn wait_returns_immediately_when_already_set() {
    let flags = EventFlags::new();
    flags.set(BIT_A | BIT_B);
    let got = flags.wait_any(BIT_A, true, Duration::from_millis(1));
    assert_eq!(got & BIT_A, BIT_A);
    // clear only touched the waited-for bit
    assert_eq!(flags.current(), BIT_B);
  }

  #[test]
  fn wait_times_out_without_the_bit() {
    let flags = EventFlags::new();
    flags.set(BIT_B);
    let got = flags.wait_any(BIT_A, false, Duration::from_millis(20));
    assert_eq!(got & BIT_A, 0);
  }

  #[test]
  fn set_from_another_thread_wakes_waiter() {
    let flags = Arc::new(EventFlags::new());
    let flags2 = Arc::clone(&flags);
    let t = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      flags2.set(BIT_A);
    });
    let got = flags.wait_any(BIT_A, false, Duration::from_secs(5));
    assert_eq!(got & BIT_A, BIT_A);
    t.join().unwrap();
  }
}
