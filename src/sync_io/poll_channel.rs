use std::{io, os::unix::io::AsRawFd};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_06::{unix::EventedFd, Evented, Poll, PollOpt, Ready, Token};
use socketpair::{socketpair_stream, SocketpairStream};

// A byte-level doorbell: the sender writes a byte, the receiver is a
// pollable fd that becomes readable. Used to fold "mailbox non-empty" and
// "control message pending" into the same mio poll as the DTLS socket.

fn set_nonblocking(fd: &SocketpairStream) -> io::Result<()> {
  let raw = fd.as_raw_fd();
  unsafe {
    let flags = libc::fcntl(raw, libc::F_GETFL, 0);
    if flags < 0 {
      return Err(io::Error::last_os_error());
    }
    if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
      return Err(io::Error::last_os_error());
    }
  }
  Ok(())
}

pub(crate) fn make_poll_channel() -> io::Result<(PollEventSource, PollEventSender)> {
  let (rcv_socket, snd_socket) = socketpair_stream()?;
  set_nonblocking(&rcv_socket)?;
  set_nonblocking(&snd_socket)?;
  Ok((
    PollEventSource { rcv_socket },
    PollEventSender { snd_socket },
  ))
}

pub(crate) struct PollEventSender {
  snd_socket: SocketpairStream,
}

impl PollEventSender {
  /// Make the receiving end readable. Losing the byte to a full pipe is
  /// fine: the receiver is already pending a wakeup.
  pub fn send(&self) {
    let raw = self.snd_socket.as_raw_fd();
    let byte: u8 = 0xcc;
    let ret = unsafe { libc::write(raw, &byte as *const u8 as *const libc::c_void, 1) };
    if ret < 0 {
      let e = io::Error::last_os_error();
      if e.kind() != io::ErrorKind::WouldBlock {
        warn!("PollEventSender.send: {e}");
      }
    }
  }
}

pub(crate) struct PollEventSource {
  rcv_socket: SocketpairStream,
}

impl PollEventSource {
  /// Consume pending wakeup bytes. Must be called every time the source
  /// polls readable, or the poll will spin.
  pub fn drain(&self) {
    let raw = self.rcv_socket.as_raw_fd();
    let mut buf = [0u8; 16];
    loop {
      let ret = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
      if ret > 0 {
        continue;
      } else if ret == 0 {
        warn!("PollEventSource.drain: sender closed");
        return;
      } else {
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::WouldBlock {
          warn!("PollEventSource.drain: {e}");
        }
        return;
      }
    }
  }
}

impl Evented for PollEventSource {
  fn register(
    &self,
    poll: &Poll,
    token: Token,
    interest: Ready,
    opts: PollOpt,
  ) -> io::Result<()> {
    EventedFd(&self.rcv_socket.as_raw_fd()).register(poll, token, interest, opts)
  }

  fn reregister(
    &self,
    poll: &Poll,
    token: Token,
    interest: Ready,
    opts: PollOpt,
  ) -> io::Result<()> {
    EventedFd(&self.rcv_socket.as_raw_fd()).reregister(poll, token, interest, opts)
  }

  fn deregister(&self, poll: &Poll) -> io::Result<()> {
    EventedFd(&self.rcv_socket.as_raw_fd()).deregister(poll)
  }
}
