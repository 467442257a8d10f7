// Blocking/waitable primitives shared by the client and the I/O thread.
//
// The only primitive the I/O thread ever sleeps in is its mio poll, so
// everything that needs to wake it must be representable as a pollable file
// descriptor. `poll_channel` provides that; `mailbox` and `event_flags`
// build the two higher-level shapes on top of std sync types.

pub(crate) mod event_flags;
pub(crate) mod mailbox;
pub(crate) mod poll_channel;

pub(crate) use event_flags::EventFlags;
pub(crate) use mailbox::{MailboxReceiver, MailboxSender};
