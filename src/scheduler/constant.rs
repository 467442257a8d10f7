use mio_06::Token;

// Poll tokens of the I/O thread. One fixed token per source; the socket is
// re-registered with the same token across reconnects.

pub const SOCKET_TOKEN: Token = Token(0);
pub const REQUEST_MAILBOX_TOKEN: Token = Token(1);
pub const CONTROL_CHANNEL_TOKEN: Token = Token(2);
pub const TIMER_TOKEN: Token = Token(3);

// Event-flag bits visible to application threads.
pub const FLAG_CONNECTED: u32 = 1 << 0;
pub const FLAG_STOPPED: u32 = 1 << 1;
