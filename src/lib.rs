//! Native Rust device-side client for the [Golioth] IoT cloud.
//!
//! One [`Client`] owns one CoAP-over-DTLS session to the cloud and
//! multiplexes every service over it: LightDB state ([`lightdb`]),
//! time-series uploads ([`stream`]), remote procedure calls ([`rpc`]),
//! remote settings ([`settings`]), structured log shipping
//! ([`remote_log`]), firmware updates ([`fw_update`]), and location /
//! network-info queries ([`location`], [`net_info`]).
//!
//! All requests funnel through a single I/O thread with a bounded queue
//! and at most one request in flight; server-push observations are pumped
//! between requests and survive reconnects.
//!
//! # Example
//!
//! ```no_run
//! use golioth_client::{Client, ClientConfig, Credentials, lightdb, remote_log};
//!
//! let config = ClientConfig::new(Credentials::Psk {
//!   id: "my-device@my-project".to_string(),
//!   key: b"supersecret".to_vec(),
//! });
//! let client = Client::create(config).unwrap();
//! client.wait_for_connect(Some(std::time::Duration::from_secs(30))).unwrap();
//!
//! remote_log::info_sync(&client, "main", "hello", None).unwrap();
//! lightdb::set_int_sync(&client, "counter", 42, None).unwrap();
//! assert_eq!(lightdb::get_int_sync(&client, "counter", None).unwrap(), 42);
//!
//! client.destroy();
//! ```
//!
//! [Golioth]: https://golioth.io

mod blockwise;
mod client;
pub mod coap;
pub mod config;
pub mod debug;
mod error;
pub mod fw_update;
pub mod ota;
pub mod payload;
mod scheduler;
pub mod services;
mod sync_io;
mod transport;

pub use blockwise::{ChunkSource, SliceSource};
pub use client::{Client, ClientEvent};
pub use config::{ClientConfig, Credentials};
pub use error::{GolResult, Status};
pub use scheduler::CoapResponse;
// service modules, addressable without the `services::` prefix
pub use services::{lightdb, location, net_info, remote_log, rpc, settings, stream};
