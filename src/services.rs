// The high-level cloud services, all funneling into the one request
// scheduler: key/value state, time-series stream, RPC, settings, log
// shipping, and location/network-info queries.

pub mod lightdb;
pub mod location;
pub mod net_info;
pub mod remote_log;
pub mod rpc;
pub mod settings;
pub mod stream;
