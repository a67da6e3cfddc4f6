//! Utility modules for mettle.

mod net;

pub use net::external_ip;
