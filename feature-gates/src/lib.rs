pub mod api;
pub mod config;
pub mod flags;
pub mod gates;
pub mod metrics;
pub mod router;
pub mod server;

// Used by integration tests too, so it is compiled into the library
pub mod test_utils;
