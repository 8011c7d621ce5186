pub mod config;
pub mod constants;
pub mod error;
pub mod locator;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod tally;
pub mod upstream;
