//! Logging macros that set target to "cloudsql_connector" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "cloudsql_connector::refresh::entry"), creating overly verbose
//! logger names for embedders that route Rust targets into their own logging
//! hierarchy. These macros ensure all logs from this crate use a single
//! "cloudsql_connector" target.

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "cloudsql_connector", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "cloudsql_connector", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "cloudsql_connector", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "cloudsql_connector", $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "cloudsql_connector", $($arg)*) };
}
