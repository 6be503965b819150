//! ICE connection library (lib.rs)
//!
//! Manages a single ICE connection for one media transport: asynchronous
//! candidate gathering on a dedicated background thread, aggregation of
//! per-component states into one connection state, serialized outbound
//! writes and ordered listener notification.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ice;

// Re-export main types
pub use config::{ConnectionConfig, MediaType, DEFAULT_STUN_PORT};
pub use error::{IceError, IceResult};
pub use ice::{
    CandidateInfo, CandidateType, ComponentId, EngineEvent, EngineEventSink, IceConnection,
    IceConnectionListener, IceEngine, IceState, TransportProtocol, UdpHostEngine,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once
/// keeps the first subscriber.
///
/// # Example
/// ```
/// ice_connection::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("not a level");
    }
}
