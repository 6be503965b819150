// src/ice/mod.rs
//! ICE connection core
//!
//! - [`state`]: connection states and per-component aggregation
//! - [`candidate`] / [`store`]: candidate values and their storage
//! - [`engine`]: boundary to the protocol engine, plus a UDP host engine
//! - [`context`]: background thread driving the engine
//! - [`connection`]: the orchestrator and its listener interface

pub mod candidate;
pub mod connection;
pub mod context;
pub mod engine;
pub mod state;
pub mod store;

/// ICE component id, `1..=components`
pub type ComponentId = u32;

pub use candidate::{calculate_priority, CandidateInfo, CandidateType, TransportProtocol};
pub use connection::{IceConnection, IceConnectionListener, STREAMS_PER_CONNECTION};
pub use context::ExecutionContext;
pub use engine::{EngineEvent, EngineEventSink, IceEngine, UdpHostEngine};
pub use state::{ComponentStateTracker, IceState};
pub use store::CandidateStore;
