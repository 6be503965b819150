// src/ice/engine/mod.rs
//! Boundary to the ICE protocol engine
//!
//! The connection does not run ICE itself. An [`IceEngine`] gathers
//! candidates, performs connectivity checks and moves payload bytes; it
//! reports everything it learns as [`EngineEvent`]s posted into the
//! connection's event queue, which the background context drains one event
//! at a time.

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::ConnectionConfig;
use crate::error::IceResult;
use super::{CandidateInfo, ComponentId, IceState};

pub mod udp;

pub use udp::UdpHostEngine;

/// Events posted by the engine into the connection
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local candidate was discovered
    LocalCandidate(CandidateInfo),

    /// Local gathering finished for a stream
    GatheringDone { stream_id: u32 },

    /// A component changed state
    ComponentState {
        component_id: ComponentId,
        state: IceState,
    },

    /// Payload received on a component
    Data {
        component_id: ComponentId,
        data: Bytes,
    },

    /// Unrecoverable engine failure
    Fatal(String),
}

/// Cloneable, non-blocking handle for posting engine events
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Post an event; events sent after the connection stopped are dropped
    pub fn send(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("Dropping engine event after shutdown: {:?}", e.0);
        }
    }

    pub fn local_candidate(&self, candidate: CandidateInfo) {
        self.send(EngineEvent::LocalCandidate(candidate));
    }

    pub fn gathering_done(&self, stream_id: u32) {
        self.send(EngineEvent::GatheringDone { stream_id });
    }

    pub fn component_state(&self, component_id: ComponentId, state: IceState) {
        self.send(EngineEvent::ComponentState { component_id, state });
    }

    pub fn data(&self, component_id: ComponentId, data: impl Into<Bytes>) {
        self.send(EngineEvent::Data {
            component_id,
            data: data.into(),
        });
    }

    pub fn fatal(&self, reason: impl Into<String>) {
        self.send(EngineEvent::Fatal(reason.into()));
    }

    /// Whether the connection is still consuming events
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capability the connection needs from an ICE engine
pub trait IceEngine: Send + Sync + 'static {
    /// Begin gathering local candidates.
    ///
    /// The returned future runs on the connection's background runtime, so
    /// the engine may `tokio::spawn` its own tasks; they stop when the
    /// connection does.
    fn start_gathering(
        &self,
        config: &ConnectionConfig,
        events: EngineEventSink,
    ) -> BoxFuture<'static, IceResult<()>>;

    /// Feed remote candidates and begin connectivity checks
    fn submit_remote_candidates(&self, candidates: &[CandidateInfo]) -> IceResult<()>;

    /// Transmit bytes on a component; returns bytes accepted
    fn write(&self, component_id: ComponentId, data: &[u8]) -> IceResult<usize>;

    /// Release engine resources once the background context stopped
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EngineEventSink::new(tx);

        sink.gathering_done(1);
        sink.component_state(1, IceState::Ready);
        sink.data(1, vec![1u8, 2, 3]);

        assert!(matches!(rx.try_recv(), Ok(EngineEvent::GatheringDone { stream_id: 1 })));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::ComponentState { component_id: 1, state: IceState::Ready })
        ));
        match rx.try_recv() {
            Ok(EngineEvent::Data { component_id, data }) => {
                assert_eq!(component_id, 1);
                assert_eq!(&data[..], &[1, 2, 3]);
            }
            other => panic!("Expected data event, got {:?}", other),
        }
    }

    #[test]
    fn test_sink_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EngineEventSink::new(tx);
        drop(rx);

        assert!(sink.is_closed());
        sink.fatal("late");
    }
}
