// src/ice/connection.rs
//! ICE connection orchestrator
//!
//! An [`IceConnection`] owns one engine and one background
//! [`ExecutionContext`]. Engine events are drained serially on that context
//! and folded into the connection state; callers may concurrently send data,
//! add remote candidates and read state from any thread.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::config::{ConnectionConfig, MediaType};
use crate::error::{IceError, IceResult};
use super::context::{wait_for_shutdown, ExecutionContext, ShutdownSignal};
use super::engine::{EngineEvent, EngineEventSink, IceEngine};
use super::{CandidateInfo, CandidateStore, ComponentId, ComponentStateTracker, IceState};

/// ICE streams negotiated by one connection
pub const STREAMS_PER_CONNECTION: usize = 1;

/// Receiver of connection events.
///
/// Called from the connection's background thread, one call at a time.
/// The connection holds only a weak reference to its listener.
pub trait IceConnectionListener: Send + Sync {
    /// Inbound payload on a component
    fn on_nice_data(&self, component_id: ComponentId, data: &[u8], connection: &IceConnection);

    /// Externally visible connection state changed
    fn update_ice_state(&self, state: IceState, connection: &IceConnection);
}

struct StateMachine {
    visible: IceState,
    tracker: ComponentStateTracker,
    gathered_streams: BTreeSet<u32>,
    gathering_complete: bool,
}

/// A single ICE connection attempt
pub struct IceConnection {
    id: String,
    config: ConnectionConfig,
    engine: Box<dyn IceEngine>,

    /// Mirror of `machine.visible` for lock-free reads
    state: AtomicU8,
    machine: Mutex<StateMachine>,
    /// Held from a state change until its listener call returns, so
    /// notifications from different threads arrive in transition order
    transition: ReentrantMutex<()>,
    candidates: Mutex<CandidateStore>,
    listener: RwLock<Option<Weak<dyn IceConnectionListener>>>,

    /// Serializes writes into the engine
    write_lock: Mutex<()>,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    context: Mutex<Option<ExecutionContext>>,

    /// Set when destruction begins; no listener call starts afterwards
    closing: AtomicBool,
    engine_released: AtomicBool,
}

impl IceConnection {
    /// Create a connection driven by `engine`
    pub fn new(config: ConnectionConfig, engine: impl IceEngine) -> IceResult<Arc<Self>> {
        Self::with_engine(config, Box::new(engine))
    }

    pub fn with_engine(config: ConnectionConfig, engine: Box<dyn IceEngine>) -> IceResult<Arc<Self>> {
        config.validate()?;

        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        debug!(
            conn = %id,
            "Creating {} connection {} with {} component(s)",
            config.media_type, config.transport_name, config.ice_components
        );

        Ok(Arc::new(Self {
            id,
            engine,
            state: AtomicU8::new(IceState::Initial as u8),
            machine: Mutex::new(StateMachine {
                visible: IceState::Initial,
                tracker: ComponentStateTracker::new(config.ice_components),
                gathered_streams: BTreeSet::new(),
                gathering_complete: false,
            }),
            transition: ReentrantMutex::new(()),
            candidates: Mutex::new(CandidateStore::new(config.ice_components)),
            listener: RwLock::new(None),
            write_lock: Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            context: Mutex::new(None),
            closing: AtomicBool::new(false),
            engine_released: AtomicBool::new(false),
            config,
        }))
    }

    /// Spin up the background context and start gathering.
    ///
    /// Returns immediately; gathering proceeds asynchronously.
    pub fn start(self: &Arc<Self>) -> IceResult<()> {
        let state = self.ice_state();
        if state.is_terminal() {
            return Err(IceError::InvalidState(state));
        }

        let mut context = self.context.lock();
        let mut events_slot = self.events_rx.lock();
        if events_slot.is_none() {
            warn!(conn = %self.id, "start() called twice");
            return Err(IceError::AlreadyStarted);
        }

        let gathering = self.engine.start_gathering(&self.config, self.event_sink());
        let failure_sink = self.event_sink();
        let weak = Arc::downgrade(self);
        let (handoff_tx, handoff_rx) = oneshot::channel();

        let name = format!("ice-{}-{}", self.config.media_type, self.id);
        let span = info_span!("ice_context", conn = %self.id);

        let spawned = ExecutionContext::spawn(name, span, move |shutdown| async move {
            let Ok(events_rx) = handoff_rx.await else {
                return;
            };

            tokio::spawn(async move {
                if let Err(e) = gathering.await {
                    failure_sink.fatal(format!("Candidate gathering failed: {}", e));
                }
            });

            run_event_loop(weak, events_rx, shutdown).await;
        })?;

        // The receiver stays in place if the context could not be spawned
        if let Some(events_rx) = events_slot.take() {
            let _ = handoff_tx.send(events_rx);
        }
        *context = Some(spawned);

        info!(conn = %self.id, "Started gathering for {}", self.config.transport_name);
        Ok(())
    }

    /// Add remote candidates and forward new ones to the engine.
    ///
    /// Invalid candidates are skipped without aborting the batch; if any were
    /// skipped the call returns [`IceError::CandidatesRejected`] after
    /// applying the valid ones. Already known candidates are ignored.
    /// Returns the number of newly accepted candidates.
    pub fn set_remote_candidates(&self, candidates: &[CandidateInfo]) -> IceResult<usize> {
        let mut store = self.candidates.lock();

        let mut fresh = Vec::new();
        let mut batch_keys = HashSet::new();
        let mut rejected = 0;

        for candidate in candidates {
            if let Err(e) = store.validate(candidate) {
                warn!(conn = %self.id, "Rejecting remote candidate {}: {}", candidate, e);
                rejected += 1;
                continue;
            }

            if store.is_known_remote(candidate) || !batch_keys.insert(candidate.key()) {
                trace!(conn = %self.id, "Remote candidate {} already known", candidate);
                continue;
            }

            fresh.push(candidate.clone());
        }

        if !fresh.is_empty() {
            self.engine.submit_remote_candidates(&fresh)?;
            for candidate in &fresh {
                store.add_remote(candidate.clone())?;
            }
        }

        let accepted = fresh.len();
        debug!(
            conn = %self.id,
            accepted, rejected,
            "Remote candidates set, {} known", store.remote_count()
        );
        drop(store);

        if rejected > 0 {
            return Err(IceError::CandidatesRejected { accepted, rejected });
        }

        Ok(accepted)
    }

    /// Local gathering finished for `stream_id`.
    ///
    /// Once every stream is done, components that have not progressed yet
    /// move to `CandidatesGathered`.
    pub fn gathering_done(&self, stream_id: u32) {
        let _transition = self.transition.lock();
        let local_count = self.candidates.lock().local_count();
        let changed = {
            let mut machine = self.machine.lock();

            if !machine.gathered_streams.insert(stream_id) {
                debug!(conn = %self.id, "Duplicate gathering completion for stream {}", stream_id);
                return;
            }

            if machine.gathered_streams.len() < STREAMS_PER_CONNECTION {
                return;
            }

            machine.gathering_complete = true;
            info!(
                conn = %self.id,
                "Gathering done, {} local candidate(s)",
                local_count
            );

            if machine.visible.is_terminal() {
                return;
            }

            let (_, aggregate) = machine.tracker.raise_all(IceState::CandidatesGathered);
            self.advance(&mut machine, aggregate)
        };

        if let Some(state) = changed {
            self.notify_state(state);
        }
    }

    /// Register the listener; the connection keeps only a weak reference
    pub fn set_listener<L: IceConnectionListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<dyn IceConnectionListener> = Arc::downgrade(listener) as Weak<dyn IceConnectionListener>;
        *self.listener.write() = Some(weak);
    }

    /// Currently registered listener, if it is still alive
    pub fn listener(&self) -> Option<Arc<dyn IceConnectionListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn clear_listener(&self) {
        self.listener.write().take();
    }

    /// Send bytes on a component; returns bytes accepted by the engine.
    ///
    /// Fails without touching the engine when the component is unknown or
    /// the connection is not `Ready`.
    pub fn send_data(&self, component_id: ComponentId, data: &[u8]) -> IceResult<usize> {
        if component_id == 0 || component_id > self.config.ice_components {
            return Err(IceError::InvalidComponent {
                component_id,
                components: self.config.ice_components,
            });
        }

        let state = self.ice_state();
        if state != IceState::Ready {
            return Err(IceError::InvalidState(state));
        }

        let _guard = self.write_lock.lock();
        match self.engine.write(component_id, data) {
            Ok(sent) => {
                trace!(conn = %self.id, "Sent {} bytes on component {}", sent, component_id);
                Ok(sent)
            }
            Err(e) => {
                debug!(conn = %self.id, "Send on component {} failed: {}", component_id, e);
                Err(e)
            }
        }
    }

    /// Connection-level override reported by the engine.
    ///
    /// Ignored once the connection is `Finished` or `Failed`, and when it
    /// would move the state backwards.
    pub fn update_ice_state(&self, state: IceState) {
        let _transition = self.transition.lock();
        let changed = {
            let mut machine = self.machine.lock();
            if machine.visible.is_terminal() {
                debug!(conn = %self.id, "Ignoring {} in terminal state {}", state, machine.visible);
                None
            } else {
                self.advance(&mut machine, state)
            }
        };

        if let Some(state) = changed {
            self.notify_state(state);
        }
    }

    /// Record one component's state and recompute the aggregate
    pub fn update_component_state(&self, component_id: ComponentId, state: IceState) -> IceResult<()> {
        let _transition = self.transition.lock();
        let changed = {
            let mut machine = self.machine.lock();

            if machine.tracker.get(component_id).is_none() {
                return Err(IceError::InvalidComponent {
                    component_id,
                    components: self.config.ice_components,
                });
            }

            if machine.visible.is_terminal() {
                debug!(
                    conn = %self.id,
                    "Ignoring component {} -> {} in terminal state {}",
                    component_id, state, machine.visible
                );
                return Ok(());
            }

            debug!(conn = %self.id, component = component_id, %state, "Component state changed");
            let (aggregate_changed, aggregate) = machine.tracker.update(component_id, state)?;
            if aggregate_changed {
                self.advance(&mut machine, aggregate)
            } else {
                None
            }
        };

        if let Some(state) = changed {
            self.notify_state(state);
        }
        Ok(())
    }

    /// Tear the connection down: move to `Finished` and stop the background
    /// context. Blocks until the context has exited unless called from it.
    pub fn close(&self) {
        self.update_ice_state(IceState::Finished);
        self.stop_context();
    }

    /// Current externally visible state
    pub fn ice_state(&self) -> IceState {
        IceState::from(self.state.load(Ordering::Acquire))
    }

    pub fn component_state(&self, component_id: ComponentId) -> Option<IceState> {
        self.machine.lock().tracker.get(component_id)
    }

    /// Snapshot of all component states, ordered by component id
    pub fn component_states(&self) -> Vec<IceState> {
        self.machine.lock().tracker.states().to_vec()
    }

    pub fn is_gathering_complete(&self) -> bool {
        self.machine.lock().gathering_complete
    }

    /// Local candidates discovered so far
    pub fn local_candidates(&self) -> Vec<CandidateInfo> {
        self.candidates.lock().snapshot()
    }

    pub fn remote_candidates(&self) -> Vec<CandidateInfo> {
        self.candidates.lock().remote_snapshot()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn media_type(&self) -> MediaType {
        self.config.media_type
    }

    pub fn transport_name(&self) -> &str {
        &self.config.transport_name
    }

    pub fn components(&self) -> u32 {
        self.config.ice_components
    }

    pub fn is_started(&self) -> bool {
        self.events_rx.lock().is_none()
    }

    fn event_sink(&self) -> EngineEventSink {
        EngineEventSink::new(self.events_tx.clone())
    }

    /// Apply `state` only if it moves the visible state forward
    fn advance(&self, machine: &mut StateMachine, state: IceState) -> Option<IceState> {
        if state > machine.visible {
            self.set_visible(machine, state)
        } else {
            None
        }
    }

    fn set_visible(&self, machine: &mut StateMachine, state: IceState) -> Option<IceState> {
        if machine.visible == state {
            return None;
        }

        info!(conn = %self.id, "ICE state {} -> {}", machine.visible, state);
        machine.visible = state;
        self.state.store(state as u8, Ordering::Release);
        Some(state)
    }

    fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if let Err(e) = candidate.validate(self.config.ice_components) {
                    warn!(conn = %self.id, "Engine produced invalid local candidate {}: {}", candidate, e);
                    return;
                }
                debug!(conn = %self.id, "Local candidate {}", candidate);
                self.candidates.lock().add_local(candidate);
            }

            EngineEvent::GatheringDone { stream_id } => self.gathering_done(stream_id),

            EngineEvent::ComponentState { component_id, state } => {
                if let Err(e) = self.update_component_state(component_id, state) {
                    warn!(conn = %self.id, "Dropping component state from engine: {}", e);
                }
            }

            EngineEvent::Data { component_id, data } => {
                if self.ice_state().is_terminal() {
                    trace!(conn = %self.id, "Dropping {} bytes after termination", data.len());
                    return;
                }
                self.notify_data(component_id, &data);
            }

            EngineEvent::Fatal(reason) => {
                error!(conn = %self.id, "Engine failure: {}", reason);
                self.update_ice_state(IceState::Failed);
            }
        }
    }

    fn notify_state(&self, state: IceState) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }

        match self.listener() {
            Some(listener) => listener.update_ice_state(state, self),
            None => debug!(conn = %self.id, "No listener for state {}", state),
        }
    }

    fn notify_data(&self, component_id: ComponentId, data: &[u8]) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }

        match self.listener() {
            Some(listener) => listener.on_nice_data(component_id, data, self),
            None => trace!(conn = %self.id, "No listener for {} bytes", data.len()),
        }
    }

    fn stop_context(&self) {
        let context = self.context.lock().take();
        if let Some(mut context) = context {
            context.stop();
        }

        if !self.engine_released.swap(true, Ordering::AcqRel) {
            self.engine.shutdown();
        }
    }
}

impl Drop for IceConnection {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.stop_context();
        debug!(conn = %self.id, "Connection dropped");
    }
}

impl fmt::Debug for IceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceConnection")
            .field("id", &self.id)
            .field("media_type", &self.config.media_type)
            .field("transport_name", &self.config.transport_name)
            .field("components", &self.config.ice_components)
            .field("state", &self.ice_state())
            .field("listener", &self.listener().is_some())
            .finish()
    }
}

/// Drain engine events one at a time until shutdown or the connection is gone
async fn run_event_loop(
    connection: Weak<IceConnection>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown) => break,

            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                connection.handle_event(event);
            }
        }
    }

    debug!("Event loop finished");
}
