// src/ice/context.rs
//! Dedicated background thread driving a connection's engine
//!
//! Each context owns a named OS thread running a single-threaded tokio
//! runtime. Everything spawned on that runtime, including the engine's own
//! tasks, lives exactly as long as the context. Stopping flips a watch flag
//! and joins the thread.

use std::future::Future;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::{IceResult, IoErrorContext};

/// Shutdown flag handed to the context's main future
pub type ShutdownSignal = watch::Receiver<bool>;

/// Resolves once `shutdown` is raised or its sender is gone
pub async fn wait_for_shutdown(shutdown: &mut ShutdownSignal) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Background execution flow of one connection
pub struct ExecutionContext {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    /// Build the runtime and start the thread.
    ///
    /// `main` is called on the new thread with the shutdown signal and its
    /// future is driven to completion there.
    pub fn spawn<F, Fut>(name: impl Into<String>, span: Span, main: F) -> IceResult<Self>
    where
        F: FnOnce(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(name.clone())
            .build()
            .ice_context("build context runtime")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(main(shutdown_rx).instrument(span));
                // Dropping the runtime cancels whatever the engine spawned
                drop(runtime);
                debug!("Context thread {} exiting", thread_name);
            })
            .ice_context("spawn context thread")?;

        info!("Started execution context {}", name);

        Ok(Self {
            name,
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the background thread, while it is attached
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|t| t.thread().id())
    }

    /// Whether the calling thread is this context's thread
    pub fn is_current(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal shutdown and wait for the thread to exit.
    ///
    /// Called from the context's own thread this only signals; the thread
    /// exits once the current event returns.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            debug!("Execution context {} stopping from its own thread", self.name);
            return;
        }

        if thread.join().is_err() {
            warn!("Execution context {} panicked", self.name);
        } else {
            info!("Stopped execution context {}", self.name);
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.stop();
    }
}
