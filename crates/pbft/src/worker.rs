//! The dedicated consensus worker thread.
//!
//! The worker owns the state machine's schedule: it drains the inbound queue
//! with a short timed pop, then runs the timeout check, the parked-prepare
//! replay, and garbage collection. Network I/O happens on transport threads;
//! they only push into the queue.

use crate::engine::PbftEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// How long one tick waits on the queue before running timer duties anyway.
const TICK_WAIT: Duration = Duration::from_millis(5);

/// Handle to a running consensus worker. Stops and joins the thread on drop.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker loop for an engine.
    pub fn spawn(engine: Arc<PbftEngine>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("pbft-worker".into())
            .spawn(move || {
                info!("Consensus worker started");
                while !stop_flag.load(Ordering::Relaxed) {
                    engine.run_once(TICK_WAIT);
                }
                debug!("Consensus worker stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the worker to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
