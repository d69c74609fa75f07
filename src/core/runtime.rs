//! Dispatcher thread integration.
//!
//! Production embeds the dispatcher into a host event loop; this runner
//! covers the standalone case (and the smoke binary): a dedicated thread
//! calling `dispatch_once` until asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::core::dispatcher::InputDispatcher;

/// Runs an `InputDispatcher` on its own thread, endlessly.
pub struct DispatcherThread {
    dispatcher: Arc<InputDispatcher>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherThread {
    pub fn start(dispatcher: Arc<InputDispatcher>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("input-dispatcher".to_string())
                .spawn(move || {
                    tracing::info!("input dispatcher thread started");
                    while running.load(Ordering::Acquire) {
                        dispatcher.dispatch_once();
                    }
                    tracing::info!("input dispatcher thread stopped");
                })
                .expect("failed to spawn dispatcher thread")
        };
        Self {
            dispatcher,
            running,
            handle: Some(handle),
        }
    }

    pub fn dispatcher(&self) -> &Arc<InputDispatcher> {
        &self.dispatcher
    }

    /// Ask the thread to stop and wait for it to park.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.dispatcher.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
