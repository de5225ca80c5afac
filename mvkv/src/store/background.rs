//! The background writer: a daemon thread that periodically flushes
//! unsaved changes, so a long-running writer does not accumulate unbounded
//! dirty memory between commits. Flushed chunks that contain uncommitted
//! data are marked for rollback on reopen.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::store::{BackgroundExceptionHandler, StoreInner};

pub(crate) struct BackgroundWriter {
    handle: Option<JoinHandle<()>>,
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl BackgroundWriter {
    pub(crate) fn start(
        inner: Arc<StoreInner>,
        write_delay_ms: u64,
        handler: Option<BackgroundExceptionHandler>,
    ) -> Self {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("mvkv-background-writer".to_string())
            .spawn(move || {
                let (stop_flag, cond) = &*thread_shared;
                let tick = Duration::from_millis((write_delay_ms / 10).max(1));
                let mut stopped = stop_flag.lock().unwrap();
                loop {
                    let (guard, _) = cond.wait_timeout(stopped, tick).unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if inner.background_store_due(write_delay_ms) {
                        drop(stopped);
                        if let Err(err) = inner.store_in_background() {
                            match &handler {
                                Some(h) => h(&err),
                                None => log::error!("background store failed: {}", err),
                            }
                        }
                        stopped = stop_flag.lock().unwrap();
                    }
                }
            })
            .expect("failed to spawn the background writer");
        Self { handle: Some(handle), shared }
    }

    /// Signals the thread to exit and waits for it.
    pub(crate) fn stop(mut self) {
        {
            let mut stopped = self.shared.0.lock().unwrap();
            *stopped = true;
            self.shared.1.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
