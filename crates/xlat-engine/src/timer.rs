use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;
use xlat_tb::StopToken;

/// Timer thread that raises the stop flag once `timeout` elapses. It touches
/// nothing but the flag.
pub(crate) struct Timeout {
    cancel: Option<Sender<()>>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Timeout {
    pub(crate) fn spawn(timeout: Duration, stop: StopToken) -> Self {
        let (cancel, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = thread::Builder::new()
            .name("xlat-timeout".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    flag.store(true, Ordering::Release);
                    stop.request();
                }
            })
            .ok();
        if handle.is_none() {
            debug!("could not spawn the timeout thread; running without a deadline");
        }
        Self {
            cancel: Some(cancel),
            fired,
            handle,
        }
    }

    /// Stop the timer and report whether it fired.
    pub(crate) fn finish(mut self) -> bool {
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
