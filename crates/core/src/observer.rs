//! Progress and cancellation sink for a run.
//!
//! The pipeline reports one tick per finished image and polls cancellation
//! between images only; an in-flight image always completes.

use tokio::sync::watch;

pub trait RunObserver: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize);
    fn is_cancelled(&self) -> bool;
}

/// Ignores progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_progress(&self, _completed: usize, _total: usize) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Cancellation driven by a `watch` channel (set to `true` to cancel), with an
/// optional progress callback.
pub struct WatchObserver {
    cancel_rx: watch::Receiver<bool>,
    progress: Option<ProgressCallback>,
}

impl WatchObserver {
    pub fn new(cancel_rx: watch::Receiver<bool>) -> Self {
        Self {
            cancel_rx,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

impl RunObserver for WatchObserver {
    fn on_progress(&self, completed: usize, total: usize) {
        if let Some(callback) = &self.progress {
            callback(completed, total);
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_noop_observer() {
        let observer = NoopObserver;
        observer.on_progress(1, 2);
        assert!(!observer.is_cancelled());
    }

    #[test]
    fn test_watch_observer_cancel() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let observer = WatchObserver::new(cancel_rx);
        assert!(!observer.is_cancelled());
        cancel_tx.send(true).unwrap();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_watch_observer_progress() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let observer = WatchObserver::new(cancel_rx).with_progress(Box::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        }));
        observer.on_progress(1, 3);
        observer.on_progress(2, 3);
        assert_eq!(*ticks.lock().unwrap(), vec![(1, 3), (2, 3)]);
    }
}
