//! Progress-callback trait for per-item pipeline events.
//!
//! Inject an [`Arc<dyn RehostProgressCallback>`] via
//! [`crate::config::RehostConfigBuilder::progress_callback`] to receive
//! events as each URL is fetched and each artifact is uploaded. The CLI
//! drives its progress bars from these; library callers can forward them
//! anywhere.
//!
//! # Example
//!
//! ```rust
//! use img_rehost::{RehostConfig, RehostProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl RehostProgressCallback for Counter {
//!     fn on_item_complete(&self, _stage: Stage, _item: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = RehostConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::Stage;
use std::sync::Arc;

/// Called by the pipeline as it processes each item.
///
/// Implementations must be `Send + Sync`: fetches and uploads run
/// concurrently, so `on_item_complete` and `on_item_error` may be called
/// from several tasks at once. All methods default to no-ops.
pub trait RehostProgressCallback: Send + Sync {
    /// Called once before a stage submits its first item.
    ///
    /// # Arguments
    /// * `stage`: the stage starting
    /// * `total`: number of items the stage will process
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let _ = (stage, total);
    }

    /// Called when one item finishes successfully.
    ///
    /// `item` is the original URL for fetches and the artifact path for
    /// uploads.
    fn on_item_complete(&self, stage: Stage, item: &str) {
        let _ = (stage, item);
    }

    /// Called when one item fails after all retries.
    fn on_item_error(&self, stage: Stage, item: &str, error: &str) {
        let _ = (stage, item, error);
    }

    /// Called once after every item of a stage has been attempted.
    fn on_stage_complete(&self, stage: Stage, total: usize, success_count: usize) {
        let _ = (stage, total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RehostProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RehostConfig`].
pub type ProgressCallback = Arc<dyn RehostProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        started: Mutex<Vec<(Stage, usize)>>,
        completes: AtomicUsize,
        errors: AtomicUsize,
        finished: Mutex<Vec<(Stage, usize)>>,
    }

    impl RehostProgressCallback for TrackingCallback {
        fn on_stage_start(&self, stage: Stage, total: usize) {
            self.started.lock().unwrap().push((stage, total));
        }

        fn on_item_complete(&self, _stage: Stage, _item: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_error(&self, _stage: Stage, _item: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_complete(&self, stage: Stage, _total: usize, success_count: usize) {
            self.finished.lock().unwrap().push((stage, success_count));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Fetch, 3);
        cb.on_item_complete(Stage::Fetch, "http://x.com/a.png");
        cb.on_item_error(Stage::Upload, "downloads/a.png", "boom");
        cb.on_stage_complete(Stage::Upload, 3, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_stage_start(Stage::Fetch, 3);
        tracker.on_item_complete(Stage::Fetch, "a");
        tracker.on_item_complete(Stage::Fetch, "b");
        tracker.on_item_error(Stage::Fetch, "c", "HTTP 404");
        tracker.on_stage_complete(Stage::Fetch, 3, 2);

        assert_eq!(*tracker.started.lock().unwrap(), vec![(Stage::Fetch, 3)]);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.finished.lock().unwrap(), vec![(Stage::Fetch, 2)]);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Upload, 10);
        cb.on_item_complete(Stage::Upload, "downloads/a.png");
    }
}
