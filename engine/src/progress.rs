//! Progress reporting trait.
//!
//! Decouples the work queue from whatever displays progress (the CLI prints
//! to stderr, tests record events).

use crate::queue::{ResultRecord, WorkItem};

/// Receives lifecycle events from a `DiskWorkQueue`.
///
/// Both methods run on the thread that drives the queue, never on a worker.
pub trait ProgressCallback<T, R> {
    /// Called right before an item is handed to its worker thread.
    fn on_work_started(&self, item: &WorkItem<T>);

    /// Called when the completion of an item has been applied.
    fn on_work_completed(&self, record: &ResultRecord<T, R>);
}
