//! Device-exclusive work queue.
//!
//! Every submitted payload is mapped to the set of devices it touches. Items
//! whose devices are all idle are started on their own thread; an item that
//! shares a device with a running item waits until that device is released.
//!
//! All scheduling state (busy devices, pending items, running items, finished
//! records) lives on the thread that owns the queue. Workers only own
//! their payload and report back through a completion channel, so the state
//! needs no locking.
//!
//! The queue is not meant to be shared between threads.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::device::{DeviceId, DeviceResolver, FsDeviceResolver};
use crate::error::QueueError;
use crate::progress::ProgressCallback;

/// Error type a job may fail with.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Result of running one job.
pub type JobResult<R> = Result<R, JobError>;

/// Successful results and `(payload, message)` pairs of failed items.
pub type FinishedItems<T, R> = (Vec<R>, Vec<(T, String)>);

type PathGetter<T> = Box<dyn Fn(&T) -> Vec<PathBuf>>;
type Worker<T, R> = Arc<dyn Fn(&mut T) -> JobResult<R> + Send + Sync>;
type Readiness<T> = Box<dyn Fn(&T) -> bool>;

/// A payload together with the devices it needs.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    /// Identifier assigned on submission
    pub id: Uuid,

    /// Caller supplied work
    pub payload: T,

    /// Devices of the involved paths, in path order (duplicates kept)
    pub involved_devices: Vec<DeviceId>,

    /// Set once when the item is handed to a worker thread
    pub started: bool,

    slots: Vec<usize>,
}

/// An item handed to a worker thread whose completion has not been applied.
///
/// The payload belongs to the worker until the completion comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningItem {
    pub id: Uuid,
    pub involved_devices: Vec<DeviceId>,
}

/// Outcome of a finished work item.
///
/// Exactly one of `result` and `error` is set for a completed job.
#[derive(Debug)]
pub struct ResultRecord<T, R> {
    pub item: WorkItem<T>,
    pub result: Option<R>,
    pub error: Option<String>,
}

/// Busy flags for every device seen so far, indexed by a dense slot number
/// handed out on first sight of a device.
#[derive(Debug, Default)]
struct DeviceTable {
    slots: HashMap<DeviceId, usize>,
    busy: Vec<bool>,
}

impl DeviceTable {
    fn slot(&mut self, device: DeviceId) -> usize {
        if let Some(&slot) = self.slots.get(&device) {
            return slot;
        }
        let slot = self.busy.len();
        self.busy.push(false);
        self.slots.insert(device, slot);
        slot
    }

    fn any_busy(&self, slots: &[usize]) -> bool {
        slots.iter().any(|&slot| self.busy[slot])
    }

    fn set_busy(&mut self, slots: &[usize], busy: bool) {
        for &slot in slots {
            self.busy[slot] = busy;
        }
    }

    fn is_busy(&self, device: DeviceId) -> bool {
        self.slots
            .get(&device)
            .map_or(false, |&slot| self.busy[slot])
    }

    fn all_idle(&self) -> bool {
        self.busy.iter().all(|busy| !busy)
    }
}

/// Runs jobs in parallel while keeping each device to one job at a time.
pub struct DiskWorkQueue<T, R> {
    get_paths: PathGetter<T>,
    worker: Worker<T, R>,
    resolver: Box<dyn DeviceResolver>,
    readiness: Option<Readiness<T>>,
    progress: Option<Box<dyn ProgressCallback<T, R>>>,
    devices: DeviceTable,
    pending: Vec<WorkItem<T>>,
    running: Vec<RunningItem>,
    submitted: usize,
    finished: Vec<ResultRecord<T, R>>,
    done_tx: Sender<ResultRecord<T, R>>,
    done_rx: Receiver<ResultRecord<T, R>>,
}

impl<T, R> DiskWorkQueue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create a queue.
    ///
    /// `get_paths` lists the paths a payload touches; `worker` runs on a
    /// dedicated thread per item.
    pub fn new<P, W>(get_paths: P, worker: W) -> Self
    where
        P: Fn(&T) -> Vec<PathBuf> + 'static,
        W: Fn(&mut T) -> JobResult<R> + Send + Sync + 'static,
    {
        let (done_tx, done_rx) = unbounded();
        DiskWorkQueue {
            get_paths: Box::new(get_paths),
            worker: Arc::new(worker),
            resolver: Box::new(FsDeviceResolver),
            readiness: None,
            progress: None,
            devices: DeviceTable::default(),
            pending: Vec::new(),
            running: Vec::new(),
            submitted: 0,
            finished: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    /// Replace the filesystem device lookup.
    pub fn with_resolver<D: DeviceResolver + 'static>(mut self, resolver: D) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Only start items for which `ready` returns true, on top of the device
    /// check. Evaluated on the controlling thread.
    pub fn with_readiness<F>(mut self, ready: F) -> Self
    where
        F: Fn(&T) -> bool + 'static,
    {
        self.readiness = Some(Box::new(ready));
        self
    }

    /// Report starts and completions to `progress`.
    pub fn with_progress<C>(mut self, progress: C) -> Self
    where
        C: ProgressCallback<T, R> + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Submit payloads, resolving their devices with the queue's path getter.
    ///
    /// # Errors
    /// If any device cannot be resolved nothing from this call is queued.
    pub fn add_work<I>(&mut self, items: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = T>,
    {
        let resolved = self.resolve_items(items, self.get_paths.as_ref())?;
        self.push_items(resolved);
        Ok(())
    }

    /// Submit payloads using a path getter for this call only.
    pub fn add_work_with<I, P>(&mut self, items: I, get_paths: P) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = T>,
        P: Fn(&T) -> Vec<PathBuf>,
    {
        let resolved = self.resolve_items(items, &get_paths)?;
        self.push_items(resolved);
        Ok(())
    }

    fn resolve_items<I>(
        &self,
        items: I,
        get_paths: &dyn Fn(&T) -> Vec<PathBuf>,
    ) -> Result<Vec<(T, Vec<DeviceId>)>, QueueError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut resolved = Vec::new();
        for payload in items {
            let devices = get_paths(&payload)
                .iter()
                .map(|path| self.resolver.resolve(path))
                .collect::<Result<Vec<_>, _>>()?;
            resolved.push((payload, devices));
        }
        Ok(resolved)
    }

    fn push_items(&mut self, resolved: Vec<(T, Vec<DeviceId>)>) {
        for (payload, devices) in resolved {
            let slots = devices.iter().map(|&d| self.devices.slot(d)).collect();
            self.pending.push(WorkItem {
                id: Uuid::new_v4(),
                payload,
                involved_devices: devices,
                started: false,
                slots,
            });
            self.submitted += 1;
        }
    }

    /// Start every pending item whose devices are idle and that passes the
    /// readiness check. Never blocks.
    ///
    /// Returns how many items were started.
    ///
    /// # Errors
    /// `QueueError::ItemsWillNeverBeReady` when nothing is running, nothing
    /// could be started and items are still pending. Those items stay queued.
    pub fn start_ready_devices(&mut self) -> Result<usize, QueueError> {
        self.update_finished_threads();

        let mut started = 0;
        let mut index = 0;
        while index < self.pending.len() {
            if self.can_start(&self.pending[index]) {
                let item = self.pending.remove(index);
                self.launch(item);
                started += 1;
            } else {
                index += 1;
            }
        }

        if started == 0 && self.running.is_empty() && !self.pending.is_empty() {
            return Err(QueueError::ItemsWillNeverBeReady {
                blocked: self.pending.iter().map(|item| item.id).collect(),
            });
        }

        Ok(started)
    }

    fn can_start(&self, item: &WorkItem<T>) -> bool {
        if self.devices.any_busy(&item.slots) {
            return false;
        }
        self.readiness
            .as_ref()
            .map_or(true, |ready| ready(&item.payload))
    }

    fn launch(&mut self, mut item: WorkItem<T>) {
        self.devices.set_busy(&item.slots, true);
        item.started = true;
        self.running.push(RunningItem {
            id: item.id,
            involved_devices: item.involved_devices.clone(),
        });

        if let Some(progress) = &self.progress {
            progress.on_work_started(&item);
        }

        let worker = Arc::clone(&self.worker);
        let done = self.done_tx.clone();
        thread::spawn(move || {
            let record = run_item(worker.as_ref(), item);
            // the receiver only goes away together with the queue
            let _ = done.send(record);
        });
    }

    fn work_done(&mut self, record: ResultRecord<T, R>) {
        self.devices.set_busy(&record.item.slots, false);
        if let Some(pos) = self.running.iter().position(|r| r.id == record.item.id) {
            self.running.remove(pos);
        }

        if let Some(progress) = &self.progress {
            progress.on_work_completed(&record);
        }

        self.finished.push(record);
    }

    /// Apply every completion already sitting in the channel.
    fn update_finished_threads(&mut self) {
        while let Ok(record) = self.done_rx.try_recv() {
            self.work_done(record);
        }
    }

    /// Block until one running item completes, then apply it.
    fn wait_till_one_finished(&mut self) {
        if self.running.is_empty() {
            return;
        }
        if let Ok(record) = self.done_rx.recv() {
            self.work_done(record);
        }
    }

    /// Block until no item is running. Starts nothing new.
    pub fn join(&mut self) {
        while !self.running.is_empty() {
            self.wait_till_one_finished();
        }
    }

    /// Run until every submitted item has finished.
    ///
    /// # Errors
    /// Propagates `ItemsWillNeverBeReady` instead of waiting forever.
    pub fn start_and_join_all(&mut self) -> Result<FinishedItems<T, R>, QueueError>
    where
        T: Clone,
        R: Clone,
    {
        self.start_ready_devices()?;
        while self.finished.len() < self.submitted {
            // start_ready_devices may already have applied completions
            self.wait_till_one_finished();
            self.start_ready_devices()?;
        }

        self.get_finished_items()
    }

    /// Split everything finished so far into successes and failures, keeping
    /// the order in which completions were applied.
    ///
    /// # Errors
    /// `QueueError::MissingOutcome` if a record has neither result nor error.
    pub fn get_finished_items(&mut self) -> Result<FinishedItems<T, R>, QueueError>
    where
        T: Clone,
        R: Clone,
    {
        self.update_finished_threads();

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        for record in &self.finished {
            match (&record.result, &record.error) {
                (_, Some(message)) => errors.push((record.item.payload.clone(), message.clone())),
                (Some(result), None) => successes.push(result.clone()),
                (None, None) => {
                    return Err(QueueError::MissingOutcome {
                        id: record.item.id,
                    })
                }
            }
        }

        Ok((successes, errors))
    }

    /// Items not started yet, in submission order.
    pub fn pending_items(&self) -> &[WorkItem<T>] {
        &self.pending
    }

    /// The not yet started item with `id`, e.g. one named by
    /// `QueueError::ItemsWillNeverBeReady`.
    pub fn pending_item(&self, id: Uuid) -> Option<&WorkItem<T>> {
        self.pending.iter().find(|item| item.id == id)
    }

    /// Items started but not applied as finished, in start order.
    pub fn running_items(&self) -> &[RunningItem] {
        &self.running
    }

    /// Records applied so far, in completion order.
    pub fn finished_items(&self) -> &[ResultRecord<T, R>] {
        &self.finished
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Submitted items that have not finished: pending plus running.
    ///
    /// `finished_count() + unfinished_count() == submitted_count()` holds
    /// between calls.
    pub fn unfinished_count(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Whether a running item currently holds `device`.
    pub fn is_device_busy(&self, device: DeviceId) -> bool {
        self.devices.is_busy(device)
    }

    /// True when no device is held by a running item.
    pub fn all_devices_idle(&self) -> bool {
        self.devices.all_idle()
    }
}

fn run_item<T, R>(
    worker: &(dyn Fn(&mut T) -> JobResult<R> + Send + Sync),
    mut item: WorkItem<T>,
) -> ResultRecord<T, R> {
    debug!(work = %item.id, devices = ?item.involved_devices, "Starting work");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(&mut item.payload)));
    match outcome {
        Ok(Ok(result)) => {
            debug!(work = %item.id, "Successfully completed work");
            ResultRecord {
                item,
                result: Some(result),
                error: None,
            }
        }
        Ok(Err(err)) => {
            let message = err.to_string();
            warn!(work = %item.id, error = %message, "Failed work");
            ResultRecord {
                item,
                result: None,
                error: Some(message),
            }
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(work = %item.id, error = %message, "Work panicked");
            ResultRecord {
                item,
                result: None,
                error: Some(message),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}
