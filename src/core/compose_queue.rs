//! Compose queue - serialized background composition, one job in flight.
//!
//! - At most one pending task per owner: a new submission replaces the queued
//!   one for the same item and goes to the back
//! - A single worker thread runs at a time across all items
//! - Running tasks are never cancelled
//!
//! Threads:
//! - dispatcher (`filmeto-compose-dispatch`): owns scheduling, driven by a
//!   control channel
//! - worker (`filmeto-compose-<task id>`): runs `LayerComposeTask::execute()`
//!   under `catch_unwind`, then posts `Finished`
//!
//! Teardown is a two-step handshake: the dispatcher only joins a worker after
//! its `Finished` message has been handled and the cleanup delay has passed.
//! A worker still alive by then is polled again after the retry delay, and
//! parked in `retiring` once `join_timeout` is exceeded. `shutdown()` joins
//! whatever is left, bounded.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};

use crate::config::FilmetoConfig;
use crate::entities::compose_task::{ComposeState, LayerComposeTask, OwnerKey};
use crate::entities::layer_manager::LayerManager;

enum Control {
    /// Queue changed or was resumed
    Kick,
    /// Worker done; sent as the worker's last action
    Finished { task_id: String, outcome: Outcome },
    Shutdown,
}

enum Outcome {
    Completed(ComposeState),
    Panicked(String),
}

struct ComposeWorker {
    task_id: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<LayerComposeTask>,
    current: Option<ComposeWorker>,
    /// Workers that outlived `join_timeout`
    retiring: Vec<ComposeWorker>,
    suspended: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    control: Sender<Control>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    cleanup_delay: Duration,
    retry_delay: Duration,
    join_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the compose queue. Clones share one queue and one dispatcher.
///
/// # Example
/// ```ignore
/// let queue = LayerComposeTaskManager::new(&config)?;
/// let services = ItemServices::new(config).with_composer(queue.clone());
/// // ... layer edits submit automatically ...
/// queue.wait_idle(Duration::from_secs(30));
/// queue.shutdown();
/// ```
#[derive(Clone)]
pub struct LayerComposeTaskManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LayerComposeTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("LayerComposeTaskManager")
            .field("pending", &state.pending.len())
            .field("running", &state.current.as_ref().map(|w| w.task_id.clone()))
            .field("shutting_down", &self.is_shut_down())
            .finish()
    }
}

impl LayerComposeTaskManager {
    /// Start the dispatcher with timing from `config`.
    pub fn new(config: &FilmetoConfig) -> std::io::Result<Self> {
        Self::with_timing(config.cleanup_delay(), config.retry_delay(), config.join_timeout())
    }

    pub fn with_timing(cleanup_delay: Duration, retry_delay: Duration, join_timeout: Duration) -> std::io::Result<Self> {
        let (control, inbox) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            idle: Condvar::new(),
            control,
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            cleanup_delay,
            retry_delay,
            join_timeout,
        });

        let dispatcher_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("filmeto-compose-dispatch".to_owned())
            .spawn(move || dispatch_loop(dispatcher_shared, inbox))?;
        *shared.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        trace!("Compose queue started");
        Ok(Self { shared })
    }

    /// Queue a composition of `manager`'s item. None once shut down.
    ///
    /// A not-yet-started task for the same owner is dropped in favour of this one.
    pub fn submit_compose_task(&self, manager: &Arc<LayerManager>) -> Option<String> {
        if self.is_shut_down() {
            return None;
        }
        let n = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = LayerComposeTask::new(format!("compose_{}", n), Arc::clone(manager));
        let task_id = task.id().to_owned();
        let owner = task.owner();
        {
            let mut state = self.shared.lock();
            // Re-checked under the lock: shutdown clears pending while holding it
            if self.is_shut_down() {
                return None;
            }
            let before = state.pending.len();
            state.pending.retain(|t| t.owner() != owner);
            if state.pending.len() < before {
                debug!("Compose {:?}: replaced pending task with {}", owner, task_id);
            }
            state.pending.push_back(task);
        }
        trace!("Submitted {} for {:?}", task_id, owner);
        let _ = self.shared.control.send(Control::Kick);
        Some(task_id)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Ids of queued tasks, front first.
    pub fn pending_task_ids(&self) -> Vec<String> {
        self.shared.lock().pending.iter().map(|t| t.id().to_owned()).collect()
    }

    /// Id of the task being executed, if any.
    pub fn running_task_id(&self) -> Option<String> {
        self.shared.lock().current.as_ref().map(|w| w.task_id.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Hold queued tasks; the running one (if any) finishes normally.
    pub fn suspend(&self) {
        self.shared.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.shared.lock().suspended = false;
        let _ = self.shared.control.send(Control::Kick);
    }

    /// Block until nothing is queued or running. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Stop accepting work, abandon queued tasks and join all threads (bounded).
    ///
    /// Idempotent. A running task is allowed to finish within `join_timeout`.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let abandoned = {
            let mut state = self.shared.lock();
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        info!("Compose queue shutting down ({} queued tasks abandoned)", abandoned);

        let _ = self.shared.control.send(Control::Shutdown);
        let dispatcher = self.shared.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = dispatcher {
            if handle.join().is_err() {
                error!("Compose dispatcher panicked");
            }
        }

        let workers: Vec<ComposeWorker> = {
            let mut state = self.shared.lock();
            let mut workers: Vec<_> = state.current.take().into_iter().collect();
            workers.append(&mut state.retiring);
            workers
        };
        for worker in workers {
            join_bounded(worker, self.shared.join_timeout);
        }
        self.shared.idle.notify_all();
        debug!("Compose queue stopped");
    }
}

/// Pending post-finish cleanup: when to look again, and when the worker reported done.
struct Cleanup {
    wake_at: Instant,
    finished_at: Instant,
}

fn dispatch_loop(shared: Arc<Shared>, inbox: Receiver<Control>) {
    let mut cleanup: Option<Cleanup> = None;
    loop {
        let message = match &cleanup {
            Some(c) => inbox.recv_timeout(c.wake_at.saturating_duration_since(Instant::now())),
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
            Ok(Control::Kick) => {
                // While a cleanup is pending, the cleanup starts the next task
                if cleanup.is_none() {
                    start_next(&shared);
                }
            }
            Ok(Control::Finished { task_id, outcome }) => {
                match outcome {
                    Outcome::Completed(state) => debug!("Compose {} done: {:?}", task_id, state),
                    Outcome::Panicked(msg) => error!("Compose {} panicked: {}", task_id, msg),
                }
                let now = Instant::now();
                cleanup = Some(Cleanup {
                    wake_at: now + shared.cleanup_delay,
                    finished_at: now,
                });
            }
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let Some(c) = cleanup.take() else { continue };
                if reap_current(&shared, c.finished_at) {
                    start_next(&shared);
                } else {
                    cleanup = Some(Cleanup {
                        wake_at: Instant::now() + shared.retry_delay,
                        finished_at: c.finished_at,
                    });
                }
            }
        }
    }
    trace!("Compose dispatcher exiting");
}

/// Join the finished worker. False if it is still alive and may be retried.
fn reap_current(shared: &Shared, finished_at: Instant) -> bool {
    let mut state = shared.lock();
    let Some(worker) = state.current.take() else {
        return true;
    };
    if worker.handle.is_finished() {
        if worker.handle.join().is_err() {
            warn!("Compose worker {} ended abnormally", worker.task_id);
        }
        trace!("Compose worker {} released", worker.task_id);
        return true;
    }
    if finished_at.elapsed() < shared.join_timeout {
        trace!("Compose worker {} still active, retrying", worker.task_id);
        state.current = Some(worker);
        return false;
    }
    warn!(
        "Compose worker {} did not exit within {:?}, parking it",
        worker.task_id, shared.join_timeout
    );
    state.retiring.push(worker);
    true
}

/// Start the head of the queue unless suspended or a worker is active.
fn start_next(shared: &Shared) {
    let mut state = shared.lock();
    if state.current.is_some() {
        return;
    }
    while !state.suspended {
        let Some(mut task) = state.pending.pop_front() else {
            break;
        };
        let task_id = task.id().to_owned();
        let control = shared.control.clone();
        let worker_id = task_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("filmeto-compose-{}", task_id))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
                    Ok(state) => Outcome::Completed(state),
                    Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
                };
                // Release the task (and its manager handle) before reporting
                drop(task);
                let _ = control.send(Control::Finished {
                    task_id: worker_id,
                    outcome,
                });
            });
        match spawned {
            Ok(handle) => {
                debug!("Compose {} running ({} queued)", task_id, state.pending.len());
                state.current = Some(ComposeWorker { task_id, handle });
                return;
            }
            Err(e) => error!("Failed to spawn compose worker for {}: {}", task_id, e),
        }
    }
    if state.is_idle() {
        shared.idle.notify_all();
    }
}

fn join_bounded(worker: ComposeWorker, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !worker.handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "Compose worker {} still running after {:?}, leaving it detached",
                worker.task_id, timeout
            );
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if worker.handle.join().is_err() {
        warn!("Compose worker {} ended abnormally", worker.task_id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
