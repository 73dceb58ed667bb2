use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, RwLock},
    thread::JoinHandle,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::lock::{CoordinationLock, LockGuard, LockOptions};

/// Subtracted from batch progress while the task still holds the write lock,
/// so that exactly 1.0 is only ever observed after the lock is released.
const PROGRESS_EPSILON: f32 = 1e-4;

/// Fraction reported while a step has no measurable progress.
pub const INDETERMINATE: f32 = -1.0;

/// Returned by step functions to continue with the next unit of work or to
/// stop the task without marking it successful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Done,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Mutable status of the running task. Written only by the task thread.
#[derive(Clone, Debug)]
pub struct ProgressState {
    pub fraction: f32,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub error: Option<String>,
}

impl ProgressState {
    fn started(title: String) -> Self {
        Self {
            fraction: INDETERMINATE,
            title,
            description: String::new(),
            state: TaskState::Running,
            error: None,
        }
    }
}

/// Snapshot handed out to pollers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub progress: f32,
    pub title: String,
    pub description: String,
    /// `None` when no task ever ran.
    pub state: Option<TaskState>,
    pub error: Option<String>,
}

impl TaskStatus {
    fn idle() -> Self {
        Self {
            progress: INDETERMINATE,
            title: String::new(),
            description: String::new(),
            state: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, Some(TaskState::Running))
    }
}

impl From<&ProgressState> for TaskStatus {
    fn from(state: &ProgressState) -> Self {
        Self {
            progress: state.fraction,
            title: state.title.clone(),
            description: state.description.clone(),
            state: Some(state.state),
            error: state.error.clone(),
        }
    }
}

type SharedProgress = Arc<RwLock<ProgressState>>;

fn write_progress(progress: &SharedProgress) -> std::sync::RwLockWriteGuard<'_, ProgressState> {
    progress.write().unwrap_or_else(PoisonError::into_inner)
}

/// Per-item progress reporting for a batch step.
pub struct ProgressHandle {
    progress: SharedProgress,
    total: usize,
    done: usize,
}

impl ProgressHandle {
    fn new(progress: SharedProgress, total: usize) -> Self {
        write_progress(&progress).fraction = 0.0;
        Self {
            progress,
            total,
            done: 0,
        }
    }

    /// Record one processed item.
    pub fn advance(&mut self) {
        self.done += 1;
        let fraction = self.done as f32 / self.total.max(1) as f32 - PROGRESS_EPSILON;
        write_progress(&self.progress).fraction = fraction.max(0.0);
    }

    pub fn done(&self) -> usize {
        self.done
    }
}

type BatchFn = Box<dyn FnOnce(&mut ProgressHandle) -> anyhow::Result<Flow> + Send>;
type SingleFn = Box<dyn FnOnce() -> anyhow::Result<Flow> + Send>;
type DeferredFn = Box<dyn FnOnce() -> anyhow::Result<Vec<Step>> + Send>;

enum StepBody {
    Batch { total: usize, run: BatchFn },
    Single(SingleFn),
    Deferred(DeferredFn),
}

/// One unit of a task.
pub struct Step {
    description: String,
    body: StepBody,
}

impl Step {
    /// Apply `f` to every item in order, reporting progress after each one.
    pub fn batch<T, F>(description: impl Into<String>, items: Vec<T>, mut f: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) -> anyhow::Result<Flow> + Send + 'static,
    {
        let total = items.len();
        let run: BatchFn = Box::new(move |handle| {
            for item in items {
                if f(item)? == Flow::Abort {
                    return Ok(Flow::Abort);
                }
                handle.advance();
            }
            Ok(Flow::Continue)
        });

        Self {
            description: description.into(),
            body: StepBody::Batch { total, run },
        }
    }

    /// A single action without measurable progress.
    pub fn single<F>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Flow> + Send + 'static,
    {
        Self {
            description: description.into(),
            body: StepBody::Single(Box::new(f)),
        }
    }

    /// An action that runs under the task's lock and yields the steps that
    /// follow it. Used when the size of later batches is only known once the
    /// lock is held.
    pub fn deferred<F>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Vec<Step>> + Send + 'static,
    {
        Self {
            description: description.into(),
            body: StepBody::Deferred(Box::new(f)),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.body {
            StepBody::Batch { total, .. } => format!("Batch({total})"),
            StepBody::Single(_) => "Single".to_string(),
            StepBody::Deferred(_) => "Deferred".to_string(),
        };
        write!(f, "Step {{ description: {:?}, kind: {kind} }}", self.description)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The write lock was not available or another task is still running.
    Busy,
}

struct CurrentTask {
    progress: SharedProgress,
    handle: Option<JoinHandle<()>>,
}

impl CurrentTask {
    fn is_finished(&self) -> bool {
        self.progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .is_terminal()
    }
}

/// Runs at most one task at a time under exclusive access to the
/// [`CoordinationLock`].
pub struct TaskRunner {
    lock: CoordinationLock,
    write_timeout: Duration,
    current: Mutex<Option<CurrentTask>>,
}

impl TaskRunner {
    pub fn new(lock: CoordinationLock, write_timeout: Duration) -> Self {
        Self {
            lock,
            write_timeout,
            current: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> &CoordinationLock {
        &self.lock
    }

    /// Start `steps` on a background thread that holds the write lock for the
    /// whole task. A no-op returning [`StartOutcome::Busy`] when the lock
    /// cannot be taken within the configured timeout or the previous task has
    /// not finished.
    pub fn start(&self, title: impl Into<String>, steps: Vec<Step>) -> StartOutcome {
        let title = title.into();

        let Some(guard) = self.lock.acquire(LockOptions::write(Some(self.write_timeout))) else {
            log::info!("cannot start \"{title}\": index is locked");
            return StartOutcome::Busy;
        };

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|task| !task.is_finished()) {
            log::info!("cannot start \"{title}\": another task is still running");
            return StartOutcome::Busy;
        }

        // a finished task's thread is done or about to exit
        if let Some(handle) = current.take().and_then(|task| task.handle) {
            if let Err(err) = handle.join() {
                log::error!("previous task thread panicked: {err:?}");
            }
        }

        log::info!("starting task \"{title}\" with {} step(s)", steps.len());
        let progress = Arc::new(RwLock::new(ProgressState::started(title)));
        let handle = std::thread::spawn({
            let progress = progress.clone();
            move || run_task(steps, guard, progress)
        });

        *current = Some(CurrentTask {
            progress,
            handle: Some(handle),
        });

        StartOutcome::Started
    }

    pub fn status(&self) -> TaskStatus {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(task) => {
                TaskStatus::from(&*task.progress.read().unwrap_or_else(PoisonError::into_inner))
            }
            None => TaskStatus::idle(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Block until the current task (if any) has finished and return its
    /// final status.
    pub fn join(&self) -> TaskStatus {
        let handle = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|task| task.handle.take());

        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                log::error!("task thread panicked: {err:?}");
            }
        }

        self.status()
    }
}

fn run_task(steps: Vec<Step>, guard: LockGuard, progress: SharedProgress) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_steps(steps, &progress)));

    // release first: pollers treat a terminal state as "reads may proceed"
    drop(guard);

    let mut state = write_progress(&progress);
    match outcome {
        Ok(Ok(Flow::Continue)) => {
            state.fraction = 1.0;
            state.state = TaskState::Done;
            log::info!("task \"{}\" finished", state.title);
        }
        Ok(Ok(Flow::Abort)) => {
            state.state = TaskState::Aborted;
            log::warn!("task \"{}\" aborted during \"{}\"", state.title, state.description);
        }
        Ok(Err(err)) => {
            log::error!(
                "task \"{}\" failed during \"{}\": {err:#}",
                state.title,
                state.description
            );
            state.state = TaskState::Failed;
            state.error = Some(format!("{err:#}"));
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("task \"{}\" panicked: {msg}", state.title);
            state.state = TaskState::Failed;
            state.error = Some(format!("panicked: {msg}"));
        }
    }
}

fn run_steps(steps: Vec<Step>, progress: &SharedProgress) -> anyhow::Result<Flow> {
    let mut queue = VecDeque::from(steps);

    while let Some(step) = queue.pop_front() {
        log::debug!("running step {step:?}");
        write_progress(progress).description = step.description;

        let flow = match step.body {
            StepBody::Batch { total, run } => {
                let mut handle = ProgressHandle::new(progress.clone(), total);
                run(&mut handle)?
            }
            StepBody::Single(run) => {
                write_progress(progress).fraction = INDETERMINATE;
                run()?
            }
            StepBody::Deferred(run) => {
                write_progress(progress).fraction = INDETERMINATE;
                for next in run()?.into_iter().rev() {
                    queue.push_front(next);
                }
                Flow::Continue
            }
        };

        if flow == Flow::Abort {
            return Ok(Flow::Abort);
        }
    }

    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn runner() -> Arc<TaskRunner> {
        Arc::new(TaskRunner::new(
            CoordinationLock::new(),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_idle_status() {
        let runner = runner();
        let status = runner.status();
        assert_eq!(status.progress, INDETERMINATE);
        assert!(status.state.is_none());
        assert!(!runner.is_running());
    }

    #[test]
    fn test_steps_run_in_order_and_finish_at_one() {
        let runner = runner();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let steps = vec![
            Step::batch("numbers", vec![1, 2, 3], {
                let seen = seen.clone();
                move |n| {
                    seen.lock().unwrap().push(n);
                    Ok(Flow::Continue)
                }
            }),
            Step::single("tail", {
                let seen = seen.clone();
                move || {
                    seen.lock().unwrap().push(100);
                    Ok(Flow::Continue)
                }
            }),
        ];

        assert_eq!(runner.start("ordered", steps), StartOutcome::Started);
        let status = runner.join();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 100]);
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.state, Some(TaskState::Done));
        assert_eq!(status.title, "ordered");
    }

    #[test]
    fn test_second_start_is_rejected_while_running() {
        let runner = runner();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();

        let steps = vec![Step::single("wait", move || {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(Flow::Continue)
        })];
        assert_eq!(runner.start("first", steps), StartOutcome::Started);
        entered_rx.recv().unwrap();

        assert_ne!(runner.status().progress, 1.0);
        assert_eq!(runner.start("second", vec![]), StartOutcome::Busy);
        assert_eq!(runner.status().title, "first");

        release_tx.send(()).unwrap();
        runner.join();
        assert_eq!(runner.start("third", vec![]), StartOutcome::Started);
        assert_eq!(runner.join().state, Some(TaskState::Done));
    }

    #[test]
    fn test_read_succeeds_immediately_after_completion() {
        let runner = runner();
        assert_eq!(
            runner.start("quick", vec![Step::single("noop", || Ok(Flow::Continue))]),
            StartOutcome::Started
        );

        while runner.status().progress != 1.0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(runner.lock().acquire_read(false, None));
        runner.lock().release_read();
    }

    #[test]
    fn test_lock_is_held_while_running() {
        let runner = runner();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();

        runner.start(
            "holding",
            vec![Step::single("wait", move || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(Flow::Continue)
            })],
        );
        entered_rx.recv().unwrap();

        assert!(runner.lock().is_write_locked());
        assert!(!runner.lock().acquire_read(true, Some(Duration::from_millis(20))));

        release_tx.send(()).unwrap();
        runner.join();
        assert!(!runner.lock().is_write_locked());
    }

    #[test]
    fn test_batch_progress_is_below_one_while_running() {
        let runner = runner();
        let observed = Arc::new(Mutex::new(Vec::new()));

        runner.start(
            "progress",
            vec![
                Step::batch("items", vec![(); 4], {
                    let runner = runner.clone();
                    let observed = observed.clone();
                    move |_| {
                        observed.lock().unwrap().push(runner.status().progress);
                        Ok(Flow::Continue)
                    }
                }),
                Step::single("observe", {
                    let runner = runner.clone();
                    let observed = observed.clone();
                    move || {
                        observed.lock().unwrap().push(runner.status().progress);
                        Ok(Flow::Continue)
                    }
                }),
            ],
        );
        assert_eq!(runner.join().progress, 1.0);

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 5);
        assert_eq!(observed[0], 0.0);
        assert!((observed[3] - (0.75 - PROGRESS_EPSILON)).abs() < 1e-6);
        assert!(observed[..4].iter().all(|p| *p < 1.0));
        assert_eq!(observed[4], INDETERMINATE);
    }

    #[test]
    fn test_progress_handle_fraction() {
        let progress = Arc::new(RwLock::new(ProgressState::started("t".into())));
        let mut handle = ProgressHandle::new(progress.clone(), 4);
        assert_eq!(progress.read().unwrap().fraction, 0.0);

        handle.advance();
        handle.advance();
        let fraction = progress.read().unwrap().fraction;
        assert!((fraction - (0.5 - PROGRESS_EPSILON)).abs() < 1e-6);

        handle.advance();
        handle.advance();
        let fraction = progress.read().unwrap().fraction;
        assert!(fraction < 1.0);
        assert_eq!(handle.done(), 4);
    }

    #[test]
    fn test_abort_skips_remaining_steps() {
        let runner = runner();
        let processed = Arc::new(Mutex::new(Vec::new()));

        let steps = vec![
            Step::batch("stop at 2", vec![1, 2, 3], {
                let processed = processed.clone();
                move |n| {
                    processed.lock().unwrap().push(n);
                    Ok(if n == 2 { Flow::Abort } else { Flow::Continue })
                }
            }),
            Step::single("never", {
                let processed = processed.clone();
                move || {
                    processed.lock().unwrap().push(100);
                    Ok(Flow::Continue)
                }
            }),
        ];
        runner.start("abort", steps);
        let status = runner.join();

        assert_eq!(*processed.lock().unwrap(), vec![1, 2]);
        assert_eq!(status.state, Some(TaskState::Aborted));
        assert!(status.progress < 1.0);
        assert!(!runner.lock().is_write_locked());
    }

    #[test]
    fn test_failure_is_recorded_and_lock_released() {
        let runner = runner();
        let steps = vec![
            Step::batch("one ok", vec![1], |_| Ok(Flow::Continue)),
            Step::single("explode", || anyhow::bail!("commit failed")),
        ];
        runner.start("failing", steps);
        let status = runner.join();

        assert_eq!(status.state, Some(TaskState::Failed));
        assert!(status.error.unwrap().contains("commit failed"));
        assert_eq!(status.description, "explode");
        assert!(status.progress < 1.0);
        assert!(!runner.lock().is_write_locked());

        // a failed task does not block the next one
        assert_eq!(runner.start("again", vec![]), StartOutcome::Started);
        runner.join();
    }

    #[test]
    fn test_panic_is_recorded_and_lock_released() {
        let runner = runner();
        runner.start(
            "panicking",
            vec![Step::single("boom", || -> anyhow::Result<Flow> { panic!("boom") })],
        );
        let status = runner.join();

        assert_eq!(status.state, Some(TaskState::Failed));
        assert!(status.error.unwrap().contains("boom"));
        assert!(!runner.lock().is_write_locked());
    }

    #[test]
    fn test_deferred_steps_are_spliced_in_place() {
        let runner = runner();
        let order = Arc::new(Mutex::new(Vec::new()));

        let push = |order: &Arc<Mutex<Vec<&'static str>>>, name: &'static str| {
            let order = order.clone();
            Step::single(name, move || {
                order.lock().unwrap().push(name);
                Ok(Flow::Continue)
            })
        };

        let steps = vec![
            Step::deferred("plan", {
                let order = order.clone();
                move || Ok(vec![push(&order, "a"), push(&order, "b")])
            }),
            push(&order, "c"),
        ];
        runner.start("deferred", steps);
        runner.join();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_start_busy_when_readers_hold_the_lock() {
        let runner = runner();
        assert!(runner.lock().acquire_read(true, None));

        assert_eq!(runner.start("blocked", vec![]), StartOutcome::Busy);
        assert!(runner.status().state.is_none());

        runner.lock().release_read();
    }
}
