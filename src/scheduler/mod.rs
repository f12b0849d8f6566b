//! The task scheduler.
//!
//! A single-owner driver loop supervises worker threads over typed mpsc
//! events. The driver holds the canonical task states; workers only execute
//! one job and report the outcome. Admission is bounded per task class
//! (fetchers, builders, pushers); readiness is FIFO by the completion batch
//! that unblocked the task, ties broken by topological depth with deeper
//! tasks first to widen parallelism. Network-class failures retry with
//! exponential backoff up to the configured limit; build failures never
//! retry. A cancelled task reports SKIPPED, not FAILED.

use crate::element::ElementId;
use crate::error::{Error, Result};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

/// Cooperative cancellation flag shared between the driver, workers and the
/// sandbox executor.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Track,
    Fetch,
    Pull,
    Build,
    Push,
    PullSource,
    PushSource,
}

impl TaskKind {
    /// The admission semaphore this task draws from.
    fn resource(self) -> Resource {
        match self {
            Self::Track | Self::Fetch | Self::Pull | Self::PullSource => Resource::Fetchers,
            Self::Build => Resource::Builders,
            Self::Push | Self::PushSource => Resource::Pushers,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Resource {
    Fetchers,
    Builders,
    Pushers,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub element: ElementId,
    /// Human name for logs and reports.
    pub element_name: String,
    /// Prerequisite tasks; this task is READY when all are DONE or SKIPPED.
    pub prerequisites: Vec<TaskId>,
    /// Topological depth of the element (deeper = closer to the leaves).
    pub depth: usize,
}

/// What a finished job reports back.
#[derive(Debug, Default)]
pub struct JobOutcome {
    /// The task had nothing to do (already cached, nothing indexed, ...).
    pub skipped: bool,
}

pub struct JobContext {
    pub cancel: CancelToken,
    pub attempt: u32,
}

pub type JobFn = Box<dyn FnOnce(&JobContext) -> Result<JobOutcome> + Send>;

/// Creates the job body for a task; called once per attempt.
pub trait JobFactory: Sync {
    fn create(&self, task: &Task) -> JobFn;
}

impl<F> JobFactory for F
where
    F: Fn(&Task) -> JobFn + Sync,
{
    fn create(&self, task: &Task) -> JobFn {
        self(task)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum OnError {
    /// Finish the unaffected subgraph, report at the end.
    #[default]
    Continue,
    /// Drain in-flight tasks, start nothing new.
    Quit,
    /// Cancel in-flight tasks and stop.
    Terminate,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub fetchers: usize,
    pub builders: usize,
    pub pushers: usize,
    pub network_retries: u32,
    pub on_error: OnError,
    /// Base delay for retry backoff; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetchers: 10,
            builders: 4,
            pushers: 4,
            network_retries: 2,
            on_error: OnError::default(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskReport {
    pub kind: TaskKind,
    pub element: ElementId,
    pub element_name: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SchedulerReport {
    pub tasks: Vec<TaskReport>,
    pub success: bool,
}

impl SchedulerReport {
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }
}

struct TaskEvent {
    id: TaskId,
    attempt: u32,
    result: Result<JobOutcome>,
}

struct TaskRecord {
    task: Task,
    state: TaskState,
    attempts: u32,
    error: Option<String>,
    /// Unfinished prerequisites.
    waiting_on: usize,
    /// Completion batch in which the task became ready (FIFO key).
    ready_batch: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Runs the task graph to completion under the configured policies.
    pub fn run(
        &self,
        tasks: Vec<Task>,
        factory: &dyn JobFactory,
        cancel: &CancelToken,
    ) -> SchedulerReport {
        let mut records: Vec<TaskRecord> = tasks
            .into_iter()
            .map(|task| TaskRecord {
                waiting_on: task.prerequisites.len(),
                task,
                state: TaskState::Pending,
                attempts: 0,
                error: None,
                ready_batch: 0,
            })
            .collect();
        debug_assert!(records.iter().enumerate().all(|(i, r)| r.task.id.0 == i));
        let mut dependants: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for record in &records {
            for prereq in &record.task.prerequisites {
                dependants.entry(*prereq).or_default().push(record.task.id);
            }
        }

        let (tx, rx) = mpsc::channel::<TaskEvent>();
        let mut in_use: HashMap<Resource, usize> = HashMap::new();
        let mut ready: Vec<TaskId> = Vec::new();
        let mut delayed: Vec<(Instant, TaskId)> = Vec::new();
        let mut running = 0usize;
        let mut batch = 0u64;
        let mut draining = false;

        for record in &mut records {
            if record.waiting_on == 0 {
                record.state = TaskState::Ready;
                record.ready_batch = batch;
                ready.push(record.task.id);
            }
        }

        loop {
            if cancel.is_cancelled() && !draining {
                draining = true;
            }

            // Admit as much ready work as resources allow.
            if !draining {
                self.admit(&mut records, &mut ready, &mut in_use, &mut running, factory, &tx, cancel);
            } else {
                // Ready tasks are dropped on shutdown; they report SKIPPED.
                for id in ready.drain(..) {
                    let record = &mut records[id.0];
                    if record.state == TaskState::Ready {
                        record.state = TaskState::Skipped;
                    }
                }
                delayed.retain(|(_, id)| {
                    let record = &mut records[id.0];
                    record.state = TaskState::Skipped;
                    false
                });
            }

            if running == 0 && ready.is_empty() && delayed.is_empty() {
                break;
            }

            // Wake for the next delayed retry or the next completion.
            let timeout = delayed
                .iter()
                .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(Duration::from_secs(3600));
            let event = match rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };

            // Promote due retries back into the ready set.
            let now = Instant::now();
            let mut due: Vec<TaskId> = Vec::new();
            delayed.retain(|(at, id)| {
                if *at <= now {
                    due.push(*id);
                    false
                } else {
                    true
                }
            });
            for id in due {
                let record = &mut records[id.0];
                record.state = TaskState::Ready;
                record.ready_batch = batch;
                ready.push(id);
            }

            let Some(event) = event else { continue };
            batch += 1;
            running -= 1;
            let resource = records[event.id.0].task.kind.resource();
            *in_use.entry(resource).or_default() -= 1;

            match event.result {
                Ok(outcome) => {
                    let record = &mut records[event.id.0];
                    record.state = if outcome.skipped { TaskState::Skipped } else { TaskState::Done };
                    trace!(task = ?record.task.kind, element = %record.task.element_name,
                           state = ?record.state, "task finished");
                    self.unblock_dependants(event.id, &dependants, &mut records, &mut ready, batch);
                }
                Err(e) if e.is_network()
                    && records[event.id.0].attempts <= self.config.network_retries
                    && !draining =>
                {
                    let record = &records[event.id.0];
                    let backoff = self.config.retry_backoff * 2u32.pow(record.attempts - 1);
                    info!(task = ?record.task.kind, element = %record.task.element_name,
                          attempt = record.attempts, "network failure, retrying in {backoff:?}: {e}");
                    delayed.push((Instant::now() + backoff, event.id));
                }
                Err(e) => {
                    let was_cancelled = matches!(e, Error::Cancelled) || cancel.is_cancelled();
                    let record = &mut records[event.id.0];
                    if was_cancelled {
                        record.state = TaskState::Skipped;
                    } else {
                        record.state = TaskState::Failed;
                        record.error = Some(e.to_string());
                        error!(task = ?record.task.kind, element = %record.task.element_name,
                               "task failed: {e}");
                    }
                    self.skip_dependants(event.id, &dependants, &mut records);
                    match self.config.on_error {
                        OnError::Continue => {}
                        OnError::Quit => draining = true,
                        OnError::Terminate => {
                            draining = true;
                            cancel.cancel();
                        }
                    }
                }
            }
        }

        // Anything still pending at shutdown was dropped.
        for record in &mut records {
            if matches!(record.state, TaskState::Pending | TaskState::Ready) {
                record.state = TaskState::Skipped;
            }
        }
        let success = !cancel.is_cancelled()
            && records
                .iter()
                .all(|r| matches!(r.state, TaskState::Done | TaskState::Skipped));
        SchedulerReport {
            tasks: records
                .into_iter()
                .map(|r| TaskReport {
                    kind: r.task.kind,
                    element: r.task.element,
                    element_name: r.task.element_name,
                    state: r.state,
                    attempts: r.attempts,
                    error: r.error,
                })
                .collect(),
            success,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &self,
        records: &mut [TaskRecord],
        ready: &mut Vec<TaskId>,
        in_use: &mut HashMap<Resource, usize>,
        running: &mut usize,
        factory: &dyn JobFactory,
        tx: &mpsc::Sender<TaskEvent>,
        cancel: &CancelToken,
    ) {
        // FIFO by readiness batch; within a batch, deeper tasks first.
        ready.sort_by_key(|id| {
            let record = &records[id.0];
            (record.ready_batch, usize::MAX - record.task.depth, id.0)
        });
        let mut admitted = Vec::new();
        for &id in ready.iter() {
            let record = &records[id.0];
            let resource = record.task.kind.resource();
            let cap = match resource {
                Resource::Fetchers => self.config.fetchers,
                Resource::Builders => self.config.builders,
                Resource::Pushers => self.config.pushers,
            };
            let used = in_use.entry(resource).or_default();
            if *used >= cap {
                continue;
            }
            *used += 1;
            admitted.push(id);
        }
        for id in admitted {
            ready.retain(|r| *r != id);
            let record = &mut records[id.0];
            record.state = TaskState::Running;
            record.attempts += 1;
            *running += 1;
            let job = factory.create(&record.task);
            let ctx = JobContext { cancel: cancel.clone(), attempt: record.attempts };
            let tx = tx.clone();
            let id = record.task.id;
            let attempt = record.attempts;
            std::thread::spawn(move || {
                let result = job(&ctx);
                let _ = tx.send(TaskEvent { id, attempt, result });
            });
        }
    }

    fn unblock_dependants(
        &self,
        id: TaskId,
        dependants: &HashMap<TaskId, Vec<TaskId>>,
        records: &mut [TaskRecord],
        ready: &mut Vec<TaskId>,
        batch: u64,
    ) {
        if let Some(deps) = dependants.get(&id) {
            for dep in deps {
                let record = &mut records[dep.0];
                if record.state != TaskState::Pending {
                    continue;
                }
                record.waiting_on -= 1;
                if record.waiting_on == 0 {
                    record.state = TaskState::Ready;
                    record.ready_batch = batch;
                    ready.push(*dep);
                }
            }
        }
    }

    /// A failed prerequisite skips the whole dependent subgraph.
    fn skip_dependants(
        &self,
        id: TaskId,
        dependants: &HashMap<TaskId, Vec<TaskId>>,
        records: &mut [TaskRecord],
    ) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let source = records[current.0].task.element_name.clone();
            if let Some(deps) = dependants.get(&current) {
                for dep in deps {
                    let record = &mut records[dep.0];
                    if record.state == TaskState::Pending {
                        record.state = TaskState::Skipped;
                        record.error =
                            Some(format!("prerequisite '{source}' did not complete"));
                        stack.push(*dep);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn task(id: usize, kind: TaskKind, prereqs: &[usize], depth: usize) -> Task {
        Task {
            id: TaskId(id),
            kind,
            element: ElementId(id),
            element_name: format!("e{id}.bst"),
            prerequisites: prereqs.iter().map(|p| TaskId(*p)).collect(),
            depth,
        }
    }

    fn run_with(
        tasks: Vec<Task>,
        config: SchedulerConfig,
        factory: impl Fn(&Task) -> JobFn + Sync,
    ) -> SchedulerReport {
        Scheduler::new(config).run(tasks, &factory, &CancelToken::new())
    }

    #[test]
    fn dependency_order_is_respected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks = vec![
            task(0, TaskKind::Build, &[], 1),
            task(1, TaskKind::Build, &[0], 0),
            task(2, TaskKind::Build, &[0], 0),
            task(3, TaskKind::Build, &[1, 2], 0),
        ];
        let report = run_with(tasks, SchedulerConfig::default(), |t: &Task| {
            let order = Arc::clone(&order);
            let id = t.id;
            Box::new(move |_ctx| {
                order.lock().unwrap().push(id);
                Ok(JobOutcome::default())
            })
        });
        assert!(report.success);
        let order = order.lock().unwrap();
        let pos = |id: usize| order.iter().position(|t| *t == TaskId(id)).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(3) > pos(1) && pos(3) > pos(2));
    }

    #[test]
    fn builder_cap_limits_concurrency() {
        let peak = Arc::new(Mutex::new((0usize, 0usize)));
        let tasks: Vec<Task> =
            (0..6).map(|i| task(i, TaskKind::Build, &[], 0)).collect();
        let config = SchedulerConfig { builders: 2, ..Default::default() };
        let report = run_with(tasks, config, |_t: &Task| {
            let peak = Arc::clone(&peak);
            Box::new(move |_ctx| {
                {
                    let mut p = peak.lock().unwrap();
                    p.0 += 1;
                    p.1 = p.1.max(p.0);
                }
                std::thread::sleep(Duration::from_millis(30));
                peak.lock().unwrap().0 -= 1;
                Ok(JobOutcome::default())
            })
        });
        assert!(report.success);
        assert!(peak.lock().unwrap().1 <= 2, "more than `builders` ran at once");
    }

    #[test]
    fn network_failures_retry_then_succeed() {
        let attempts_seen = Arc::new(Mutex::new(0u32));
        let tasks = vec![task(0, TaskKind::Fetch, &[], 0)];
        let config = SchedulerConfig {
            network_retries: 3,
            retry_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        let report = run_with(tasks, config, |_t: &Task| {
            let attempts_seen = Arc::clone(&attempts_seen);
            Box::new(move |ctx| {
                *attempts_seen.lock().unwrap() = ctx.attempt;
                if ctx.attempt < 3 {
                    Err(crate::error::RemoteError::Network {
                        url: "cache".into(),
                        message: "refused".into(),
                    }
                    .into())
                } else {
                    Ok(JobOutcome::default())
                }
            })
        });
        assert!(report.success);
        assert_eq!(*attempts_seen.lock().unwrap(), 3);
    }

    #[test]
    fn build_failures_do_not_retry() {
        let attempts_seen = Arc::new(Mutex::new(0u32));
        let tasks = vec![task(0, TaskKind::Build, &[], 0)];
        let report = run_with(tasks, SchedulerConfig::default(), |_t: &Task| {
            let attempts_seen = Arc::clone(&attempts_seen);
            Box::new(move |ctx| {
                *attempts_seen.lock().unwrap() = ctx.attempt;
                Err(crate::error::SandboxError::CommandFailed {
                    element: "e0.bst".into(),
                    group: "build".into(),
                    status: 2,
                }
                .into())
            })
        });
        assert!(!report.success);
        assert_eq!(*attempts_seen.lock().unwrap(), 1);
    }

    #[test]
    fn failure_skips_the_dependent_subgraph() {
        let tasks = vec![
            task(0, TaskKind::Build, &[], 1),
            task(1, TaskKind::Build, &[0], 0),
            task(2, TaskKind::Build, &[], 0),
        ];
        let report = run_with(tasks, SchedulerConfig::default(), |t: &Task| {
            let fail = t.id == TaskId(0);
            Box::new(move |_ctx| {
                if fail {
                    Err(crate::error::Error::User("boom".into()))
                } else {
                    Ok(JobOutcome::default())
                }
            })
        });
        assert!(!report.success);
        let state = |id: usize| report.tasks[id].state;
        assert_eq!(state(0), TaskState::Failed);
        assert_eq!(state(1), TaskState::Skipped);
        // The unaffected subgraph still completes under `continue`.
        assert_eq!(state(2), TaskState::Done);
    }

    #[test]
    fn cancellation_reports_skipped() {
        let cancel = CancelToken::new();
        let tasks = vec![task(0, TaskKind::Build, &[], 0), task(1, TaskKind::Build, &[0], 0)];
        let cancel2 = cancel.clone();
        let report = Scheduler::new(SchedulerConfig::default()).run(
            tasks,
            &move |_t: &Task| -> JobFn {
                let cancel = cancel2.clone();
                Box::new(move |_ctx| {
                    cancel.cancel();
                    Err(Error::Cancelled)
                })
            },
            &cancel,
        );
        assert!(report.tasks.iter().all(|t| t.state == TaskState::Skipped));
    }
}
