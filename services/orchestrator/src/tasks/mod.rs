//! Recurring task execution.
//!
//! The [`TaskScheduler`] keeps a min-heap of `(next_run, task_id, generation)`
//! keys next to a map of task entries. The map decides whether a task
//! exists: cancelling or replacing a task only touches the map, and the
//! orphaned heap key is dropped when it reaches the top. The heap is rebuilt
//! once orphaned keys outnumber live tasks.
//!
//! Every due task runs in its own tokio task. A periodic task is re-armed
//! from the moment it was dispatched, so a late wake-up shifts the schedule
//! by the lateness once instead of accumulating drift.

mod job;
mod trigger;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use sfw_id::RunId;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ValidationError, ValidationResult};

pub use job::{task_fn, CommandTask, ScheduledTask, TaskBody, TaskContext, TaskInfo};
pub use trigger::{CronSpec, Trigger, TriggerSpec, MIN_INTERVAL};

const MIN_SLEEP: Duration = Duration::from_millis(100);
const MAX_SLEEP: Duration = Duration::from_secs(1);

/// Orphaned heap keys tolerated before a rebuild is considered.
const COMPACT_FLOOR: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    due_ms: i64,
    task_id: String,
    generation: u64,
}

struct TaskEntry {
    task: ScheduledTask,
    generation: u64,
    next_run: DateTime<Utc>,
    dispatched: u64,
    executed: Arc<AtomicU64>,
}

impl TaskEntry {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.task.id.clone(),
            trigger: self.task.trigger.to_string(),
            next_run: self.next_run,
            executed_times: self.executed.load(Ordering::SeqCst),
            remaining: self.task.times.map(|t| t.saturating_sub(self.dispatched)),
            instance_id: self.task.instance_id,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, TaskEntry>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    tombstones: usize,
    next_generation: u64,
}

impl SchedulerState {
    fn is_live(&self, key: &HeapKey) -> bool {
        self.tasks
            .get(&key.task_id)
            .is_some_and(|entry| entry.generation == key.generation)
    }

    fn maybe_compact(&mut self) {
        if self.tombstones <= COMPACT_FLOOR || self.tombstones <= self.tasks.len() {
            return;
        }
        let before = self.heap.len();
        let mut heap = std::mem::take(&mut self.heap);
        heap.retain(|Reverse(key)| self.is_live(key));
        self.heap = heap;
        self.tombstones = 0;
        debug!(before, after = self.heap.len(), "Compacted task heap");
    }
}

/// One execution handed to the runtime.
struct Dispatch {
    task_id: String,
    body: Arc<dyn TaskBody>,
    executed: Arc<AtomicU64>,
    fired_at: DateTime<Utc>,
}

/// Min-heap driven executor for recurring tasks.
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    wake: Notify,
    running: AtomicBool,
    epoch: AtomicU64,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedules `task`, replacing any task with the same id.
    pub fn schedule(&self, task: ScheduledTask) -> ValidationResult<()> {
        self.schedule_at(task, Utc::now())
    }

    /// Schedules `task` as if the current time were `now`.
    pub fn schedule_at(&self, task: ScheduledTask, now: DateTime<Utc>) -> ValidationResult<()> {
        if task.id.trim().is_empty() {
            return Err(ValidationError::InvalidTrigger(
                "task id cannot be empty".to_string(),
            ));
        }
        if task.times == Some(0) {
            return Err(ValidationError::InvalidTrigger(format!(
                "task '{}' must be allowed at least one run",
                task.id
            )));
        }
        task.trigger.validate()?;

        let next_run = next_after(&task.trigger, now);
        let executed = Arc::new(AtomicU64::new(0));
        let immediate = task.immediate.then(|| Dispatch {
            task_id: task.id.clone(),
            body: Arc::clone(&task.body),
            executed: Arc::clone(&executed),
            fired_at: now,
        });

        {
            let mut state = self.lock();
            let generation = state.next_generation;
            state.next_generation += 1;

            state.heap.push(Reverse(HeapKey {
                due_ms: next_run.timestamp_millis(),
                task_id: task.id.clone(),
                generation,
            }));

            info!(
                task_id = %task.id,
                trigger = %task.trigger,
                next_run = %next_run,
                "Scheduled task"
            );

            let id = task.id.clone();
            let entry = TaskEntry {
                task,
                generation,
                next_run,
                dispatched: 0,
                executed,
            };
            if state.tasks.insert(id.clone(), entry).is_some() {
                warn!(task_id = %id, "Replaced existing task");
                state.tombstones += 1;
                state.maybe_compact();
            }
        }

        if let Some(dispatch) = immediate {
            spawn_run(dispatch);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Removes a task. Runs already in flight are left alone.
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.tasks.remove(task_id).is_some();
            if removed {
                state.tombstones += 1;
                state.maybe_compact();
            }
            removed
        };
        if removed {
            info!(task_id = %task_id, "Cancelled task");
            self.wake.notify_one();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Earliest next run over all live tasks.
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.lock().tasks.values().map(|entry| entry.next_run).min()
    }

    pub fn task(&self, task_id: &str) -> Option<TaskInfo> {
        self.lock().tasks.get(task_id).map(TaskEntry::info)
    }

    /// All live tasks, soonest first.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.lock().tasks.values().map(TaskEntry::info).collect();
        tasks.sort_by(|a, b| a.next_run.cmp(&b.next_run).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Dispatches every task due at `now` and re-arms the periodic ones.
    ///
    /// Returns how many runs were dispatched.
    pub fn run_due(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis();
        let mut due = Vec::new();

        {
            let mut guard = self.lock();
            let state = &mut *guard;

            loop {
                match state.heap.peek() {
                    Some(Reverse(top)) if top.due_ms <= now_ms => {}
                    _ => break,
                }
                let Some(Reverse(key)) = state.heap.pop() else {
                    break;
                };
                if !state.is_live(&key) {
                    state.tombstones = state.tombstones.saturating_sub(1);
                    continue;
                }
                let Some(entry) = state.tasks.get_mut(&key.task_id) else {
                    continue;
                };

                entry.dispatched += 1;
                due.push(Dispatch {
                    task_id: key.task_id.clone(),
                    body: Arc::clone(&entry.task.body),
                    executed: Arc::clone(&entry.executed),
                    fired_at: now,
                });

                let exhausted = entry.task.times.is_some_and(|t| entry.dispatched >= t);
                if exhausted {
                    info!(task_id = %key.task_id, runs = entry.dispatched, "Task reached its run limit");
                    state.tasks.remove(&key.task_id);
                    continue;
                }

                entry.next_run = next_after(&entry.task.trigger, now);
                // A re-armed key is never due again within this pass.
                state.heap.push(Reverse(HeapKey {
                    due_ms: entry.next_run.timestamp_millis().max(now_ms + 1),
                    ..key
                }));
            }
        }

        let dispatched = due.len();
        for dispatch in due {
            spawn_run(dispatch);
        }
        dispatched
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the scheduling loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_loop(epoch).await });
    }

    /// Stops the loop. In-flight runs are neither awaited nor cancelled.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.is_running() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn run_loop(&self, epoch: u64) {
        info!(tasks = self.count(), "Task scheduler started");

        while self.is_current(epoch) {
            let fired = self.run_due(Utc::now());
            if fired > 0 {
                debug!(fired, "Dispatched due tasks");
            }

            let wait = self.sleep_for(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("Task scheduler stopped");
    }

    fn sleep_for(&self, now: DateTime<Utc>) -> Duration {
        self.next_run_time()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_SLEEP)
            .clamp(MIN_SLEEP, MAX_SLEEP)
    }
}

/// Next run computed on the local wall clock, stored as UTC.
fn next_after(trigger: &Trigger, now: DateTime<Utc>) -> DateTime<Utc> {
    trigger
        .next_run_after(&now.with_timezone(&Local))
        .with_timezone(&Utc)
}

fn spawn_run(dispatch: Dispatch) {
    let Ok(handle) = Handle::try_current() else {
        warn!(task_id = %dispatch.task_id, "No async runtime available, run skipped");
        return;
    };

    handle.spawn(async move {
        let ctx = TaskContext {
            task_id: dispatch.task_id,
            run_id: RunId::new(),
            fired_at: dispatch.fired_at,
        };
        debug!(task_id = %ctx.task_id, run_id = %ctx.run_id, "Running task");

        match dispatch.body.run(&ctx).await {
            Ok(()) => debug!(task_id = %ctx.task_id, run_id = %ctx.run_id, "Task run completed"),
            Err(e) => warn!(
                task_id = %ctx.task_id,
                run_id = %ctx.run_id,
                error = %e,
                "Task run failed"
            ),
        }
        dispatch.executed.fetch_add(1, Ordering::SeqCst);
    });
}
