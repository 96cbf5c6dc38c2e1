//! Async work scheduling for lumen.
//!
//! Long-running jobs such as catching up from history are split into small
//! [`Work`] units. A [`WorkScheduler`] runs them on the Tokio runtime while
//! respecting three rules:
//!
//! - a unit only starts once every unit it depends on succeeded
//! - at most `max_concurrency` units run at the same time
//! - a unit that asks to be retried is re-run according to its
//!   [`RetryPolicy`], and fails once the policy is used up
//!
//! A unit that fails or is cancelled blocks everything downstream of it.
//! [`WorkSequence`] chains units so each depends on the one before.
//!
//! ```ignore
//! use lumen_work::{RetryPolicy, WorkScheduler, WorkSchedulerConfig, WorkSequence};
//!
//! let mut scheduler = WorkScheduler::new(WorkSchedulerConfig::default());
//! let mut seq = WorkSequence::new();
//! seq.push(&mut scheduler, Box::new(download), RetryPolicy::Bounded(3));
//! seq.push(&mut scheduler, Box::new(apply), RetryPolicy::Never);
//! scheduler.run_until_done().await;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   Pending ──deps ok──> Running ──> Success
//!      ^                    │
//!      └──── Retry ─────────┤
//!                           ├──> Failed ───┐
//!                           └──> Cancelled ┴──> dependents Blocked
//! ```
//!
//! Cancellation is cooperative: units should poll
//! [`WorkContext::is_cancelled`] and return [`WorkOutcome::Cancelled`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPLETION_CHANNEL_CAPACITY: usize = 128;

/// Identifier of a unit within one scheduler, assigned from 1 upwards.
pub type WorkId = u64;

/// What a single run of a unit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Success,
    /// The unit noticed cancellation and stopped.
    Cancelled,
    /// Transient failure. The unit is run again after `delay` (the
    /// scheduler default when zero) if its retry policy allows it.
    Retry { delay: Duration },
    /// Permanent failure. Never retried.
    Failed(String),
}

/// How often a unit may ask to be run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// A retry request is a failure. Used for steps that must not be
    /// repeated with the same inputs, like verification and apply.
    #[default]
    Never,
    Once,
    Bounded(u32),
}

impl RetryPolicy {
    pub fn max_retries(self) -> u32 {
        match self {
            RetryPolicy::Never => 0,
            RetryPolicy::Once => 1,
            RetryPolicy::Bounded(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Waiting on dependencies, a free slot, or a retry delay.
    Pending,
    Running,
    Success,
    /// Failed outright or ran out of retries.
    Failed,
    /// A dependency did not succeed, so this unit never ran.
    Blocked,
    Cancelled,
}

impl WorkState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Blocked | Self::Cancelled)
    }
}

/// Handed to [`Work::run`] for each attempt.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub id: WorkId,
    /// 1 for the first run, 2 for the first retry and so on.
    pub attempt: u32,
    cancel_token: CancellationToken,
}

impl WorkContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

/// A state change, published on [`WorkSchedulerConfig::event_tx`].
#[derive(Debug, Clone)]
pub struct WorkEvent {
    pub id: WorkId,
    pub name: String,
    pub state: WorkState,
    pub attempt: u32,
}

/// A unit of async work.
///
/// Units run with `&mut self` so they can keep state, such as partially
/// downloaded files, across retries.
#[async_trait]
pub trait Work: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, ctx: WorkContext) -> WorkOutcome;
}

/// Runs a callback with the outcome of every attempt of the wrapped unit.
pub struct WorkWithCallback {
    work: Box<dyn Work + Send>,
    callback: Arc<dyn Fn(&WorkOutcome, &WorkContext) + Send + Sync>,
}

impl WorkWithCallback {
    pub fn new(
        work: Box<dyn Work + Send>,
        callback: Arc<dyn Fn(&WorkOutcome, &WorkContext) + Send + Sync>,
    ) -> Self {
        Self { work, callback }
    }
}

#[async_trait]
impl Work for WorkWithCallback {
    fn name(&self) -> &str {
        self.work.name()
    }

    async fn run(&mut self, ctx: WorkContext) -> WorkOutcome {
        let outcome = self.work.run(ctx.clone()).await;
        (self.callback)(&outcome, &ctx);
        outcome
    }
}

#[derive(Debug, Clone)]
pub struct WorkSchedulerConfig {
    /// Units allowed to run at once. 1 gives strictly sequential execution.
    pub max_concurrency: usize,
    /// Delay used when a unit asks for a retry with a zero delay.
    pub retry_delay: Duration,
    /// Optional sink for [`WorkEvent`]s. Events are dropped when it is full.
    pub event_tx: Option<mpsc::Sender<WorkEvent>>,
}

impl Default for WorkSchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_delay: Duration::from_secs(1),
            event_tx: None,
        }
    }
}

struct WorkEntry {
    name: String,
    deps: Vec<WorkId>,
    retries_left: u32,
    attempts: u32,
    last_error: Option<String>,
    cancel_token: CancellationToken,
    /// `None` while the unit is running on a spawned task.
    work: Option<Box<dyn Work + Send>>,
}

struct WorkCompletion {
    id: WorkId,
    outcome: WorkOutcome,
    work: Box<dyn Work + Send>,
    attempt: u32,
    cancelled: bool,
}

/// A dependency-aware async work scheduler.
///
/// The scheduler itself is driven from one task; units run on spawned Tokio
/// tasks and report back over a channel. A unit is moved out of its entry
/// while it runs and moved back when it completes, so the same boxed unit
/// sees every retry.
pub struct WorkScheduler {
    config: WorkSchedulerConfig,
    next_id: WorkId,
    entries: HashMap<WorkId, WorkEntry>,
    states: HashMap<WorkId, WorkState>,
    /// Reverse edges: unit -> units that depend on it.
    dependents: HashMap<WorkId, Vec<WorkId>>,
}

impl WorkScheduler {
    pub fn new(config: WorkSchedulerConfig) -> Self {
        Self {
            config,
            next_id: 1,
            entries: HashMap::new(),
            states: HashMap::new(),
            dependents: HashMap::new(),
        }
    }

    /// Register `work` to run once every unit in `deps` succeeded.
    ///
    /// An unknown dependency id never succeeds, so the unit ends up
    /// `Pending` forever and is reported as not runnable at the end of the
    /// run.
    pub fn add_work(
        &mut self,
        work: Box<dyn Work + Send>,
        deps: Vec<WorkId>,
        retry: RetryPolicy,
    ) -> WorkId {
        let id = self.next_id;
        self.next_id += 1;

        let name = work.name().to_string();
        debug!(work_id = id, name = %name, ?retry, "registered work");

        for &dep in &deps {
            self.dependents.entry(dep).or_default().push(id);
        }
        // A dependency that already failed blocks the new unit right away.
        let blocked = deps
            .iter()
            .any(|dep| self.states.get(dep).is_some_and(|s| s.is_failure()));

        self.entries.insert(
            id,
            WorkEntry {
                name,
                deps,
                retries_left: retry.max_retries(),
                attempts: 0,
                last_error: None,
                cancel_token: CancellationToken::new(),
                work: Some(work),
            },
        );
        self.states.insert(id, WorkState::Pending);
        if blocked {
            self.set_terminal(id, WorkState::Blocked, 0);
        }
        id
    }

    #[must_use]
    pub fn state(&self, id: WorkId) -> Option<WorkState> {
        self.states.get(&id).copied()
    }

    /// Number of times `id` has been started.
    pub fn attempts(&self, id: WorkId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.attempts)
    }

    /// Reason recorded by the last failed run of `id`.
    pub fn last_error(&self, id: WorkId) -> Option<&str> {
        self.entries.get(&id)?.last_error.as_deref()
    }

    /// True once every registered unit reached a terminal state.
    pub fn all_done(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    /// True when every registered unit succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.states.values().all(|s| s.is_success())
    }

    /// Cancel a pending or running unit and block its dependents.
    ///
    /// Returns `false` if the unit is unknown or already finished.
    pub fn cancel(&mut self, id: WorkId) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        if let Some(entry) = self.entries.get(&id) {
            entry.cancel_token.cancel();
            let attempts = entry.attempts;
            self.set_terminal(id, WorkState::Cancelled, attempts);
        }
        true
    }

    pub fn cancel_all(&mut self) {
        let mut ids: Vec<WorkId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.cancel(id);
        }
    }

    pub async fn run_until_done(&mut self) {
        self.run_until_done_with_cancel(CancellationToken::new())
            .await;
    }

    /// Run until nothing can make progress any more.
    ///
    /// Triggering `cancel` cancels every unit; the call still waits for
    /// running units to hand back control before returning.
    pub async fn run_until_done_with_cancel(&mut self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<WorkCompletion>(COMPLETION_CHANNEL_CAPACITY);
        let mut running: HashSet<WorkId> = HashSet::new();
        let mut queue = self.ready_queue();
        let mut queued: HashSet<WorkId> = queue.iter().copied().collect();
        let mut delayed: Vec<(Instant, WorkId)> = Vec::new();
        let mut cancel_requested = false;

        loop {
            if !cancel_requested && cancel.is_cancelled() {
                cancel_requested = true;
                self.cancel_all();
                delayed.clear();
            }

            let now = Instant::now();
            delayed.retain(|&(due, id)| {
                if due <= now {
                    if queued.insert(id) {
                        queue.push_back(id);
                    }
                    false
                } else {
                    true
                }
            });

            while running.len() < self.config.max_concurrency {
                let Some(id) = queue.pop_front() else { break };
                queued.remove(&id);
                if self.state(id) != Some(WorkState::Pending) || !self.can_run(id) {
                    continue;
                }
                if self.start(id, &tx) {
                    running.insert(id);
                }
            }

            if running.is_empty() && queue.is_empty() && delayed.is_empty() {
                break;
            }

            let next_due = delayed.iter().map(|(due, _)| *due).min();
            let completion = tokio::select! {
                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    self.cancel_all();
                    delayed.clear();
                    continue;
                }
                _ = sleep_until(next_due), if next_due.is_some() => continue,
                completion = rx.recv() => completion,
            };
            let Some(completion) = completion else { break };
            running.remove(&completion.id);
            if let Some(requeue) = self.complete(completion) {
                delayed.push(requeue);
            }
            if !cancel_requested {
                let busy: HashSet<WorkId> = running
                    .iter()
                    .copied()
                    .chain(delayed.iter().map(|(_, id)| *id))
                    .collect();
                self.enqueue_ready(&mut queue, &mut queued, &busy);
            }
        }

        let stuck = self
            .states
            .values()
            .filter(|s| **s == WorkState::Pending)
            .count();
        if stuck > 0 {
            warn!(stuck, "work scheduler stopped with unrunnable work");
        }
        info!(total = self.entries.len(), "work scheduler finished");
    }

    fn start(&mut self, id: WorkId, tx: &mpsc::Sender<WorkCompletion>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let Some(mut work) = entry.work.take() else {
            return false;
        };
        entry.attempts += 1;
        let attempt = entry.attempts;
        let cancel_token = entry.cancel_token.clone();
        let completion_tx = tx.clone();
        debug!(work_id = id, name = %entry.name, attempt, "starting work");

        self.states.insert(id, WorkState::Running);
        self.emit_event(id, WorkState::Running, attempt);

        tokio::spawn(async move {
            let outcome = work
                .run(WorkContext {
                    id,
                    attempt,
                    cancel_token: cancel_token.clone(),
                })
                .await;
            let _ = completion_tx
                .send(WorkCompletion {
                    id,
                    outcome,
                    work,
                    attempt,
                    cancelled: cancel_token.is_cancelled(),
                })
                .await;
        });
        true
    }

    /// Apply a finished run. Returns the retry deadline if the unit should
    /// run again.
    fn complete(&mut self, completion: WorkCompletion) -> Option<(Instant, WorkId)> {
        let WorkCompletion {
            id,
            outcome,
            work,
            attempt,
            cancelled,
        } = completion;
        let cancelled = cancelled || self.state(id) == Some(WorkState::Cancelled);
        let entry = self.entries.get_mut(&id)?;
        entry.work = Some(work);

        if cancelled || outcome == WorkOutcome::Cancelled {
            self.set_terminal(id, WorkState::Cancelled, attempt);
            return None;
        }

        match outcome {
            WorkOutcome::Success => {
                self.states.insert(id, WorkState::Success);
                self.emit_event(id, WorkState::Success, attempt);
                None
            }
            WorkOutcome::Retry { delay } => {
                if entry.retries_left == 0 {
                    warn!(work_id = id, name = %entry.name, attempt, "work out of retries");
                    entry.last_error = Some(format!("gave up after {attempt} attempts"));
                    self.set_terminal(id, WorkState::Failed, attempt);
                    return None;
                }
                entry.retries_left -= 1;
                let delay = if delay.is_zero() {
                    self.config.retry_delay
                } else {
                    delay
                };
                debug!(work_id = id, name = %entry.name, ?delay, "retrying work");
                self.states.insert(id, WorkState::Pending);
                self.emit_event(id, WorkState::Pending, attempt);
                Some((Instant::now() + delay, id))
            }
            WorkOutcome::Failed(err) => {
                warn!(work_id = id, name = %entry.name, error = %err, "work failed");
                entry.last_error = Some(err);
                self.set_terminal(id, WorkState::Failed, attempt);
                None
            }
            WorkOutcome::Cancelled => None,
        }
    }

    fn ready_queue(&self) -> VecDeque<WorkId> {
        let mut ids: Vec<WorkId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == WorkState::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into()
    }

    fn enqueue_ready(
        &self,
        queue: &mut VecDeque<WorkId>,
        queued: &mut HashSet<WorkId>,
        busy: &HashSet<WorkId>,
    ) {
        for id in self.ready_queue() {
            if !busy.contains(&id) && self.can_run(id) && queued.insert(id) {
                queue.push_back(id);
            }
        }
    }

    fn can_run(&self, id: WorkId) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };
        entry
            .deps
            .iter()
            .all(|dep| self.state(*dep) == Some(WorkState::Success))
    }

    /// Move `id` to a non-success terminal state and block everything
    /// downstream of it.
    fn set_terminal(&mut self, id: WorkId, state: WorkState, attempt: u32) {
        self.states.insert(id, state);
        self.emit_event(id, state, attempt);

        let mut stack = self.dependents.get(&id).cloned().unwrap_or_default();
        while let Some(child) = stack.pop() {
            if self.state(child) == Some(WorkState::Pending) {
                self.states.insert(child, WorkState::Blocked);
                self.emit_event(child, WorkState::Blocked, 0);
                if let Some(grandchildren) = self.dependents.get(&child) {
                    stack.extend(grandchildren.iter().copied());
                }
            }
        }
    }

    fn emit_event(&self, id: WorkId, state: WorkState, attempt: u32) {
        let Some(tx) = self.config.event_tx.as_ref() else {
            return;
        };
        let name = self
            .entries
            .get(&id)
            .map_or_else(|| "unknown".into(), |entry| entry.name.clone());
        let _ = tx.try_send(WorkEvent {
            id,
            name,
            state,
            attempt,
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Chains units so that each one depends on the previously pushed one.
#[derive(Default)]
pub struct WorkSequence {
    ids: Vec<WorkId>,
}

impl WorkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        scheduler: &mut WorkScheduler,
        work: Box<dyn Work + Send>,
        retry: RetryPolicy,
    ) -> WorkId {
        let deps = self.ids.last().copied().into_iter().collect();
        let id = scheduler.add_work(work, deps, retry);
        self.ids.push(id);
        id
    }

    pub fn ids(&self) -> &[WorkId] {
        &self.ids
    }

    pub fn last(&self) -> Option<WorkId> {
        self.ids.last().copied()
    }

    /// The first unit in the sequence that did not succeed, if any.
    pub fn first_failure(&self, scheduler: &WorkScheduler) -> Option<WorkId> {
        self.ids
            .iter()
            .copied()
            .find(|id| !scheduler.state(*id).is_some_and(WorkState::is_success))
    }
}
