//! Cooperative, poll-driven operations.
//!
//! Every long-running piece of work (decoding a manifest, downloading a file, loading a bundle) is an
//! [AsyncOperation].  Nothing blocks: an [OperationSystem] calls [AsyncOperation::update_operation] on every live
//! operation once per tick, and each operation reports whether it is done yet.  The single blocking path is
//! [AsyncOperation::wait_for_sync_complete], which spins the operation a bounded number of times and fails with
//! [OperationError::Timeout] rather than hanging.
//!
//! Operations are shared as `Rc<RefCell<..>>`, since one operation may be awaited by many callers.  Completion
//! callbacks are never run while the operation is borrowed: the `update`/`abort`/`wait` methods hand back a
//! [Completion], which the `*_and_notify` helpers fire once the borrow is released.
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::OperationError;

pub type OperationRef = Rc<RefCell<dyn AsyncOperation>>;

pub type CompletionCallback = Box<dyn FnOnce(&OperationOutcome)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    None,
    Processing,
    Succeed,
    Failed,
}

impl OperationStatus {
    pub fn is_done(self) -> bool {
        matches!(self, OperationStatus::Succeed | OperationStatus::Failed)
    }
}

/// The terminal state handed to completion callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationOutcome {
    pub status: OperationStatus,
    pub error: Option<OperationError>,
}

/// Callbacks waiting to be told about a terminal state.  Must be notified once the operation is no longer borrowed.
#[must_use = "completion callbacks only run when notified"]
pub struct Completion {
    outcome: OperationOutcome,
    callbacks: Vec<CompletionCallback>,
}

impl Completion {
    pub fn outcome(&self) -> &OperationOutcome {
        &self.outcome
    }

    pub fn notify(self) {
        for cb in self.callbacks {
            cb(&self.outcome);
        }
    }
}

/// How much work an operation may do in the current tick.
#[derive(Debug)]
pub struct TimeSlice {
    deadline: Option<Instant>,
    steps: Cell<Option<u32>>,
}

impl TimeSlice {
    /// No limit; used while waiting synchronously.
    pub fn unbounded() -> TimeSlice {
        TimeSlice {
            deadline: None,
            steps: Cell::new(None),
        }
    }

    pub fn for_duration(duration: Duration) -> TimeSlice {
        TimeSlice {
            deadline: Instant::now().checked_add(duration),
            steps: Cell::new(None),
        }
    }

    /// A budget of units of work rather than time, which keeps time slicing deterministic.
    pub fn steps(steps: u32) -> TimeSlice {
        TimeSlice {
            deadline: None,
            steps: Cell::new(Some(steps)),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.deadline.is_none() && self.steps.get().is_none()
    }

    pub fn is_busy(&self) -> bool {
        if self.steps.get() == Some(0) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Record one unit of work and report whether the caller should yield until the next tick.
    pub fn yield_now(&self) -> bool {
        if let Some(n) = self.steps.get() {
            self.steps.set(Some(n.saturating_sub(1)));
        }
        self.is_busy()
    }
}

pub const DEFAULT_MAX_WAIT_ITERATIONS: u32 = 1000;

/// State shared by every operation: status, progress, error, callbacks and children.
pub struct OperationCore {
    status: OperationStatus,
    progress: f32,
    error: Option<OperationError>,
    callbacks: Vec<CompletionCallback>,
    children: Vec<OperationRef>,
    priority: u32,
    waiting_sync: bool,
    finished: bool,
    max_wait_iterations: u32,
}

impl Default for OperationCore {
    fn default() -> Self {
        OperationCore {
            status: OperationStatus::None,
            progress: 0.0,
            error: None,
            callbacks: Vec::new(),
            children: Vec::new(),
            priority: 0,
            waiting_sync: false,
            finished: false,
            max_wait_iterations: DEFAULT_MAX_WAIT_ITERATIONS,
        }
    }
}

impl std::fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCore")
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("error", &self.error)
            .field("callbacks", &self.callbacks.len())
            .field("children", &self.children.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl OperationCore {
    pub fn new() -> OperationCore {
        Default::default()
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Done, and the callbacks have been handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn set_progress(&mut self, progress: f32) {
        if !self.is_done() {
            self.progress = progress.max(0.0).min(1.0);
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    pub fn succeed(&mut self) {
        if !self.is_done() {
            self.status = OperationStatus::Succeed;
        }
    }

    /// Fail the operation.  A finished status is never overwritten.
    pub fn fail(&mut self, err: OperationError) {
        if !self.is_done() {
            self.status = OperationStatus::Failed;
            self.error = Some(err);
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    pub fn is_waiting_sync(&self) -> bool {
        self.waiting_sync
    }

    pub fn max_wait_iterations(&self) -> u32 {
        self.max_wait_iterations
    }

    pub fn set_max_wait_iterations(&mut self, iterations: u32) {
        self.max_wait_iterations = iterations.max(1);
    }

    /// Track a child so that aborting this operation aborts it too.
    ///
    /// # Panics
    ///
    /// If the same child is added twice.
    pub fn add_child(&mut self, child: OperationRef) {
        assert!(
            !self.children.iter().any(|c| Rc::ptr_eq(c, &child)),
            "child operation added twice"
        );
        self.children.push(child);
    }

    pub fn children(&self) -> &[OperationRef] {
        &self.children
    }

    fn outcome(&self) -> OperationOutcome {
        OperationOutcome {
            status: self.status,
            error: self.error.clone(),
        }
    }

    fn take_completion(&mut self) -> Option<Completion> {
        if !self.is_done() || self.finished {
            return None;
        }
        self.finished = true;
        self.progress = 1.0;
        Some(Completion {
            outcome: self.outcome(),
            callbacks: std::mem::take(&mut self.callbacks),
        })
    }
}

/// A cooperative operation.  Implementors provide the `internal_*` hooks; callers use the provided methods.
pub trait AsyncOperation {
    fn core(&self) -> &OperationCore;

    fn core_mut(&mut self) -> &mut OperationCore;

    fn internal_start(&mut self);

    fn internal_update(&mut self, slice: &TimeSlice);

    fn internal_abort(&mut self) {}

    /// Human readable identification used in logs and timeout errors.
    fn description(&self) -> String;

    fn status(&self) -> OperationStatus {
        self.core().status()
    }

    fn is_done(&self) -> bool {
        self.core().is_done()
    }

    fn progress(&self) -> f32 {
        self.core().progress()
    }

    fn error(&self) -> Option<&OperationError> {
        self.core().error()
    }

    fn start_operation(&mut self) {
        if self.status() == OperationStatus::None {
            self.core_mut().status = OperationStatus::Processing;
            debug!("Starting {}", self.description());
            self.internal_start();
        }
    }

    /// Poll once.  Does nothing before the operation is started, and nothing but report completion once done.
    fn update_operation(&mut self, slice: &TimeSlice) -> Option<Completion> {
        if self.status() == OperationStatus::Processing {
            self.internal_update(slice);
        }
        self.core_mut().take_completion()
    }

    /// Abort this operation and, transitively, its children.  Finished operations are left untouched.
    fn abort_operation(&mut self) -> Option<Completion> {
        let children = self.core().children.clone();
        for child in &children {
            abort_and_notify(child);
        }
        if !self.is_done() {
            warn!("{} has been aborted", self.description());
            self.core_mut().fail(OperationError::Aborted);
            self.internal_abort();
        }
        self.core_mut().take_completion()
    }

    /// Drive the operation to completion on the calling thread, failing it if it cannot get there within
    /// [OperationCore::max_wait_iterations] updates.
    fn wait_for_sync_complete(&mut self) -> Option<Completion> {
        if self.core().finished {
            return None;
        }
        if self.status() == OperationStatus::None {
            self.start_operation();
        }
        self.core_mut().waiting_sync = true;

        let slice = TimeSlice::unbounded();
        let iterations = self.core().max_wait_iterations;
        let mut remaining = iterations;
        while !self.is_done() {
            self.internal_update(&slice);
            if self.is_done() {
                break;
            }
            remaining -= 1;
            if remaining == 0 {
                let err = OperationError::Timeout {
                    operation: self.description(),
                    iterations,
                };
                error!("{}", err);
                self.core_mut().fail(err);
            }
        }
        self.core_mut().take_completion()
    }

    /// Subscribe to completion.  Runs immediately if the operation has already finished.
    fn on_completed(&mut self, callback: CompletionCallback) {
        if self.core().finished {
            callback(&self.core().outcome());
        } else {
            self.core_mut().callbacks.push(callback);
        }
    }
}

fn notify(completion: Option<Completion>) {
    if let Some(c) = completion {
        c.notify();
    }
}

/// Poll once and fire completion callbacks outside the borrow.  Returns whether the operation is done.
pub fn update_and_notify<T: AsyncOperation + ?Sized>(op: &RefCell<T>, slice: &TimeSlice) -> bool {
    let completion = op.borrow_mut().update_operation(slice);
    notify(completion);
    op.borrow().is_done()
}

pub fn abort_and_notify<T: AsyncOperation + ?Sized>(op: &RefCell<T>) {
    let completion = op.borrow_mut().abort_operation();
    notify(completion);
}

pub fn wait_and_notify<T: AsyncOperation + ?Sized>(op: &RefCell<T>) -> OperationStatus {
    let completion = op.borrow_mut().wait_for_sync_complete();
    notify(completion);
    op.borrow().status()
}

#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct OperationSystemConfig {
    /// Wall-clock budget of one [OperationSystem::update] tick.
    pub time_slice: Duration,
    /// Update budget of [AsyncOperation::wait_for_sync_complete].
    pub max_wait_iterations: u32,
}

impl Default for OperationSystemConfig {
    fn default() -> Self {
        OperationSystemConfig {
            time_slice: Duration::from_millis(30),
            max_wait_iterations: DEFAULT_MAX_WAIT_ITERATIONS,
        }
    }
}

/// The scheduler: polls every live operation once per tick, highest priority first.
pub struct OperationSystem {
    config: OperationSystemConfig,
    operations: Vec<OperationRef>,
    added: Vec<OperationRef>,
}

impl OperationSystem {
    pub fn new(config: OperationSystemConfig) -> OperationSystem {
        OperationSystem {
            config,
            operations: Vec::new(),
            added: Vec::new(),
        }
    }

    pub fn config(&self) -> &OperationSystemConfig {
        &self.config
    }

    /// Start an operation and poll it from the next tick on.
    pub fn start_operation(&mut self, op: OperationRef) {
        {
            let mut guard = op.borrow_mut();
            guard
                .core_mut()
                .set_max_wait_iterations(self.config.max_wait_iterations);
            guard.start_operation();
        }
        self.added.push(op);
    }

    /// Number of operations that have not finished yet.
    pub fn len(&self) -> usize {
        self.operations.len() + self.added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&mut self) {
        let slice = TimeSlice::for_duration(self.config.time_slice);
        self.update_with(&slice);
    }

    /// Run one tick within the given budget.  Operations that do not get polled before the budget runs out are
    /// polled next tick.
    pub fn update_with(&mut self, slice: &TimeSlice) {
        self.operations.retain(|op| !op.borrow().core().is_finished());

        if !self.added.is_empty() {
            self.operations.append(&mut self.added);
            // Stable, so equal priorities keep their start order.
            self.operations
                .sort_by(|a, b| b.borrow().core().priority().cmp(&a.borrow().core().priority()));
        }

        for op in &self.operations {
            if slice.is_busy() {
                break;
            }
            update_and_notify(&**op, slice);
        }
    }

    /// Abort and forget every operation.
    pub fn clear_all(&mut self) {
        self.operations.append(&mut self.added);
        for op in self.operations.drain(..) {
            abort_and_notify(&*op);
        }
    }
}
