#![forbid(unsafe_code)]

//! Nested work scopes built on [`Signal`].
//!
//! [`Batches`] keeps a LIFO stack of open batches; the top of the stack is the
//! *current* batch. Each batch owns a signal that stays pending until the
//! batch has ended and every piece of work registered on it has finished.
//!
//! A batch started while another is current holds a token on the outer
//! batch's signal, so outer completion waits for inner completion.
//!
//! Provider round trips must not nest unrelated work under whatever batch
//! happened to be current, so the session *suspends* the current batch for
//! the duration of the call and *resumes* it in the continuation. Batches
//! that were started while it was suspended and are still on the stack at
//! resume time are *transferred* into it: they leave the stack and the
//! resumed batch waits for them before it can complete.
//!
//! # Invariants
//!
//! 1. The stack only holds [`BatchState::Active`] batches.
//! 2. An active batch can only end when it is on top of the stack.
//! 3. A suspended batch can only be resumed after every batch that was below
//!    it at suspension time has been resumed or ended.
//! 4. `all()` lists exactly the batches that have started and not ended.
//! 5. A resume parked by [`Batches::resume_or_park`] is retried on the tick
//!    after its blocker is resumed, ended or force-completed, until it
//!    succeeds or fails for another reason.
//!
//! # Failure Modes
//!
//! Every structural misuse returns a [`BatchError`] and leaves the table
//! untouched.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};
use web_time::Instant;

use crate::error::BatchError;
use crate::scheduler::Scheduler;
use crate::signal::{Dispatch, Signal, Token};

/// Identifier of a batch, unique within one [`Batches`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(u64);

impl BatchId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// Where an open batch currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// On the stack.
    Active,
    /// Taken off the stack by `suspend_current`.
    Suspended,
    /// Taken off the stack when `into` was resumed above it.
    Transferred { into: BatchId },
}

/// Diagnostic snapshot of one open batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub id: BatchId,
    pub label: String,
    pub state: BatchState,
    /// Outstanding tokens on the batch signal, including the one held until
    /// `end`.
    pub pending: usize,
    pub age: Duration,
}

/// Handle returned by [`Batches::suspend_current`].
///
/// When nothing was current the handle is a no-op and resuming it does
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a suspended batch must be resumed"]
pub struct SuspendedBatch {
    id: Option<BatchId>,
    label: String,
}

impl SuspendedBatch {
    /// Handle that suspends nothing.
    pub fn none(label: impl Into<String>) -> Self {
        Self {
            id: None,
            label: label.into(),
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.id.is_none()
    }

    #[must_use]
    pub fn id(&self) -> Option<BatchId> {
        self.id
    }

    /// Label of the suspension point (not of the batch).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

struct BatchEntry {
    label: String,
    signal: Signal,
    open: Option<Token>,
    state: BatchState,
    below: Vec<BatchId>,
    started_at: Instant,
}

type AfterResume = Box<dyn FnOnce(Result<(), BatchError>)>;

/// A resume that hit [`BatchError::ResumeOutOfOrder`], waiting on its blocker.
struct ParkedResume {
    blocked_by: BatchId,
    handle: SuspendedBatch,
    then: AfterResume,
}

#[derive(Default)]
struct BatchTable {
    next_id: u64,
    stack: Vec<BatchId>,
    entries: BTreeMap<BatchId, BatchEntry>,
    parked: Vec<ParkedResume>,
}

impl BatchTable {
    fn state(&self, id: BatchId) -> Option<BatchState> {
        self.entries.get(&id).map(|entry| entry.state)
    }
}

/// The batch stack of one session. Clones share the same stack.
#[derive(Clone)]
pub struct Batches {
    table: Rc<RefCell<BatchTable>>,
    scheduler: Scheduler,
}

impl Batches {
    #[must_use]
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            table: Rc::new(RefCell::new(BatchTable::default())),
            scheduler: scheduler.clone(),
        }
    }

    /// Open a batch and make it current.
    pub fn start(&self, label: impl Into<String>) -> BatchId {
        let label = label.into();
        let (id, signal, parent) = {
            let mut table = self.table.borrow_mut();
            table.next_id += 1;
            let id = BatchId(table.next_id);
            let signal = Signal::new(format!("{label} ({id})"), &self.scheduler);
            let open = signal.pending();
            let parent = table
                .stack
                .last()
                .and_then(|top| table.entries.get(top))
                .map(|entry| entry.signal.clone());
            table.entries.insert(
                id,
                BatchEntry {
                    label: label.clone(),
                    signal: signal.clone(),
                    open: Some(open),
                    state: BatchState::Active,
                    below: Vec::new(),
                    started_at: Instant::now(),
                },
            );
            table.stack.push(id);
            (id, signal, parent)
        };
        if let Some(parent) = parent {
            signal.fan_into(&parent);
        }
        debug!(batch = %id, label = %label, "batch started");
        id
    }

    /// Close a batch. Its signal completes once its remaining work finishes.
    ///
    /// # Errors
    ///
    /// [`BatchError::NotOpen`] if the batch is unknown or already ended,
    /// [`BatchError::NotInnermost`] if it is active but not on top.
    pub fn end(&self, id: BatchId) -> Result<(), BatchError> {
        let open = {
            let mut table = self.table.borrow_mut();
            let state = table.state(id).ok_or(BatchError::NotOpen(id))?;
            if state == BatchState::Active {
                match table.stack.last() {
                    Some(&top) if top != id => {
                        return Err(BatchError::NotInnermost {
                            batch: id,
                            innermost: top,
                        });
                    }
                    _ => {}
                }
                table.stack.pop();
            }
            table.entries.remove(&id).and_then(|mut entry| entry.open.take())
        };
        debug!(batch = %id, "batch ended");
        if let Some(token) = open {
            token.release();
        }
        self.wake_parked(id);
        Ok(())
    }

    /// Take the current batch off the stack without ending it.
    pub fn suspend_current(&self, label: impl Into<String>) -> SuspendedBatch {
        let label = label.into();
        let mut table = self.table.borrow_mut();
        let Some(id) = table.stack.pop() else {
            return SuspendedBatch::none(label);
        };
        let below = table.stack.clone();
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.state = BatchState::Suspended;
            entry.below = below;
        }
        debug!(batch = %id, at = %label, "batch suspended");
        SuspendedBatch {
            id: Some(id),
            label,
        }
    }

    /// Put a suspended batch back on the stack, transferring into it every
    /// batch started above its suspension point that is still on the stack.
    ///
    /// # Errors
    ///
    /// [`BatchError::NotOpen`], [`BatchError::NotSuspended`], or
    /// [`BatchError::ResumeOutOfOrder`] when a batch that was below it at
    /// suspension time is itself still suspended.
    pub fn resume(&self, handle: SuspendedBatch) -> Result<(), BatchError> {
        let Some(id) = handle.id else {
            return Ok(());
        };
        let (target, moved) = {
            let mut table = self.table.borrow_mut();
            let entry = table.entries.get(&id).ok_or(BatchError::NotOpen(id))?;
            if entry.state != BatchState::Suspended {
                return Err(BatchError::NotSuspended(id));
            }
            let below = entry.below.clone();
            let target = entry.signal.clone();

            if let Some(&blocked_by) = below
                .iter()
                .find(|b| table.state(**b) == Some(BatchState::Suspended))
            {
                return Err(BatchError::ResumeOutOfOrder {
                    batch: id,
                    blocked_by,
                });
            }

            let split = table
                .stack
                .iter()
                .rposition(|b| below.contains(b))
                .map_or(0, |i| i + 1);
            let expected: Vec<BatchId> = below
                .iter()
                .copied()
                .filter(|b| table.state(*b) == Some(BatchState::Active))
                .collect();
            let base = &table.stack[..split];
            if base != expected.as_slice() {
                let blocked_by = base
                    .iter()
                    .chain(&expected)
                    .copied()
                    .find(|b| !(base.contains(b) && expected.contains(b)))
                    .unwrap_or(id);
                return Err(BatchError::ResumeOutOfOrder {
                    batch: id,
                    blocked_by,
                });
            }

            let moved_ids: Vec<BatchId> = table.stack.drain(split..).collect();
            let mut moved = Vec::with_capacity(moved_ids.len());
            for moved_id in moved_ids {
                if let Some(entry) = table.entries.get_mut(&moved_id) {
                    entry.state = BatchState::Transferred { into: id };
                    moved.push((moved_id, entry.signal.clone()));
                }
            }
            if let Some(entry) = table.entries.get_mut(&id) {
                entry.state = BatchState::Active;
                entry.below.clear();
            }
            table.stack.push(id);
            (target, moved)
        };
        for (moved_id, signal) in moved {
            debug!(batch = %moved_id, into = %id, "batch transferred");
            signal.fan_into(&target);
        }
        debug!(batch = %id, at = %handle.label, "batch resumed");
        self.wake_parked(id);
        Ok(())
    }

    /// Resume `handle` and pass the outcome to `then`.
    ///
    /// When the resume is blocked by an enclosing batch that is still
    /// suspended, the attempt is parked instead of failing and retried on the
    /// scheduler tick after the blocker is resumed or ended, so `then` always
    /// runs with the batch back on the stack unless some other error occurs.
    pub fn resume_or_park(
        &self,
        handle: SuspendedBatch,
        then: impl FnOnce(Result<(), BatchError>) + 'static,
    ) {
        match self.resume(handle.clone()) {
            Err(BatchError::ResumeOutOfOrder { batch, blocked_by }) if blocked_by != batch => {
                debug!(batch = %batch, blocked_by = %blocked_by, "resume parked");
                self.table.borrow_mut().parked.push(ParkedResume {
                    blocked_by,
                    handle,
                    then: Box::new(then),
                });
            }
            result => then(result),
        }
    }

    /// Number of resumes waiting for a blocker.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.table.borrow().parked.len()
    }

    fn wake_parked(&self, id: BatchId) {
        let woken: Vec<ParkedResume> = {
            let mut table = self.table.borrow_mut();
            let (woken, still) = std::mem::take(&mut table.parked)
                .into_iter()
                .partition(|parked| parked.blocked_by == id);
            table.parked = still;
            woken
        };
        for parked in woken {
            let batches = self.clone();
            self.scheduler
                .defer(move || batches.resume_or_park(parked.handle, parked.then));
        }
    }

    /// Run `callback` when the current batch completes, or right away if no
    /// batch is current.
    pub fn when_done(&self, callback: impl FnOnce() + 'static) {
        match self.current().and_then(|id| self.signal_of(id)) {
            Some(signal) => signal.wait_for_all(Dispatch::Now, callback),
            None => callback(),
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<BatchId> {
        self.table.borrow().stack.last().copied()
    }

    /// Signal of an open batch.
    #[must_use]
    pub fn signal_of(&self, id: BatchId) -> Option<Signal> {
        self.table
            .borrow()
            .entries
            .get(&id)
            .map(|entry| entry.signal.clone())
    }

    #[must_use]
    pub fn state(&self, id: BatchId) -> Option<BatchState> {
        self.table.borrow().state(id)
    }

    /// Every open batch, in start order.
    #[must_use]
    pub fn all(&self) -> Vec<BatchInfo> {
        let now = Instant::now();
        self.table
            .borrow()
            .entries
            .iter()
            .map(|(id, entry)| BatchInfo {
                id: *id,
                label: entry.label.clone(),
                state: entry.state,
                pending: entry.signal.pending_count(),
                age: now.saturating_duration_since(entry.started_at),
            })
            .collect()
    }

    /// Force-complete and drop every open batch older than `max_age`.
    ///
    /// Degraded mode for harnesses that gave up waiting; returns the dropped
    /// ids.
    pub fn force_complete_stale(&self, max_age: Duration) -> Vec<BatchId> {
        let now = Instant::now();
        let stale: Vec<(BatchId, Signal, Option<Token>)> = {
            let mut table = self.table.borrow_mut();
            let ids: Vec<BatchId> = table
                .entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.started_at) >= max_age)
                .map(|(id, _)| *id)
                .collect();
            table.stack.retain(|id| !ids.contains(id));
            ids.into_iter()
                .filter_map(|id| {
                    table
                        .entries
                        .remove(&id)
                        .map(|mut entry| (id, entry.signal.clone(), entry.open.take()))
                })
                .collect()
        };
        let mut dropped = Vec::with_capacity(stale.len());
        for (id, signal, open) in stale {
            warn!(batch = %id, pending = signal.pending_count(), "stale batch force-completed");
            signal.force_complete();
            if let Some(token) = open {
                token.release();
            }
            self.wake_parked(id);
            dropped.push(id);
        }
        dropped
    }
}

impl fmt::Debug for Batches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.borrow();
        f.debug_struct("Batches")
            .field("stack", &table.stack)
            .field("open", &table.entries.len())
            .field("parked", &table.parked.len())
            .finish()
    }
}
