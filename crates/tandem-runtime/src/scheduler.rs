#![forbid(unsafe_code)]

//! Cooperative "next tick" queue.
//!
//! The host event loop owns the actual timing; Tandem only needs somewhere to
//! park callbacks that must not run synchronously. Call [`Scheduler::tick`]
//! (or [`Scheduler::run_until_idle`]) from the loop to drain them.
//!
//! # Invariants
//!
//! 1. Tasks run in the order they were deferred.
//! 2. A task deferred while a tick is running waits for the next tick.
//! 3. No internal borrow is held while a task runs, so tasks may defer more
//!    work.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

/// Shared queue of deferred callbacks. Clones share the same queue.
#[derive(Clone, Default)]
pub struct Scheduler {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` for the next tick.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Run the tasks that were queued when this tick began. Returns how many ran.
    pub fn tick(&self) -> usize {
        let due = self.queue.borrow().len();
        for _ in 0..due {
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        due
    }

    /// Tick until the queue stays empty. Returns the total number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.tick();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Number of tasks waiting for a tick.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
