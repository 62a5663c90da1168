use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::mutator::{ContextId, MutatorContext, MutatorRef, SavedContext, ThreadState};

/// The kernel-wide stop-the-world primitive the relocation engine runs under.
pub trait World: Send + Sync {
    /// Suspends every schedulable context. Returns false, with nothing
    /// suspended, if the world could not be stopped.
    fn suspend_all(&self) -> bool;
    fn resume_all(&self);
    /// Calls `visitor` once per suspended context. Only valid between a
    /// successful `suspend_all` and the matching `resume_all`.
    fn for_each_suspended_context(&self, visitor: &mut dyn FnMut(&mut dyn SavedContext));
}

struct BarrierState {
    armed: bool,
    stopped: usize,
    parked: usize,
    attached: usize,
}

pub(crate) struct Barrier {
    requested: AtomicBool,
    state: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            state: Mutex::new(BarrierState {
                armed: false,
                stopped: 0,
                parked: 0,
                attached: 0,
            }),
            cv_resume: Condvar::new(),
            cv_stopped: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Arms the barrier and waits for every attached context to stop.
    fn arm(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        if state.armed {
            return false;
        }
        state.armed = true;
        state.stopped = state.parked;
        self.requested.store(true, Ordering::Release);

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.stopped < state.attached {
            match deadline {
                Some(deadline) => {
                    if self.cv_stopped.wait_until(&mut state, deadline).timed_out()
                        && state.stopped < state.attached
                    {
                        log::debug!(
                            "carat: {} of {} contexts reached the safepoint before timeout",
                            state.stopped,
                            state.attached
                        );
                        self.release(&mut state);
                        return false;
                    }
                }
                None => self.cv_stopped.wait(&mut state),
            }
        }
        debug_assert_eq!(state.stopped, state.attached);
        true
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        self.release(&mut state);
    }

    fn release(&self, state: &mut BarrierState) {
        state.armed = false;
        state.stopped = 0;
        self.requested.store(false, Ordering::Release);
        self.cv_resume.notify_all();
    }

    pub fn wait_in_safepoint(&self, mutator: &MutatorContext) {
        let mut state = self.state.lock();
        if !state.armed {
            return;
        }
        let previous = mutator.state.load(Ordering::Relaxed);
        if previous == ThreadState::Parked {
            // Already counted as stopped.
            while state.armed {
                self.cv_resume.wait(&mut state);
            }
            state.parked -= 1;
            mutator.state.store(ThreadState::Running, Ordering::Release);
            return;
        }
        mutator.state.store(ThreadState::Safepoint, Ordering::Release);
        state.stopped += 1;
        self.cv_stopped.notify_all();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        mutator.state.store(previous, Ordering::Release);
    }

    pub fn park(&self, mutator: &MutatorContext) {
        let mut state = self.state.lock();
        if mutator.state.load(Ordering::Relaxed) == ThreadState::Parked {
            return;
        }
        mutator.state.store(ThreadState::Parked, Ordering::Release);
        state.parked += 1;
        if state.armed {
            state.stopped += 1;
            self.cv_stopped.notify_all();
        }
    }

    pub fn unpark(&self, mutator: &MutatorContext) {
        let mut state = self.state.lock();
        if mutator.state.load(Ordering::Relaxed) != ThreadState::Parked {
            return;
        }
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        state.parked -= 1;
        mutator.state.store(ThreadState::Running, Ordering::Release);
    }
}

/// Used to bring every attached context to a safepoint so that a relocation
/// can patch pointers nobody else is looking at.
pub struct GlobalSafepoint {
    barrier: Arc<Barrier>,
    mutators: Mutex<Vec<MutatorRef>>,
    next_id: AtomicU64,
    timeout: Option<Duration>,
}

impl GlobalSafepoint {
    /// `timeout` bounds how long `suspend_all` waits for running contexts.
    /// `None` waits forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            barrier: Arc::new(Barrier::new()),
            mutators: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Attaches a new context. If the world is currently stopped the context
    /// starts parked and waits at its first poll.
    pub fn attach(&self, name: impl Into<String>) -> MutatorRef {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.barrier.state.lock();
        let initial = if state.armed {
            state.parked += 1;
            state.stopped += 1;
            ThreadState::Parked
        } else {
            ThreadState::Running
        };
        let mutator = Arc::new(MutatorContext::new(
            id,
            name.into(),
            initial,
            self.barrier.clone(),
        ));
        state.attached += 1;
        self.mutators.lock().push(mutator.clone());
        log::debug!("carat: attached context {} ({})", id, mutator.name());
        mutator
    }

    pub fn detach(&self, mutator: &MutatorContext) -> bool {
        let mut state = self.barrier.state.lock();
        let mut mutators = self.mutators.lock();
        let Some(position) = mutators.iter().position(|m| m.id() == mutator.id()) else {
            return false;
        };
        mutators.swap_remove(position);
        state.attached -= 1;
        if mutator.state() == ThreadState::Parked {
            state.parked -= 1;
            if state.armed {
                state.stopped -= 1;
            }
        }
        self.barrier.cv_stopped.notify_all();
        log::debug!("carat: detached context {}", mutator.id());
        true
    }

    pub fn find(&self, id: ContextId) -> Option<MutatorRef> {
        self.mutators.lock().iter().find(|m| m.id() == id).cloned()
    }

    pub fn contexts(&self) -> Vec<MutatorRef> {
        self.mutators.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.barrier.is_armed()
    }
}

impl World for GlobalSafepoint {
    fn suspend_all(&self) -> bool {
        self.barrier.arm(self.timeout)
    }

    fn resume_all(&self) {
        self.barrier.disarm();
    }

    fn for_each_suspended_context(&self, visitor: &mut dyn FnMut(&mut dyn SavedContext)) {
        let mutators = self.mutators.lock();
        for mutator in mutators.iter() {
            debug_assert!(mutator.state().safe_for_safepoint());
            let mut saved = mutator.suspended();
            visitor(&mut saved);
        }
    }
}
