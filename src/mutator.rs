//! Schedulable contexts and their saved register state.
//!
//! A [`MutatorContext`] is the handle a thread gets when it attaches to the
//! [`GlobalSafepoint`](crate::safepoint::GlobalSafepoint). While the world is
//! stopped its register file is handed to the relocation engine through the
//! [`SavedContext`] capability, which is all the engine ever sees of a thread.
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use atomic::{Atomic, Ordering};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{Error, Result},
    safepoint::Barrier,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing mutator code. Has to reach a safepoint before the world is stopped.
    Running = 0,
    /// Blocked or otherwise not touching tracked memory.
    Parked = 1,
    /// Waiting at a safepoint for the world to resume.
    Safepoint = 2,
}

impl ThreadState {
    pub fn safe_for_safepoint(self) -> bool {
        matches!(self, Self::Parked | Self::Safepoint)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rsp,
}

impl Register {
    pub const COUNT: usize = 17;

    /// Registers the relocation engine may patch, in the order a saved
    /// interrupt frame lays them out. `rip` and `rsp` carry control flow and
    /// are never rewritten.
    pub const GENERAL_PURPOSE: [Register; 15] = [
        Register::R15,
        Register::R14,
        Register::R13,
        Register::R12,
        Register::R11,
        Register::R10,
        Register::R9,
        Register::R8,
        Register::Rbp,
        Register::Rdi,
        Register::Rsi,
        Register::Rdx,
        Register::Rcx,
        Register::Rbx,
        Register::Rax,
    ];

    pub fn is_general_purpose(self) -> bool {
        !matches!(self, Register::Rip | Register::Rsp)
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Rax => "rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rsi => "rsi",
            Register::Rdi => "rdi",
            Register::Rbp => "rbp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
            Register::Rip => "rip",
            Register::Rsp => "rsp",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    values: [usize; Register::COUNT],
}

impl RegisterFile {
    pub fn get(&self, reg: Register) -> usize {
        self.values[reg as usize]
    }

    pub fn set(&mut self, reg: Register, value: usize) {
        self.values[reg as usize] = value;
    }
}

/// Read/write access to the registers a suspended context will resume with.
pub trait SavedContext {
    fn id(&self) -> ContextId;
    fn read(&self, reg: Register) -> usize;
    fn write(&mut self, reg: Register, value: usize);
}

/// Saved registers of one stopped context, borrowed for the duration of a
/// [`World::for_each_suspended_context`](crate::safepoint::World) callback.
pub struct SuspendedRegisters<'a> {
    id: ContextId,
    registers: MutexGuard<'a, RegisterFile>,
}

impl SavedContext for SuspendedRegisters<'_> {
    fn id(&self) -> ContextId {
        self.id
    }

    fn read(&self, reg: Register) -> usize {
        self.registers.get(reg)
    }

    fn write(&mut self, reg: Register, value: usize) {
        self.registers.set(reg, value);
    }
}

/// Fails if a frame of `frame_size` bytes placed at `rsp` would reach past
/// `stack_end`.
pub fn check_callee_stack(rsp: usize, frame_size: usize, stack_end: usize) -> Result<()> {
    match rsp.checked_add(frame_size) {
        Some(new_rsp) if new_rsp <= stack_end => Ok(()),
        _ => Err(Error::StackOverflow {
            rsp,
            frame: frame_size,
            limit: stack_end,
        }),
    }
}

pub struct MutatorContext {
    id: ContextId,
    name: String,
    pub(crate) state: Atomic<ThreadState>,
    registers: Mutex<RegisterFile>,
    stack_base: AtomicUsize,
    stack_size: AtomicUsize,
    barrier: Arc<Barrier>,
}

pub type MutatorRef = Arc<MutatorContext>;

impl MutatorContext {
    pub(crate) fn new(
        id: ContextId,
        name: String,
        state: ThreadState,
        barrier: Arc<Barrier>,
    ) -> Self {
        Self {
            id,
            name,
            state: Atomic::new(state),
            registers: Mutex::new(RegisterFile::default()),
            stack_base: AtomicUsize::new(0),
            stack_size: AtomicUsize::new(0),
            barrier,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub fn load(&self, reg: Register) -> usize {
        self.registers.lock().get(reg)
    }

    pub fn store(&self, reg: Register, value: usize) {
        self.registers.lock().set(reg, value);
    }

    pub fn registers(&self) -> RegisterFile {
        *self.registers.lock()
    }

    /// Records the stack this context runs on.
    pub fn set_stack(&self, base: usize, size: usize) {
        self.stack_base.store(base, Ordering::Relaxed);
        self.stack_size.store(size, Ordering::Release);
    }

    /// `(base, size)` of the stack, if one was recorded.
    pub fn stack(&self) -> Option<(usize, usize)> {
        let size = self.stack_size.load(Ordering::Acquire);
        if size == 0 {
            return None;
        }
        Some((self.stack_base.load(Ordering::Relaxed), size))
    }

    /// Checks that a callee frame of `frame_size` bytes fits on this
    /// context's stack, starting from its saved `rsp`. Contexts without a
    /// recorded stack always pass.
    pub fn check_callee_stack(&self, frame_size: usize) -> Result<()> {
        match self.stack() {
            Some((base, size)) => check_callee_stack(
                self.load(Register::Rsp),
                frame_size,
                base.saturating_add(size),
            ),
            None => Ok(()),
        }
    }

    pub(crate) fn suspended(&self) -> SuspendedRegisters<'_> {
        SuspendedRegisters {
            id: self.id,
            registers: self.registers.lock(),
        }
    }

    /// Safepoint poll. Blocks while a stop-the-world request is pending and
    /// returns true if it did.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.barrier.is_requested() {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        self.barrier.wait_in_safepoint(self);
    }

    /// Marks this context as not touching tracked memory. A stop request does
    /// not have to wait for a parked context.
    pub fn enter_parked(&self) {
        self.barrier.park(self);
    }

    /// Leaves the parked state, waiting first if the world is stopped.
    pub fn leave_parked(&self) {
        self.barrier.unpark(self);
    }

    /// Runs `f` parked.
    pub fn parked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_parked();
        let result = f();
        self.leave_parked();
        result
    }
}

impl fmt::Debug for MutatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rip_and_rsp_are_not_general_purpose() {
        assert!(!Register::Rip.is_general_purpose());
        assert!(!Register::Rsp.is_general_purpose());
        assert!(!Register::GENERAL_PURPOSE.contains(&Register::Rip));
        assert!(!Register::GENERAL_PURPOSE.contains(&Register::Rsp));
        assert!(Register::GENERAL_PURPOSE
            .iter()
            .all(|r| r.is_general_purpose()));
    }

    #[test]
    fn callee_frame_must_fit_the_stack() {
        assert_eq!(check_callee_stack(0x1000, 0x100, 0x2000), Ok(()));
        assert_eq!(check_callee_stack(0x1f00, 0x100, 0x2000), Ok(()));
        assert_eq!(
            check_callee_stack(0x1f00, 0x101, 0x2000),
            Err(Error::StackOverflow {
                rsp: 0x1f00,
                frame: 0x101,
                limit: 0x2000
            })
        );
        assert!(check_callee_stack(usize::MAX - 4, 8, usize::MAX).is_err());
    }

    #[test]
    fn register_file_roundtrip() {
        let mut file = RegisterFile::default();
        file.set(Register::R12, 0xdead);
        file.set(Register::Rsp, 0x7fff);
        assert_eq!(file.get(Register::R12), 0xdead);
        assert_eq!(file.get(Register::Rsp), 0x7fff);
        assert_eq!(file.get(Register::Rax), 0);
    }
}
