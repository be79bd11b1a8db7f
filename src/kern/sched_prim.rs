//! Next-PC recovery for a thread that is not running
//!
//! A switched-out thread's saved kernel context points into `Switch_context`,
//! which only `thread_invoke` calls. `thread_invoke` in turn is entered from
//! a small, fixed set of callers (`thread_run`, `thread_block_reason`), so
//! the interesting next pc sits at a known slot of the caller's frame. The
//! caller is identified by the link register `thread_invoke` saved.
//!
//! ```text
//!   kernel_stack ──► saved state ──sp──► thread_invoke frame
//!                                          +stored_link : return into caller
//!                                        caller frame (sp + frame_size)
//!                                          +next_pc_slot : candidate pc
//!                                          +x21_slot     : exception frame
//! ```
//!
//! When the candidate is `exception_return`, the thread was preempted out of
//! an exception and the real pc lives in the exception frame held in x21.
//!
//! Every failure here is an expected outcome (threads caught while being
//! created or torn down); the result is [`NextPc::Unknown`], never an error.

use core::fmt;

use log::{debug, warn};

use crate::arch::aarch64::SavedRegisterState;
use crate::error::{IntrospectError, Result};
use crate::kern::thread::Thread;
use crate::layout::{CallerLandmark, Layout};
use crate::memory::MemoryReader;
use crate::types::{Field, KAddr};

// ============================================================================
// Recovery Result
// ============================================================================

/// Why a next pc could not be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    /// Neither running, nor holding a user context or kernel stack
    NoLocator,
    /// A frame or saved state needed by the unwind could not be read
    UnreadableFrame { address: KAddr },
    /// The saved link matches no known caller of `thread_invoke`
    UnknownCaller { sp: KAddr, observed: KAddr },
    /// Returning through `exception_return` with no exception frame in x21
    NullExceptionFrame { sp: KAddr },
    /// The thread is running but the live pc could not be evaluated
    CurrentPcUnavailable,
    /// The running thread is unknown, so a saved kernel frame may be stale
    CurrentThreadUnknown,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unresolved::NoLocator => write!(f, "no user context or kernel stack"),
            Unresolved::UnreadableFrame { address } => {
                write!(f, "frame at {} unreadable", address)
            }
            Unresolved::UnknownCaller { sp, observed } => write!(
                f,
                "saved link {} in frame at {} matches no known caller",
                observed, sp
            ),
            Unresolved::NullExceptionFrame { sp } => {
                write!(f, "exception return without saved state (frame at {})", sp)
            }
            Unresolved::CurrentPcUnavailable => write!(f, "live pc unavailable"),
            Unresolved::CurrentThreadUnknown => {
                write!(f, "current thread unknown, kernel frame may be stale")
            }
        }
    }
}

/// Three-state next-pc result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPc {
    Address(KAddr),
    Unknown(Unresolved),
    /// No thread to recover for
    NotApplicable,
}

impl NextPc {
    pub fn address(&self) -> Option<KAddr> {
        match self {
            NextPc::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, NextPc::Unknown(_))
    }

    /// Convert for callers that want `?`; `Unknown` becomes
    /// [`IntrospectError::UnresolvedControlFlow`]
    pub fn into_result(self, thread: KAddr) -> Result<Option<KAddr>> {
        match self {
            NextPc::Address(a) => Ok(Some(a)),
            NextPc::NotApplicable => Ok(None),
            NextPc::Unknown(reason) => Err(IntrospectError::UnresolvedControlFlow { thread, reason }),
        }
    }
}

impl fmt::Display for NextPc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextPc::Address(a) => a.fmt(f),
            NextPc::Unknown(_) => write!(f, "unknown"),
            NextPc::NotApplicable => write!(f, "N/A"),
        }
    }
}

// ============================================================================
// Current Thread
// ============================================================================

/// Which thread the inspected cpu is executing, as far as the target says
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentThread {
    /// Value of the current-thread register; NULL when idle
    Known(KAddr),
    /// The current-thread register could not be evaluated
    Unavailable,
}

impl CurrentThread {
    /// Evaluate the layout's current-thread register once
    pub fn evaluate<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout) -> Self {
        match mem.evaluate(&layout.registers.current_thread) {
            Ok(raw) => CurrentThread::Known(KAddr(raw)),
            Err(e) => {
                warn!(
                    "{} unavailable, kernel-stack next pcs will be unknown: {}",
                    layout.registers.current_thread, e
                );
                CurrentThread::Unavailable
            }
        }
    }

    pub fn address(self) -> Option<KAddr> {
        match self {
            CurrentThread::Known(a) => a.non_null(),
            CurrentThread::Unavailable => None,
        }
    }

    /// `Some(true)` when `thread` is running, `None` when that cannot be told
    pub fn is(self, thread: KAddr) -> Option<bool> {
        match self {
            CurrentThread::Known(a) => Some(a == thread),
            CurrentThread::Unavailable => None,
        }
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Recover the address `thread` will execute next
///
/// When `current` is unavailable a running thread cannot be told apart from
/// a switched-out one. The user context still holds the pc of the next
/// return to user space, but a saved kernel frame may be stale, so the
/// kernel-stack unwind is not attempted.
pub fn recover_next_pc<M: MemoryReader + ?Sized>(
    mem: &M,
    layout: &Layout,
    thread: Option<&Thread>,
    current: CurrentThread,
) -> NextPc {
    let Some(thread) = thread else {
        return NextPc::NotApplicable;
    };

    let running = current.is(thread.address);
    if running == Some(true) {
        return match mem.evaluate(&layout.registers.pc) {
            Ok(pc) => NextPc::Address(KAddr(pc)),
            Err(e) => {
                warn!("thread {}: running but {} failed: {}", thread.address, layout.registers.pc, e);
                NextPc::Unknown(Unresolved::CurrentPcUnavailable)
            }
        };
    }

    let outcome = match (thread.user_context, thread.kernel_stack) {
        (Field::Unreadable(address), _) => Err(Unresolved::UnreadableFrame { address }),
        (Field::Known(uctx), _) if !uctx.is_null() => saved_pc(mem, layout, uctx),
        (_, Field::Unreadable(address)) => Err(Unresolved::UnreadableFrame { address }),
        (_, Field::Known(kstack)) if !kstack.is_null() => match running {
            Some(_) => unwind_kernel_stack(mem, layout, kstack),
            None => Err(Unresolved::CurrentThreadUnknown),
        },
        _ => Err(Unresolved::NoLocator),
    };

    match outcome {
        Ok(pc) => NextPc::Address(pc),
        Err(reason) => {
            debug!("thread {}: next pc unknown: {}", thread.address, reason);
            NextPc::Unknown(reason)
        }
    }
}

fn saved_pc<M: MemoryReader + ?Sized>(
    mem: &M,
    layout: &Layout,
    state: KAddr,
) -> core::result::Result<KAddr, Unresolved> {
    match SavedRegisterState::decode(mem, layout, state).map(|s| s.pc_addr()) {
        Some(Field::Known(pc)) => Ok(pc),
        Some(Field::Unreadable(address)) => Err(Unresolved::UnreadableFrame { address }),
        None => Err(Unresolved::NoLocator),
    }
}

/// Where the candidate next pc lives for a matched caller
fn caller_for(layout: &Layout, link: KAddr) -> Option<&CallerLandmark> {
    layout.next_pc.callers.iter().find(|c| c.return_address == link)
}

fn read_frame_ptr<M: MemoryReader + ?Sized>(
    mem: &M,
    addr: KAddr,
) -> core::result::Result<KAddr, Unresolved> {
    mem.read_ptr(addr).map_err(|e| {
        debug!("unwind read at {} failed: {}", addr, e);
        Unresolved::UnreadableFrame { address: addr }
    })
}

fn unwind_kernel_stack<M: MemoryReader + ?Sized>(
    mem: &M,
    layout: &Layout,
    kernel_stack: KAddr,
) -> core::result::Result<KAddr, Unresolved> {
    let landmarks = &layout.next_pc;

    let sp = match SavedRegisterState::decode(mem, layout, kernel_stack).map(|s| s.sp_addr()) {
        Some(Field::Known(sp)) => sp,
        Some(Field::Unreadable(address)) => return Err(Unresolved::UnreadableFrame { address }),
        None => return Err(Unresolved::NoLocator),
    };

    let link = read_frame_ptr(mem, sp.offset(landmarks.stored_link))?;
    let caller = caller_for(layout, link).ok_or(Unresolved::UnknownCaller { sp, observed: link })?;

    let caller_frame = sp.offset(landmarks.frame_size);
    let candidate = read_frame_ptr(mem, caller_frame.offset(caller.next_pc_slot))?;
    debug!("unwind: via {} at {}, candidate {}", caller.name, sp, candidate);

    if candidate != landmarks.exception_return {
        return Ok(candidate);
    }

    let exception_frame = read_frame_ptr(mem, caller_frame.offset(landmarks.x21_slot))?;
    if exception_frame.is_null() {
        return Err(Unresolved::NullExceptionFrame { sp });
    }
    saved_pc(mem, layout, exception_frame)
}
