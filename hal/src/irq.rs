//! # Interrupt Handling
//!
//! Handler trait and the per-line dispatch table used by platforms that
//! deliver interrupts in software (and by the simulator).
//!
//! Each line carries a fixed-capacity chain of handlers, so dispatch never
//! allocates. Dispatch holds the line lock for the whole chain walk and
//! [`IrqLineTable::unregister`] takes the same lock: once it returns, the
//! removed handler is not running and will not run again.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use pcidma_core::{Error, IrqLine, PciAddr, Result};
use spin::Mutex;
use static_assertions::const_assert;

/// Handlers allowed on one shared line
pub const MAX_SHARED_HANDLERS: usize = 8;

const_assert!(MAX_SHARED_HANDLERS >= 2);

// =============================================================================
// HANDLER
// =============================================================================

/// Outcome of one handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not raised by this handler's device
    NotMine,
    /// The interrupt was acknowledged
    Handled,
}

/// Interrupt-context handler
///
/// Runs with preemption restricted: must not block and must not allocate.
pub trait InterruptHandler: Send + Sync {
    /// Handle an interrupt on `line`
    fn handle(&self, line: IrqLine) -> IrqReturn;
}

bitflags::bitflags! {
    /// Interrupt request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line may be shared with other handlers
        const SHARED = 1 << 0;
    }
}

/// Registration cookie returned by `request_irq`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqCookie(u64);

impl IrqCookie {
    /// Raw cookie value
    pub const fn raw(self) -> u64 {
        self.0
    }
}

// =============================================================================
// LINE TABLE
// =============================================================================

struct IrqAction {
    cookie: IrqCookie,
    owner: PciAddr,
    flags: IrqFlags,
    handler: Arc<dyn InterruptHandler>,
}

impl fmt::Debug for IrqAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqAction")
            .field("cookie", &self.cookie)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct LineState {
    actions: ArrayVec<IrqAction, MAX_SHARED_HANDLERS>,
    handled: u64,
    spurious: u64,
}

/// Software interrupt dispatch table
#[derive(Debug)]
pub struct IrqLineTable {
    lines: Vec<Mutex<LineState>>,
    max_handlers: usize,
    next_cookie: AtomicU64,
}

impl IrqLineTable {
    /// Create a table with `nr_lines` lines of up to `max_handlers` each
    ///
    /// `max_handlers` is clamped to `1..=MAX_SHARED_HANDLERS`.
    pub fn new(nr_lines: u32, max_handlers: usize) -> Self {
        let lines = (0..nr_lines).map(|_| Mutex::new(LineState::default())).collect();
        Self {
            lines,
            max_handlers: max_handlers.clamp(1, MAX_SHARED_HANDLERS),
            next_cookie: AtomicU64::new(1),
        }
    }

    /// Handlers one line accepts
    pub fn max_handlers(&self) -> usize {
        self.max_handlers
    }

    /// Number of lines
    pub fn nr_lines(&self) -> u32 {
        self.lines.len() as u32
    }

    fn line(&self, line: IrqLine) -> Result<&Mutex<LineState>> {
        self.lines
            .get(line.raw() as usize)
            .ok_or(Error::InterruptUnavailable)
    }

    /// Attach a handler
    pub fn register(
        &self,
        owner: PciAddr,
        line: IrqLine,
        flags: IrqFlags,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<IrqCookie> {
        let mut state = self.line(line)?.lock();

        if !state.actions.is_empty() {
            let all_shared = state
                .actions
                .iter()
                .all(|a| a.flags.contains(IrqFlags::SHARED));
            if !all_shared || !flags.contains(IrqFlags::SHARED) {
                log::warn!("{:?}: requested by {} but held without sharing", line, owner);
                return Err(Error::AlreadyInUse);
            }
        }
        if state.actions.len() >= self.max_handlers {
            return Err(Error::InterruptUnavailable);
        }

        let cookie = IrqCookie(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        state.actions.push(IrqAction {
            cookie,
            owner,
            flags,
            handler,
        });
        Ok(cookie)
    }

    /// Detach a handler; returns `false` if the cookie was not registered
    ///
    /// Waits for any dispatch currently walking this line.
    pub fn unregister(&self, line: IrqLine, cookie: IrqCookie) -> bool {
        let Ok(slot) = self.line(line) else {
            return false;
        };
        let mut state = slot.lock();
        match state.actions.iter().position(|a| a.cookie == cookie) {
            Some(pos) => {
                state.actions.remove(pos);
                true
            },
            None => false,
        }
    }

    /// Deliver one interrupt on `line` to every attached handler
    pub fn dispatch(&self, line: IrqLine) -> IrqReturn {
        let Ok(slot) = self.line(line) else {
            return IrqReturn::NotMine;
        };
        let mut state = slot.lock();

        let mut result = IrqReturn::NotMine;
        for action in state.actions.iter() {
            if action.handler.handle(line) == IrqReturn::Handled {
                result = IrqReturn::Handled;
            }
        }

        match result {
            IrqReturn::Handled => state.handled += 1,
            IrqReturn::NotMine => state.spurious += 1,
        }
        result
    }

    /// Handlers currently attached to `line`
    pub fn handler_count(&self, line: IrqLine) -> usize {
        self.line(line).map(|s| s.lock().actions.len()).unwrap_or(0)
    }

    /// Handlers attached on behalf of `owner`, across all lines
    pub fn owned_by(&self, owner: PciAddr) -> usize {
        self.lines
            .iter()
            .map(|s| s.lock().actions.iter().filter(|a| a.owner == owner).count())
            .sum()
    }

    /// Interrupts on `line` that no handler claimed
    pub fn spurious_count(&self, line: IrqLine) -> u64 {
        self.line(line).map(|s| s.lock().spurious).unwrap_or(0)
    }

    /// Interrupts on `line` that some handler claimed
    pub fn handled_count(&self, line: IrqLine) -> u64 {
        self.line(line).map(|s| s.lock().handled).unwrap_or(0)
    }
}
