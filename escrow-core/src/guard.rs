//! Invocation-scoped reentrancy guard
//!
//! Every state-mutating entry point takes the guard on entry. A nested call
//! made while the guard is held (for example from a programmable asset's
//! transfer hook) fails immediately with [`Error::Reentrancy`]. Release is
//! tied to `Drop`, so early returns and errors always clear the flag.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive invocation flag
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    entered: AtomicBool,
}

/// Held for the duration of one invocation
#[derive(Debug)]
pub struct Entered<'a> {
    guard: &'a ReentrancyGuard,
}

impl ReentrancyGuard {
    /// Create released guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard or fail if an invocation is already active
    pub fn enter(&self) -> Result<Entered<'_>> {
        self.entered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Reentrancy)?;
        Ok(Entered { guard: self })
    }

    /// Whether an invocation is active
    pub fn is_entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.guard.entered.store(false, Ordering::Release);
    }
}
