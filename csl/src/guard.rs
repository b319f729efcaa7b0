// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted resource guard
//!
//! The instance, every session, every KMD device and every acquired
//! device carries a [`RefGuard`]: a lifecycle state and a structural
//! reference count behind one mutex, plus a condition variable that wakes
//! the destroyer when the count drains.
//!
//! ```text
//!   Invalid ──► Valid ──► Destroying ──► Invalid
//!                 │  ▲
//!                 ▼  │        (sessions only)
//!                Flush
//!   any ──► Error
//! ```
//!
//! Operations take a reference for their duration with [`RefGuard::get_ref`]
//! and drop it with [`RefGuard::put_ref`]. Teardown calls
//! [`RefGuard::wait_for_zero`], which moves the object to `Destroying` so no
//! new reference can be taken, then blocks until in-flight ones are gone.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, error};
use serde::Serialize;

/// Lifecycle state shared by every guarded object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    #[default]
    Invalid,
    Valid,
    Destroying,
    Error,
    /// A flush is in progress on the session.
    Flush,
}

/// What a guard protects. Decides the transition and acceptance rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum GuardKind {
    Instance,
    Session,
    KmdDevice,
    AcquiredDevice,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardKind::Instance => "instance",
            GuardKind::Session => "session",
            GuardKind::KmdDevice => "kmd device",
            GuardKind::AcquiredDevice => "acquired device",
        };
        f.write_str(name)
    }
}

impl GuardKind {
    fn accepts_ref(self, state: LifecycleState) -> bool {
        match self {
            GuardKind::Session => {
                matches!(state, LifecycleState::Valid | LifecycleState::Flush)
            }
            _ => state == LifecycleState::Valid,
        }
    }

    fn can_enter(self, from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match self {
            GuardKind::Session => match to {
                Invalid | Error | Flush => true,
                Valid => matches!(from, Invalid | Flush),
                Destroying => matches!(from, Valid | Flush | Error),
            },
            _ => match to {
                Invalid | Error => true,
                Valid => from == Invalid,
                Destroying => from == Valid,
                Flush => false,
            },
        }
    }

    fn can_destroy(self, state: LifecycleState) -> bool {
        match self {
            GuardKind::Session => matches!(
                state,
                LifecycleState::Valid | LifecycleState::Flush | LifecycleState::Error
            ),
            _ => state == LifecycleState::Valid,
        }
    }
}

#[derive(Debug, Default)]
struct GuardState {
    state: LifecycleState,
    refcount: u32,
}

/// State plus reference count with a drain notification.
#[derive(Debug)]
pub struct RefGuard {
    kind: GuardKind,
    inner: Mutex<GuardState>,
    drained: Condvar,
}

impl RefGuard {
    /// A guard in `Invalid` with no references.
    pub fn new(kind: GuardKind) -> Self {
        RefGuard {
            kind,
            inner: Mutex::new(GuardState::default()),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> GuardKind {
        self.kind
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn refcount(&self) -> u32 {
        self.lock().refcount
    }

    /// Apply a state transition. Illegal transitions are logged and leave
    /// the state untouched.
    pub fn set_state(&self, next: LifecycleState) -> bool {
        let mut inner = self.lock();
        if self.kind.can_enter(inner.state, next) {
            inner.state = next;
            true
        } else {
            error!(
                "invalid {} state transition {:?} -> {next:?}",
                self.kind, inner.state
            );
            false
        }
    }

    /// Take a reference if the object accepts new users.
    pub fn get_ref(&self) -> bool {
        let mut inner = self.lock();
        if self.kind.accepts_ref(inner.state) {
            inner.refcount += 1;
            true
        } else {
            error!("invalid get on {} in state {:?}", self.kind, inner.state);
            false
        }
    }

    /// Drop a reference, waking a pending destroyer on the last one.
    pub fn put_ref(&self) {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Invalid {
            error!("invalid put on {} in state {:?}", self.kind, inner.state);
            return;
        }
        if inner.refcount == 0 {
            error!("{} refcount underflow", self.kind);
            return;
        }
        inner.refcount -= 1;
        if inner.refcount == 0 && inner.state == LifecycleState::Destroying {
            self.drained.notify_all();
        }
    }

    /// Move to `Destroying` and block until every reference is dropped.
    ///
    /// Returns false without touching the count when the object is already
    /// being destroyed or was never valid.
    pub fn wait_for_zero(&self) -> bool {
        if !self.begin_destroy() {
            return false;
        }
        self.wait_drained();
        true
    }

    /// Move to `Destroying` so no new reference can be taken, without
    /// waiting for the ones already out.
    pub fn begin_destroy(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Destroying {
            error!("{} already in destroying state", self.kind);
            return false;
        }
        if !self.kind.can_destroy(inner.state) {
            error!("cannot destroy {} in state {:?}", self.kind, inner.state);
            return false;
        }
        inner.state = LifecycleState::Destroying;
        true
    }

    /// Block until the reference count drains to zero.
    pub fn wait_drained(&self) {
        let mut inner = self.lock();
        if inner.refcount > 0 {
            debug!(
                "{} destroyed with {} reference(s) outstanding, waiting",
                self.kind, inner.refcount
            );
        }
        while inner.refcount > 0 {
            inner = self
                .drained
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Back to `Invalid` with no references, for slot reuse.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = LifecycleState::Invalid;
        inner.refcount = 0;
    }
}

/// Holds a reference on a guard for the lifetime of the value.
pub struct RefHold<'a> {
    guard: &'a RefGuard,
}

impl<'a> RefHold<'a> {
    pub fn acquire(guard: &'a RefGuard) -> Option<Self> {
        guard.get_ref().then_some(RefHold { guard })
    }
}

impl Drop for RefHold<'_> {
    fn drop(&mut self) {
        self.guard.put_ref();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn valid(kind: GuardKind) -> RefGuard {
        let guard = RefGuard::new(kind);
        assert!(guard.set_state(LifecycleState::Valid));
        guard
    }

    #[test]
    fn test_get_ref_requires_valid() {
        let guard = RefGuard::new(GuardKind::KmdDevice);
        assert!(!guard.get_ref());
        assert_eq!(guard.refcount(), 0);
        guard.set_state(LifecycleState::Valid);
        assert!(guard.get_ref());
        assert_eq!(guard.refcount(), 1);
    }

    #[test]
    fn test_session_accepts_refs_in_flush() {
        let session = valid(GuardKind::Session);
        assert!(session.set_state(LifecycleState::Flush));
        assert!(session.get_ref());

        let instance = valid(GuardKind::Instance);
        assert!(!instance.set_state(LifecycleState::Flush));
    }

    #[test]
    fn test_transition_rules() {
        let instance = RefGuard::new(GuardKind::Instance);
        assert!(!instance.set_state(LifecycleState::Destroying));
        assert!(instance.set_state(LifecycleState::Valid));
        assert!(!instance.set_state(LifecycleState::Valid));

        let session = valid(GuardKind::Session);
        assert!(session.set_state(LifecycleState::Error));
        assert!(session.set_state(LifecycleState::Destroying));
        assert!(!session.set_state(LifecycleState::Valid));
    }

    #[test]
    fn test_wait_for_zero_at_zero_returns_immediately() {
        for kind in [
            GuardKind::Instance,
            GuardKind::Session,
            GuardKind::KmdDevice,
            GuardKind::AcquiredDevice,
        ] {
            let guard = valid(kind);
            assert!(guard.wait_for_zero());
            assert_eq!(guard.state(), LifecycleState::Destroying);
        }
    }

    #[test]
    fn test_double_destroy_rejected() {
        let guard = valid(GuardKind::Session);
        assert!(guard.get_ref());
        guard.put_ref();
        assert!(guard.wait_for_zero());
        assert!(!guard.wait_for_zero());
        assert_eq!(guard.refcount(), 0);
    }

    #[test]
    fn test_wait_for_zero_blocks_until_drained() {
        let guard = Arc::new(valid(GuardKind::Session));
        assert!(guard.get_ref());

        let releaser = {
            let guard = guard.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                guard.put_ref();
            })
        };

        assert!(guard.wait_for_zero());
        assert_eq!(guard.refcount(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_session_in_error_can_be_destroyed() {
        let session = valid(GuardKind::Session);
        assert!(session.set_state(LifecycleState::Error));
        assert!(session.wait_for_zero());
        assert_eq!(session.state(), LifecycleState::Destroying);

        let device = valid(GuardKind::AcquiredDevice);
        assert!(device.set_state(LifecycleState::Error));
        assert!(!device.wait_for_zero());
    }

    #[test]
    fn test_begin_destroy_blocks_new_refs_before_draining() {
        let guard = Arc::new(valid(GuardKind::Instance));
        assert!(guard.get_ref());
        assert!(guard.begin_destroy());
        assert!(!guard.get_ref());

        let releaser = {
            let guard = guard.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                guard.put_ref();
            })
        };
        guard.wait_drained();
        assert_eq!(guard.refcount(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_no_new_refs_while_destroying() {
        let guard = valid(GuardKind::Instance);
        assert!(guard.wait_for_zero());
        assert!(!guard.get_ref());
    }

    #[test]
    fn test_ref_hold_releases_on_drop() {
        let guard = valid(GuardKind::AcquiredDevice);
        {
            let _hold = RefHold::acquire(&guard).unwrap();
            assert_eq!(guard.refcount(), 1);
        }
        assert_eq!(guard.refcount(), 0);
    }
}
