//! Modeset locking
//!
//! A transaction takes the lock of every object it touches through one
//! acquire context. Locks are only ever try-acquired: when one is held by
//! another context the caller gets [`GfxError::LockContention`], must drop
//! everything it holds ([`ModesetLockDomain::backoff`]) and start its
//! transaction over. The backoff waits for the contended lock with nothing
//! else held, so two contexts can never wait on each other.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::object::{CrtcId, PlaneId};
use crate::error::{GfxError, GfxResult};

/// One lock in the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModesetLockId {
    /// Guards connector states and routing
    ConnectionMutex,
    Crtc(CrtcId),
    Plane(PlaneId),
}

/// Locks held by one transaction.
#[derive(Debug)]
pub struct AcquireCtx {
    id: u64,
    held: Vec<ModesetLockId>,
    contended: Option<ModesetLockId>,
}

impl AcquireCtx {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            held: Vec::new(),
            contended: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn held(&self) -> &[ModesetLockId] {
        &self.held
    }

    pub fn holds(&self, lock: ModesetLockId) -> bool {
        self.held.contains(&lock)
    }

    /// Lock whose contention caused the last failure.
    pub fn contended(&self) -> Option<ModesetLockId> {
        self.contended
    }

    pub(crate) fn note_acquired(&mut self, lock: ModesetLockId) {
        self.held.push(lock);
    }

    pub(crate) fn note_contended(&mut self, lock: ModesetLockId) {
        self.contended = Some(lock);
    }

    pub(crate) fn take_held(&mut self) -> Vec<ModesetLockId> {
        core::mem::take(&mut self.held)
    }

    pub(crate) fn take_contended(&mut self) -> Option<ModesetLockId> {
        self.contended.take()
    }
}

pub trait ModesetLockDomain: Send + Sync {
    fn new_ctx(&self) -> AcquireCtx;

    /// Take `lock` for `ctx`. Already holding it is not an error.
    fn lock(&self, ctx: &mut AcquireCtx, lock: ModesetLockId) -> GfxResult<()>;

    fn release_all(&self, ctx: &mut AcquireCtx);

    /// Drop every lock of `ctx`, then wait for the one that was contended.
    fn backoff(&self, ctx: &mut AcquireCtx);

    fn is_locked(&self, lock: ModesetLockId) -> bool;
}

/// Lock domain backed by a spinlock-protected owner table.
#[derive(Debug, Default)]
pub struct SpinLockDomain {
    owners: Mutex<BTreeMap<ModesetLockId, u64>>,
    next_ctx: AtomicU64,
}

impl SpinLockDomain {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, ctx: &mut AcquireCtx, lock: ModesetLockId) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(&lock) {
            Some(&owner) => owner == ctx.id,
            None => {
                owners.insert(lock, ctx.id);
                ctx.note_acquired(lock);
                true
            }
        }
    }
}

impl ModesetLockDomain for SpinLockDomain {
    fn new_ctx(&self) -> AcquireCtx {
        AcquireCtx::new(self.next_ctx.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self, ctx: &mut AcquireCtx, lock: ModesetLockId) -> GfxResult<()> {
        if self.try_take(ctx, lock) {
            return Ok(());
        }
        log::debug!("modeset lock {:?} contended, backing off", lock);
        ctx.note_contended(lock);
        Err(GfxError::LockContention)
    }

    fn release_all(&self, ctx: &mut AcquireCtx) {
        let held = ctx.take_held();
        if held.is_empty() {
            return;
        }
        let mut owners = self.owners.lock();
        for lock in held {
            owners.remove(&lock);
        }
    }

    fn backoff(&self, ctx: &mut AcquireCtx) {
        self.release_all(ctx);
        if let Some(lock) = ctx.take_contended() {
            while !self.try_take(ctx, lock) {
                core::hint::spin_loop();
            }
        }
    }

    fn is_locked(&self, lock: ModesetLockId) -> bool {
        self.owners.lock().contains_key(&lock)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_context_contends() {
        let domain = SpinLockDomain::new();
        let mut a = domain.new_ctx();
        let mut b = domain.new_ctx();
        let crtc = ModesetLockId::Crtc(CrtcId(0));

        domain.lock(&mut a, crtc).unwrap();
        domain.lock(&mut a, crtc).unwrap();
        assert_eq!(a.held().len(), 1);

        assert_eq!(domain.lock(&mut b, crtc), Err(GfxError::LockContention));
        assert_eq!(b.contended(), Some(crtc));

        domain.release_all(&mut a);
        assert!(!domain.is_locked(crtc));

        domain.backoff(&mut b);
        assert!(b.holds(crtc));
        assert!(domain.is_locked(crtc));
        domain.release_all(&mut b);
        assert!(!domain.is_locked(crtc));
    }
}
