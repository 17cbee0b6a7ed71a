//! Physical transactions
//!
//! A [`PhysicalTransaction`] owns one driver transaction and counts the
//! logical transactions riding on it. It completes at most once: the first
//! commit or rollback consumes the driver handle and every later attempt is
//! rejected.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backends::{BeginOptions, DatabaseTransaction};
use crate::error::{TxError, TxResult};

/// Lifecycle of a physical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalState {
    Active,
    Committed,
    RolledBack,
}

impl PhysicalState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PhysicalState::Committed,
            2 => PhysicalState::RolledBack,
            _ => PhysicalState::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PhysicalState::Active => 0,
            PhysicalState::Committed => 1,
            PhysicalState::RolledBack => 2,
        }
    }
}

/// Reference counted wrapper around one driver transaction
pub struct PhysicalTransaction {
    label: String,
    options: BeginOptions,
    handle: Mutex<Option<Box<dyn DatabaseTransaction>>>,
    ref_count: AtomicU32,
    state: AtomicU8,
}

impl PhysicalTransaction {
    pub(crate) fn new(label: String, options: BeginOptions, handle: Box<dyn DatabaseTransaction>) -> Self {
        Self {
            label,
            options,
            handle: Mutex::new(Some(handle)),
            ref_count: AtomicU32::new(0),
            state: AtomicU8::new(PhysicalState::Active.as_u8()),
        }
    }

    /// Options the transaction was opened with
    pub fn options(&self) -> &BeginOptions {
        &self.options
    }

    pub fn state(&self) -> PhysicalState {
        PhysicalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_done(&self) -> bool {
        self.state() != PhysicalState::Active
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Register one more logical transaction; returns the new count
    pub(crate) fn retain(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference, never going below zero; returns the remaining count
    pub(crate) fn release(&self) -> u32 {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| Some(count.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Forget every reference at once
    pub(crate) fn release_all(&self) {
        self.ref_count.swap(0, Ordering::SeqCst);
    }

    /// Lock the driver handle for a statement
    pub(crate) async fn lock(&self) -> Option<MappedMutexGuard<'_, Box<dyn DatabaseTransaction>>> {
        let guard = self.handle.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).ok()
    }

    /// Move from `Active` to `target` and hand out the driver handle.
    /// Only the first caller gets it.
    async fn complete(&self, target: PhysicalState) -> TxResult<Box<dyn DatabaseTransaction>> {
        let mut slot = self.handle.lock().await;
        self.state
            .compare_exchange(
                PhysicalState::Active.as_u8(),
                target.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| TxError::invalid_state(self))?;
        slot.take().ok_or_else(|| TxError::invalid_state(self))
    }

    pub(crate) async fn commit(&self) -> TxResult<()> {
        let handle = self.complete(PhysicalState::Committed).await?;
        handle.commit().await?;
        debug!("{} committed", self);
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> TxResult<()> {
        let handle = self.complete(PhysicalState::RolledBack).await?;
        handle.rollback().await?;
        debug!("{} rolled back", self);
        Ok(())
    }

    /// Give up on the transaction without awaiting the driver.
    ///
    /// The handle is dropped, which makes the driver roll back. When a
    /// statement still holds the handle it is released together with the
    /// last reference to this value instead.
    pub(crate) fn abandon(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                PhysicalState::Active.as_u8(),
                PhysicalState::RolledBack.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !transitioned {
            return false;
        }

        self.release_all();
        match self.handle.try_lock() {
            Ok(mut slot) => drop(slot.take()),
            Err(_) => warn!("{} is busy; rollback deferred until it is released", self),
        }
        true
    }
}

impl fmt::Display for PhysicalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "physical-{}", self.label)
    }
}

impl fmt::Debug for PhysicalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalTransaction")
            .field("label", &self.label)
            .field("options", &self.options)
            .field("ref_count", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DatabasePool, MemoryBackend, MemoryEvent};

    async fn open(backend: &MemoryBackend) -> PhysicalTransaction {
        let handle = backend.begin_transaction(&BeginOptions::default()).await.unwrap();
        PhysicalTransaction::new("test".to_string(), BeginOptions::default(), handle)
    }

    #[tokio::test]
    async fn test_ref_count_never_goes_negative() {
        let backend = MemoryBackend::new();
        let physical = open(&backend).await;

        assert_eq!(physical.retain(), 1);
        assert_eq!(physical.retain(), 2);
        assert_eq!(physical.release(), 1);
        assert_eq!(physical.release(), 0);
        assert_eq!(physical.release(), 0);
        assert_eq!(physical.ref_count(), 0);

        physical.retain();
        physical.retain();
        physical.release_all();
        assert_eq!(physical.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_completes_only_once() {
        let backend = MemoryBackend::new();
        let physical = open(&backend).await;

        physical.commit().await.unwrap();
        assert_eq!(physical.state(), PhysicalState::Committed);

        assert!(physical.commit().await.unwrap_err().is_invalid_state());
        assert!(physical.rollback().await.unwrap_err().is_invalid_state());
        assert!(!physical.abandon());
        assert!(physical.lock().await.is_none());

        let stats = backend.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 0);
    }

    #[tokio::test]
    async fn test_double_rollback_hits_driver_once() {
        let backend = MemoryBackend::new();
        let physical = open(&backend).await;

        physical.rollback().await.unwrap();
        assert!(physical.rollback().await.unwrap_err().is_invalid_state());
        assert_eq!(backend.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_abandon_drops_handle() {
        let backend = MemoryBackend::new();
        let physical = open(&backend).await;
        physical.retain();

        assert!(physical.abandon());
        assert_eq!(physical.state(), PhysicalState::RolledBack);
        assert_eq!(physical.ref_count(), 0);
        assert!(backend.events().contains(&MemoryEvent::Dropped { tx: 1 }));
    }

    #[tokio::test]
    async fn test_driver_errors_pass_through() {
        let backend = MemoryBackend::new();
        backend.fail_rollback("connection reset");
        let physical = open(&backend).await;

        let err = physical.rollback().await.unwrap_err();
        assert_eq!(err, TxError::Rollback("connection reset".to_string()));
        assert!(physical.is_done());
    }
}
