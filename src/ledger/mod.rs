//! Entitlement ledger: the authoritative per-user records.
//!
//! [`Ledger`] pairs a [`LedgerStore`] with per-user locks. Every mutation
//! (usage consumption, billing reconciliation, sign-in, the read-path monthly
//! reset) goes through [`Ledger::update`], which re-reads the record under the
//! user's lock before changing it.

mod error;
mod file_store;
mod locks;
pub(crate) mod snapshot;
pub mod storage;

use std::sync::Arc;

pub use error::LedgerError;
pub use file_store::FileLedgerStore;
pub use locks::KeyedLocks;
pub use storage::LedgerStore;

#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryLedgerStore;

use crate::clock::{Clock, SystemClock};
use crate::entitlements::EntitlementRecord;
use crate::error::{Result, TierwiseError};

/// Result of a sign-in.
#[derive(Debug, Clone)]
pub struct SignIn {
    pub record: EntitlementRecord,
    /// True if this sign-in created the record.
    pub created: bool,
}

/// A mutation that reached the store.
#[derive(Debug)]
pub struct Applied<T> {
    pub record: EntitlementRecord,
    pub value: T,
    /// Set when the store kept the change in memory but could not persist it.
    pub write_error: Option<LedgerError>,
}

/// Store plus per-user serialization.
#[derive(Clone)]
pub struct Ledger<S: LedgerStore> {
    store: S,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> Ledger<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            clock,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<EntitlementRecord>> {
        self.store.get(user_id).await
    }

    /// Create the record on first sign-in; refresh the login time after that.
    pub async fn sign_in(
        &self,
        identity: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<SignIn> {
        let _guard = self.locks.lock(identity).await;
        let now = self.clock.now();

        match self.store.get(identity).await? {
            Some(mut record) => {
                record.last_login_at = now;
                record.updated_at = now;
                if record.display_name.is_none() {
                    record.display_name = display_name.map(String::from);
                }
                self.store.put(&record).await?;
                Ok(SignIn {
                    record,
                    created: false,
                })
            }
            None => {
                let record = EntitlementRecord::new(
                    identity,
                    email,
                    display_name.map(String::from),
                    now,
                );
                self.store.put(&record).await?;
                tracing::info!(
                    target: "tierwise::ledger",
                    user_id = %identity,
                    "Created entitlement record"
                );
                Ok(SignIn {
                    record,
                    created: true,
                })
            }
        }
    }

    /// Apply `f` to the user's record under their lock.
    ///
    /// Returns `None` if there is no record. The record is written back only
    /// if `f` changed it, with `updated_at` refreshed. An error from `f`
    /// leaves the stored record untouched. A failed snapshot write is an
    /// error here even though the change is held in memory; callers that
    /// must not re-run `f` use [`Ledger::update_applied`].
    pub async fn update<T, F>(&self, user_id: &str, f: F) -> Result<Option<(EntitlementRecord, T)>>
    where
        F: FnOnce(&mut EntitlementRecord) -> Result<T> + Send,
        T: Send,
    {
        match self.update_applied(user_id, f).await? {
            None => Ok(None),
            Some(Applied {
                write_error: Some(err),
                ..
            }) => Err(err.into()),
            Some(Applied { record, value, .. }) => Ok(Some((record, value))),
        }
    }

    /// Like [`Ledger::update`], but a failed snapshot write still counts as applied.
    ///
    /// Stores keep a change in memory when persisting it fails, so by the time
    /// [`LedgerError::PersistenceWriteFailure`] comes back the mutation has
    /// happened. The error is handed back in [`Applied::write_error`] for the
    /// caller to report; running `f` again would apply it twice.
    pub async fn update_applied<T, F>(&self, user_id: &str, f: F) -> Result<Option<Applied<T>>>
    where
        F: FnOnce(&mut EntitlementRecord) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.locks.lock(user_id).await;

        let Some(current) = self.store.get(user_id).await? else {
            return Ok(None);
        };
        let mut next = current.clone();
        let value = f(&mut next)?;

        let mut write_error = None;
        if next != current {
            next.updated_at = self.clock.now();
            match self.store.put(&next).await {
                Ok(()) => {}
                Err(TierwiseError::Ledger(err @ LedgerError::PersistenceWriteFailure { .. })) => {
                    tracing::error!(
                        target: "tierwise::ledger",
                        user_id = %user_id,
                        error = %err,
                        "Record updated in memory only"
                    );
                    write_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(Applied {
            record: next,
            value,
            write_error,
        }))
    }
}
