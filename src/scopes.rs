//! Scope-level bookkeeping: single-writer locks per scope, and the reconciliation of declared
//! scopes against what the store and local cache still hold.

use parking_lot::Mutex;
use std::{collections::BTreeMap, collections::BTreeSet, io::ErrorKind, path::Path, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    config::PipelineConfig, db::DbConnection, error::ForceError, event::ForceEvent,
    properties::Scope,
};

/// One async lock per scope. Batches for different scopes proceed in parallel; two batches
/// for the same scope queue up behind each other.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: Mutex<BTreeMap<Scope, Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, scope: &Scope) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock several scopes, always in sorted order so concurrent callers cannot deadlock.
    pub async fn lock_all<'a, I>(&self, scopes: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a Scope>,
    {
        let sorted: BTreeSet<&Scope> = scopes.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for scope in sorted {
            guards.push(self.lock(scope).await);
        }
        guards
    }
}

/// What one scope sync pass removed, and what it could not.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScopeSyncReport {
    pub removed_scopes: Vec<Scope>,
    pub removed_controllers: Vec<String>,
    /// Cleanup failures, keyed by the scope or controller they hit. The pass continues past
    /// each of them; whatever failed is retried on the next pass.
    pub failures: Vec<(String, ForceError)>,
    pub events: Vec<ForceEvent>,
}

impl ScopeSyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// `(persisted scopes - declared scopes, persisted controllers - declared controllers)`.
/// A controller counts as declared only while at least one of its scopes is.
pub fn stale_scopes(
    declared: &BTreeSet<Scope>,
    persisted_scopes: &BTreeSet<Scope>,
    persisted_controllers: &BTreeSet<String>,
) -> (Vec<Scope>, Vec<String>) {
    let declared_controllers: BTreeSet<&str> =
        declared.iter().map(|s| s.controller.as_str()).collect();
    let scopes = persisted_scopes.difference(declared).cloned().collect();
    let controllers = persisted_controllers
        .iter()
        .filter(|c| !declared_controllers.contains(c.as_str()))
        .cloned()
        .collect();
    (scopes, controllers)
}

pub struct ScopeReconciler<'a> {
    db: &'a DbConnection,
    config: &'a PipelineConfig,
    locks: &'a ScopeLocks,
}

impl<'a> ScopeReconciler<'a> {
    pub fn new(db: &'a DbConnection, config: &'a PipelineConfig, locks: &'a ScopeLocks) -> Self {
        ScopeReconciler { db, config, locks }
    }

    /// Reconcile the configuration's declared scopes against the store.
    pub async fn sync(&self) -> Result<ScopeSyncReport, ForceError> {
        let persisted_scopes = self.db.persisted_scopes().await?;
        let persisted_controllers = self.db.persisted_controllers().await?;
        Ok(self
            .reconcile(
                &self.config.declared_scopes(),
                &persisted_scopes,
                &persisted_controllers,
            )
            .await)
    }

    /// Remove everything persisted or cached for scopes and controllers no longer declared.
    ///
    /// Scope cleanup runs before controller cleanup, and for each target the local files go
    /// before the store rows. A target whose file cleanup fails keeps its store rows.
    #[tracing::instrument(skip_all)]
    pub async fn reconcile(
        &self,
        declared: &BTreeSet<Scope>,
        persisted_scopes: &BTreeSet<Scope>,
        persisted_controllers: &BTreeSet<String>,
    ) -> ScopeSyncReport {
        let (stale, stale_controllers) =
            stale_scopes(declared, persisted_scopes, persisted_controllers);
        let mut report = ScopeSyncReport::default();

        for scope in stale {
            let _guard = self.locks.lock(&scope).await;
            match self.remove_scope(&scope).await {
                Ok(event) => {
                    tracing::info!("Removed undeclared scope {}", scope);
                    report.events.push(event);
                    report.removed_scopes.push(scope);
                }
                Err(e) => {
                    tracing::warn!("Could not remove scope {}: {}", scope, e);
                    report.failures.push((scope.to_string(), e));
                }
            }
        }

        for controller in stale_controllers {
            let owned: Vec<&Scope> = persisted_scopes
                .iter()
                .filter(|s| s.controller == controller)
                .collect();
            let _guards = self.locks.lock_all(owned).await;
            match self.remove_controller(&controller).await {
                Ok(event) => {
                    tracing::info!("Removed undeclared controller {}", controller);
                    report.events.push(event);
                    report.removed_controllers.push(controller);
                }
                Err(e) => {
                    tracing::warn!("Could not remove controller {}: {}", controller, e);
                    report.failures.push((controller, e));
                }
            }
        }
        report
    }

    async fn remove_scope(&self, scope: &Scope) -> Result<ForceEvent, ForceError> {
        remove_file_if_present(&self.config.dump_path(scope)).await?;
        self.db.remove_scope(scope).await
    }

    async fn remove_controller(&self, controller: &str) -> Result<ForceEvent, ForceError> {
        let dir = self.config.controller_dir(controller);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!("Deleted cache directory {:?}", dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.db.remove_controller(controller).await
    }
}

async fn remove_file_if_present(path: &Path) -> Result<(), ForceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!("Deleted cached dump {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
