//! # Force pipeline
//!
//! [`ForcePipeline`] drives one ingestion cycle:
//!
//! 1. **Fetch**: the [`DumpTransport`] copies each controller's dumps into the local cache.
//! 2. **Parse**: every cached `{controller}_{resource}.dat` is split into rows and its
//!    identifiers decoded to canonical bit names.
//! 3. **Match**: names are looked up in the controller's reference metadata in bounded chunks.
//! 4. **Decode**: raw value words become typed values.
//! 5. **Reconcile**: the scope's batch is diffed against the store and written atomically.
//!
//! Steps 2-5 run once per scope, under that scope's lock. Scopes of all controllers run
//! concurrently, and a failing scope or controller is reported without stopping the others.
//!
//! ```rust,no_run
//! use forcewatch::{
//!     config::{ConfigProvider, TomlConfigProvider},
//!     db::{db_init, DbConnection},
//!     metadata::SqliteMetadataSource,
//!     pipeline::ForcePipeline,
//!     properties::now_secs,
//!     transport::MirrorTransport,
//! };
//! use std::{path::PathBuf, sync::Arc};
//!
//! # async fn example() -> Result<(), forcewatch::ForceError> {
//! let config = TomlConfigProvider::new(PathBuf::from("forcewatch.toml")).get_config()?;
//! let db = DbConnection(db_init(&config.store_path).await?);
//! let source = SqliteMetadataSource::connect(&config).await?;
//! let pipeline = ForcePipeline::new(
//!     Arc::new(config),
//!     db,
//!     source,
//!     MirrorTransport::new("/mnt/controllers"),
//! );
//!
//! let report = pipeline.run_all(now_secs()).await;
//! for (target, error) in report.failures.iter() {
//!     eprintln!("{target}: {error}");
//! }
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    codec::{decode_all, decode_row, DumpParser, DumpRow},
    config::PipelineConfig,
    db::DbConnection,
    error::ForceError,
    event::{ForceEvent, ScopeSummary},
    metadata::{MetadataMatcher, MetadataSource},
    properties::Scope,
    reconcile::ScopeBatch,
    scopes::{ScopeLocks, ScopeReconciler, ScopeSyncReport},
    transport::{cached_scopes, DumpTransport},
};

/// Outcome of a multi-scope run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub summaries: Vec<ScopeSummary>,
    /// Failed scopes (`controller/resource`) or controllers (fetch failures), with the error.
    pub failures: Vec<(String, ForceError)>,
}

impl RunReport {
    fn merge(&mut self, other: RunReport) {
        self.summaries.extend(other.summaries);
        self.failures.extend(other.failures);
    }
}

pub struct ForcePipeline<S, T> {
    config: Arc<PipelineConfig>,
    db: DbConnection,
    source: S,
    transport: T,
    locks: Arc<ScopeLocks>,
    tx: Option<UnboundedSender<ForceEvent>>,
}

impl<S, T> ForcePipeline<S, T>
where
    S: MetadataSource,
    T: DumpTransport,
{
    pub fn new(config: Arc<PipelineConfig>, db: DbConnection, source: S, transport: T) -> Self {
        ForcePipeline {
            config,
            db,
            source,
            transport,
            locks: Arc::new(ScopeLocks::new()),
            tx: None,
        }
    }

    /// Forward every committed [`ForceEvent`] to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<ForceEvent>) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Share scope locks with another pipeline over the same store.
    pub fn with_locks(mut self, locks: Arc<ScopeLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    /// Process the cached dump of `scope`.
    pub async fn run_scope(&self, scope: &Scope, now: i64) -> Result<ScopeSummary, ForceError> {
        let path = self.config.dump_path(scope);
        self.ingest_file(scope, path, now).await
    }

    /// Parse, match, decode and reconcile one dump file as the complete batch for `scope`.
    ///
    /// Nothing is written unless every step before reconciliation succeeded. A missing or
    /// unreadable file is an error for the scope, never an empty batch, and so is a lookup
    /// where every chunk failed. Bits from individually failed chunks keep their state.
    #[tracing::instrument(skip(self, scope, path), fields(scope = %scope))]
    pub async fn ingest_file(
        &self,
        scope: &Scope,
        path: PathBuf,
        now: i64,
    ) -> Result<ScopeSummary, ForceError> {
        let _guard = self.locks.lock(scope).await;

        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<DumpRow>, ForceError> {
            DumpParser::open(&path)?
                .map(|row| row.map(decode_row))
                .collect()
        })
        .await??;
        tracing::debug!("Parsed {} rows", rows.len());

        let matched = MetadataMatcher::from_config(&self.source, &self.config)
            .match_rows(rows, scope, &self.config.department)
            .await;
        if matched.is_total_failure() {
            return Err(ForceError::Lookup(format!(
                "all {} metadata lookups for {} failed, keeping persisted state",
                matched.chunks, scope
            )));
        }
        let batch = ScopeBatch {
            scope: scope.clone(),
            department: self.config.department.clone(),
            records: decode_all(matched.records),
            failed_chunks: matched.failed_chunks,
            unresolved: matched.unresolved,
        };

        let plan = self.db.reconcile_scope(&batch, now).await?;
        self.emit(&plan.events);
        Ok(plan.summary)
    }

    /// Fetch a controller's dumps, then process each declared scope with a cached dump.
    ///
    /// `Err` only when the controller is unknown or its fetch failed; per-scope failures are
    /// carried in the report.
    #[tracing::instrument(skip(self))]
    pub async fn run_controller(&self, name: &str, now: i64) -> Result<RunReport, ForceError> {
        let controller = self
            .config
            .controller(name)
            .ok_or_else(|| ForceError::NotFound(format!("controller {name} is not configured")))?;
        let local_dir = self.config.controller_dir(name);
        let fetched = self
            .transport
            .fetch_files(controller, &self.config.remote_path, &local_dir)
            .await?;
        tracing::debug!("Fetched {} dumps for {}", fetched.len(), name);

        let declared = self.config.declared_scopes();
        let scopes: Vec<Scope> = cached_scopes(&local_dir)?
            .into_iter()
            .filter(|scope| {
                let keep = declared.contains(scope);
                if !keep {
                    tracing::debug!("Skipping cached dump of undeclared scope {}", scope);
                }
                keep
            })
            .collect();

        let results = join_all(scopes.iter().map(|scope| self.run_scope(scope, now))).await;
        let mut report = RunReport::default();
        for (scope, result) in scopes.iter().zip(results) {
            match result {
                Ok(summary) => report.summaries.push(summary),
                Err(e) => {
                    tracing::error!("Scope {} failed: {}", scope, e);
                    report.failures.push((scope.to_string(), e));
                }
            }
        }
        Ok(report)
    }

    /// Run every configured controller concurrently.
    pub async fn run_all(&self, now: i64) -> RunReport {
        let names: Vec<&str> = self
            .config
            .controllers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let results = join_all(names.iter().map(|name| self.run_controller(name, now))).await;

        let mut report = RunReport::default();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(controller_report) => report.merge(controller_report),
                Err(e) => {
                    tracing::error!("Controller {} failed: {}", name, e);
                    report.failures.push((name.to_string(), e));
                }
            }
        }
        tracing::info!(
            "Run complete: {} scopes processed, {} failures",
            report.summaries.len(),
            report.failures.len()
        );
        report
    }

    /// One scheduler cycle: a single controller when `controller` is given, else all of them.
    /// Never fails; an unknown controller or failed fetch is reported like any scope failure.
    pub async fn run_cycle(&self, controller: Option<&str>, now: i64) -> RunReport {
        let Some(name) = controller else {
            return self.run_all(now).await;
        };
        match self.run_controller(name, now).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Controller {} failed: {}", name, e);
                RunReport {
                    summaries: Vec::new(),
                    failures: vec![(name.to_string(), e)],
                }
            }
        }
    }

    /// Drop everything the store and cache hold for scopes no longer in the configuration.
    pub async fn sync_scopes(&self) -> Result<ScopeSyncReport, ForceError> {
        let report = ScopeReconciler::new(&self.db, &self.config, &self.locks)
            .sync()
            .await?;
        self.emit(&report.events);
        Ok(report)
    }

    fn emit(&self, events: &[ForceEvent]) {
        for event in events.iter().filter(|e| e.is_transition()) {
            tracing::debug!("{}", event);
        }
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        for event in events {
            if let Err(e) = tx.send(event.clone()) {
                tracing::warn!("{}", ForceError::from(e));
                break;
            }
        }
    }
}
