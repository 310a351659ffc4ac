use futures::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection},
    ConnectOptions, Pool, Row,
};
use std::{collections::BTreeSet, path::Path, result::Result, str::FromStr};

use crate::{
    error::ForceError,
    event::{ForceEvent, ScopeSummary},
    properties::{Annotation, ForceRecord, HistoryEntry, Scope},
    reconcile::{plan, ReconcilePlan, ScopeBatch},
};

/// Staged store changes, written together by [`Transaction::execute`].
pub struct Transaction {
    events: Vec<ForceEvent>,
    pub staged: usize,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            events: Vec::new(),
            staged: 0,
        }
    }

    pub fn add_event(&mut self, event: &ForceEvent) {
        self.events.push(event.clone());
        self.staged += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Apply every staged event inside one store transaction. Nothing is written unless all of
    /// them succeed.
    pub async fn execute(&mut self, connection: &Pool<Sqlite>) -> Result<(), ForceError> {
        let mut tx = connection.begin().await?;
        self.apply(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply staged events on a connection the caller controls (usually an open transaction).
    pub async fn apply(&mut self, conn: &mut SqliteConnection) -> Result<(), ForceError> {
        for event in self.events.iter() {
            apply_event(&mut *conn, event).await.map_err(|e| {
                tracing::error!("[Transaction] failed applying {}: {}", event, e);
                e
            })?;
        }
        tracing::debug!("[Transaction] applied {} events", self.staged);
        self.events.clear();
        self.staged = 0;
        Ok(())
    }
}

async fn apply_event(conn: &mut SqliteConnection, event: &ForceEvent) -> Result<(), ForceError> {
    match event {
        ForceEvent::BitForced(record) => {
            upsert_record(&mut *conn, record).await?;
            open_history(&mut *conn, record).await?;
        }
        ForceEvent::BitRefreshed(record) => {
            sqlx::query(
                "UPDATE force_records SET kks = ?, comment = ?, second_comment = ?, \
                 declared_type = ?, value = ?, department = ? \
                 WHERE controller = ? AND resource = ? AND bit_number = ?",
            )
            .bind(&record.kks)
            .bind(&record.comment)
            .bind(&record.second_comment)
            .bind(record.declared_type.as_str())
            .bind(record.value.to_stored())
            .bind(&record.department)
            .bind(&record.scope.controller)
            .bind(&record.scope.resource)
            .bind(&record.bit_number)
            .execute(&mut *conn)
            .await?;
        }
        ForceEvent::BitReforced(record) => {
            upsert_record(&mut *conn, record).await?;
            open_history(&mut *conn, record).await?;
        }
        ForceEvent::BitDeforced(scope, bit, at) => {
            sqlx::query(
                "UPDATE force_records SET force_active = 0 \
                 WHERE controller = ? AND resource = ? AND bit_number = ?",
            )
            .bind(&scope.controller)
            .bind(&scope.resource)
            .bind(bit)
            .execute(&mut *conn)
            .await?;
            close_history(&mut *conn, scope, bit, *at).await?;
        }
        ForceEvent::Annotated(scope, bit, annotation) => {
            sqlx::query(
                "UPDATE force_records SET reason = COALESCE(?, reason), \
                 forced_by = COALESCE(?, forced_by), ticket_ref = COALESCE(?, ticket_ref) \
                 WHERE controller = ? AND resource = ? AND bit_number = ?",
            )
            .bind(&annotation.reason)
            .bind(&annotation.forced_by)
            .bind(&annotation.ticket_ref)
            .bind(&scope.controller)
            .bind(&scope.resource)
            .bind(bit)
            .execute(&mut *conn)
            .await?;
            // The open entry, or failing that the most recent one.
            sqlx::query(
                "UPDATE force_history SET reason = COALESCE(?, reason), \
                 forced_by = COALESCE(?, forced_by), ticket_ref = COALESCE(?, ticket_ref) \
                 WHERE id = (SELECT id FROM force_history \
                     WHERE controller = ? AND resource = ? AND bit_number = ? \
                     ORDER BY deforced_at IS NOT NULL, forced_at DESC, id DESC LIMIT 1)",
            )
            .bind(&annotation.reason)
            .bind(&annotation.forced_by)
            .bind(&annotation.ticket_ref)
            .bind(&scope.controller)
            .bind(&scope.resource)
            .bind(bit)
            .execute(&mut *conn)
            .await?;
        }
        ForceEvent::ScopeRemoved(scope) => {
            for table in ["force_history", "force_records", "scopes"] {
                sqlx::query(&format!(
                    "DELETE FROM {table} WHERE controller = ? AND resource = ?"
                ))
                .bind(&scope.controller)
                .bind(&scope.resource)
                .execute(&mut *conn)
                .await?;
            }
        }
        ForceEvent::ControllerRemoved(name) => {
            for table in ["force_history", "force_records", "scopes"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE controller = ?"))
                    .bind(name)
                    .execute(&mut *conn)
                    .await?;
            }
            sqlx::query("DELETE FROM controllers WHERE name = ?")
                .bind(name)
                .execute(&mut *conn)
                .await?;
        }
        ForceEvent::ScopeProcessed(summary) => {
            record_scope_run(&mut *conn, summary).await?;
        }
    }
    Ok(())
}

async fn upsert_record(conn: &mut SqliteConnection, record: &ForceRecord) -> Result<(), ForceError> {
    sqlx::query(
        "INSERT INTO force_records (controller, resource, bit_number, kks, comment, \
         second_comment, declared_type, value, force_active, forced_at, forced_by, ticket_ref, \
         reason, department) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(controller, resource, bit_number) DO UPDATE SET \
         kks = excluded.kks, comment = excluded.comment, \
         second_comment = excluded.second_comment, declared_type = excluded.declared_type, \
         value = excluded.value, force_active = excluded.force_active, \
         forced_at = excluded.forced_at, forced_by = excluded.forced_by, \
         ticket_ref = excluded.ticket_ref, reason = excluded.reason, \
         department = excluded.department",
    )
    .bind(&record.scope.controller)
    .bind(&record.scope.resource)
    .bind(&record.bit_number)
    .bind(&record.kks)
    .bind(&record.comment)
    .bind(&record.second_comment)
    .bind(record.declared_type.as_str())
    .bind(record.value.to_stored())
    .bind(record.force_active)
    .bind(record.forced_at)
    .bind(&record.forced_by)
    .bind(&record.ticket_ref)
    .bind(&record.reason)
    .bind(&record.department)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Start a new episode. An open entry with the same start is this episode already (a replayed
/// write) and is kept as is. Any other open entry is dangling and gets closed first, so at most
/// one entry per bit is ever open.
async fn open_history(conn: &mut SqliteConnection, record: &ForceRecord) -> Result<(), ForceError> {
    let open_since: Option<i64> = sqlx::query_scalar(
        "SELECT forced_at FROM force_history \
         WHERE controller = ? AND resource = ? AND bit_number = ? AND deforced_at IS NULL",
    )
    .bind(&record.scope.controller)
    .bind(&record.scope.resource)
    .bind(&record.bit_number)
    .fetch_optional(&mut *conn)
    .await?;
    if open_since == Some(record.forced_at) {
        return Ok(());
    }
    close_history(&mut *conn, &record.scope, &record.bit_number, record.forced_at).await?;
    sqlx::query(
        "INSERT INTO force_history (controller, resource, bit_number, reason, forced_by, \
         ticket_ref, forced_at, deforced_at) VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
    )
    .bind(&record.scope.controller)
    .bind(&record.scope.resource)
    .bind(&record.bit_number)
    .bind(&record.reason)
    .bind(&record.forced_by)
    .bind(&record.ticket_ref)
    .bind(record.forced_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn close_history(
    conn: &mut SqliteConnection,
    scope: &Scope,
    bit: &str,
    at: i64,
) -> Result<(), ForceError> {
    sqlx::query(
        "UPDATE force_history SET deforced_at = ? \
         WHERE controller = ? AND resource = ? AND bit_number = ? AND deforced_at IS NULL",
    )
    .bind(at)
    .bind(&scope.controller)
    .bind(&scope.resource)
    .bind(bit)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn record_scope_run(
    conn: &mut SqliteConnection,
    summary: &ScopeSummary,
) -> Result<(), ForceError> {
    sqlx::query("INSERT OR IGNORE INTO controllers (name, department) VALUES (?, ?)")
        .bind(&summary.scope.controller)
        .bind(&summary.department)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO scopes (controller, resource, last_run, batch_size, failed_chunks) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT(controller, resource) DO UPDATE SET \
         last_run = excluded.last_run, batch_size = excluded.batch_size, \
         failed_chunks = excluded.failed_chunks",
    )
    .bind(&summary.scope.controller)
    .bind(&summary.scope.resource)
    .bind(summary.processed_at)
    .bind(summary.batch_size as i64)
    .bind(summary.failed_chunks as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// The force store. Single access point for every read and write of persisted force state.
#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    /// Reconcile one scope's complete batch.
    ///
    /// Must not run concurrently for the same scope; [`crate::scopes::ScopeLocks`] provides
    /// that guarantee. The read is side-effect free, and every resulting write lands in a single
    /// transaction, so a failure at any point leaves the scope exactly as it was.
    #[tracing::instrument(skip(self, batch), fields(scope = %batch.scope))]
    pub async fn reconcile_scope(
        &self,
        batch: &ScopeBatch,
        now: i64,
    ) -> Result<ReconcilePlan, ForceError> {
        let current = self.scope_records(&batch.scope).await?;
        let plan = plan(batch, &current, now);

        let mut transaction = Transaction::new();
        for event in plan.events.iter() {
            transaction.add_event(event);
        }
        transaction.execute(&self.0).await?;

        tracing::info!(
            "{}: {} in batch, {} forced, {} reforced, {} deforced, {} invalid",
            batch.scope,
            plan.summary.batch_size,
            plan.summary.forced,
            plan.summary.reforced,
            plan.summary.deforced,
            plan.summary.invalid
        );
        Ok(plan)
    }

    /// Apply operator context to an existing bit. Never changes whether the bit is active.
    #[tracing::instrument(skip(self))]
    pub async fn annotate(
        &self,
        scope: &Scope,
        bit: &str,
        annotation: &Annotation,
    ) -> Result<ForceEvent, ForceError> {
        if self.record(scope, bit).await?.is_none() {
            return Err(ForceError::NotFound(format!("no forced bit {bit} in {scope}")));
        }
        let event = ForceEvent::Annotated(scope.clone(), bit.to_string(), annotation.clone());
        if annotation.is_empty() {
            return Ok(event);
        }
        let mut transaction = Transaction::new();
        transaction.add_event(&event);
        transaction.execute(&self.0).await?;
        Ok(event)
    }

    /// Delete every trace of `scope` from the store.
    pub async fn remove_scope(&self, scope: &Scope) -> Result<ForceEvent, ForceError> {
        let event = ForceEvent::ScopeRemoved(scope.clone());
        let mut transaction = Transaction::new();
        transaction.add_event(&event);
        transaction.execute(&self.0).await?;
        Ok(event)
    }

    /// Delete a controller and everything recorded under it.
    pub async fn remove_controller(&self, controller: &str) -> Result<ForceEvent, ForceError> {
        let event = ForceEvent::ControllerRemoved(controller.to_string());
        let mut transaction = Transaction::new();
        transaction.add_event(&event);
        transaction.execute(&self.0).await?;
        Ok(event)
    }

    pub async fn record(&self, scope: &Scope, bit: &str) -> Result<Option<ForceRecord>, ForceError> {
        Ok(sqlx::query_as::<_, ForceRecord>(
            "SELECT * FROM force_records WHERE controller = ? AND resource = ? AND bit_number = ?",
        )
        .bind(&scope.controller)
        .bind(&scope.resource)
        .bind(bit)
        .fetch_optional(&self.0)
        .await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn scope_records(&self, scope: &Scope) -> Result<Vec<ForceRecord>, ForceError> {
        let records = sqlx::query_as::<_, ForceRecord>(
            "SELECT * FROM force_records WHERE controller = ? AND resource = ? ORDER BY bit_number",
        )
        .bind(&scope.controller)
        .bind(&scope.resource)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!(
                "[DbConnection.scope_records] SQL error reading {}\n\terror: {}",
                scope,
                e
            );
            e
        })?;
        Ok(records)
    }

    pub async fn controller_records(&self, controller: &str) -> Result<Vec<ForceRecord>, ForceError> {
        Ok(sqlx::query_as::<_, ForceRecord>(
            "SELECT * FROM force_records WHERE controller = ? ORDER BY resource, bit_number",
        )
        .bind(controller)
        .fetch_all(&self.0)
        .await?)
    }

    /// Every episode of a bit, oldest first.
    pub async fn bit_history(&self, scope: &Scope, bit: &str) -> Result<Vec<HistoryEntry>, ForceError> {
        Ok(sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM force_history WHERE controller = ? AND resource = ? AND bit_number = ? \
             ORDER BY forced_at, id",
        )
        .bind(&scope.controller)
        .bind(&scope.resource)
        .bind(bit)
        .fetch_all(&self.0)
        .await?)
    }

    /// Scopes the store knows about: every scope that ever ran, plus any scope still holding
    /// records.
    pub async fn persisted_scopes(&self) -> Result<BTreeSet<Scope>, ForceError> {
        let rows = sqlx::query(
            "SELECT controller, resource FROM scopes \
             UNION SELECT DISTINCT controller, resource FROM force_records",
        )
        .fetch_all(&self.0)
        .await?;
        rows.iter()
            .map(|row| -> Result<Scope, ForceError> {
                Ok(Scope::new(
                    row.try_get::<String, _>(0)?,
                    row.try_get::<String, _>(1)?,
                ))
            })
            .collect()
    }

    pub async fn persisted_controllers(&self) -> Result<BTreeSet<String>, ForceError> {
        let rows = sqlx::query(
            "SELECT name FROM controllers UNION SELECT controller FROM scopes \
             UNION SELECT DISTINCT controller FROM force_records",
        )
        .fetch_all(&self.0)
        .await?;
        rows.iter()
            .map(|row| -> Result<String, ForceError> { Ok(row.try_get::<String, _>(0)?) })
            .collect()
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_force_tables",
        sql: "\
            CREATE TABLE controllers (name TEXT PRIMARY KEY, department TEXT NOT NULL); \
            CREATE TABLE scopes (controller TEXT NOT NULL, resource TEXT NOT NULL, \
                last_run INTEGER NOT NULL, batch_size INTEGER NOT NULL DEFAULT 0, \
                failed_chunks INTEGER NOT NULL DEFAULT 0, PRIMARY KEY (controller, resource)); \
            CREATE TABLE force_records (controller TEXT NOT NULL, resource TEXT NOT NULL, \
                bit_number TEXT NOT NULL, kks TEXT NOT NULL, comment TEXT NOT NULL, \
                second_comment TEXT NOT NULL, declared_type TEXT NOT NULL, value TEXT NOT NULL, \
                force_active INTEGER NOT NULL, forced_at INTEGER NOT NULL, forced_by TEXT, \
                ticket_ref TEXT, reason TEXT, department TEXT NOT NULL, \
                UNIQUE(controller, resource, bit_number)); \
            CREATE TABLE force_history (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                controller TEXT NOT NULL, resource TEXT NOT NULL, bit_number TEXT NOT NULL, \
                reason TEXT, forced_by TEXT, ticket_ref TEXT, forced_at INTEGER NOT NULL, \
                deforced_at INTEGER); \
            CREATE INDEX force_history_bit ON force_history (controller, resource, bit_number); \
            CREATE UNIQUE INDEX force_history_open ON force_history (controller, resource, bit_number) \
                WHERE deforced_at IS NULL;",
        kind: MigrationType::ReversibleUp,
    }])
}

pub async fn db_init(db_path: &Path) -> Result<Pool<Sqlite>, sqlx::Error> {
    let fqdb = format!("sqlite:{}", db_path.to_string_lossy());
    tracing::debug!("Initializing force store from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);
    let pool = Pool::<Sqlite>::connect_with(options).await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let record_count = sqlx::query("SELECT COUNT(*) FROM force_records;")
        .fetch_one(&pool)
        .await?;
    let active_count = sqlx::query("SELECT COUNT(*) FROM force_records WHERE force_active = 1;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "Force store initialized.\n \
         \tKnown bits:\t{:?} \n \
         \tActive forces:\t{:?}",
        record_count.get::<i64, usize>(0),
        active_count.get::<i64, usize>(0)
    );

    Ok(pool)
}
