//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use forcewatch::{
    codec::DecodedValue,
    config::{ControllerConfig, PipelineConfig},
    db::{db_init, DbConnection},
    properties::{DecodedRecord, DeclaredType, MetadataRecord, Scope},
    reconcile::ScopeBatch,
};
use sqlx::{
    sqlite::{Sqlite, SqliteConnectOptions},
    Pool,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// One reference-store row: (name, hierarchy, comment, declared type).
pub type MetaRow<'a> = (&'a str, [&'a str; 3], &'a str, &'a str);

/// A scratch installation: config, empty force store, a mirror of controller file systems and
/// one reference metadata store per controller.
#[allow(dead_code)]
pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
    pub db: DbConnection,
}

#[allow(dead_code)]
impl Fixture {
    /// `controllers`: (name, resources).
    pub async fn new(controllers: &[(&str, &[&str])]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::new("BT2", dir.path().join("cache"));
        config.store_path = dir.path().join("force.db");
        for (name, resources) in controllers {
            config.controllers.push(ControllerConfig {
                name: name.to_string(),
                address: "127.0.0.1".to_string(),
                port: 22,
                username: "ide".to_string(),
                resources: resources.iter().map(|r| r.to_string()).collect(),
                metadata_db: dir.path().join(format!("meta_{name}.db")),
            });
        }
        config.validate().unwrap();
        let db = DbConnection(db_init(&config.store_path).await.unwrap());
        Fixture { dir, config, db }
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    /// Place a dump where the mirror transport expects the controller's file.
    pub fn put_remote_dump(&self, scope: &Scope, lines: &[&str]) {
        let path = self
            .mirror_root()
            .join(&scope.controller)
            .join(self.config.remote_path_for(&scope.resource).trim_start_matches('/'));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    pub fn remove_remote_dump(&self, scope: &Scope) {
        let path = self
            .mirror_root()
            .join(&scope.controller)
            .join(self.config.remote_path_for(&scope.resource).trim_start_matches('/'));
        std::fs::remove_file(path).unwrap();
    }

    /// Fill the reference table of `scope` in its controller's metadata store.
    pub async fn put_metadata(&self, scope: &Scope, rows: &[MetaRow<'_>]) {
        let controller = self.config.controller(&scope.controller).unwrap();
        write_metadata(&controller.metadata_db, &scope.resource, rows).await;
    }
}

pub async fn write_metadata(db_path: &Path, table: &str, rows: &[MetaRow<'_>]) {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = Pool::<Sqlite>::connect_with(options).await.unwrap();
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (SecondComment TEXT, Name TEXT, MnemoA TEXT, \
         MnemoB TEXT, MnemoC TEXT, Comment TEXT, Type TEXT)"
    ))
    .execute(&pool)
    .await
    .unwrap();
    for (name, [a, b, c], comment, declared) in rows {
        sqlx::query(&format!(
            "INSERT INTO {table} VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(format!("{name} second"))
        .bind(*name)
        .bind(*a)
        .bind(*b)
        .bind(*c)
        .bind(*comment)
        .bind(*declared)
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;
}

/// A decoded BOOL record, as the matcher and codec would produce it.
#[allow(dead_code)]
pub fn decoded(scope: &Scope, bit: &str, value: bool) -> DecodedRecord {
    DecodedRecord {
        metadata: MetadataRecord {
            name_id: bit.to_string(),
            kks: "10.LBA.CP001".to_string(),
            comment: "feed pump".to_string(),
            second_comment: "None".to_string(),
            declared_type: DeclaredType::Bool,
            raw_value_tokens: vec![if value { "1" } else { "0" }.to_string()],
            scope: scope.clone(),
            department: "BT2".to_string(),
        },
        value: DecodedValue::Bool(value),
    }
}

#[allow(dead_code)]
pub fn batch(scope: &Scope, bits: &[&str]) -> ScopeBatch {
    ScopeBatch {
        records: bits.iter().map(|b| decoded(scope, b, true)).collect(),
        ..ScopeBatch::new(scope.clone(), "BT2")
    }
}
