//! Enrichment of decoded dump rows with reference metadata.
//!
//! The reference store is queried in bounded chunks with an `IN (...)` predicate, because the
//! stores in use cap the number of list items a single predicate may carry. Raw value words are
//! re-attached by name through an explicit lookup map, never by position: chunked results may
//! come back in any order.

use sqlx::{
    sqlite::{Sqlite, SqliteConnectOptions, SqliteRow},
    Pool, Row,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    path::Path,
    str::FromStr,
};

use crate::{
    codec::DumpRow,
    config::PipelineConfig,
    error::ForceError,
    properties::{DeclaredType, MetadataRecord, Scope, NONE_SENTINEL},
};

/// Largest list the reference store reliably accepts in one `IN` predicate.
pub const DEFAULT_CHUNK_SIZE: usize = 800;

/// `{table}` is replaced by the resource name, `{placeholders}` by one bind slot per name.
pub const DEFAULT_QUERY_TEMPLATE: &str = "SELECT SecondComment, Name, MnemoA, MnemoB, MnemoC, \
     Comment, Type FROM {table} WHERE Name IN ({placeholders})";

const COL_SECOND_COMMENT: usize = 0;
const COL_NAME: usize = 1;
const COL_HIERARCHY: [usize; 3] = [2, 3, 4];
const COL_COMMENT: usize = 5;
const COL_TYPE: usize = 6;

/// One reference-store row, addressed by column position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRow(pub Vec<Option<String>>);

impl MetadataRow {
    /// Trimmed column text; missing and NULL columns read as empty.
    pub fn col(&self, idx: usize) -> &str {
        self.0
            .get(idx)
            .and_then(|c| c.as_deref())
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Parameterized query access to the reference metadata store of a controller.
pub trait MetadataSource: Sync {
    fn query(
        &self,
        controller: &str,
        sql: &str,
        params: &[String],
    ) -> impl Future<Output = Result<Vec<MetadataRow>, ForceError>> + Send;
}

/// Reference metadata kept in one SQLite file per controller.
#[derive(Debug, Clone, Default)]
pub struct SqliteMetadataSource {
    pools: BTreeMap<String, Pool<Sqlite>>,
}

impl SqliteMetadataSource {
    pub fn from_pools(pools: BTreeMap<String, Pool<Sqlite>>) -> Self {
        SqliteMetadataSource { pools }
    }

    /// Open the `metadata_db` of every configured controller, read-only.
    pub async fn connect(config: &PipelineConfig) -> Result<Self, ForceError> {
        let mut pools = BTreeMap::new();
        for controller in config.controllers.iter() {
            pools.insert(
                controller.name.clone(),
                Self::open(&controller.metadata_db).await?,
            );
        }
        Ok(SqliteMetadataSource { pools })
    }

    pub async fn open(path: &Path) -> Result<Pool<Sqlite>, ForceError> {
        tracing::debug!("Opening reference metadata store {:?}", path);
        let url = format!("sqlite:{}", path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&url)?.read_only(true);
        Ok(Pool::connect_with(options).await?)
    }
}

fn row_to_metadata_row(row: &SqliteRow) -> MetadataRow {
    MetadataRow(
        (0..row.len())
            .map(|idx| {
                row.try_get::<Option<String>, _>(idx)
                    .ok()
                    .flatten()
                    .or_else(|| {
                        row.try_get::<Option<i64>, _>(idx)
                            .ok()
                            .flatten()
                            .map(|i| i.to_string())
                    })
            })
            .collect(),
    )
}

impl MetadataSource for SqliteMetadataSource {
    async fn query(
        &self,
        controller: &str,
        sql: &str,
        params: &[String],
    ) -> Result<Vec<MetadataRow>, ForceError> {
        let pool = self.pools.get(controller).ok_or_else(|| {
            ForceError::NotFound(format!(
                "no reference metadata store configured for controller {controller}"
            ))
        })?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.clone());
        }
        let rows = query.fetch_all(pool).await.map_err(|e| {
            tracing::error!(
                "[SqliteMetadataSource.query] SQL error processing '{}'\n\terror: {}",
                sql,
                e
            );
            ForceError::Lookup(format!("{e}"))
        })?;
        Ok(rows.iter().map(row_to_metadata_row).collect())
    }
}

/// Outcome of matching one scope's rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    pub records: Vec<MetadataRecord>,
    pub chunks: usize,
    /// Chunks whose query failed and were skipped. Non-zero means the scope's metadata is
    /// partial.
    pub failed_chunks: usize,
    /// Names present in the dump whose chunk failed. Their state is unknown, not absent.
    pub unresolved: BTreeSet<String>,
}

impl MatchReport {
    /// Every lookup failed: nothing about the scope is known.
    pub fn is_total_failure(&self) -> bool {
        self.chunks > 0 && self.failed_chunks == self.chunks
    }
}

pub struct MetadataMatcher<'a, S> {
    source: &'a S,
    chunk_size: usize,
    query_template: &'a str,
}

impl<'a, S: MetadataSource> MetadataMatcher<'a, S> {
    pub fn new(source: &'a S, chunk_size: usize, query_template: &'a str) -> Self {
        MetadataMatcher {
            source,
            chunk_size: chunk_size.max(1),
            query_template,
        }
    }

    pub fn from_config(source: &'a S, config: &'a PipelineConfig) -> Self {
        Self::new(source, config.chunk_size, &config.query_template)
    }

    /// Enrich `rows` (identifiers already decoded) with reference metadata for `scope`.
    ///
    /// An empty input yields a single [`MetadataRecord::placeholder`]. A failing chunk is
    /// logged and skipped; the remaining chunks still run.
    #[tracing::instrument(skip(self, rows, scope), fields(scope = %scope))]
    pub async fn match_rows<I>(&self, rows: I, scope: &Scope, department: &str) -> MatchReport
    where
        I: IntoIterator<Item = DumpRow>,
    {
        let lookup = lookup_map(rows);
        if lookup.is_empty() {
            tracing::info!("Scope {} produced no names, recording placeholder", scope);
            return MatchReport {
                records: vec![MetadataRecord::placeholder(scope.clone(), department)],
                ..Default::default()
            };
        }

        let names: Vec<String> = lookup.keys().cloned().collect();
        let mut report = MatchReport::default();
        for chunk in names.chunks(self.chunk_size) {
            report.chunks += 1;
            let sql = render_query(self.query_template, &scope.resource, chunk.len());
            match self.source.query(&scope.controller, &sql, chunk).await {
                Ok(rows) => {
                    report.records.extend(
                        rows.iter()
                            .map(|row| metadata_from_row(row, &lookup, scope, department)),
                    );
                }
                Err(e) => {
                    report.failed_chunks += 1;
                    report.unresolved.extend(chunk.iter().cloned());
                    tracing::warn!(
                        "Metadata lookup for {} failed on chunk {} ({} names), skipping: {}",
                        scope,
                        report.chunks,
                        chunk.len(),
                        e
                    );
                }
            }
        }
        tracing::debug!(
            "Matched {} of {} names in {} chunks ({} failed)",
            report.records.len(),
            names.len(),
            report.chunks,
            report.failed_chunks
        );
        report
    }
}

/// name → value words. A name seen twice keeps its last row.
pub fn lookup_map<I>(rows: I) -> BTreeMap<String, Vec<String>>
where
    I: IntoIterator<Item = DumpRow>,
{
    rows.into_iter()
        .map(|row| (row.identifier, row.value_tokens))
        .collect()
}

pub fn render_query(template: &str, table: &str, bind_count: usize) -> String {
    let placeholders = vec!["?"; bind_count].join(", ");
    template
        .replace("{table}", table)
        .replace("{placeholders}", &placeholders)
}

fn metadata_from_row(
    row: &MetadataRow,
    lookup: &BTreeMap<String, Vec<String>>,
    scope: &Scope,
    department: &str,
) -> MetadataRecord {
    let name_id = row.col(COL_NAME).to_string();
    let hierarchy: Vec<&str> = COL_HIERARCHY.iter().map(|idx| row.col(*idx)).collect();
    let kks = if hierarchy.iter().any(|segment| segment.is_empty()) {
        NONE_SENTINEL.to_string()
    } else {
        hierarchy.join(".")
    };
    let or_sentinel = |text: &str| {
        if text.is_empty() {
            NONE_SENTINEL.to_string()
        } else {
            text.to_string()
        }
    };
    let raw_value_tokens = lookup.get(&name_id).cloned().unwrap_or_else(|| {
        tracing::debug!("Store returned unrequested name {:?}", name_id);
        Vec::new()
    });

    MetadataRecord {
        kks,
        comment: or_sentinel(row.col(COL_COMMENT)),
        second_comment: or_sentinel(row.col(COL_SECOND_COMMENT)),
        declared_type: DeclaredType::from(row.col(COL_TYPE)),
        raw_value_tokens,
        scope: scope.clone(),
        department: department.to_string(),
        name_id,
    }
}
