//! End-to-end cycles: mirror fetch, parse, metadata match, decode and reconcile, against
//! real SQLite stores in a scratch directory.

mod common;

use common::Fixture;
use forcewatch::{
    codec::DecodedValue,
    config::PipelineConfig,
    event::ForceEvent,
    metadata::{MetadataRow, MetadataSource, SqliteMetadataSource},
    pipeline::ForcePipeline,
    properties::{DeclaredType, Scope},
    transport::MirrorTransport,
    ForceError,
};
use std::{collections::BTreeSet, sync::Arc};
use test_log::test;
use tokio::sync::mpsc::unbounded_channel;

type Pipeline = ForcePipeline<SqliteMetadataSource, MirrorTransport>;

async fn pipeline(fx: &Fixture) -> Pipeline {
    let source = SqliteMetadataSource::connect(&fx.config).await.unwrap();
    pipeline_with(fx, fx.config.clone(), source)
}

fn pipeline_with<S: MetadataSource>(
    fx: &Fixture,
    config: PipelineConfig,
    source: S,
) -> ForcePipeline<S, MirrorTransport> {
    ForcePipeline::new(
        Arc::new(config),
        fx.db.clone(),
        source,
        MirrorTransport::new(fx.mirror_root()),
    )
}

/// Reference store whose lookups fail whenever a chunk asks for one of `failing`.
struct FlakySource {
    inner: SqliteMetadataSource,
    failing: BTreeSet<String>,
}

impl MetadataSource for FlakySource {
    async fn query(
        &self,
        controller: &str,
        sql: &str,
        params: &[String],
    ) -> Result<Vec<MetadataRow>, ForceError> {
        if params.iter().any(|p| self.failing.contains(p)) {
            return Err(ForceError::Lookup("connection reset".to_string()));
        }
        self.inner.query(controller, sql, params).await
    }
}

async fn niet_fixture() -> (Fixture, Scope) {
    let fx = Fixture::new(&[("BTEST", &["NIET"])]).await;
    let scope = Scope::new("BTEST", "NIET");
    fx.put_metadata(
        &scope,
        &[
            ("W00001", ["10", "LBA", "CP001"], "feed pump on", "BOOL"),
            ("W00002", ["10", "LBA", "CP002"], "standby pump on", "BOOL"),
            ("R00161", ["10", "LBA", "CT001"], "inlet temperature", "REAL"),
            ("M00016", ["", "LBA", "CL001"], "", "LINT"),
        ],
    )
    .await;
    (fx, scope)
}

#[test(tokio::test)]
async fn test_cycle_decodes_and_enriches_records() {
    let (fx, scope) = niet_fixture().await;
    fx.put_remote_dump(
        &scope,
        &[
            "5700001 00000001",
            "52000A1 3F800000",
            "4D00010 FFFFFFFFFFFFFFFF",
        ],
    );
    let pipeline = pipeline(&fx).await;

    let report = pipeline.run_all(1_000).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.summaries.len(), 1);
    let summary = &report.summaries[0];
    assert_eq!(summary.scope, scope);
    assert_eq!(summary.batch_size, 3);
    assert_eq!(summary.forced, 3);
    assert_eq!(summary.failed_chunks, 0);

    let pump = fx.db.record(&scope, "W00001").await.unwrap().unwrap();
    assert_eq!(pump.value, DecodedValue::Bool(true));
    assert_eq!(pump.kks, "10.LBA.CP001");
    assert_eq!(pump.comment, "feed pump on");
    assert_eq!(pump.second_comment, "W00001 second");
    assert_eq!(pump.department, "BT2");
    assert_eq!(pump.forced_at, 1_000);

    let temperature = fx.db.record(&scope, "R00161").await.unwrap().unwrap();
    assert_eq!(temperature.declared_type, DeclaredType::Real);
    assert_eq!(temperature.value, DecodedValue::Float(1.0));

    // A blank hierarchy segment or comment degrades to the sentinel.
    let level = fx.db.record(&scope, "M00016").await.unwrap().unwrap();
    assert_eq!(level.value, DecodedValue::Int(-1));
    assert_eq!(level.kks, "None");
    assert_eq!(level.comment, "None");

    assert!(fx.config.dump_path(&scope).exists());
}

#[test(tokio::test)]
async fn test_unmatched_identifiers_are_not_recorded() {
    let (fx, scope) = niet_fixture().await;
    fx.put_remote_dump(&scope, &["5700001 00000001", "57000FF 00000001", "GARBAGE 01"]);
    let pipeline = pipeline(&fx).await;

    let report = pipeline.run_all(1_000).await;
    assert_eq!(report.summaries[0].batch_size, 1);
    let records = fx.db.scope_records(&scope).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].bit_number, "W00001");
}

#[test(tokio::test)]
async fn test_second_cycle_deforces_vanished_bits() {
    let (fx, scope) = niet_fixture().await;
    let pipeline = pipeline(&fx).await;

    fx.put_remote_dump(&scope, &["5700001 00000001", "5700002 00000001"]);
    pipeline.run_all(1_000).await;
    fx.put_remote_dump(&scope, &["5700002 00000000"]);
    let report = pipeline.run_all(2_000).await;

    let summary = &report.summaries[0];
    assert_eq!(summary.deforced, 1);
    assert_eq!(summary.refreshed, 1);
    assert!(!fx.db.record(&scope, "W00001").await.unwrap().unwrap().force_active);
    let standby = fx.db.record(&scope, "W00002").await.unwrap().unwrap();
    assert!(standby.force_active);
    assert_eq!(standby.value, DecodedValue::Bool(false));
    assert_eq!(standby.forced_at, 1_000);
}

#[test(tokio::test)]
async fn test_missing_remote_dump_leaves_state_alone() {
    let (fx, scope) = niet_fixture().await;
    let pipeline = pipeline(&fx).await;

    fx.put_remote_dump(&scope, &["5700001 00000001"]);
    pipeline.run_all(1_000).await;

    // The fetch skips the missing file and the previously cached copy is processed again.
    fx.remove_remote_dump(&scope);
    let report = pipeline.run_all(2_000).await;
    assert!(report.failures.is_empty());
    assert_eq!(report.summaries[0].changed(), 0);
    assert!(fx.db.record(&scope, "W00001").await.unwrap().unwrap().force_active);
}

#[test(tokio::test)]
async fn test_ingesting_a_missing_file_is_a_scope_error() {
    let (fx, scope) = niet_fixture().await;
    let pipeline = pipeline(&fx).await;
    fx.put_remote_dump(&scope, &["5700001 00000001"]);
    pipeline.run_all(1_000).await;

    let err = pipeline
        .ingest_file(&scope, fx.dir.path().join("nowhere.dat"), 2_000)
        .await
        .unwrap_err();
    assert!(matches!(err, ForceError::NotFound(_)), "{err:?}");
    assert!(fx.db.record(&scope, "W00001").await.unwrap().unwrap().force_active);
}

#[test(tokio::test)]
async fn test_empty_dump_deforces_everything() {
    let (fx, scope) = niet_fixture().await;
    let pipeline = pipeline(&fx).await;

    fx.put_remote_dump(&scope, &["5700001 00000001", "5700002 00000001"]);
    pipeline.run_all(1_000).await;
    fx.put_remote_dump(&scope, &[]);
    let report = pipeline.run_all(2_000).await;

    assert_eq!(report.summaries[0].batch_size, 0);
    assert_eq!(report.summaries[0].deforced, 2);
    let records = fx.db.scope_records(&scope).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.force_active));
}

#[test(tokio::test)]
async fn test_events_are_forwarded_in_commit_order() {
    let (fx, scope) = niet_fixture().await;
    let (tx, mut rx) = unbounded_channel();
    let pipeline = pipeline(&fx).await.with_events(tx);

    fx.put_remote_dump(&scope, &["5700001 00000001"]);
    pipeline.run_all(1_000).await;
    fx.put_remote_dump(&scope, &[]);
    pipeline.run_all(2_000).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], ForceEvent::BitForced(r) if r.bit_number == "W00001"));
    assert!(matches!(&events[1], ForceEvent::ScopeProcessed(s) if s.forced == 1));
    assert!(matches!(
        &events[2],
        ForceEvent::BitDeforced(s, bit, 2_000) if *s == scope && bit == "W00001"
    ));
    assert!(matches!(&events[3], ForceEvent::ScopeProcessed(s) if s.deforced == 1));
}

#[test(tokio::test)]
async fn test_failing_controller_does_not_stop_the_others() {
    let fx = Fixture::new(&[("BTEST", &["NIET"]), ("BPROD", &["HK1"])]).await;
    let niet = Scope::new("BTEST", "NIET");
    let hk1 = Scope::new("BPROD", "HK1");
    fx.put_metadata(&niet, &[("W00001", ["10", "LBA", "CP001"], "feed pump on", "BOOL")])
        .await;
    fx.put_metadata(&hk1, &[("W00001", ["20", "LBB", "CP001"], "drain pump on", "BOOL")])
        .await;
    fx.put_remote_dump(&niet, &["5700001 00000001"]);
    fx.put_remote_dump(&hk1, &["5700001 00000001"]);
    let pipeline = pipeline(&fx).await;

    // A directory where the cached dump should go makes BPROD's fetch fail.
    std::fs::create_dir_all(fx.config.dump_path(&hk1)).unwrap();
    let report = pipeline.run_all(1_000).await;

    assert_eq!(report.summaries.len(), 1);
    assert_eq!(report.summaries[0].scope, niet);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "BPROD");
    assert!(fx.db.record(&niet, "W00001").await.unwrap().is_some());
    assert!(fx.db.scope_records(&hk1).await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_sync_scopes_removes_undeclared_resources_and_controllers() {
    let fx = Fixture::new(&[("BTEST", &["NIET", "HK1"]), ("BPROD", &["HK1"])]).await;
    let niet = Scope::new("BTEST", "NIET");
    let btest_hk1 = Scope::new("BTEST", "HK1");
    let bprod_hk1 = Scope::new("BPROD", "HK1");
    for scope in [&niet, &btest_hk1, &bprod_hk1] {
        fx.put_metadata(scope, &[("W00001", ["10", "LBA", "CP001"], "pump on", "BOOL")])
            .await;
        fx.put_remote_dump(scope, &["5700001 00000001"]);
    }
    let report = pipeline(&fx).await.run_all(1_000).await;
    assert_eq!(report.summaries.len(), 3);

    // Drop one resource of BTEST and every resource of BPROD.
    let mut config = fx.config.clone();
    config.controllers[0].resources = vec!["NIET".to_string()];
    config.controllers[1].resources.clear();
    let source = SqliteMetadataSource::connect(&config).await.unwrap();
    let pipeline = ForcePipeline::new(
        Arc::new(config),
        fx.db.clone(),
        source,
        MirrorTransport::new(fx.mirror_root()),
    );

    let sync = pipeline.sync_scopes().await.unwrap();
    assert!(sync.is_clean(), "{:?}", sync.failures);
    assert!(sync.removed_scopes.contains(&btest_hk1));
    assert!(sync.removed_scopes.contains(&bprod_hk1));
    assert_eq!(sync.removed_controllers, vec!["BPROD".to_string()]);

    assert!(fx.db.scope_records(&btest_hk1).await.unwrap().is_empty());
    assert!(fx.db.scope_records(&bprod_hk1).await.unwrap().is_empty());
    assert_eq!(fx.db.scope_records(&niet).await.unwrap().len(), 1);
    assert!(!fx.config.dump_path(&btest_hk1).exists());
    assert!(fx.config.dump_path(&niet).exists());
    assert!(!fx.config.controller_dir("BPROD").exists());

    let persisted = fx.db.persisted_controllers().await.unwrap();
    assert!(persisted.contains("BTEST"));
    assert!(!persisted.contains("BPROD"));

    // A second pass finds nothing left to do.
    let again = pipeline.sync_scopes().await.unwrap();
    assert!(again.removed_scopes.is_empty());
    assert!(again.removed_controllers.is_empty());
}

#[test(tokio::test)]
async fn test_metadata_outage_fails_the_scope_without_deforcing() {
    let (fx, scope) = niet_fixture().await;
    fx.put_remote_dump(&scope, &["5700001 00000001"]);
    pipeline(&fx).await.run_all(1_000).await;

    // No reference store at all: every lookup chunk fails.
    let outage = pipeline_with(&fx, fx.config.clone(), SqliteMetadataSource::default());
    let report = outage.run_all(2_000).await;

    assert!(report.summaries.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "BTEST/NIET");
    assert!(matches!(report.failures[0].1, ForceError::Lookup(_)));

    assert!(fx.db.record(&scope, "W00001").await.unwrap().unwrap().force_active);
    let history = fx.db.bit_history(&scope, "W00001").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_open());
}

#[test(tokio::test)]
async fn test_bits_in_failed_lookup_chunk_stay_forced() {
    let (fx, scope) = niet_fixture().await;
    let mut config = fx.config.clone();
    config.chunk_size = 1;
    fx.put_remote_dump(&scope, &["5700001 00000001", "5700002 00000001"]);

    let healthy = pipeline_with(
        &fx,
        config.clone(),
        SqliteMetadataSource::connect(&config).await.unwrap(),
    );
    healthy.run_all(1_000).await;

    let flaky = pipeline_with(
        &fx,
        config.clone(),
        FlakySource {
            inner: SqliteMetadataSource::connect(&config).await.unwrap(),
            failing: BTreeSet::from(["W00001".to_string()]),
        },
    );
    let report = flaky.run_all(2_000).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let summary = &report.summaries[0];
    assert_eq!(summary.failed_chunks, 1);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.deforced, 0);

    let pump = fx.db.record(&scope, "W00001").await.unwrap().unwrap();
    assert!(pump.force_active);
    assert_eq!(pump.forced_at, 1_000);

    // Once the store answers again the episode simply continues.
    let report = healthy.run_all(3_000).await;
    assert_eq!(report.summaries[0].changed(), 0);
    let history = fx.db.bit_history(&scope, "W00001").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_open());
    assert_eq!(history[0].forced_at, 1_000);
}

#[test(tokio::test)]
async fn test_cycle_reports_unknown_controller_instead_of_failing() {
    let (fx, scope) = niet_fixture().await;
    fx.put_remote_dump(&scope, &["5700001 00000001"]);
    let pipeline = pipeline(&fx).await;

    let report = pipeline.run_cycle(Some("BGONE"), 1_000).await;
    assert!(report.summaries.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "BGONE");
    assert!(matches!(report.failures[0].1, ForceError::NotFound(_)));

    // The next cycle runs normally.
    let report = pipeline.run_cycle(Some("BTEST"), 2_000).await;
    assert!(report.failures.is_empty());
    assert_eq!(report.summaries[0].forced, 1);
    let report = pipeline.run_cycle(None, 3_000).await;
    assert_eq!(report.summaries.len(), 1);
}

#[test(tokio::test)]
async fn test_sync_scopes_continues_past_a_failed_cleanup() {
    let fx = Fixture::new(&[("BTEST", &["NIET", "HK1"]), ("BPROD", &["HK1"])]).await;
    let niet = Scope::new("BTEST", "NIET");
    let btest_hk1 = Scope::new("BTEST", "HK1");
    let bprod_hk1 = Scope::new("BPROD", "HK1");
    for scope in [&niet, &btest_hk1, &bprod_hk1] {
        fx.put_metadata(scope, &[("W00001", ["10", "LBA", "CP001"], "pump on", "BOOL")])
            .await;
        fx.put_remote_dump(scope, &["5700001 00000001"]);
    }
    pipeline(&fx).await.run_all(1_000).await;

    // A non-empty directory where BTEST/HK1's cached dump should be cannot be unlinked.
    let blocked = fx.config.dump_path(&btest_hk1);
    std::fs::remove_file(&blocked).unwrap();
    std::fs::create_dir_all(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), "x").unwrap();

    let mut config = fx.config.clone();
    config.controllers[0].resources = vec!["NIET".to_string()];
    config.controllers[1].resources.clear();
    let source = SqliteMetadataSource::connect(&config).await.unwrap();
    let pipeline = pipeline_with(&fx, config, source);

    let sync = pipeline.sync_scopes().await.unwrap();
    assert!(!sync.is_clean());
    assert_eq!(sync.failures.len(), 1);
    assert_eq!(sync.failures[0].0, "BTEST/HK1");

    // Files go before rows: the failed scope keeps its rows.
    assert_eq!(fx.db.scope_records(&btest_hk1).await.unwrap().len(), 1);
    assert!(fx.db.persisted_scopes().await.unwrap().contains(&btest_hk1));

    // Everything else stale was still removed.
    assert_eq!(sync.removed_scopes, vec![bprod_hk1.clone()]);
    assert_eq!(sync.removed_controllers, vec!["BPROD".to_string()]);
    assert!(fx.db.scope_records(&bprod_hk1).await.unwrap().is_empty());
    assert!(!fx.db.persisted_controllers().await.unwrap().contains("BPROD"));
    assert_eq!(fx.db.scope_records(&niet).await.unwrap().len(), 1);

    // Cleared up, the next pass finishes the job.
    std::fs::remove_dir_all(&blocked).unwrap();
    let again = pipeline.sync_scopes().await.unwrap();
    assert!(again.is_clean());
    assert_eq!(again.removed_scopes, vec![btest_hk1.clone()]);
    assert!(fx.db.scope_records(&btest_hk1).await.unwrap().is_empty());
}
