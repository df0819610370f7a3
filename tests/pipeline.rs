use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use scholarly_harvester::{
    HarvestError, HarvestRequest, HarvestWindow, HarvestedRecord, Harvester, JsonNormalizer,
    MemoryGraphSink, NormalizeError, NormalizeJob, NormalizedGraph, Normalizer, Pipeline,
    RawRecord, RawRecordId, RawRecordStore, RecordStream, RetryPolicy, RuntimeConfig,
    SourceRegistry, TaskState, XmlNormalizer,
};

const HARVEST: &str = "run_harvester";
const NORMALIZE: &str = "run_normalizer";

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn record(id: &str, title: &str) -> HarvestedRecord {
    HarvestedRecord::json(id, &serde_json::json!({ "id": id, "title": title }))
}

/// Serves a fixed record list after failing its first `failures` calls.
struct ScriptedHarvester {
    source: &'static str,
    records: Mutex<Vec<HarvestedRecord>>,
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedHarvester {
    fn new(source: &'static str, records: Vec<HarvestedRecord>) -> Self {
        Self {
            source,
            records: Mutex::new(records),
            failures: 0,
            calls: AtomicU32::new(0),
        }
    }

    fn failing_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }
}

impl Harvester for ScriptedHarvester {
    fn source(&self) -> &str {
        self.source
    }

    fn harvest(&self, _window: HarvestWindow) -> RecordStream<'_> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let records = self.records.lock().unwrap().clone();

        if call <= self.failures {
            // First record arrives, then the next page fails.
            let items = records
                .into_iter()
                .take(1)
                .map(Ok)
                .chain(std::iter::once(Err(HarvestError::Network(
                    "connection reset".to_string(),
                ))));
            return Box::pin(futures::stream::iter(items));
        }

        Box::pin(futures::stream::iter(
            records.into_iter().map(Ok::<_, HarvestError>),
        ))
    }
}

/// Fails every record whose provider id is listed, succeeds otherwise.
struct PickyNormalizer {
    reject: Vec<&'static str>,
    attempts: AtomicU32,
}

#[async_trait]
impl Normalizer for PickyNormalizer {
    async fn normalize(&self, raw: &RawRecord) -> Result<NormalizedGraph, NormalizeError> {
        if self.reject.contains(&raw.provider_id.as_str()) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(NormalizeError::Mapping(format!(
                "no mapping for {}",
                raw.provider_id
            )));
        }
        JsonNormalizer.normalize(raw).await
    }
}

enum Misbehavior {
    Panic,
    FarLookback,
    Slow(Duration),
}

/// A "vivo" harvester that yields nothing, in one of several bad ways.
struct MisbehavingHarvester(Misbehavior);

impl Harvester for MisbehavingHarvester {
    fn source(&self) -> &str {
        "vivo"
    }

    fn default_lookback(&self) -> chrono::Duration {
        match self.0 {
            // Past the earliest representable timestamp.
            Misbehavior::FarLookback => chrono::Duration::days(100_000_000),
            _ => chrono::Duration::days(1),
        }
    }

    fn harvest(&self, _window: HarvestWindow) -> RecordStream<'_> {
        match self.0 {
            Misbehavior::Panic => panic!("upstream client bug"),
            Misbehavior::Slow(delay) => Box::pin(
                futures::stream::once(tokio::time::sleep(delay))
                    .filter_map(|()| async { None::<Result<HarvestedRecord, HarvestError>> }),
            ),
            Misbehavior::FarLookback => Box::pin(futures::stream::empty::<
                Result<HarvestedRecord, HarvestError>,
            >()),
        }
    }
}

struct PanickingNormalizer;

#[async_trait]
impl Normalizer for PanickingNormalizer {
    async fn normalize(&self, raw: &RawRecord) -> Result<NormalizedGraph, NormalizeError> {
        panic!("mapping table missing for {}", raw.provider_id)
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        countdown: Duration::from_millis(5),
    }
}

fn start(
    harvester: Arc<dyn Harvester>,
    normalizer: Arc<dyn Normalizer>,
    runtime: RuntimeConfig,
) -> (Pipeline, Arc<MemoryGraphSink>) {
    let registry = SourceRegistry::new()
        .register(harvester, normalizer)
        .unwrap();
    let sink = Arc::new(MemoryGraphSink::new());
    let pipeline = Pipeline::builder(registry, sink.clone())
        .with_runtime(runtime)
        .with_retry_policy(fast_retry())
        .start();
    (pipeline, sink)
}

async fn settle(pipeline: &Pipeline) {
    tokio::time::timeout(Duration::from_secs(10), pipeline.wait_idle())
        .await
        .expect("pipeline did not settle");
}

async fn stored_provider_ids(pipeline: &Pipeline, ids: &[RawRecordId]) -> Vec<String> {
    let mut provider_ids = Vec::new();
    for id in ids {
        provider_ids.push(pipeline.store().get(*id).await.unwrap().provider_id);
    }
    provider_ids.sort();
    provider_ids
}

#[tokio::test]
async fn test_window_scenario_stores_and_normalizes_each_record() {
    let harvester = Arc::new(ScriptedHarvester::new(
        "vivo",
        vec![record("id1", "first"), record("id2", "second")],
    ));
    let (pipeline, sink) = start(harvester, Arc::new(JsonNormalizer), RuntimeConfig::default());

    let task = pipeline
        .submit_harvest(HarvestRequest::between("vivo", ts(2024, 1, 1), ts(2024, 1, 2)))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().get(task).unwrap().state, TaskState::Succeeded);
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 2);

    let raw_ids = sink.raw_ids();
    assert_eq!(raw_ids.len(), 2);
    assert_eq!(
        stored_provider_ids(&pipeline, &raw_ids).await,
        vec!["id1".to_string(), "id2".to_string()]
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_enqueues_one_normalize_task_per_record() {
    let records: Vec<_> = (0..50).map(|i| record(&format!("id{i}"), "t")).collect();
    let harvester = Arc::new(ScriptedHarvester::new("vivo", records));
    let runtime = RuntimeConfig {
        worker_concurrency: 4,
        ..RuntimeConfig::default()
    };
    let (pipeline, sink) = start(harvester, Arc::new(JsonNormalizer), runtime);

    pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 50);
    assert_eq!(sink.raw_ids().len(), 50);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_reharvest_does_not_duplicate_unchanged_records() {
    let harvester = Arc::new(ScriptedHarvester::new(
        "vivo",
        vec![record("id1", "first"), record("id2", "second")],
    ));
    let (pipeline, _sink) = start(
        harvester.clone(),
        Arc::new(JsonNormalizer),
        RuntimeConfig::default(),
    );
    let request = HarvestRequest::between("vivo", ts(2024, 1, 1), ts(2024, 1, 2));

    pipeline.submit_harvest(request.clone()).await.unwrap();
    settle(&pipeline).await;
    pipeline.submit_harvest(request).await.unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().count(HARVEST, TaskState::Succeeded), 2);
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 2);
    assert_eq!(pipeline.store().versions("vivo", "id1").await.unwrap().len(), 1);
    assert_eq!(pipeline.store().versions("vivo", "id2").await.unwrap().len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_reharvest_normalizes_changed_payload_only() {
    let harvester = Arc::new(ScriptedHarvester::new(
        "vivo",
        vec![record("id1", "first"), record("id2", "second")],
    ));
    let (pipeline, _sink) = start(
        harvester.clone(),
        Arc::new(JsonNormalizer),
        RuntimeConfig::default(),
    );

    pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    *harvester.records.lock().unwrap() = vec![record("id1", "first"), record("id2", "revised")];
    pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 3);
    assert_eq!(pipeline.store().versions("vivo", "id1").await.unwrap().len(), 1);
    assert_eq!(pipeline.store().versions("vivo", "id2").await.unwrap().len(), 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_reprocess_unchanged_fans_out_again() {
    let harvester = Arc::new(ScriptedHarvester::new("vivo", vec![record("id1", "first")]));
    let runtime = RuntimeConfig {
        reprocess_unchanged: true,
        ..RuntimeConfig::default()
    };
    let (pipeline, sink) = start(harvester, Arc::new(JsonNormalizer), runtime);

    for _ in 0..2 {
        pipeline
            .submit_harvest(HarvestRequest::latest("vivo"))
            .await
            .unwrap();
        settle(&pipeline).await;
    }

    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 2);
    assert_eq!(sink.graphs().len(), 2);
    assert_eq!(pipeline.store().versions("vivo", "id1").await.unwrap().len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_transient_harvest_failure_retries_whole_run() {
    let harvester = Arc::new(
        ScriptedHarvester::new("vivo", vec![record("id1", "a"), record("id2", "b")])
            .failing_first(1),
    );
    let (pipeline, sink) = start(
        harvester.clone(),
        Arc::new(JsonNormalizer),
        RuntimeConfig::default(),
    );

    let task = pipeline
        .submit_harvest(HarvestRequest::latest("vivo").started_by("ops"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let record = pipeline.ledger().get(task).unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.attempts, 2);
    assert!(record.last_error.unwrap().contains("connection reset"));
    assert_eq!(harvester.calls.load(Ordering::SeqCst), 2);

    // id1 was stored during the failed attempt; the retry must not
    // normalize it a second time.
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 2);
    assert_eq!(sink.raw_ids().len(), 2);

    let normalizers: Vec<_> = pipeline
        .ledger()
        .snapshot()
        .into_iter()
        .filter(|r| r.name == NORMALIZE)
        .collect();
    assert!(normalizers
        .iter()
        .all(|r| r.started_by.as_deref() == Some("ops")));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_harvest_fails_after_retries_exhausted() {
    let harvester = Arc::new(
        ScriptedHarvester::new("vivo", vec![record("id1", "a")]).failing_first(u32::MAX),
    );
    let (pipeline, _sink) = start(
        harvester.clone(),
        Arc::new(JsonNormalizer),
        RuntimeConfig::default(),
    );

    let task = pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let record = pipeline.ledger().get(task).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 4);
    assert_eq!(harvester.calls.load(Ordering::SeqCst), 4);

    // The record seen in the first failed attempt was stored and normalized
    // exactly once.
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_missing_raw_record_fails_without_affecting_siblings() {
    let harvester = Arc::new(ScriptedHarvester::new("vivo", vec![]));
    let (pipeline, sink) = start(harvester, Arc::new(JsonNormalizer), RuntimeConfig::default());

    let stored = pipeline
        .store()
        .put("vivo", record("b", "present"))
        .await
        .unwrap();

    let missing = pipeline
        .submit_normalize(NormalizeJob {
            source: "vivo".to_string(),
            raw_id: RawRecordId(9_999),
            started_by: None,
        })
        .await
        .unwrap();
    let present = pipeline
        .submit_normalize(NormalizeJob {
            source: "vivo".to_string(),
            raw_id: stored.id,
            started_by: None,
        })
        .await
        .unwrap();
    settle(&pipeline).await;

    let missing = pipeline.ledger().get(missing).unwrap();
    assert_eq!(missing.state, TaskState::Failed);
    assert_eq!(missing.attempts, 1);
    assert!(missing.last_error.unwrap().contains("not found"));

    assert_eq!(pipeline.ledger().get(present).unwrap().state, TaskState::Succeeded);
    assert_eq!(sink.raw_ids(), vec![stored.id]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_normalization_failure_is_retried_in_isolation() {
    let harvester = Arc::new(ScriptedHarvester::new(
        "vivo",
        vec![record("a", "unmappable"), record("b", "fine")],
    ));
    let normalizer = Arc::new(PickyNormalizer {
        reject: vec!["a"],
        attempts: AtomicU32::new(0),
    });
    let (pipeline, sink) = start(harvester, normalizer.clone(), RuntimeConfig::default());

    let harvest = pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().get(harvest).unwrap().state, TaskState::Succeeded);
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Failed), 1);
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 1);
    assert_eq!(normalizer.attempts.load(Ordering::SeqCst), 4);

    let graphs = sink.graphs();
    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].graph["@graph"][0]["@id"], "b");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unknown_source_fails_immediately() {
    let harvester = Arc::new(ScriptedHarvester::new("vivo", vec![]));
    let (pipeline, _sink) = start(harvester, Arc::new(JsonNormalizer), RuntimeConfig::default());

    let task = pipeline
        .submit_harvest(HarvestRequest::latest("arxiv"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let record = pipeline.ledger().get(task).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_harvests_of_different_sources() {
    let registry = SourceRegistry::new()
        .register(
            Arc::new(ScriptedHarvester::new("vivo", vec![record("x", "vivo")])),
            Arc::new(JsonNormalizer),
        )
        .unwrap()
        .register(
            Arc::new(ScriptedHarvester::new("iacr", vec![record("x", "iacr")])),
            Arc::new(JsonNormalizer),
        )
        .unwrap();
    let sink = Arc::new(MemoryGraphSink::new());
    let pipeline = Pipeline::builder(registry, sink.clone())
        .with_retry_policy(fast_retry())
        .start();

    pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    pipeline
        .submit_harvest(HarvestRequest::latest("iacr"))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Succeeded), 2);
    let mut sources: Vec<_> = sink.graphs().into_iter().map(|g| g.source).collect();
    sources.sort();
    assert_eq!(sources, vec!["iacr".to_string(), "vivo".to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_panicking_harvester_is_recorded_as_failed() {
    let harvester = Arc::new(MisbehavingHarvester(Misbehavior::Panic));
    let (pipeline, sink) = start(harvester, Arc::new(JsonNormalizer), RuntimeConfig::default());

    let task = pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let failed = pipeline.ledger().get(task).unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.unwrap().contains("upstream client bug"));

    // The worker pool is still serving other tasks.
    let stored = pipeline
        .store()
        .put("vivo", record("a", "fine"))
        .await
        .unwrap();
    let normalize = pipeline
        .submit_normalize(NormalizeJob {
            source: "vivo".to_string(),
            raw_id: stored.id,
            started_by: None,
        })
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().get(normalize).unwrap().state, TaskState::Succeeded);
    assert_eq!(sink.raw_ids(), vec![stored.id]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_panicking_normalizer_is_recorded_as_failed() {
    let harvester = Arc::new(ScriptedHarvester::new("vivo", vec![record("a", "x")]));
    let (pipeline, sink) = start(harvester, Arc::new(PanickingNormalizer), RuntimeConfig::default());

    pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    assert_eq!(pipeline.ledger().count(HARVEST, TaskState::Succeeded), 1);
    assert_eq!(pipeline.ledger().count(NORMALIZE, TaskState::Failed), 1);
    assert!(sink.graphs().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_default_window_fails_without_retry() {
    let harvester = Arc::new(MisbehavingHarvester(Misbehavior::FarLookback));
    let (pipeline, _sink) = start(harvester, Arc::new(JsonNormalizer), RuntimeConfig::default());

    let task = pipeline
        .submit_harvest(HarvestRequest::latest("vivo"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let record = pipeline.ledger().get(task).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.unwrap().contains("out of range"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_tasks_still_queued() {
    let harvester = Arc::new(MisbehavingHarvester(Misbehavior::Slow(Duration::from_millis(300))));
    let runtime = RuntimeConfig {
        worker_concurrency: 1,
        ..RuntimeConfig::default()
    };
    let (pipeline, _sink) = start(harvester, Arc::new(JsonNormalizer), runtime);

    for _ in 0..3 {
        pipeline
            .submit_harvest(HarvestRequest::latest("vivo"))
            .await
            .unwrap();
    }
    // Let the first run take the only worker slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ledger = Arc::clone(pipeline.ledger());
    pipeline.shutdown().await;
    tokio::time::timeout(Duration::from_secs(10), ledger.wait_idle())
        .await
        .expect("queued tasks were left pending");

    assert_eq!(ledger.count(HARVEST, TaskState::Succeeded), 1);
    assert_eq!(ledger.count(HARVEST, TaskState::Failed), 2);
    assert!(ledger
        .snapshot()
        .into_iter()
        .filter(|r| r.state == TaskState::Failed)
        .all(|r| r.last_error.unwrap_or_default().contains("shut down")));
}

#[tokio::test]
async fn test_xml_records_are_normalized() {
    let item = "<item><link>https://eprint.iacr.org/2024/001</link>\
                <title>Lattice Sieving</title></item>";
    let harvester = Arc::new(ScriptedHarvester::new(
        "iacr",
        vec![HarvestedRecord::xml("https://eprint.iacr.org/2024/001", item)],
    ));
    let (pipeline, sink) = start(harvester, Arc::new(XmlNormalizer), RuntimeConfig::default());

    pipeline
        .submit_harvest(HarvestRequest::latest("iacr"))
        .await
        .unwrap();
    settle(&pipeline).await;

    let graphs = sink.graphs();
    assert_eq!(graphs.len(), 1);
    let node = &graphs[0].graph["@graph"][0];
    assert_eq!(node["@id"], "https://eprint.iacr.org/2024/001");
    assert_eq!(node["attributes"]["title"], "Lattice Sieving");

    pipeline.shutdown().await;
}
