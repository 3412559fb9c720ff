use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use wprof_core::{
    LoadResult, LoadStatus, LoaderError, LoaderFactory, LoaderResult, PageLoader, ProfilerConfig,
    RunError, TestRunner, TestSuite, TrialJob,
};

/// Scripted stand-in for a browser loader. Results carry the loader id in
/// `final_url` so tests can see which instance served which trial.
struct MockLoader {
    id: usize,
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    created: AtomicUsize,
    events: Mutex<Vec<String>>,
    /// Worker indexes whose loaders never come up.
    dead_workers: Vec<u32>,
    /// Loader ids whose every load hangs until killed from outside.
    hanging_loaders: Vec<usize>,
    /// Loader ids whose every load errors out.
    broken_loaders: Vec<usize>,
    /// Once this many loaders exist, further setups fail.
    max_loaders: Option<usize>,
}

impl MockState {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl PageLoader for MockLoader {
    async fn setup(&mut self) -> LoaderResult<()> {
        self.state.record(format!("setup {}", self.id));
        Ok(())
    }

    async fn preload_objects(&mut self, _urls: &[String], _fresh: bool) -> LoaderResult<()> {
        Ok(())
    }

    async fn load_page(&mut self, job: &TrialJob, _outdir: &Path) -> LoaderResult<LoadResult> {
        if self.state.hanging_loaders.contains(&self.id) {
            std::future::pending::<()>().await;
        }
        if self.state.broken_loaders.contains(&self.id) {
            return Err(LoaderError::Unresponsive("scripted crash".into()));
        }
        Ok(LoadResult::success(&job.case.url, job.trial)
            .with_final_url(format!("loader-{}", self.id)))
    }

    async fn teardown(&mut self) {
        self.state.record(format!("teardown {}", self.id));
    }
}

struct MockFactory {
    state: Arc<MockState>,
}

#[async_trait]
impl LoaderFactory for MockFactory {
    async fn create(&self, worker_index: u32) -> LoaderResult<Box<dyn PageLoader>> {
        if self.state.dead_workers.contains(&worker_index) {
            return Err(LoaderError::Unresponsive("scripted dead worker".into()));
        }
        let id = self.state.created.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.state.max_loaders {
            if id >= limit {
                return Err(LoaderError::Unresponsive("scripted exhaustion".into()));
            }
        }
        Ok(Box::new(MockLoader {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

fn runner(suite_json: &str, state: &Arc<MockState>) -> TestRunner {
    let suite = TestSuite::from_json_str(suite_json).unwrap();
    let mut config = ProfilerConfig::default();
    // Keep worker deadlines tight so hung-loader tests finish quickly.
    config.timeouts.grace_seconds = 0;
    config.timeouts.worker_stop_seconds = 5;
    let outdir = std::env::temp_dir();
    TestRunner::new(suite, config, outdir)
        .with_factory(Arc::new(MockFactory {
            state: Arc::clone(state),
        }))
        .without_signal_handling()
}

#[tokio::test]
async fn every_trial_produces_exactly_one_result() {
    let state = Arc::new(MockState::default());
    let report = runner(
        r#"{
            "defaults": { "numTrials": 3, "timeoutSeconds": 5 },
            "tests": [{ "url": "https://example.com" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.dispatched, 3);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.successes(), 3);
    assert_eq!(report.workers_ready, 1);
    assert!(!report.interrupted);
}

#[tokio::test]
async fn poisoning_tears_down_every_loader() {
    let state = Arc::new(MockState::default());
    let report = runner(
        r#"{
            "defaults": { "parallelism": 2, "timeoutSeconds": 5 },
            "tests": [
                { "url": "https://a.com" },
                { "url": "https://b.com", "numTrials": 2 }
            ]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(
        report
            .results
            .iter()
            .filter(|result| result.url == "https://b.com")
            .count(),
        2
    );
    // One teardown per setup: the shutdown jobs reached both workers.
    assert_eq!(state.count("setup"), state.count("teardown"));
    assert!(state.count("setup") >= 2);
}

#[tokio::test]
async fn no_trial_is_duplicated_or_skipped_under_parallelism() {
    let state = Arc::new(MockState::default());
    let report = runner(
        r#"{
            "defaults": { "numTrials": 2, "parallelism": 4, "timeoutSeconds": 5 },
            "tests": [
                { "url": "https://a.com" },
                { "url": "https://b.com" },
                { "url": "https://c.com" }
            ]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    let seen: HashSet<(String, u32)> = report
        .results
        .iter()
        .map(|result| (result.url.clone(), result.trial))
        .collect();
    assert_eq!(report.results.len(), 6, "no duplicates");
    assert_eq!(seen.len(), 6, "no skips");
    assert!(seen.contains(&("https://c.com".to_string(), 1)));
}

#[tokio::test]
async fn hung_loader_times_out_and_is_replaced() {
    let state = Arc::new(MockState {
        hanging_loaders: vec![0],
        ..MockState::default()
    });
    let report = runner(
        r#"{
            "defaults": { "numTrials": 3, "timeoutSeconds": 1 },
            "tests": [{ "url": "https://slow.example" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.results.len(), 3);
    let timeouts: Vec<_> = report
        .results
        .iter()
        .filter(|result| result.status == LoadStatus::Timeout)
        .collect();
    assert_eq!(timeouts.len(), 1);

    // The remaining trials came from a replacement loader, not the hung one.
    let served_by: HashSet<_> = report
        .results
        .iter()
        .filter_map(|result| result.final_url.clone())
        .collect();
    assert!(!served_by.contains("loader-0"));
    assert_eq!(report.successes(), 2);
    // The hung loader was torn down when it was replaced.
    assert!(state.events().contains(&"teardown 0".to_string()));
}

#[tokio::test]
async fn crashed_loader_yields_failure_and_run_continues() {
    let state = Arc::new(MockState {
        broken_loaders: vec![0],
        ..MockState::default()
    });
    let report = runner(
        r#"{
            "defaults": { "numTrials": 2, "timeoutSeconds": 5 },
            "tests": [{ "url": "https://crashy.example" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.successes(), 1);
    assert_eq!(
        report
            .results
            .iter()
            .filter(|result| result.status == LoadStatus::Failed)
            .count(),
        1
    );
}

#[tokio::test]
async fn interrupt_abandons_inflight_work_and_tears_everything_down() {
    // The only loader hangs forever on a 60s case timeout, so the run can
    // only finish promptly if the interrupt cuts through the trial itself.
    let state = Arc::new(MockState {
        hanging_loaders: vec![0],
        ..MockState::default()
    });
    let runner = runner(
        r#"{
            "defaults": { "numTrials": 3, "timeoutSeconds": 60 },
            "tests": [{ "url": "https://example.com" }]
        }"#,
        &state,
    );
    let interrupt = runner.interrupt_handle();
    let run = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    interrupt.interrupt();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("interrupt unwinds the run before any timeout fires")
        .unwrap()
        .unwrap();

    assert!(report.interrupted);
    assert!(report.results.is_empty(), "abandoned trial yields no result");
    // Every loader that came up was torn down again.
    assert_eq!(state.count("setup"), state.count("teardown"));
    assert!(state.count("setup") >= 1);
}

#[tokio::test]
async fn run_aborts_when_no_worker_comes_up() {
    let state = Arc::new(MockState {
        dead_workers: vec![0, 1],
        ..MockState::default()
    });
    let err = runner(
        r#"{
            "defaults": { "parallelism": 2, "timeoutSeconds": 5 },
            "tests": [{ "url": "https://example.com" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, RunError::NoWorkersReady));
}

#[tokio::test]
async fn surviving_worker_drains_the_whole_suite() {
    let state = Arc::new(MockState {
        dead_workers: vec![1],
        ..MockState::default()
    });
    let report = runner(
        r#"{
            "defaults": { "numTrials": 4, "parallelism": 2, "timeoutSeconds": 5 },
            "tests": [{ "url": "https://example.com" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.workers_ready, 1);
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.successes(), 4);
}

#[tokio::test]
async fn run_unwinds_when_every_worker_dies_mid_suite() {
    // Loader 0 crashes on every load and no replacement can be built, so the
    // only worker dies with jobs still queued. The run must still return.
    let state = Arc::new(MockState {
        broken_loaders: vec![0],
        max_loaders: Some(1),
        ..MockState::default()
    });
    let report = runner(
        r#"{
            "defaults": { "numTrials": 3, "timeoutSeconds": 5 },
            "tests": [{ "url": "https://example.com" }]
        }"#,
        &state,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.dispatched, 3);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].status, LoadStatus::Failed);
}
