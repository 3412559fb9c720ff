use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("failed to read suite {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse suite: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("test case {case} has no url")]
    MissingUrl { case: usize },
    #[error("test case {case} has an invalid url {url:?}: {source}")]
    InvalidUrl {
        case: usize,
        url: String,
        source: url::ParseError,
    },
    #[error("test case {case} has invalid trial count {value}")]
    InvalidTrialCount { case: usize, value: u32 },
    #[error("test case {case} has invalid timeout {value}s")]
    InvalidTimeout { case: usize, value: u64 },
    #[error("unknown browser: {0}")]
    UnknownBrowser(String),
    #[error("invalid parallelism {0}")]
    InvalidParallelism(usize),
    #[error("suite contains no test cases")]
    Empty,
}

pub type SuiteResult<T> = std::result::Result<T, SuiteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chrome,
    Firefox,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chrome => "chrome",
            Browser::Firefox => "firefox",
        }
    }
}

impl std::fmt::Display for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Browser {
    type Err = SuiteError;

    fn from_str(s: &str) -> SuiteResult<Self> {
        match s {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            other => Err(SuiteError::UnknownBrowser(other.to_string())),
        }
    }
}

/// Suite-wide settings consumed when a loader is constructed. These are only
/// honored in the suite `defaults` block: loaders live for many jobs, so a
/// single case cannot re-pick the browser or flip browser-tuning flags.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub browser: Browser,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub disable_local_cache: bool,
    pub disable_quic: bool,
    pub disable_spdy: bool,
    pub ignore_certificate_errors: bool,
    pub ssl_key_log_file: Option<PathBuf>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            browser: Browser::Chrome,
            headless: true,
            user_agent: None,
            disable_local_cache: false,
            disable_quic: false,
            disable_spdy: false,
            ignore_certificate_errors: false,
            ssl_key_log_file: None,
        }
    }
}

/// One measured page, fully resolved. Immutable once expanded into jobs.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub url: String,
    pub trials: u32,
    pub save_trace: bool,
    pub capture_packets: bool,
    pub capture_screenshot: bool,
    pub fresh_view_per_trial: bool,
    pub preload: Vec<String>,
    pub timeout: Duration,
    /// File-name prefix for saved traces. Private per-case default (derived
    /// from the url), never inherited from suite defaults.
    pub trace_file_name: Option<String>,
    pub screenshot_file_name: Option<String>,
}

impl TestCase {
    /// Prefix used for artifacts (traces, pcaps) belonging to this case.
    pub fn artifact_label(&self) -> String {
        match &self.trace_file_name {
            Some(name) => name.clone(),
            None => sanitize_label(&self.url),
        }
    }
}

fn sanitize_label(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TestSuite {
    pub settings: LoaderSettings,
    pub parallelism: usize,
    pub cases: Vec<Arc<TestCase>>,
}

impl TestSuite {
    pub fn from_path<P: AsRef<Path>>(path: P) -> SuiteResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SuiteError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> SuiteResult<Self> {
        let raw: RawSuite = serde_json::from_str(content)?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawSuite) -> SuiteResult<Self> {
        if raw.tests.is_empty() {
            return Err(SuiteError::Empty);
        }
        let defaults = raw.defaults;

        let browser = match &defaults.browser {
            Some(name) => name.parse()?,
            None => Browser::Chrome,
        };
        let parallelism = defaults.parallelism.unwrap_or(1);
        if parallelism < 1 {
            return Err(SuiteError::InvalidParallelism(parallelism));
        }
        let settings = LoaderSettings {
            browser,
            headless: defaults.headless.unwrap_or(true),
            user_agent: defaults.user_agent.clone(),
            disable_local_cache: defaults.disable_local_cache.unwrap_or(false),
            disable_quic: defaults.disable_quic.unwrap_or(false),
            disable_spdy: defaults.disable_spdy.unwrap_or(false),
            ignore_certificate_errors: defaults.ignore_certificate_errors.unwrap_or(false),
            ssl_key_log_file: defaults.ssl_key_log_file.clone(),
        };

        let mut cases = Vec::with_capacity(raw.tests.len());
        for (index, case) in raw.tests.into_iter().enumerate() {
            let url = case.url.ok_or(SuiteError::MissingUrl { case: index })?;
            Url::parse(&url).map_err(|source| SuiteError::InvalidUrl {
                case: index,
                url: url.clone(),
                source,
            })?;

            // Cascade: case-local, then suite defaults, then the global
            // built-ins. Output file names never cascade.
            let trials = case
                .num_trials
                .or(defaults.num_trials)
                .unwrap_or(1);
            if trials < 1 {
                return Err(SuiteError::InvalidTrialCount {
                    case: index,
                    value: trials,
                });
            }
            let timeout_seconds = case
                .timeout_seconds
                .or(defaults.timeout_seconds)
                .unwrap_or(30);
            if timeout_seconds < 1 {
                return Err(SuiteError::InvalidTimeout {
                    case: index,
                    value: timeout_seconds,
                });
            }

            cases.push(Arc::new(TestCase {
                url,
                trials,
                save_trace: case.save_trace.or(defaults.save_trace).unwrap_or(false),
                capture_packets: case
                    .capture_packets
                    .or(defaults.capture_packets)
                    .unwrap_or(false),
                capture_screenshot: case
                    .capture_screenshot
                    .or(defaults.capture_screenshot)
                    .unwrap_or(false),
                fresh_view_per_trial: case
                    .fresh_view_per_trial
                    .or(defaults.fresh_view_per_trial)
                    .unwrap_or(false),
                preload: case
                    .preload
                    .or_else(|| defaults.preload.clone())
                    .unwrap_or_default(),
                timeout: Duration::from_secs(timeout_seconds),
                trace_file_name: case.trace_file_name,
                screenshot_file_name: case.screenshot_file_name,
            }));
        }

        Ok(Self {
            settings,
            parallelism,
            cases,
        })
    }

    /// One job per trial per case, in deterministic (case, trial) order.
    pub fn expand_jobs(&self) -> Vec<TrialJob> {
        let mut jobs = Vec::new();
        for case in &self.cases {
            for trial in 0..case.trials {
                jobs.push(TrialJob {
                    case: Arc::clone(case),
                    trial,
                });
            }
        }
        jobs
    }

    pub fn total_trials(&self) -> usize {
        self.cases.iter().map(|case| case.trials as usize).sum()
    }
}

/// A unit of dispatchable work. The shutdown instruction is a distinct
/// variant so it can never be mistaken for a real trial.
#[derive(Debug, Clone)]
pub enum Job {
    Trial(TrialJob),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TrialJob {
    pub case: Arc<TestCase>,
    pub trial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure_timeout")]
    Timeout,
    #[serde(rename = "failure_unknown")]
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::Timeout => "failure_timeout",
            LoadStatus::Failed => "failure_unknown",
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one executed job. Produced exactly once per trial; shutdown
/// jobs produce none.
#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub status: LoadStatus,
    pub url: String,
    pub trial: u32,
    /// Page load time in seconds, when the loader can measure it.
    pub load_time: Option<f64>,
    /// Final url after redirects, when the loader can observe it.
    pub final_url: Option<String>,
    /// Saved network trace, when the case asked for one.
    pub trace_path: Option<PathBuf>,
    pub screenshot_path: Option<PathBuf>,
    pub completed_at: DateTime<Utc>,
}

impl LoadResult {
    pub fn success(url: &str, trial: u32) -> Self {
        Self::new(LoadStatus::Success, url, trial)
    }

    pub fn failure(status: LoadStatus, url: &str, trial: u32) -> Self {
        debug_assert_ne!(status, LoadStatus::Success);
        Self::new(status, url, trial)
    }

    fn new(status: LoadStatus, url: &str, trial: u32) -> Self {
        Self {
            status,
            url: url.to_string(),
            trial,
            load_time: None,
            final_url: None,
            trace_path: None,
            screenshot_path: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_load_time(mut self, seconds: f64) -> Self {
        self.load_time = Some(seconds);
        self
    }

    pub fn with_final_url(mut self, url: String) -> Self {
        self.final_url = Some(url);
        self
    }

    pub fn with_trace_path(mut self, path: PathBuf) -> Self {
        self.trace_path = Some(path);
        self
    }

    pub fn with_screenshot_path(mut self, path: PathBuf) -> Self {
        self.screenshot_path = Some(path);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSuite {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    tests: Vec<RawCase>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawDefaults {
    num_trials: Option<u32>,
    save_trace: Option<bool>,
    capture_packets: Option<bool>,
    capture_screenshot: Option<bool>,
    fresh_view_per_trial: Option<bool>,
    timeout_seconds: Option<u64>,
    preload: Option<Vec<String>>,
    headless: Option<bool>,
    browser: Option<String>,
    parallelism: Option<usize>,
    disable_local_cache: Option<bool>,
    disable_quic: Option<bool>,
    disable_spdy: Option<bool>,
    ignore_certificate_errors: Option<bool>,
    user_agent: Option<String>,
    ssl_key_log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCase {
    url: Option<String>,
    num_trials: Option<u32>,
    save_trace: Option<bool>,
    capture_packets: Option<bool>,
    capture_screenshot: Option<bool>,
    fresh_view_per_trial: Option<bool>,
    timeout_seconds: Option<u64>,
    preload: Option<Vec<String>>,
    trace_file_name: Option<String>,
    screenshot_file_name: Option<String>,
}
