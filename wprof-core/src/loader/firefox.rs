use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ProfilerConfig;
use crate::deadline::run_with_deadline;
use crate::suite::{LoadResult, LoadStatus, LoaderSettings, TrialJob};

use super::{
    describe_command, stop_child, CommandExecutor, LoaderError, LoaderResult, PageLoader,
    SystemCommandExecutor, WorkerResources,
};

const DRIVER_POLL_ATTEMPTS: u32 = 20;
const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(250);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Firefox driven through geckodriver's WebDriver endpoint. Firefox cannot
/// produce network traces here, so results carry the navigation-timing load
/// time and final url instead.
pub struct FirefoxLoader {
    config: ProfilerConfig,
    settings: LoaderSettings,
    resources: WorkerResources,
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
    _profile: tempfile::TempDir,
    display_server: Option<Child>,
    driver: Option<Child>,
    session_id: Option<String>,
}

impl FirefoxLoader {
    pub fn new(
        config: ProfilerConfig,
        settings: LoaderSettings,
        worker_index: u32,
    ) -> LoaderResult<Self> {
        let profile = tempfile::Builder::new().prefix("wprof-firefox-").tempdir()?;
        let resources = WorkerResources::allocate(worker_index, profile.path().to_path_buf())?;
        Ok(Self {
            config,
            settings,
            resources,
            executor: Arc::new(SystemCommandExecutor),
            http: reqwest::Client::new(),
            _profile: profile,
            display_server: None,
            driver: None,
            session_id: None,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn resources(&self) -> &WorkerResources {
        &self.resources
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.resources.debug_port)
    }

    fn session_url(&self, suffix: &str) -> LoaderResult<String> {
        let session = self
            .session_id
            .as_deref()
            .ok_or_else(|| LoaderError::Protocol("no active webdriver session".into()))?;
        Ok(format!("{}/session/{session}{suffix}", self.base_url()))
    }

    fn capabilities(&self) -> Value {
        let mut args = Vec::new();
        if self.settings.headless {
            args.push("-headless".to_string());
        }
        let mut prefs = serde_json::Map::new();
        if self.settings.disable_local_cache {
            prefs.insert("browser.cache.disk.enable".into(), json!(false));
            prefs.insert("browser.cache.memory.enable".into(), json!(false));
        }
        if self.settings.disable_spdy {
            prefs.insert("network.http.spdy.enabled".into(), json!(false));
        }
        if self.settings.disable_quic {
            prefs.insert("network.http.http3.enabled".into(), json!(false));
        }
        if let Some(agent) = &self.settings.user_agent {
            prefs.insert("general.useragent.override".into(), json!(agent));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "firefox",
                    "acceptInsecureCerts": self.settings.ignore_certificate_errors,
                    "moz:firefoxOptions": {
                        "binary": self.config.tools.firefox,
                        "args": args,
                        "prefs": Value::Object(prefs),
                    }
                }
            }
        })
    }

    fn spawn_display(&mut self) -> LoaderResult<()> {
        let mut command = Command::new(&self.config.tools.xvfb);
        command
            .arg(&self.resources.display)
            .arg("-screen")
            .arg(self.config.display.screen_number.to_string())
            .arg(&self.config.display.screen);
        let child = self
            .executor
            .spawn(&mut command)
            .map_err(|source| LoaderError::Spawn {
                command: describe_command(&command),
                source,
            })?;
        self.display_server = Some(child);
        Ok(())
    }

    fn spawn_driver(&mut self) -> LoaderResult<()> {
        let mut command = Command::new(&self.config.tools.geckodriver);
        command
            .arg("--port")
            .arg(self.resources.debug_port.to_string());
        if !self.settings.headless {
            command.env("DISPLAY", &self.resources.display);
        }
        if let Some(keylog) = &self.settings.ssl_key_log_file {
            command.env("SSLKEYLOGFILE", keylog);
        }
        let child = self
            .executor
            .spawn(&mut command)
            .map_err(|source| LoaderError::Spawn {
                command: describe_command(&command),
                source,
            })?;
        self.driver = Some(child);
        Ok(())
    }

    async fn wait_for_driver(&self) -> LoaderResult<()> {
        let url = format!("{}/status", self.base_url());
        for attempt in 0..DRIVER_POLL_ATTEMPTS {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(attempt, "geckodriver ready");
                    return Ok(());
                }
                Ok(response) => debug!(attempt, status = %response.status(), "driver not ready"),
                Err(err) => debug!(attempt, error = %err, "driver not reachable"),
            }
            sleep(DRIVER_POLL_INTERVAL).await;
        }
        Err(LoaderError::Unresponsive(format!(
            "geckodriver at {url} never answered"
        )))
    }

    async fn open_session(&mut self) -> LoaderResult<()> {
        let response: Value = self
            .http
            .post(format!("{}/session", self.base_url()))
            .json(&self.capabilities())
            .send()
            .await?
            .json()
            .await?;
        let session_id = response["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| LoaderError::Protocol(format!("no sessionId in {response}")))?
            .to_string();
        self.session_id = Some(session_id);
        Ok(())
    }

    async fn execute_script(&self, script: &str) -> LoaderResult<Value> {
        let url = self.session_url("/execute/sync")?;
        let response: Value = self
            .http
            .post(url)
            .json(&json!({ "script": script, "args": [] }))
            .send()
            .await?
            .json()
            .await?;
        Ok(response["value"].clone())
    }

    async fn navigate(&self, url: &str) -> LoaderResult<()> {
        let endpoint = self.session_url("/url")?;
        let response = self
            .http
            .post(endpoint)
            .json(&json!({ "url": url }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            Err(LoaderError::Protocol(format!(
                "navigation to {url} rejected: {body}"
            )))
        }
    }

    async fn wait_until_loaded(&self) -> LoaderResult<()> {
        loop {
            let state = self.execute_script("return document.readyState;").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn measure(&self, job: &TrialJob) -> LoaderResult<LoadResult> {
        self.navigate(&job.case.url).await?;
        self.wait_until_loaded().await?;

        let seconds = self
            .execute_script(
                "var t = window.performance.timing; \
                 return (t.loadEventEnd - t.fetchStart) / 1000.0;",
            )
            .await?
            .as_f64();

        let final_url: Value = self
            .http
            .get(self.session_url("/url")?)
            .send()
            .await?
            .json()
            .await?;

        let mut result = LoadResult::success(&job.case.url, job.trial);
        if let Some(seconds) = seconds.filter(|s| *s >= 0.0) {
            result = result.with_load_time(seconds);
        }
        if let Some(url) = final_url["value"].as_str() {
            result = result.with_final_url(url.to_string());
        }
        Ok(result)
    }

    /// Capture the rendered viewport as a PNG next to the other artifacts.
    async fn save_screenshot(&self, job: &TrialJob, outdir: &Path) -> LoaderResult<PathBuf> {
        let response: Value = self
            .http
            .get(self.session_url("/screenshot")?)
            .send()
            .await?
            .json()
            .await?;
        let encoded = response["value"]
            .as_str()
            .ok_or_else(|| LoaderError::Protocol(format!("no screenshot payload in {response}")))?;
        let bytes = BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| LoaderError::Protocol(format!("undecodable screenshot: {err}")))?;
        let name = job
            .case
            .screenshot_file_name
            .clone()
            .unwrap_or_else(|| job.case.artifact_label());
        let path = outdir.join(format!("{name}_trial{}.png", job.trial));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session_id.take() {
            let endpoint = format!("{}/session/{session}", self.base_url());
            if let Err(err) = self.http.delete(endpoint).send().await {
                warn!(error = %err, "failed to close webdriver session");
            }
        }
    }
}

#[async_trait]
impl PageLoader for FirefoxLoader {
    async fn setup(&mut self) -> LoaderResult<()> {
        if !self.settings.headless {
            self.spawn_display()?;
            sleep(Duration::from_millis(
                self.config.timeouts.display_stabilize_ms,
            ))
            .await;
        }
        self.spawn_driver()?;
        self.wait_for_driver().await?;
        self.open_session().await?;
        sleep(Duration::from_millis(
            self.config.timeouts.browser_stabilize_ms,
        ))
        .await;
        info!(
            port = self.resources.debug_port,
            display = %self.resources.display,
            headless = self.settings.headless,
            "firefox ready"
        );
        Ok(())
    }

    async fn preload_objects(&mut self, urls: &[String], _fresh: bool) -> LoaderResult<()> {
        // Fresh trials get a whole new loader (and profile), so there is no
        // per-trial state to reset here.
        for url in urls {
            debug!(url = %url, "preloading object");
            self.navigate(url).await?;
            self.wait_until_loaded().await?;
        }
        Ok(())
    }

    async fn load_page(&mut self, job: &TrialJob, outdir: &Path) -> LoaderResult<LoadResult> {
        if job.case.save_trace {
            warn!(url = %job.case.url, "firefox cannot save network traces, skipping");
        }
        info!(url = %job.case.url, trial = job.trial, "loading page");
        let limit = job.case.timeout + self.config.timeouts.grace();
        let mut result = match run_with_deadline(limit, self.measure(job)).await {
            Ok(result) => result?,
            Err(deadline) => {
                warn!(url = %job.case.url, trial = job.trial, limit = ?deadline.0, "load timed out");
                return Ok(LoadResult::failure(
                    LoadStatus::Timeout,
                    &job.case.url,
                    job.trial,
                ));
            }
        };
        if job.case.capture_screenshot {
            match self.save_screenshot(job, outdir).await {
                Ok(path) => result = result.with_screenshot_path(path),
                Err(err) => {
                    warn!(url = %job.case.url, trial = job.trial, error = %err, "screenshot failed")
                }
            }
        }
        Ok(result)
    }

    async fn teardown(&mut self) {
        self.close_session().await;
        let grace = self.config.timeouts.teardown_grace();
        if let Some(mut driver) = self.driver.take() {
            stop_child("geckodriver", &mut driver, grace).await;
        }
        if let Some(mut display) = self.display_server.take() {
            stop_child("xvfb", &mut display, grace).await;
        }
    }
}
