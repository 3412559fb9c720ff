use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ProfilerConfig;
use crate::deadline::run_with_deadline;
use crate::suite::{LoadResult, LoadStatus, LoaderSettings, TrialJob};

use super::{
    check_output, describe_command, stop_child, CommandExecutor, LoaderError, LoaderResult,
    PageLoader, SystemCommandExecutor, WorkerResources,
};

const DEVTOOLS_POLL_ATTEMPTS: u32 = 20;
const DEVTOOLS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Chrome driven over its remote debugging port, with traces collected by
/// `chrome-har-capturer`. Headful runs get a private Xvfb display.
pub struct ChromeLoader {
    config: ProfilerConfig,
    settings: LoaderSettings,
    resources: WorkerResources,
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
    // Held so the browser profile is removed when the loader goes away.
    _profile: tempfile::TempDir,
    display_server: Option<Child>,
    browser: Option<Child>,
}

impl ChromeLoader {
    pub fn new(
        config: ProfilerConfig,
        settings: LoaderSettings,
        worker_index: u32,
    ) -> LoaderResult<Self> {
        let profile = tempfile::Builder::new().prefix("wprof-chrome-").tempdir()?;
        let resources = WorkerResources::allocate(worker_index, profile.path().to_path_buf())?;
        Ok(Self {
            config,
            settings,
            resources,
            executor: Arc::new(SystemCommandExecutor),
            http: reqwest::Client::new(),
            _profile: profile,
            display_server: None,
            browser: None,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn resources(&self) -> &WorkerResources {
        &self.resources
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

    fn browser_command(&self) -> Command {
        let mut command = Command::new(&self.config.tools.chrome);
        command
            .arg("about:blank")
            .arg(format!("--remote-debugging-port={}", self.resources.debug_port))
            .arg(format!(
                "--user-data-dir={}",
                self.resources.profile_dir.display()
            ))
            .arg("--enable-benchmarking")
            .arg("--enable-net-benchmarking");
        if self.settings.headless {
            command.arg("--headless");
        } else {
            command.env("DISPLAY", &self.resources.display);
        }
        if self.settings.disable_local_cache {
            command.arg("--disable-application-cache").arg("--disable-cache");
        }
        if self.settings.disable_quic {
            command.arg("--disable-quic");
        }
        if self.settings.disable_spdy {
            command.arg("--use-spdy=off");
        }
        if self.settings.ignore_certificate_errors {
            command.arg("--ignore-certificate-errors");
        }
        if let Some(agent) = &self.settings.user_agent {
            command.arg(format!("--user-agent={agent}"));
        }
        if let Some(keylog) = &self.settings.ssl_key_log_file {
            command.env("SSLKEYLOGFILE", keylog);
        }
        command
    }

    fn check_display_alive(&mut self) -> LoaderResult<()> {
        if let Some(display) = self.display_server.as_mut() {
            if let Some(status) = display.try_wait()? {
                self.display_server = None;
                return Err(LoaderError::CommandFailure {
                    command: self.config.tools.xvfb.clone(),
                    status: status.to_string(),
                    stderr: format!("exited during stabilization on {}", self.resources.display),
                });
            }
        }
        Ok(())
    }

    async fn wait_for_devtools(&self) -> LoaderResult<()> {
        let url = format!(
            "http://127.0.0.1:{}/json/version",
            self.resources.debug_port
        );
        for attempt in 0..DEVTOOLS_POLL_ATTEMPTS {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(attempt, port = self.resources.debug_port, "devtools ready");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "devtools not ready");
                }
                Err(err) => {
                    debug!(attempt, error = %err, "devtools not reachable");
                }
            }
            sleep(DEVTOOLS_POLL_INTERVAL).await;
        }
        Err(LoaderError::Unresponsive(format!(
            "devtools at {url} never answered"
        )))
    }

    fn capture_command(&self, url: &str, output: &Path, repeat_view: bool) -> Command {
        let mut command = Command::new(&self.config.tools.har_capturer);
        command.arg("-d").arg("500");
        if repeat_view {
            command.arg("-r");
        }
        command
            .arg("-p")
            .arg(self.resources.debug_port.to_string())
            .arg("-o")
            .arg(output)
            .arg(url);
        command
    }

    fn trace_destination(&self, job: &TrialJob, outdir: &Path) -> PathBuf {
        if job.case.save_trace {
            outdir.join(format!(
                "{}_trial{}.har",
                job.case.artifact_label(),
                job.trial
            ))
        } else {
            PathBuf::from("/dev/null")
        }
    }
}

#[async_trait]
impl PageLoader for ChromeLoader {
    async fn setup(&mut self) -> LoaderResult<()> {
        if !self.settings.headless {
            self.spawn_display()?;
            sleep(Duration::from_millis(
                self.config.timeouts.display_stabilize_ms,
            ))
            .await;
            self.check_display_alive()?;
        }
        let mut command = self.browser_command();
        let child = self
            .executor
            .spawn(&mut command)
            .map_err(|source| LoaderError::Spawn {
                command: describe_command(&command),
                source,
            })?;
        self.browser = Some(child);
        sleep(Duration::from_millis(
            self.config.timeouts.browser_stabilize_ms,
        ))
        .await;
        self.wait_for_devtools().await?;
        info!(
            port = self.resources.debug_port,
            display = %self.resources.display,
            headless = self.settings.headless,
            "chrome ready"
        );
        Ok(())
    }

    async fn preload_objects(&mut self, urls: &[String], fresh: bool) -> LoaderResult<()> {
        for (index, url) in urls.iter().enumerate() {
            let mut command = Command::new(&self.config.tools.har_capturer);
            command.arg("-d").arg("10");
            // The first fetch of a cold-start trial navigates normally so
            // stale page state is flushed; later ones keep the cache warm.
            if !(fresh && index == 0) {
                command.arg("-n");
            }
            command
                .arg("-p")
                .arg(self.resources.debug_port.to_string())
                .arg("-o")
                .arg("/dev/null")
                .arg(url);
            let command_line = describe_command(&command);
            debug!(url = %url, "preloading object");
            let output = self.executor.run(&mut command).await?;
            check_output(command_line, output)?;
        }
        Ok(())
    }

    async fn load_page(&mut self, job: &TrialJob, outdir: &Path) -> LoaderResult<LoadResult> {
        if job.case.capture_screenshot {
            warn!(url = %job.case.url, "screenshots are not supported by the chrome trace pipeline");
        }
        let destination = self.trace_destination(job, outdir);
        let repeat_view = !job.case.fresh_view_per_trial;
        let mut command = self.capture_command(&job.case.url, &destination, repeat_view);
        let command_line = describe_command(&command);
        info!(url = %job.case.url, trial = job.trial, repeat_view, "loading page");

        let limit = job.case.timeout + self.config.timeouts.grace();
        let capture = self.executor.run(&mut command);
        let output = match run_with_deadline(limit, capture).await {
            Ok(output) => output?,
            Err(deadline) => {
                warn!(url = %job.case.url, trial = job.trial, limit = ?deadline.0, "load timed out");
                return Ok(LoadResult::failure(
                    LoadStatus::Timeout,
                    &job.case.url,
                    job.trial,
                ));
            }
        };
        check_output(command_line, output)?;

        let mut result = LoadResult::success(&job.case.url, job.trial);
        if job.case.save_trace {
            match read_onload_seconds(&destination).await {
                Ok(Some(seconds)) => result = result.with_load_time(seconds),
                Ok(None) => debug!(path = %destination.display(), "trace has no onLoad timing"),
                Err(err) => warn!(path = %destination.display(), error = %err, "unreadable trace"),
            }
            result = result.with_trace_path(destination);
        }
        Ok(result)
    }

    async fn teardown(&mut self) {
        let grace = self.config.timeouts.teardown_grace();
        if let Some(mut browser) = self.browser.take() {
            stop_child("chrome", &mut browser, grace).await;
        }
        if let Some(mut display) = self.display_server.take() {
            stop_child("xvfb", &mut display, grace).await;
        }
    }
}

/// Pull the page `onLoad` timing out of a HAR file, in seconds.
async fn read_onload_seconds(path: &Path) -> LoaderResult<Option<f64>> {
    let content = tokio::fs::read_to_string(path).await?;
    let har: serde_json::Value = serde_json::from_str(&content)
        .map_err(|err| LoaderError::Protocol(format!("malformed har: {err}")))?;
    let onload = har["log"]["pages"]
        .get(0)
        .and_then(|page| page["pageTimings"]["onLoad"].as_f64())
        .filter(|ms| *ms >= 0.0);
    Ok(onload.map(|ms| ms / 1000.0))
}
