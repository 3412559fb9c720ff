use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::deadline::{wait_or_kill, DeadlineExceeded};
use crate::suite::{LoadResult, TrialJob};

pub mod chrome;
pub mod firefox;

pub use chrome::ChromeLoader;
pub use firefox::FirefoxLoader;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} failed with {status}: {stderr}")]
    CommandFailure {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("no free debug port after {attempts} attempts starting at {start}")]
    PortUnavailable { start: u16, attempts: u32 },
    #[error("browser did not respond: {0}")]
    Unresponsive(String),
    #[error("webdriver request failed: {0}")]
    WebDriver(#[from] reqwest::Error),
    #[error("unexpected webdriver payload: {0}")]
    Protocol(String),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

pub type LoaderResult<T> = std::result::Result<T, LoaderError>;

/// Seam over subprocess execution so tests can observe command lines without
/// launching real browsers.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a short-lived command to completion, capturing its output.
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
    /// Launch a long-lived child (browser, display server, driver).
    fn spawn(&self, command: &mut Command) -> io::Result<Child>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.kill_on_drop(true).output().await
    }

    fn spawn(&self, command: &mut Command) -> io::Result<Child> {
        command.kill_on_drop(true).spawn()
    }
}

/// Per-worker slice of host resources. Ports and X displays are derived from
/// the owning process id and the worker index so that concurrent harness
/// processes on one machine never collide.
#[derive(Debug, Clone)]
pub struct WorkerResources {
    pub owner: u32,
    pub worker_index: u32,
    pub debug_port: u16,
    pub display: String,
    pub profile_dir: PathBuf,
}

// Probe ports in strides: nearby slots belong to sibling workers.
const PORT_STRIDE: u16 = 64;
const PORT_ATTEMPTS: u32 = 16;

impl WorkerResources {
    pub fn allocate(worker_index: u32, profile_dir: PathBuf) -> LoaderResult<Self> {
        let owner = std::process::id();
        let debug_port = reserve_port(owner, worker_index)?;
        Ok(Self {
            owner,
            worker_index,
            debug_port,
            display: format!(":{}", owner.wrapping_mul(10).wrapping_add(worker_index) % 64536),
            profile_dir,
        })
    }
}

fn reserve_port(owner: u32, worker_index: u32) -> LoaderResult<u16> {
    let seed = owner.wrapping_mul(10).wrapping_add(worker_index);
    let start = (seed % 64536) as u16 + 1000;
    let mut candidate = start;
    for _ in 0..PORT_ATTEMPTS {
        // Bind-probe: a successful bind means the port is free right now.
        // The listener is dropped immediately; the browser claims the port
        // moments later, which is close enough for a measurement harness.
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Ok(candidate);
        }
        candidate = match candidate.checked_add(PORT_STRIDE) {
            Some(next) => next,
            None => candidate.wrapping_add(PORT_STRIDE).max(1000),
        };
    }
    Err(LoaderError::PortUnavailable {
        start,
        attempts: PORT_ATTEMPTS,
    })
}

/// A browser instance that can measure page loads. One loader owns one
/// browser (and its virtual display) for its whole life; a crash or timeout
/// is handled by tearing the loader down and building a fresh one.
#[async_trait]
pub trait PageLoader: Send {
    /// Launch the display and browser and wait until they answer.
    async fn setup(&mut self) -> LoaderResult<()>;

    /// Fetch supporting objects into the browser cache before measurement.
    /// `fresh` marks a cold-start trial, letting the variant reset browser
    /// state before the first object.
    async fn preload_objects(&mut self, urls: &[String], fresh: bool) -> LoaderResult<()>;

    /// Perform one measured load and report the outcome. Timeouts are
    /// reported as a result, not an error; errors mean the loader is broken.
    async fn load_page(&mut self, job: &TrialJob, outdir: &Path) -> LoaderResult<LoadResult>;

    /// Stop every process this loader owns. Must be safe to call twice and
    /// after a failed setup.
    async fn teardown(&mut self);
}

/// Builds loaders for workers. The orchestrator holds one factory and calls
/// it once per worker at startup and again whenever a worker replaces a
/// broken loader.
#[async_trait]
pub trait LoaderFactory: Send + Sync {
    async fn create(&self, worker_index: u32) -> LoaderResult<Box<dyn PageLoader>>;
}

/// Factory producing real browser loaders according to the suite settings.
pub struct SystemLoaderFactory {
    config: crate::config::ProfilerConfig,
    settings: crate::suite::LoaderSettings,
}

impl SystemLoaderFactory {
    pub fn new(
        config: crate::config::ProfilerConfig,
        settings: crate::suite::LoaderSettings,
    ) -> Self {
        Self { config, settings }
    }
}

#[async_trait]
impl LoaderFactory for SystemLoaderFactory {
    async fn create(&self, worker_index: u32) -> LoaderResult<Box<dyn PageLoader>> {
        use crate::suite::Browser;
        let loader: Box<dyn PageLoader> = match self.settings.browser {
            Browser::Chrome => Box::new(ChromeLoader::new(
                self.config.clone(),
                self.settings.clone(),
                worker_index,
            )?),
            Browser::Firefox => Box::new(FirefoxLoader::new(
                self.config.clone(),
                self.settings.clone(),
                worker_index,
            )?),
        };
        Ok(loader)
    }
}

/// Ask a child to exit with SIGTERM, escalate to SIGKILL after `grace`.
pub async fn stop_child(name: &str, child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(process = name, pid, error = %err, "sigterm failed");
    }
    match wait_or_kill(child, grace).await {
        Ok(Some(_)) => {}
        Ok(None) => warn!(process = name, pid, "killed after grace period"),
        Err(err) => warn!(process = name, pid, error = %err, "failed to reap"),
    }
}

/// Render a command line for error messages.
pub(crate) fn describe_command(command: &Command) -> String {
    let std = command.as_std();
    let mut rendered = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

pub(crate) fn check_output(command_line: String, output: Output) -> LoaderResult<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(LoaderError::CommandFailure {
            command: command_line,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_derive_port_and_display_from_owner() {
        let dir = tempfile::tempdir().unwrap();
        let resources = WorkerResources::allocate(3, dir.path().to_path_buf()).unwrap();
        let owner = std::process::id();
        let seed = owner.wrapping_mul(10).wrapping_add(3);
        assert_eq!(resources.display, format!(":{}", seed % 64536));
        let start = (seed % 64536) as u16 + 1000;
        // The probed port sits on the stride lattice rooted at the seed.
        let offset = resources.debug_port.wrapping_sub(start);
        assert_eq!(offset % PORT_STRIDE, 0);
    }

    #[test]
    fn sibling_workers_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let a = WorkerResources::allocate(0, dir.path().to_path_buf()).unwrap();
        let b = WorkerResources::allocate(1, dir.path().to_path_buf()).unwrap();
        assert_ne!(a.debug_port, b.debug_port);
        assert_ne!(a.display, b.display);
    }

    #[test]
    fn occupied_port_is_skipped() {
        let owner = std::process::id();
        let seed = owner.wrapping_mul(10);
        let start = (seed % 64536) as u16 + 1000;
        let _occupier = TcpListener::bind(("127.0.0.1", start));
        // Whether or not the bind above succeeded, probing must land on a
        // bindable port.
        let port = reserve_port(owner, 0).unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }

    #[test]
    fn command_description_includes_args() {
        let mut command = Command::new("chrome-har-capturer");
        command.args(["-p", "9222", "-o", "/tmp/out.har"]);
        assert_eq!(
            describe_command(&command),
            "chrome-har-capturer -p 9222 -o /tmp/out.har"
        );
    }

    #[tokio::test]
    async fn system_executor_captures_output() {
        let mut command = Command::new("echo");
        command.arg("hello");
        let output = SystemCommandExecutor.run(&mut command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
