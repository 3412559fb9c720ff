use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read profiler config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("profiler config {path} is not valid TOML: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Ambient harness configuration: where the external tools live and how long
/// the harness waits for them. All sections default so the file is optional;
/// a suite can run against a stock installation without any config on disk.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "snake_case")]
pub struct ProfilerConfig {
    pub tools: ToolsSection,
    pub timeouts: TimeoutsSection,
    pub display: DisplaySection,
}

impl ProfilerConfig {
    /// Load from `path` when given, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => load_profiler_config(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub chrome: String,
    pub firefox: String,
    pub geckodriver: String,
    pub xvfb: String,
    pub har_capturer: String,
    pub tcpdump: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            chrome: "google-chrome".into(),
            firefox: "firefox".into(),
            geckodriver: "geckodriver".into(),
            xvfb: "Xvfb".into(),
            har_capturer: "chrome-har-capturer".into(),
            tcpdump: "tcpdump".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// Extra wall-clock seconds on top of the per-case page timeout, covering
    /// subprocess spin-up and IPC overhead.
    pub grace_seconds: u64,
    /// Stabilization delay after launching a browser before trusting it.
    pub browser_stabilize_ms: u64,
    /// Stabilization delay after launching the virtual display.
    pub display_stabilize_ms: u64,
    /// How long teardown waits after SIGTERM before escalating to SIGKILL.
    pub teardown_grace_ms: u64,
    /// How long the orchestrator waits for workers to stop after poisoning.
    pub worker_stop_seconds: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            grace_seconds: 5,
            browser_stabilize_ms: 2000,
            display_stabilize_ms: 500,
            teardown_grace_ms: 2000,
            worker_stop_seconds: 10,
        }
    }
}

impl TimeoutsSection {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    /// Xvfb screen geometry, `WxHxDEPTH`.
    pub screen: String,
    pub screen_number: u32,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            screen: "1366x768x24".into(),
            screen_number: 0,
        }
    }
}

pub fn load_profiler_config<P: AsRef<Path>>(path: P) -> ConfigResult<ProfilerConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = ProfilerConfig::default();
        assert_eq!(config.tools.xvfb, "Xvfb");
        assert_eq!(config.timeouts.grace(), Duration::from_secs(5));
        assert_eq!(config.display.screen, "1366x768x24");
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tools]\nchrome = \"/opt/chromium/chrome\"\n\n[timeouts]\ngrace_seconds = 2\n"
        )
        .unwrap();
        let config = load_profiler_config(file.path()).unwrap();
        assert_eq!(config.tools.chrome, "/opt/chromium/chrome");
        assert_eq!(config.tools.firefox, "firefox");
        assert_eq!(config.timeouts.grace_seconds, 2);
        assert_eq!(config.timeouts.browser_stabilize_ms, 2000);
    }

    #[test]
    fn missing_file_is_an_error_but_absent_path_is_not() {
        assert!(load_profiler_config("/nonexistent/wprof.toml").is_err());
        assert!(ProfilerConfig::load_or_default(None).is_ok());
    }

    #[test]
    fn errors_name_the_offending_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tools\nchrome = 3").unwrap();
        let err = load_profiler_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("profiler config"));
        assert!(err
            .to_string()
            .contains(&file.path().display().to_string()));
    }
}
