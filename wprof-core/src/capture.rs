use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::loader::{describe_command, stop_child, CommandExecutor, SystemCommandExecutor};
use crate::suite::TrialJob;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// A running tcpdump writing one pcap per trial. Started just before a
/// measured load and stopped right after, so the trace brackets exactly one
/// page load.
pub struct PacketCapture {
    child: Child,
    path: PathBuf,
}

impl PacketCapture {
    pub async fn start(
        tcpdump: &str,
        executor: &Arc<dyn CommandExecutor>,
        job: &TrialJob,
        outdir: &Path,
    ) -> CaptureResult<Self> {
        let path = outdir.join(format!(
            "{}_trial{}.pcap",
            job.case.artifact_label(),
            job.trial
        ));
        let mut command = Command::new(tcpdump);
        command.arg("-U").arg("-w").arg(&path);
        let child = executor
            .spawn(&mut command)
            .map_err(|source| CaptureError::Spawn {
                command: describe_command(&command),
                source,
            })?;
        debug!(path = %path.display(), "packet capture started");
        Ok(Self { child, path })
    }

    pub async fn start_system(
        tcpdump: &str,
        job: &TrialJob,
        outdir: &Path,
    ) -> CaptureResult<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor);
        Self::start(tcpdump, &executor, job, outdir).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and stop the capture. Failures are logged, not propagated; a
    /// lost pcap must never fail the trial it accompanied.
    pub async fn stop(mut self) {
        stop_child("tcpdump", &mut self.child, STOP_GRACE).await;
        debug!(path = %self.path.display(), "packet capture stopped");
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        if self.child.id().is_some() {
            warn!(path = %self.path.display(), "packet capture dropped without stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::TestCase;
    use async_trait::async_trait;
    use std::process::Output;
    use std::sync::Mutex;

    struct RecordingExecutor {
        commands: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            self.commands
                .lock()
                .unwrap()
                .push(describe_command(command));
            // Short-lived commands are not used by packet capture.
            Command::new("true").output().await
        }

        fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
            self.commands
                .lock()
                .unwrap()
                .push(describe_command(command));
            Command::new("sleep").arg("60").kill_on_drop(true).spawn()
        }
    }

    fn trial_job() -> TrialJob {
        TrialJob {
            case: Arc::new(TestCase {
                url: "https://example.com".into(),
                trials: 1,
                save_trace: false,
                capture_packets: true,
                capture_screenshot: false,
                fresh_view_per_trial: false,
                preload: Vec::new(),
                timeout: Duration::from_secs(30),
                trace_file_name: Some("example".into()),
                screenshot_file_name: None,
            }),
            trial: 0,
        }
    }

    #[tokio::test]
    async fn capture_writes_one_pcap_per_trial() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(RecordingExecutor {
            commands: Arc::clone(&commands),
        });
        let outdir = tempfile::tempdir().unwrap();
        let capture = PacketCapture::start("tcpdump", &executor, &trial_job(), outdir.path())
            .await
            .unwrap();
        let expected = outdir.path().join("example_trial0.pcap");
        assert_eq!(capture.path(), expected);
        capture.stop().await;

        let recorded = commands.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].starts_with("tcpdump -U -w "));
    }
}
