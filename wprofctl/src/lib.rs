use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use wprof_core::{ProfilerConfig, RunReport, SuiteError, TestRunner, TestSuite};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] wprof_core::ConfigError),
    #[error("suite error: {0}")]
    Suite(#[from] SuiteError),
    #[error("run error: {0}")]
    Run(#[from] wprof_core::RunError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("output directory {0} is not a directory")]
    InvalidOutdir(PathBuf),
    #[error("run interrupted before completion")]
    Interrupted,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel web page load measurement", long_about = None)]
pub struct Cli {
    /// Path to the JSON test suite
    pub suite: PathBuf,
    /// Directory receiving traces, captures and results
    #[arg(short, long, default_value = ".")]
    pub outdir: PathBuf,
    /// Optional harness config (tool paths and timeouts)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override the browser chosen by the suite
    #[arg(long)]
    pub browser: Option<String>,
    /// Override the worker count chosen by the suite
    #[arg(long)]
    pub parallelism: Option<usize>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Only log errors
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli);

    let config = ProfilerConfig::load_or_default(cli.config.as_deref())?;
    let mut suite = TestSuite::from_path(&cli.suite)?;
    if let Some(browser) = &cli.browser {
        suite.settings.browser = browser.parse()?;
    }
    if let Some(parallelism) = cli.parallelism {
        if parallelism < 1 {
            return Err(SuiteError::InvalidParallelism(parallelism).into());
        }
        suite.parallelism = parallelism;
    }

    let outdir = prepare_outdir(&cli.outdir)?;
    let report = TestRunner::new(suite, config, outdir.clone()).run().await?;

    let summary = RunSummary::from_report(&report);
    let results_path = outdir.join("results.json");
    fs::write(&results_path, serde_json::to_string_pretty(&summary)?)?;
    tracing::info!(path = %results_path.display(), "results written");
    render(&summary, cli.format)?;
    if report.interrupted {
        return Err(AppError::Interrupted);
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    // Quiet wins over any verbosity flags.
    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn prepare_outdir(outdir: &PathBuf) -> Result<PathBuf> {
    if !outdir.exists() {
        fs::create_dir_all(outdir)?;
    }
    if !outdir.is_dir() {
        return Err(AppError::InvalidOutdir(outdir.clone()));
    }
    Ok(outdir.clone())
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub dispatched: usize,
    pub completed: usize,
    pub successes: usize,
    pub failures: usize,
    pub interrupted: bool,
    pub results: Vec<wprof_core::LoadResult>,
}

impl RunSummary {
    fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.to_string(),
            dispatched: report.dispatched,
            completed: report.results.len(),
            successes: report.successes(),
            failures: report.failures(),
            interrupted: report.interrupted,
            results: report.results.clone(),
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let mut line = format!(
                "{} trial {}: {}",
                result.url, result.trial, result.status
            );
            if let Some(seconds) = result.load_time {
                let _ = write!(line, " ({seconds:.3}s)");
            }
            if let Some(final_url) = &result.final_url {
                if final_url != &result.url {
                    let _ = write!(line, " -> {final_url}");
                }
            }
            out.push_str(&line);
            out.push('\n');
        }
        let _ = write!(
            out,
            "{} dispatched, {} completed, {} ok, {} failed",
            self.dispatched, self.completed, self.successes, self.failures
        );
        if self.interrupted {
            out.push_str(" (interrupted)");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wprof_core::{LoadResult, LoadStatus};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_are_sensible() {
        let cli = parse(&["wprofctl", "suite.json"]);
        assert_eq!(cli.suite, PathBuf::from("suite.json"));
        assert_eq!(cli.outdir, PathBuf::from("."));
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn overrides_parse() {
        let cli = parse(&[
            "wprofctl",
            "suite.json",
            "-o",
            "/data/out",
            "--browser",
            "firefox",
            "--parallelism",
            "4",
            "-vv",
        ]);
        assert_eq!(cli.outdir, PathBuf::from("/data/out"));
        assert_eq!(cli.browser.as_deref(), Some("firefox"));
        assert_eq!(cli.parallelism, Some(4));
        assert_eq!(cli.verbose, 2);
    }

    #[tokio::test]
    async fn unknown_browser_override_is_rejected() {
        let suite = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            suite.path(),
            r#"{"tests": [{"url": "https://example.com"}]}"#,
        )
        .unwrap();
        let cli = parse(&[
            "wprofctl",
            suite.path().to_str().unwrap(),
            "--browser",
            "safari",
        ]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, AppError::Suite(SuiteError::UnknownBrowser(_))));
    }

    #[tokio::test]
    async fn missing_suite_is_an_io_error() {
        let cli = parse(&["wprofctl", "/nonexistent/suite.json"]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, AppError::Suite(SuiteError::Io { .. })));
    }

    #[test]
    fn text_rendering_summarizes_the_run() {
        let summary = RunSummary {
            run_id: "test-run".into(),
            dispatched: 2,
            completed: 2,
            successes: 1,
            failures: 1,
            interrupted: false,
            results: vec![
                LoadResult::success("https://example.com", 0)
                    .with_load_time(1.234)
                    .with_final_url("https://example.com/home".into()),
                LoadResult::failure(LoadStatus::Timeout, "https://example.com", 1),
            ],
        };
        let text = summary.display();
        assert!(text.contains("trial 0: success (1.234s) -> https://example.com/home"));
        assert!(text.contains("trial 1: failure_timeout"));
        assert!(text.contains("2 dispatched, 2 completed, 1 ok, 1 failed"));
    }
}
