pub mod capture;
pub mod config;
pub mod deadline;
pub mod loader;
pub mod orchestrator;
pub mod queue;
pub mod suite;
pub mod worker;

pub use capture::{CaptureError, CaptureResult, PacketCapture};
pub use config::{load_profiler_config, ConfigError, ConfigResult, ProfilerConfig};
pub use deadline::{run_with_deadline, wait_or_kill, DeadlineExceeded};
pub use loader::{
    ChromeLoader, CommandExecutor, FirefoxLoader, LoaderError, LoaderFactory, LoaderResult,
    PageLoader, SystemCommandExecutor, SystemLoaderFactory, WorkerResources,
};
pub use orchestrator::{InterruptHandle, RunError, RunReport, RunResult, TestRunner};
pub use queue::{JobQueue, ResultQueue, ResultSender};
pub use suite::{
    Browser, Job, LoadResult, LoadStatus, LoaderSettings, SuiteError, SuiteResult, TestCase,
    TestSuite, TrialJob,
};
pub use worker::{Worker, WorkerContext};
