//! ufoci CI - hardware continuous integration
//!
//! Provides the build loop that:
//! - Clones the hardware repository on a push trigger
//! - Flashes the bitfile and runs the configured test suite
//! - Archives the test and build reports under `<home>/builds`

pub mod context;
pub mod obs;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod server;

// Re-export key types
pub use context::{repository_name, BuildContext, BuildRequest, BuildStage, FETCH_HEAD};
pub use pipeline::{BuildPipeline, FAILURE_FILE};
pub use report::{BuildReport, BUILD_REPORT_FILE};
pub use runner::{run_command, BuildRunner, CommandOutput};
pub use server::{parse_push, PayloadError, TriggerService};
