pub mod archive;
pub mod config;
pub mod credentials;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod interpolate;
pub mod lockfile;
pub mod observability;
pub mod presets;
pub mod report;
pub mod run;
pub mod stage;
pub mod steps;
pub mod validation;

pub use config::EngineConfig;
pub use credentials::CredentialStore;
pub use definition::PipelineDefinition;
pub use engine::{CancelToken, PipelineEngine, RunOptions};
pub use error::PipelineError;
pub use report::{Verdict, aggregate};
pub use run::{PipelineRun, RunStatus};
pub use steps::{StepRegistry, StepRunner};
