pub mod job_definition;
pub mod job_run;

pub use job_definition::{JobDefinition, NewJobDefinition};
pub use job_run::{JobRun, RunStatus};
