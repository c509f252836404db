//! Logging, limits, and identifier types shared by every coderunner crate.

pub mod ids;
pub mod limits;
pub mod log;

pub use ids::{new_job_id, JobId};
pub use limits::{Concurrency, CpuQuota, MemoryLimit, SandboxTimeout};
pub use log::{build_root_logger, LogLevel};
