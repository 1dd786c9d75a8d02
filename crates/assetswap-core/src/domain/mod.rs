//! Domain model (IDs, versions, tasks, outcomes, errors).
//!
//! I/O を一切しない型だけを置く。

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;
pub mod version;

pub use errors::{DeviceError, ManifestError, RunError, TaskError};
pub use ids::{ContainerId, DeviceSerial, RunId};
pub use outcome::{BestEffort, RunReport, TaskOutcome, TaskReport, WaitOutcome};
pub use state::TaskState;
pub use task::{ReplaceTask, TaskContext};
pub use version::{OsVersion, VersionParseError};
