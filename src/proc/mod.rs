pub mod calc;
pub mod merge;
pub mod state;
pub mod upload;

// Re-export all the key structs
pub use calc::CalcJob;
pub use merge::{MergePolicy, MergeReport, QuarantinedField};
pub use state::{IntoStageErrors, ProcStatus, StageError, TaskChainState};
pub use upload::{UploadJob, UploadSummary};
