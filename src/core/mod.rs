pub mod engine;
pub mod mapper;
pub mod scanner;

pub use engine::{execute, UploadEngine, UploadEvent, UploadPhase, UploadPlan, UploadReport};
pub use mapper::{map_to_remote, remote_path_for, PathMap};
pub use scanner::{scan, ExcludeSet, LocalScanner, LocalTree};
