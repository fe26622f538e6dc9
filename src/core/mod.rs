pub mod classifier;
pub mod hardware;
pub mod mirror;
pub mod models;
pub mod orchestrator;
pub mod ownership;

pub use classifier::{Classifier, ClassifierRules, Rejection};
pub use hardware::{BusProbe, DeviceRecord, DeviceTreeSource, Transport};
pub use mirror::{MirrorEngine, MirrorEngineType, MirrorReport, create_engine};
pub use models::{BackupTask, DeviceKey, TargetLayout, TrackedDevice};
pub use orchestrator::{DevicePhase, Orchestrator, TickReport, TickSummary, TrackerState};
pub use ownership::{BackupOwner, resolve_backup_owner};
