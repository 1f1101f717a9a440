pub mod checkpoint_store;
pub mod control;
pub mod cutoff;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod flush;
pub mod health;
pub mod liveness;
pub mod poller;
pub mod recovery;
pub mod report;
pub mod service;
pub mod status;
pub mod worker;

pub use checkpoint_store::JsonFileCheckpointStore;
pub use control::ControlFile;
pub use cutoff::CutoffWindowManager;
pub use dedup::{DedupSnapshot, IntervalDedupWindow};
pub use dispatcher::ChangeEventDispatcher;
pub use engine::{EngineHandle, NotificationEngine, ShutdownReport};
pub use flush::FlushSchedule;
pub use health::{HealthMonitor, HealthState};
pub use liveness::{FileLivenessSink, NoopLivenessSink};
pub use poller::{NotificationPoller, PollStrategy, PolledPage};
pub use recovery::{GapScan, MissingOrder, MissingOrderRecovery, MissingOrderSet};
pub use report::UnprocessedOrderReport;
pub use service::LoggingInvalidationService;
pub use status::{CycleMetrics, CycleStage, SourceStatus, StatusBoard};
pub use worker::{Collaborators, CycleOutcome, EngineState, SourceWorker};
