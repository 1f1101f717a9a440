pub mod config;
pub mod error;
pub mod jsonl_store;
pub mod memory_store;
pub mod traits;
pub mod types;

pub use config::{
    ControlConfig, DedupConfig, EngineConfig, FlushConfig, LivenessConfig, PollConfig,
    ProcessingDelay, RecoveryConfig, ResyncConfig, ResyncOrigin, ResyncOriginKind, SourceConfig,
    StrategyKind,
};
pub use error::*;
pub use jsonl_store::JsonlEventStore;
pub use memory_store::MemoryEventStore;
pub use traits::*;
pub use types::*;
