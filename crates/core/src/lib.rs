pub mod error;
pub mod freeze;
pub mod health;
pub mod log;
pub mod selector;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use freeze::FreezeManager;
pub use health::{HealthRecord, HealthTracker};
pub use log::{LogStats, RequestLogReader, RequestRecord, RequestSink, UsageMetrics};
pub use selector::Selector;
pub use store::ConfigStore;

// Re-export types for convenience
pub use types::{
    now_ms, ActiveRef, EndpointProfile, Family, FamilyState, HealthCheckSettings,
    LoadBalancerSettings, Mode, Strategy,
};
