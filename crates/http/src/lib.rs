pub mod error;
pub mod forward;
pub mod headers;
pub mod middleware;
pub mod realtime;
pub mod routes;
pub mod sanitize;
pub mod state;
pub mod usage;

pub use error::HttpError;
pub use forward::Forwarder;
pub use realtime::RealtimeHub;
pub use routes::{dashboard_router, proxy_router};
pub use state::{AppState, CredentialTester, TestReport};
