pub mod daemon;
pub mod logger;
pub mod probe;
pub mod reprobe;
pub mod settings;
pub mod state_dir;

pub use daemon::PafDaemon;
pub use logger::SqliteRequestLogger;
pub use probe::HttpCredentialTester;
pub use settings::Settings;
pub use state_dir::StateDir;
