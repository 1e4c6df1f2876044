pub mod config;
pub mod discovery;
pub mod report;
pub mod types;
pub mod wipe;

pub use config::Config;
pub use discovery::TestDiscoverer;
pub use report::{RunSummary, Summary, TestRecord};
pub use types::*;
