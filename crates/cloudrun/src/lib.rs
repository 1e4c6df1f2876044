//! cloudrun - parallel test runner over a pool of server clouds.
//!
//! Launches N single-node clouds, scrapes each worker's HTTP port from its
//! output, then dispatches tests one per cloud until the queue is empty.

pub mod cloud;
pub mod context;
pub mod naming;
pub mod node;
pub mod process;
pub mod reporter;
pub mod scheduler;
pub mod scraper;
pub mod signals;
pub mod test_unit;

pub use cloud::{build_managed_clouds, Cloud, CloudError, ManagedCloud, UserSuppliedCloud};
pub use context::RunContext;
pub use reporter::Reporter;
pub use scheduler::{build_test_units, RunReport, Scheduler, SchedulerError};
pub use signals::SignalCoordinator;
pub use test_unit::TestUnit;
