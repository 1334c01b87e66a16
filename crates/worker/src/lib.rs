//! Worker process wiring: picks the store, lock and pub/sub backends from the
//! environment and assembles a [`Scheduler`](jobforge_infra::Scheduler).

pub mod backends;
pub mod settings;

pub use backends::{Backends, build_scheduler};
pub use settings::WorkerSettings;
