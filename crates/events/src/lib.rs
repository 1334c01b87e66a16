//! Cross-instance notifications for the job scheduler.
//!
//! Two message kinds travel over the publish/subscribe transport:
//! - [`TOPIC_CANCEL_JOB`]: raw job UID bytes, asking whichever instance runs
//!   the job to cancel it.
//! - [`TOPIC_STATE_CHANGE`]: an encoded [`jobforge_core::JobStateChange`],
//!   broadcast on every state transition.

pub mod bus;
pub mod codec;
pub mod in_memory_bus;

pub use bus::{PubSub, PubSubError, Subscription};
pub use codec::{StateChangeSubscription, decode_state_change, encode_state_change, subscribe_state_changes};
pub use in_memory_bus::InMemoryPubSub;

/// Topic carrying job cancellation requests.
pub const TOPIC_CANCEL_JOB: &str = "jobs:cancel";

/// Topic carrying job state-change broadcasts.
pub const TOPIC_STATE_CHANGE: &str = "jobs:state_change";
