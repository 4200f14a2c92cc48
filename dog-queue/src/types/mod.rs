pub mod events;
pub mod ids;
pub mod record;
pub mod stats;

pub use events::QueueEvent;
pub use ids::{EntryId, LeaseToken};
pub use record::{DeadLetter, EntryRecord, EntryState, LeasedEntry};
pub use stats::{QueueCounters, QueueStats};
