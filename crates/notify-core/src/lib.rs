pub mod admission;
pub mod clock;
pub mod duration;
pub mod rules;
pub mod store;

pub use admission::{AdmissionController, AdmissionError, Decision, InputError, RuleUsage};
pub use clock::{Clock, MockClock, SystemClock, Timestamp};
pub use duration::{duration_ms, format_duration, parse_duration, DurationError};
pub use rules::{normalize_event_type, RateLimitRule, RuleCatalog, RuleError, RuleProvider};
pub use store::{EventKey, EventStore, InMemoryEventStore, StoreError};

#[cfg(feature = "redis")]
pub use store::redis_store::{RedisEventStore, RedisStoreConfig};
