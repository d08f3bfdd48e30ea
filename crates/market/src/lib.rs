pub mod cache;
pub mod config;
pub mod correlation;
pub mod ids;
pub mod market;
pub mod orders;
pub mod throttle;

pub use cache::{Cached, RealTimeCache};
pub use config::MarketConfig;
pub use correlation::{CorrelationStore, Pending};
pub use ids::{RequestIdGenerator, ScreenAllocator};
pub use market::{CorrelationKey, Market};
pub use orders::OrderTable;
pub use throttle::{Throttle, ThrottleKind, TokenBucket};
