//! Account sessions: the rotating pool and the bounded send engine.

pub mod pool;
pub mod sender;

pub use pool::{AccountStatus, DEFAULT_RATE_LIMIT_BUFFER, SessionPool};
pub use sender::{Delivery, SendEngine};
