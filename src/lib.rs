//! tg-relay: channel relay dispatch core.

pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod pipeline;
pub mod platform;
pub mod rules;
pub mod session;
pub mod shutdown;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
