//! Dispatch pipeline.
//!
//! Every inbound unit flows through:
//! 1. `FilterChain::classify()`: whitelist, blacklist, content quality
//! 2. Dedup check against recorded fingerprints
//! 3. `Router::route()`: first matching rule, else the default destination
//! 4. `TextTransform::apply()`: literal replacements
//! 5. `SendEngine::send()`: one pooled account, bounded retry
//!
//! Progress for the source advances whatever the outcome.

pub mod dispatcher;
pub mod filter;
pub mod history;
pub mod router;
pub mod transform;
pub mod types;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use history::{HistoryScanner, ScanReport};
