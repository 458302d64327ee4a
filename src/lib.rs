//! Similarity-based race risk signals: tire cliff, undercut and overtake.
//!
//! Historical laps are turned into fixed-width feature vectors and loaded into
//! a nearest-neighbour index; live (or simulated) vectors are scored against
//! their historical analogues and streamed to dashboards.

pub mod advisory;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod loader;
pub mod schema;
pub mod scorer;
pub mod server;
pub mod simulator;
pub mod source;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SignalError};
pub use index::{MemoryIndex, SignalIndex, SimilarityIndex};
pub use scorer::RiskSummary;
pub use simulator::{StreamLoop, TickMessage};
pub use types::SignalKind;
