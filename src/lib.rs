pub mod cli;
pub mod config;
pub mod corpus;
pub mod handle;
pub mod index;
pub mod materialize;
mod metrics;
pub mod naming;
pub mod search;
pub mod server;
pub mod sync;

pub use config::Opts;
pub use handle::IndexHandle;
pub use index::SimilarityIndex;
pub use sync::Orchestrator;
