mod search;
pub mod server;
mod sync;

pub use search::*;
pub use server::*;
pub use sync::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
