use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{DownloadOptions, Opts, SourceOptions};
use crate::corpus::{MealSource, MongoSource};
use crate::materialize::Materializer;

#[derive(Parser, Debug, Clone)]
pub struct SyncCommand {
    #[command(flatten)]
    pub source: SourceOptions,
    #[command(flatten)]
    pub download: DownloadOptions,
}

impl SubCommandExtend for SyncCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        opts.data_dir.create_all()?;
        let source = MongoSource::connect(&self.source).await?;
        let materializer = Materializer::new(opts.data_dir.images(), &self.download)?;

        let records = source.fetch(self.source.retention()).await?;
        let report = materializer.materialize(&records).await?;

        info!("图片目录: {}", opts.data_dir.images().display());
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
