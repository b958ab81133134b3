use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::cli::SubCommandExtend;
use crate::config::{IndexOptions, Opts};
use crate::index::build_index;
use crate::naming::extract_domain_id;
use crate::search::DEFAULT_TOP_N;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 返回的相似菜品数量
    #[arg(short = 'n', long, value_name = "N", default_value_t = DEFAULT_TOP_N as u32, value_parser = clap::value_parser!(u32).range(1..))]
    pub top_n: u32,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let index = build_index(opts.data_dir.images(), self.index).await?;

        let image = self.image.clone();
        let top_n = self.top_n as usize;
        let result = spawn_blocking(move || index.search_file(image, top_n)).await??;

        let result = result
            .into_iter()
            .filter_map(|(distance, path)| extract_domain_id(&path).map(|id| (distance, id)))
            .collect::<Vec<_>>();

        match self.output_format {
            OutputFormat::Json => {
                let result = result
                    .iter()
                    .map(|(distance, id)| json!({ "distance": distance, "meal_id": id.as_str() }))
                    .collect::<Vec<_>>();
                println!("{}", serde_json::to_string_pretty(&result)?)
            }
            OutputFormat::Table => {
                for (distance, id) in result {
                    println!("{:.4}\t{}", distance, id);
                }
            }
        }
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
