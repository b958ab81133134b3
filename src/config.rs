use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

static DATA_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    ProjectDirs::from("", "homemadefood", "mealsearch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
});

fn default_data_dir() -> &'static str {
    DATA_DIR.to_str().unwrap_or("data")
}

/// 远程菜品数据库选项
#[derive(Parser, Debug, Clone)]
pub struct SourceOptions {
    /// MongoDB 连接字符串
    #[arg(long, env = "MONGODB", value_name = "URL", hide_env_values = true)]
    pub mongodb: String,
    /// 数据库名称
    #[arg(long, value_name = "NAME", default_value = "homeMadeFood")]
    pub database: String,
    /// 菜品集合名称
    #[arg(long, value_name = "NAME", default_value = "meals")]
    pub collection: String,
    /// 只同步最近 N 天内更新过的菜品
    #[arg(long, value_name = "DAYS", default_value_t = 365, value_parser = parse_retention_days)]
    pub retention_days: u64,
}

impl SourceOptions {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(SECS_PER_DAY))
    }
}

/// 图片下载选项
#[derive(Parser, Debug, Clone)]
pub struct DownloadOptions {
    /// 同时下载的最大图片数量
    #[arg(long, value_name = "N", default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..))]
    pub download_concurrency: u32,
    /// 单张图片的下载超时时间，例如 30s、2m
    #[arg(long, value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    pub download_timeout: Duration,
    /// 删除已不在远程数据库中的本地图片
    #[arg(long)]
    pub prune: bool,
}

/// 索引选项
#[derive(Parser, Debug, Clone, Copy)]
pub struct IndexOptions {
    /// 计算特征向量时使用的缩略图边长
    #[arg(long, value_name = "SIZE", default_value_t = 8, value_parser = clap::value_parser!(u32).range(2..=64))]
    pub thumbnail_size: u32,
    /// HNSW 搜索时每次访问的节点数量
    #[arg(long, value_name = "N", default_value_t = 64)]
    pub ef_search: usize,
}

/// 后台同步选项
#[derive(Parser, Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// 两轮同步之间的间隔，例如 10m、1h
    #[arg(long, value_name = "DURATION", default_value = "10m", value_parser = parse_duration)]
    pub sync_interval: Duration,
    /// 同步失败后的首次重试等待时间，之后每次失败翻倍，最长不超过同步间隔
    #[arg(long, value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    pub retry_backoff: Duration,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mealsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据目录，存放下载的图片、上传的图片和索引文件
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 搜索服务，并在后台定期同步索引
    Server(ServerCommand),
    /// 从远程数据库同步一次图片后退出
    Sync(SyncCommand),
    /// 使用本地图片构建索引并搜索一张图片
    Search(SearchCommand),
}

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回菜品图片目录
    pub fn images(&self) -> PathBuf {
        self.path.join("images")
    }

    /// 返回上传图片目录
    pub fn uploads(&self) -> PathBuf {
        self.path.join("uploads")
    }

    /// 返回索引文件目录
    pub fn index(&self) -> PathBuf {
        self.path.join("index")
    }

    /// 创建所有子目录
    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [self.images(), self.uploads(), self.index()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// 保留天数换算成秒后不能溢出
fn parse_retention_days(s: &str) -> anyhow::Result<u64> {
    let days: u64 = s.trim().parse().map_err(|_| anyhow::anyhow!("无效的天数: {}", s))?;
    days.checked_mul(SECS_PER_DAY).ok_or_else(|| anyhow::anyhow!("天数过大: {}", s))?;
    Ok(days)
}

/// 解析时间长度，支持 `ms`、`s`、`m`、`h` 后缀，不带后缀时按秒处理
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().map_err(|_| anyhow::anyhow!("无效的时间: {}", s))?;
    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "" | "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(60 * 60),
        _ => return Err(anyhow::anyhow!("无效的时间单位: {}", s)),
    };
    secs.map(Duration::from_secs).ok_or_else(|| anyhow::anyhow!("时间过长: {}", s))
}
