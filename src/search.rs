//! 以图搜菜

use std::{fmt, io};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info};
use rand::distr::{Alphanumeric, SampleString};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;

use crate::handle::IndexHandle;
use crate::metrics;
use crate::naming::extract_domain_id;

pub const DEFAULT_TOP_N: usize = 5;

/// 需要返回给调用方的搜索错误
#[derive(Debug)]
pub enum QueryError {
    /// 结果数量不合法
    InvalidTopN { top_n: usize, max: usize },
    /// 索引尚未发布
    NotReady,
    /// 上传的文件无法解码为图片
    BadImage(String),
    /// 请求参数或表单无法解析
    BadRequest(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopN { top_n, max } => {
                write!(f, "top_n 必须在 1 到 {} 之间，当前为 {}", max, top_n)
            }
            Self::NotReady => write!(f, "索引尚未就绪，请稍后再试"),
            Self::BadImage(e) => write!(f, "无法读取上传的图片: {}", e),
            Self::BadRequest(e) => write!(f, "请求格式错误: {}", e),
        }
    }
}

impl std::error::Error for QueryError {}

/// 搜索结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// 上传图片的保存路径
    pub query_image: String,
    /// 相似菜品 ID，越相似越靠前
    pub similar_meal_ids: Vec<String>,
}

pub struct QueryService {
    handle: Arc<IndexHandle>,
    upload_dir: PathBuf,
    max_top_n: usize,
}

impl QueryService {
    pub fn new(handle: Arc<IndexHandle>, upload_dir: impl Into<PathBuf>, max_top_n: usize) -> Self {
        Self { handle, upload_dir: upload_dir.into(), max_top_n }
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// 保存上传的图片，并在当前索引中搜索最相似的 `top_n` 个菜品
    pub async fn search(
        &self,
        file_name: Option<&str>,
        data: &[u8],
        top_n: usize,
    ) -> Result<SearchResult> {
        if top_n == 0 || top_n > self.max_top_n {
            return Err(QueryError::InvalidTopN { top_n, max: self.max_top_n }.into());
        }
        // 请求开始时获取快照，之后发布的新索引不影响本次搜索
        let index = self.handle.snapshot().ok_or(QueryError::NotReady)?;

        let start = Instant::now();
        let query_path = self.save_upload(file_name, data).await?;
        info!("正在搜索上传图片: {}", query_path.display());

        let path = query_path.clone();
        let neighbours = spawn_blocking(move || index.search_file(&path, top_n))
            .await?
            .map_err(|e| QueryError::BadImage(format!("{:#}", e)))?;

        let similar_meal_ids = neighbours
            .iter()
            .filter_map(|(distance, path)| {
                debug!("{:.4}\t{}", distance, path.display());
                extract_domain_id(path)
            })
            .map(|id| id.as_str().to_owned())
            .collect::<Vec<_>>();

        metrics::inc_search_duration(top_n, start.elapsed().as_secs_f32());
        Ok(SearchResult { query_image: query_path.display().to_string(), similar_meal_ids })
    }

    /// 将上传的图片写入上传目录，文件名带随机后缀以避免并发请求互相覆盖
    async fn save_upload(&self, file_name: Option<&str>, data: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        loop {
            let suffix = Alphanumeric.sample_string(&mut rand::rng(), 8);
            let path = self.upload_dir.join(upload_filename(file_name, &suffix));
            match write_new(&path, data).await {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("上传文件名冲突，重新生成: {}", path.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("无法保存上传图片 {}", path.display()));
                }
            }
        }
    }
}

/// 只在文件不存在时写入
async fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// 根据原始文件名生成上传文件名 `<stem>_<suffix>.<ext>`
fn upload_filename(file_name: Option<&str>, suffix: &str) -> String {
    let path = Path::new(file_name.unwrap_or_default());

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect::<String>();
    let stem = if stem.is_empty() { "upload".to_owned() } else { stem };

    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .filter(|s| !s.is_empty() && s.len() <= 8 && s.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_owned());

    format!("{stem}_{suffix}.{ext}")
}
