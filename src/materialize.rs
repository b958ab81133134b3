//! 将远程菜品图片下载到本地图片目录

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::distr::{Alphanumeric, SampleString};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::DownloadOptions;
use crate::corpus::ImageRecord;
use crate::metrics;
use crate::naming::{DomainId, extract_domain_id};

/// 一轮下载的统计结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    /// 去重后的菜品数量
    pub requested: usize,
    /// 本地已存在而跳过的数量
    pub skipped: usize,
    /// 下载成功的数量
    pub downloaded: usize,
    /// 下载失败的数量
    pub failed: usize,
    /// 被删除的本地图片数量
    pub pruned: usize,
}

pub struct Materializer {
    client: Client,
    image_dir: PathBuf,
    concurrency: usize,
    prune: bool,
}

impl Materializer {
    pub fn new(image_dir: impl Into<PathBuf>, opts: &DownloadOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(opts.download_timeout)
            .build()
            .context("无法创建 HTTP 客户端")?;
        Ok(Self {
            client,
            image_dir: image_dir.into(),
            concurrency: opts.download_concurrency as usize,
            prune: opts.prune,
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// 下载所有本地缺失的图片
    ///
    /// 单张图片失败只记录日志，不影响其他图片，也不会让整轮同步失败。
    pub async fn materialize(&self, records: &[ImageRecord]) -> Result<MaterializeReport> {
        tokio::fs::create_dir_all(&self.image_dir)
            .await
            .with_context(|| format!("无法创建图片目录 {}", self.image_dir.display()))?;

        // 同一菜品的多张图片对应同一个文件，只取第一张
        let mut seen = HashSet::new();
        let unique = records.iter().filter(|r| seen.insert(&r.domain_id)).collect::<Vec<_>>();

        let mut pending = vec![];
        for record in &unique {
            let path = record.local_path(&self.image_dir);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                pending.push((*record, path));
            }
        }

        let mut report = MaterializeReport {
            requested: unique.len(),
            skipped: unique.len() - pending.len(),
            ..Default::default()
        };
        info!("共 {} 个菜品，需要下载 {} 张图片", report.requested, pending.len());

        let downloaded = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        futures::stream::iter(pending)
            .for_each_concurrent(self.concurrency, |(record, path)| {
                let (downloaded, failed) = (&downloaded, &failed);
                async move {
                    match self.download(&record.source_url, &path).await {
                        Ok(()) => {
                            debug!("下载完成: {}", path.display());
                            downloaded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!("下载 {} 失败: {:#}", record.source_url, e);
                            metrics::inc_download_failure();
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;
        report.downloaded = downloaded.into_inner();
        report.failed = failed.into_inner();

        if self.prune {
            let keep = unique.iter().map(|r| r.domain_id.clone()).collect::<HashSet<_>>();
            report.pruned = self.prune_missing(&keep).await?;
        }

        info!(
            "图片同步完成：下载 {}，跳过 {}，失败 {}，删除 {}",
            report.downloaded, report.skipped, report.failed, report.pruned
        );
        Ok(report)
    }

    /// 下载一张图片，先写入临时文件再重命名，保证目标路径上要么是完整图片，要么没有文件
    async fn download(&self, url: &str, path: &Path) -> Result<()> {
        let resp = self.client.get(url).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(anyhow!("服务器返回 {}", resp.status()));
        }
        let bytes = resp.bytes().await?;

        let tmp_file = temp_path(path);
        let result = async {
            tokio::fs::write(&tmp_file, &bytes).await?;
            tokio::fs::rename(&tmp_file, path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_file).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// 删除不在 `keep` 中的本地菜品图片，返回删除数量
    pub async fn prune_missing(&self, keep: &HashSet<DomainId>) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.image_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = extract_domain_id(&path) else {
                continue;
            };
            if keep.contains(&id) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("删除已下架菜品图片: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("无法删除 {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

/// 下载时使用的临时文件，随机后缀避免多个进程写入同一个临时文件
fn temp_path(path: &Path) -> PathBuf {
    let mut tmp_file = path.as_os_str().to_owned();
    tmp_file.push(format!(".{}.part", Alphanumeric.sample_string(&mut rand::rng(), 8)));
    PathBuf::from(tmp_file)
}
