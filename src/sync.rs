//! 索引同步
//!
//! 每轮同步依次执行 获取 → 下载 → 重建 → 发布 四个阶段。启动时同步执行一轮，
//! 之后由后台任务按固定间隔循环执行，同一时间最多只有一轮在运行。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::sleep;

use crate::config::{IndexOptions, ScheduleOptions};
use crate::corpus::MealSource;
use crate::handle::IndexHandle;
use crate::index::SimilarityIndex;
use crate::materialize::{MaterializeReport, Materializer};
use crate::metrics;

/// 一轮同步的结果
#[derive(Debug, Clone, Copy)]
pub struct CycleReport {
    /// 远程返回的图片数量
    pub fetched: usize,
    pub materialize: MaterializeReport,
    /// 新索引中的图片数量
    pub indexed: usize,
}

pub struct Orchestrator<S> {
    source: S,
    materializer: Materializer,
    handle: Arc<IndexHandle>,
    retention: Duration,
    index_opts: IndexOptions,
    index_dir: PathBuf,
}

impl<S: MealSource + 'static> Orchestrator<S> {
    pub fn new(
        source: S,
        materializer: Materializer,
        handle: Arc<IndexHandle>,
        retention: Duration,
        index_opts: IndexOptions,
        index_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { source, materializer, handle, retention, index_opts, index_dir: index_dir.into() }
    }

    pub fn handle(&self) -> Arc<IndexHandle> {
        self.handle.clone()
    }

    /// 启动时执行的第一轮同步
    ///
    /// 会先清空残留的索引文件。任何阶段失败都直接返回错误，此时不会发布任何索引。
    pub async fn startup(&self) -> Result<CycleReport> {
        if tokio::fs::try_exists(&self.index_dir).await? {
            info!("清理旧索引文件: {}", self.index_dir.display());
            tokio::fs::remove_dir_all(&self.index_dir).await?;
        }
        tokio::fs::create_dir_all(&self.index_dir).await?;
        self.run_cycle().await.context("首次同步失败")
    }

    /// 执行一轮完整同步，成功后发布新索引
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let start = Instant::now();
        let result = self.cycle().await;
        metrics::inc_sync_cycle(result.is_ok(), start.elapsed().as_secs_f32());
        result
    }

    async fn cycle(&self) -> Result<CycleReport> {
        info!("[1/4] 获取菜品图片列表");
        let records = self.source.fetch(self.retention).await.context("获取菜品图片列表失败")?;

        info!("[2/4] 下载图片");
        let materialize = self.materializer.materialize(&records).await?;

        info!("[3/4] 重建索引");
        let image_dir = self.materializer.image_dir().to_path_buf();
        let index_dir = self.index_dir.clone();
        let opts = self.index_opts;
        let index = spawn_blocking(move || -> Result<_> {
            let index = SimilarityIndex::build(&image_dir, opts)?;
            if let Err(e) = index.dump(&index_dir) {
                warn!("写入索引文件失败: {:#}", e);
            }
            Ok(index)
        })
        .await??;

        info!("[4/4] 发布索引");
        let indexed = index.len();
        if indexed == 0 {
            warn!("新索引为空");
        }
        self.handle.publish(index);
        metrics::set_index_size(indexed);

        Ok(CycleReport { fetched: records.len(), materialize, indexed })
    }

    /// 启动后台同步任务
    ///
    /// 成功后等待 `sync_interval` 再执行下一轮；失败时保留当前索引，
    /// 并按 `retry_backoff` 指数退避重试。`shutdown` 变为 `true` 后任务在空闲时退出，
    /// 正在执行的一轮会先完成。
    pub fn spawn(
        self: Arc<Self>,
        opts: ScheduleOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures = 0;
            loop {
                let delay = match failures {
                    0 => opts.sync_interval,
                    n => retry_delay(opts.retry_backoff, opts.sync_interval, n),
                };
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }

                // 在独立任务中执行，即使发生 panic 也不会终止后台循环
                let this = self.clone();
                match tokio::spawn(async move { this.run_cycle().await }).await {
                    Ok(Ok(report)) => {
                        failures = 0;
                        info!(
                            "同步完成：获取 {} 张，新下载 {} 张，索引 {} 张",
                            report.fetched, report.materialize.downloaded, report.indexed
                        );
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        error!("第 {} 次同步失败，继续使用旧索引: {:#}", failures, e);
                    }
                    Err(e) => {
                        failures += 1;
                        error!("同步任务异常退出: {}", e);
                    }
                }
            }
            info!("后台同步任务已停止");
        })
    }
}

/// 第 `failures` 次连续失败后的等待时间
fn retry_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(3, 120)]
    #[case(5, 480)]
    #[case(6, 600)]
    #[case(40, 600)]
    fn backoff_doubles_until_interval(#[case] failures: u32, #[case] expected: u64) {
        let delay = retry_delay(Duration::from_secs(30), Duration::from_secs(600), failures);
        assert_eq!(delay, Duration::from_secs(expected));
    }

    #[test]
    fn backoff_never_exceeds_short_interval() {
        let delay = retry_delay(Duration::from_secs(30), Duration::from_secs(5), 1);
        assert_eq!(delay, Duration::from_secs(5));
    }
}
