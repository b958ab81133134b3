use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, sleep};

use crate::cli::SubCommandExtend;
use crate::config::{DownloadOptions, IndexOptions, ScheduleOptions, SourceOptions};
use crate::corpus::MongoSource;
use crate::handle::IndexHandle;
use crate::materialize::Materializer;
use crate::search::QueryService;
use crate::sync::Orchestrator;
use crate::{Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub source: SourceOptions,
    #[command(flatten)]
    pub download: DownloadOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub schedule: ScheduleOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 单次搜索允许返回的最大结果数量
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub max_top_n: usize,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH", value_parser = parse_auth)]
    pub prometheus_auth: Option<(String, String)>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        opts.data_dir.create_all()?;

        let source = MongoSource::connect(&self.source).await?;
        let materializer = Materializer::new(opts.data_dir.images(), &self.download)?;
        let handle = IndexHandle::new();
        let orchestrator = Arc::new(Orchestrator::new(
            source,
            materializer,
            handle.clone(),
            self.source.retention(),
            self.index,
            opts.data_dir.index(),
        ));

        // 首次同步完成之前不启动 HTTP 服务
        let report = orchestrator.startup().await?;
        info!(
            "首次同步完成：获取 {} 张，新下载 {} 张，失败 {} 张，索引 {} 张",
            report.fetched,
            report.materialize.downloaded,
            report.materialize.failed,
            report.indexed
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = orchestrator.spawn(self.schedule, shutdown_rx);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            let auth = self.prometheus_auth.clone();
            tokio::spawn(async move {
                loop {
                    let metric_families = prometheus::gather();
                    let url = url.clone();
                    let instance = instance.clone();
                    let auth = auth.clone();
                    let r = spawn_blocking(move || {
                        prometheus::push_metrics(
                            "mealsearch",
                            labels! {
                                "instance".to_string() => instance.clone(),
                            },
                            &url,
                            metric_families,
                            auth.map(|(username, password)| BasicAuthentication {
                                username,
                                password,
                            }),
                        )
                    })
                    .await;
                    match r {
                        Ok(Err(e)) => error!("推送指标失败: {e}"),
                        Err(e) => error!("推送指标任务异常退出: {e}"),
                        Ok(Ok(())) => {}
                    }
                    sleep(Duration::from_secs(30)).await;
                }
            });
        }

        let query = QueryService::new(handle, opts.data_dir.uploads(), self.max_top_n);
        let app = server::create_app(server::AppState::new(query));

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let _ = shutdown_tx.send(true);
        worker.await?;
        Ok(())
    }
}

/// 等待 Ctrl-C 或 SIGTERM，SIGTERM 的监听在调用时立即注册
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .inspect_err(|e| error!("无法监听 SIGTERM: {e}"))
        .ok();

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("无法监听 Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("收到退出信号，正在关闭服务器");
    }
}

fn parse_auth(s: &str) -> anyhow::Result<(String, String)> {
    let (username, password) =
        s.split_once(':').ok_or_else(|| anyhow::anyhow!("认证信息格式应为 username:password"))?;
    Ok((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prometheus_auth() {
        assert_eq!(parse_auth("user:p:w").unwrap(), ("user".to_owned(), "p:w".to_owned()));
        assert!(parse_auth("user").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_triggers_shutdown() {
        let shutdown = shutdown_signal();
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::timeout(Duration::from_secs(5), shutdown).await.unwrap();
    }
}
