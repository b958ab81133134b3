#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use image::{ImageFormat, Rgb, RgbImage};
use mealsearch::corpus::{ImageRecord, MealSource};
use mealsearch::naming::DomainId;
use tokio::net::TcpListener;

/// 生成一张可以区分的测试图片
pub fn pattern(seed: u32) -> RgbImage {
    RgbImage::from_fn(32, 32, |x, y| {
        Rgb([
            ((x * 8 + seed * 40) % 256) as u8,
            ((y * 8 + seed * 70) % 256) as u8,
            (((x ^ y) * seed * 3) % 256) as u8,
        ])
    })
}

pub fn png(seed: u32) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(vec![]);
    pattern(seed).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn record(id: &str, url: impl Into<String>) -> ImageRecord {
    ImageRecord::new(DomainId::parse(id).unwrap(), url)
}

#[derive(Clone)]
struct OriginState {
    files: Arc<HashMap<String, Vec<u8>>>,
    hits: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// 本地图片服务器
///
/// - `/img/{name}` 返回图片
/// - `/busy/{name}` 稍等片刻再返回图片，并记录同时处理的最大请求数
/// - `/slow/{name}` 永远不会及时返回
pub struct Origin {
    pub base: String,
    state: OriginState,
}

impl Origin {
    pub async fn start(files: HashMap<String, Vec<u8>>) -> Self {
        let state = OriginState {
            files: Arc::new(files),
            hits: Default::default(),
            in_flight: Default::default(),
            peak: Default::default(),
        };
        let app = Router::new()
            .route("/img/{name}", get(image))
            .route("/busy/{name}", get(busy))
            .route("/slow/{name}", get(slow))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Self { base: format!("http://{addr}"), state }
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/img/{}", self.base, name)
    }

    pub fn busy_url(&self, name: &str) -> String {
        format!("{}/busy/{}", self.base, name)
    }

    pub fn slow_url(&self, name: &str) -> String {
        format!("{}/slow/{}", self.base, name)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// 同时处理中的最大请求数
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

fn lookup(state: &OriginState, name: &str) -> Response {
    match state.files.get(name) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn image(State(state): State<OriginState>, Path(name): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    lookup(&state, &name)
}

async fn busy(State(state): State<OriginState>, Path(name): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(current, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    lookup(&state, &name)
}

async fn slow(State(state): State<OriginState>, Path(_): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    StatusCode::OK.into_response()
}

/// 返回固定图片列表的来源，可以随时切换为失败状态
#[derive(Default)]
pub struct StaticSource {
    records: std::sync::Mutex<Vec<ImageRecord>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(records: Vec<ImageRecord>) -> Arc<Self> {
        Arc::new(Self { records: std::sync::Mutex::new(records), ..Default::default() })
    }

    pub fn set_records(&self, records: Vec<ImageRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MealSource for StaticSource {
    async fn fetch(&self, _window: Duration) -> Result<Vec<ImageRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.records.lock().unwrap().clone())
    }
}
