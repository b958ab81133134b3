//! 菜品图片相似度索引
//!
//! 每张图片缩放为固定尺寸的 RGB 缩略图作为特征向量，使用 HNSW 进行近邻搜索。
//! 索引构建后只读，每轮同步都会从图片目录完整重建一个新索引。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use anyhow::{Context, Result};
use hnsw_rs::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use log::{debug, info, warn};
use rayon::prelude::*;
use regex::Regex;
use walkdir::WalkDir;

use crate::config::IndexOptions;

static RE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)^(jpg|jpeg|png|webp)$").expect("failed to build regex"));

const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;

/// 图片特征提取器
#[derive(Debug, Clone, Copy)]
pub struct Embedder {
    size: u32,
}

impl Embedder {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// 特征向量维数
    pub fn dimension(&self) -> usize {
        (self.size * self.size * 3) as usize
    }

    /// 计算图片的特征向量，结果已去均值并归一化
    pub fn embed(&self, img: &DynamicImage) -> Vec<f32> {
        let thumb = img.resize_exact(self.size, self.size, FilterType::Triangle).to_rgb8();
        let mut v = thumb.into_raw().into_iter().map(|p| p as f32 / 255.).collect::<Vec<_>>();

        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter_mut().for_each(|x| *x -= mean);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    /// 读取并解码图片文件，根据文件内容而不是后缀名判断格式
    pub fn embed_file(&self, path: impl AsRef<Path>) -> Result<Vec<f32>> {
        let path = path.as_ref();
        let img = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("无法解码图片 {}", path.display()))?;
        Ok(self.embed(&img))
    }
}

/// 只读的相似度索引
pub struct SimilarityIndex {
    hnsw: Hnsw<'static, f32, DistL2>,
    paths: Vec<PathBuf>,
    embedder: Embedder,
    ef_search: usize,
}

impl SimilarityIndex {
    /// 扫描图片目录并构建索引，无法解码的图片会被跳过
    ///
    /// 这是一个阻塞操作，在异步环境中请使用 [`build_index`]。
    pub fn build(image_dir: impl AsRef<Path>, opts: IndexOptions) -> Result<Self> {
        let image_dir = image_dir.as_ref();
        let embedder = Embedder::new(opts.thumbnail_size);
        let start = Instant::now();

        let files = scan_images(image_dir);
        info!("扫描完成，共 {} 张图片", files.len());

        let items = files
            .into_par_iter()
            .filter_map(|path| match embedder.embed_file(&path) {
                Ok(v) => Some((path, v)),
                Err(e) => {
                    warn!("跳过无法读取的图片 {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect::<Vec<_>>();

        let hnsw = Hnsw::<f32, _>::new(
            MAX_NB_CONNECTION,
            items.len().max(1),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistL2,
        );
        items.par_iter().enumerate().for_each(|(i, (_, v))| {
            hnsw.insert((v.as_slice(), i));
        });
        let paths = items.into_iter().map(|(path, _)| path).collect::<Vec<_>>();

        info!("索引构建完成：{} 张图片，耗时 {:.2}s", paths.len(), start.elapsed().as_secs_f32());
        Ok(Self { hnsw, paths, embedder, ef_search: opts.ef_search })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn embedder(&self) -> Embedder {
        self.embedder
    }

    /// 搜索与特征向量最相似的 `k` 张图片，返回 `(距离, 图片路径)`，距离从小到大排列
    pub fn search(&self, v: &[f32], k: usize) -> Vec<(f32, &Path)> {
        if self.is_empty() || k == 0 {
            return vec![];
        }
        let k = k.min(self.len());
        let mut neighbours = self.hnsw.search(v, k, self.ef_search.max(k));
        neighbours.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbours
            .into_iter()
            .filter_map(|n| self.paths.get(n.d_id).map(|p| (n.distance, p.as_path())))
            .collect()
    }

    /// 搜索与图片文件最相似的 `k` 张图片
    pub fn search_file(&self, path: impl AsRef<Path>, k: usize) -> Result<Vec<(f32, PathBuf)>> {
        let v = self.embedder.embed_file(path)?;
        Ok(self.search(&v, k).into_iter().map(|(d, p)| (d, p.to_path_buf())).collect())
    }

    /// 将索引写入目录，目录中原有的文件会被清空
    ///
    /// 写出的文件仅用于排查问题，服务不会重新加载它们。
    pub fn dump(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        fs::write(dir.join("meals.paths.json"), serde_json::to_vec_pretty(&self.paths)?)?;
        if !self.is_empty() {
            self.hnsw.file_dump(dir, "meals")?;
        }
        debug!("索引已写入 {}", dir.display());
        Ok(())
    }
}

/// 列出目录下所有图片文件，按路径排序
fn scan_images(dir: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                return None;
            }
            let ext = path.extension()?;
            RE_SUFFIX.is_match(&ext.to_string_lossy()).then(|| path.to_path_buf())
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

/// 在阻塞线程池中构建索引
pub async fn build_index(image_dir: PathBuf, opts: IndexOptions) -> Result<SimilarityIndex> {
    tokio::task::spawn_blocking(move || SimilarityIndex::build(image_dir, opts)).await?
}
