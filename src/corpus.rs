//! 从远程菜品数据库获取需要同步的图片列表

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use log::{debug, info, warn};
use mongodb::bson::{Bson, DateTime, Document, doc};
use mongodb::{Client, Collection};

use crate::config::SourceOptions;
use crate::naming::{DomainId, image_filename};

/// 一张需要同步的菜品图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub domain_id: DomainId,
    pub source_url: String,
}

impl ImageRecord {
    pub fn new(domain_id: DomainId, source_url: impl Into<String>) -> Self {
        Self { domain_id, source_url: source_url.into() }
    }

    /// 图片在本地目录中的路径
    pub fn local_path(&self, image_dir: impl AsRef<Path>) -> PathBuf {
        image_dir.as_ref().join(image_filename(&self.domain_id))
    }
}

/// 菜品图片来源
pub trait MealSource: Send + Sync {
    /// 返回最近 `window` 时间内更新过的所有菜品图片
    fn fetch(&self, window: Duration) -> impl Future<Output = Result<Vec<ImageRecord>>> + Send;
}

impl<S: MealSource> MealSource for Arc<S> {
    fn fetch(&self, window: Duration) -> impl Future<Output = Result<Vec<ImageRecord>>> + Send {
        (**self).fetch(window)
    }
}

/// 基于 MongoDB 的菜品图片来源
pub struct MongoSource {
    meals: Collection<Document>,
}

impl MongoSource {
    pub async fn connect(opts: &SourceOptions) -> Result<Self> {
        info!("连接菜品数据库: {}/{}", opts.database, opts.collection);
        let client = Client::with_uri_str(&opts.mongodb)
            .await
            .context("无法解析 MongoDB 连接字符串")?;
        let meals = client.database(&opts.database).collection(&opts.collection);
        Ok(Self { meals })
    }
}

impl MealSource for MongoSource {
    async fn fetch(&self, window: Duration) -> Result<Vec<ImageRecord>> {
        let since = SystemTime::now().checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        let filter = doc! { "updatedAt": { "$gt": DateTime::from_system_time(since) } };

        let mut cursor = self
            .meals
            .find(filter)
            .projection(doc! { "_id": 1, "images": 1 })
            .await
            .context("查询菜品数据库失败")?;

        let mut meals = 0;
        let mut records = vec![];
        while let Some(meal) = cursor.try_next().await.context("读取菜品记录失败")? {
            meals += 1;
            records.extend(meal_images(meal));
        }

        info!("获取到 {} 个菜品，共 {} 张图片", meals, records.len());
        Ok(records)
    }
}

/// 提取一个菜品中所有带地址的图片，格式不对的字段只跳过不报错
fn meal_images(meal: Document) -> Vec<ImageRecord> {
    let raw_id = match meal.get("_id") {
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        Some(Bson::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            warn!("跳过没有 _id 的菜品记录");
            return vec![];
        }
    };
    let Some(domain_id) = DomainId::parse(raw_id.as_str()) else {
        warn!("跳过无效的菜品 ID: {:?}", raw_id);
        return vec![];
    };

    let images = match meal.get("images") {
        Some(Bson::Array(images)) => images.as_slice(),
        None | Some(Bson::Null) => return vec![],
        Some(other) => {
            warn!("菜品 {} 的 images 字段格式错误: {}", domain_id, other);
            return vec![];
        }
    };

    images
        .iter()
        .filter_map(|image| match image_url(image) {
            Some(url) => Some(url),
            None => {
                warn!("跳过菜品 {} 中没有有效地址的图片: {}", domain_id, image);
                None
            }
        })
        .map(|url| {
            debug!("菜品 {} 图片: {}", domain_id, url);
            ImageRecord::new(domain_id.clone(), url)
        })
        .collect()
}

fn image_url(image: &Bson) -> Option<&str> {
    let url = image.as_document()?.get_str("secure_url").ok()?;
    (!url.is_empty()).then_some(url)
}

#[cfg(test)]
mod tests {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    #[test]
    fn object_id_rendered_as_hex() {
        let oid = ObjectId::parse_str("65f1c2a9e4b0a1b2c3d4e5f6").unwrap();
        let meal = doc! { "_id": oid, "images": [{ "secure_url": "https://cdn.example/a.jpg" }] };
        let records = meal_images(meal);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain_id.as_str(), "65f1c2a9e4b0a1b2c3d4e5f6");
        assert_eq!(records[0].source_url, "https://cdn.example/a.jpg");
    }

    #[test]
    fn numeric_id_is_stringified() {
        let meal = doc! { "_id": 42_i32, "images": [{ "secure_url": "https://cdn.example/n.jpg" }] };
        assert_eq!(meal_images(meal)[0].domain_id.as_str(), "42");
    }

    #[test]
    fn images_without_url_are_skipped() {
        let meal = doc! {
            "_id": "m1",
            "images": [
                {},
                { "secure_url": "" },
                { "secure_url": "https://cdn.example/b.jpg" },
            ],
        };
        let records = meal_images(meal);
        let expected = ImageRecord::new(DomainId::parse("m1").unwrap(), "https://cdn.example/b.jpg");
        assert_eq!(records, vec![expected]);
    }

    #[test]
    fn malformed_images_are_skipped() {
        let meal = doc! {
            "_id": "m3",
            "images": [
                { "secure_url": 42 },
                "https://cdn.example/bare.jpg",
                Bson::Null,
                { "secure_url": "https://cdn.example/c.jpg", "width": 640 },
            ],
        };
        let records = meal_images(meal);
        let expected = ImageRecord::new(DomainId::parse("m3").unwrap(), "https://cdn.example/c.jpg");
        assert_eq!(records, vec![expected]);

        let meal = doc! { "_id": "m4", "images": "https://cdn.example/d.jpg" };
        assert!(meal_images(meal).is_empty());
    }

    #[test]
    fn meal_without_images() {
        assert!(meal_images(doc! { "_id": "m2", "images": [] }).is_empty());
        assert!(meal_images(doc! { "_id": "m2", "images": Bson::Null }).is_empty());
        assert!(meal_images(doc! { "_id": "m2" }).is_empty());
    }

    #[test]
    fn unsafe_or_missing_id_is_skipped() {
        let meal = doc! { "_id": "../m3", "images": [{ "secure_url": "https://cdn.example/c.jpg" }] };
        assert!(meal_images(meal).is_empty());
        let meal = doc! { "images": [{ "secure_url": "https://cdn.example/c.jpg" }] };
        assert!(meal_images(meal).is_empty());
    }

    #[test]
    fn local_path_is_deterministic() {
        let record = ImageRecord::new(DomainId::parse("42").unwrap(), "https://cdn.example/x");
        assert_eq!(record.local_path("data/images"), PathBuf::from("data/images/meal_42.jpg"));
    }
}
