use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::search::{DEFAULT_TOP_N, SearchResult};

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub file: FieldData<Bytes>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的菜品图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
}

/// 搜索查询参数
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// 返回的相似菜品数量
    #[param(default = 5, minimum = 1)]
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 上传图片的保存路径
    pub query_image: String,
    /// 相似菜品 ID，越相似越靠前
    pub similar_meal_ids: Vec<String>,
}

impl From<SearchResult> for SearchResponse {
    fn from(result: SearchResult) -> Self {
        Self { query_image: result.query_image, similar_meal_ids: result.similar_meal_ids }
    }
}

/// 服务信息
#[derive(Debug, Serialize, ToSchema)]
pub struct HomeResponse {
    pub message: String,
    /// 索引是否已发布
    pub ready: bool,
}
