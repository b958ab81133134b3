use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum_typed_multipart::{TypedMultipart, TypedMultipartError};

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::search::QueryError;

/// 服务信息
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, body = HomeResponse),
    )
)]
pub async fn home_handler(State(state): State<Arc<AppState>>) -> Json<HomeResponse> {
    Json(HomeResponse {
        message: "mealsearch is running with image search!".to_owned(),
        ready: state.query.is_ready(),
    })
}

/// 以图搜菜
#[utoipa::path(
    post,
    path = "/search-by-image/",
    params(SearchQuery),
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "参数错误或图片无法解码"),
        (status = 503, description = "索引尚未就绪"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<SearchQuery>, QueryRejection>,
    data: std::result::Result<TypedMultipart<SearchRequest>, TypedMultipartError>,
) -> Result<Json<SearchResponse>> {
    let Query(query) = query.map_err(|e| QueryError::BadRequest(e.body_text()))?;
    let TypedMultipart(data) = data.map_err(|e| QueryError::BadRequest(e.to_string()))?;
    let result = state
        .query
        .search(data.file.metadata.file_name.as_deref(), &data.file.contents, query.top_n)
        .await?;
    Ok(Json(result.into()))
}
