use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;
use serde_json::json;

use crate::search::QueryError;

/// API错误类型
pub struct AppError(pub anyhow::Error);

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<QueryError>() {
            Some(QueryError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            Some(
                QueryError::InvalidTopN { .. }
                | QueryError::BadImage(_)
                | QueryError::BadRequest(_),
            ) => StatusCode::BAD_REQUEST,
            None => {
                error!("请求处理失败: {:#}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
