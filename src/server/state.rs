use std::sync::Arc;

use crate::search::QueryService;

/// 应用状态
pub struct AppState {
    /// 搜索服务，持有当前索引的句柄
    pub query: QueryService,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(query: QueryService) -> Arc<Self> {
        Arc::new(AppState { query })
    }
}
