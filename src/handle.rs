use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::index::SimilarityIndex;

/// 当前可供搜索的索引
///
/// 首次发布之前为空。发布是一次原子替换，读者拿到的快照要么是旧索引，要么是新索引，
/// 旧索引在所有持有快照的请求结束后释放。
#[derive(Default)]
pub struct IndexHandle {
    current: ArcSwapOption<SimilarityIndex>,
}

impl IndexHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 获取当前索引的快照，尚未发布时返回 `None`
    pub fn snapshot(&self) -> Option<Arc<SimilarityIndex>> {
        self.current.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// 发布新索引，返回被替换的旧索引
    pub fn publish(&self, index: SimilarityIndex) -> Option<Arc<SimilarityIndex>> {
        self.current.swap(Some(Arc::new(index)))
    }
}
