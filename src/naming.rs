//! 菜品 ID 与本地图片文件名之间的双向映射
//!
//! 每个菜品 ID 唯一对应 `meal_<id>.jpg`，同步时据此判断图片是否已下载，
//! 搜索时据此从索引返回的路径反推出菜品 ID。

use std::fmt;
use std::path::Path;

const PREFIX: &str = "meal_";
const SUFFIX: &str = ".jpg";

/// 菜品 ID
///
/// 不允许为空，也不允许包含路径分隔符、`..` 或 NUL，保证拼出的文件名始终落在图片目录内。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(String);

impl DomainId {
    pub fn parse(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && !id.contains("..")
            && !id.contains(['/', '\\', '\0']);
        valid.then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 返回菜品图片的文件名
pub fn image_filename(id: &DomainId) -> String {
    format!("{PREFIX}{}{SUFFIX}", id.0)
}

/// 从图片路径中解析出菜品 ID，不符合命名规则时返回 `None`
pub fn extract_domain_id(path: impl AsRef<Path>) -> Option<DomainId> {
    let name = path.as_ref().file_name()?.to_str()?;
    let id = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    DomainId::parse(id)
}
