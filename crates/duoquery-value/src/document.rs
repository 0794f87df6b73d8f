//! 文档结构模块
//!
//! 结果行与文档来源共用的有序字段映射。字段顺序即插入顺序,
//! 执行器按投影顺序或分桶层级顺序写入字段。

use crate::json;
use crate::value::Value;
use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// 有序文档
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: IndexMap<CompactString, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            fields: IndexMap::new(),
        }
    }

    /// # Brief
    /// 插入或覆盖字段
    ///
    /// # Arguments
    /// * `key` - 字段名
    /// * `value` - 字段值
    pub fn insert(&mut self, key: impl Into<CompactString>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// # Brief
    /// 按点分隔路径获取嵌套值
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// # Brief
    /// 从 JSON 对象构造文档;非对象输入返回 None
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match json::from_json(value) {
            Value::Document(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json::to_json(&Value::Document(self.fields.clone()))
    }

    pub fn into_value(self) -> Value {
        Value::Document(self.fields)
    }
}

impl Deref for Document {
    type Target = IndexMap<CompactString, Value>;

    fn deref(&self) -> &Self::Target {
        &self.fields
    }
}

impl DerefMut for Document {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.fields
    }
}

impl IntoIterator for Document {
    type Item = (CompactString, Value);
    type IntoIter = indexmap::map::IntoIter<CompactString, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(CompactString, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (CompactString, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// 便捷的文档构造宏
///
/// ```rust,ignore
/// let row = doc! { "name" => "a", "count" => 3i64 };
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut doc = $crate::Document::new();
        $(
            doc.insert($key, $value);
        )+
        doc
    }};
}
