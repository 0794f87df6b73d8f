//! 公共类型定义模块
//!
//! 定义 duoquery 的核心类型:
//! - FieldType: 字段声明类型,两个编译器都据此判断操作符是否适用
//! - BackendKind: 集合所在的物理后端
//! - CollectionName: 集合名称(带验证)

use crate::error::DuoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 字段声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 精确匹配的字符串
    Keyword,
    /// 64 位整数
    Integer,
    /// 双精度浮点数
    Float,
    /// UTC 时间
    Date,
    /// 布尔值
    Boolean,
    /// 点坐标
    GeoPoint,
    /// 任意几何体
    GeoShape,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Keyword => "keyword",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
            FieldType::GeoPoint => "geo_point",
            FieldType::GeoShape => "geo_shape",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }

    /// 可以做大小比较的类型
    pub fn is_ordered(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float | FieldType::Date)
    }

    pub fn is_geo(&self) -> bool {
        matches!(self, FieldType::GeoPoint | FieldType::GeoShape)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = DuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyword" | "string" | "text" => Ok(FieldType::Keyword),
            "integer" | "long" | "int" => Ok(FieldType::Integer),
            "float" | "double" => Ok(FieldType::Float),
            "date" | "datetime" | "timestamp" => Ok(FieldType::Date),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "geo_point" | "point" => Ok(FieldType::GeoPoint),
            "geo_shape" | "geometry" => Ok(FieldType::GeoShape),
            other => Err(DuoError::Validation(format!("Unknown field type: {}", other))),
        }
    }
}

/// 集合所在的物理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// 文档/搜索引擎
    Document,
    /// 关系型数据库
    Relational,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Document => f.write_str("document"),
            BackendKind::Relational => f.write_str("relational"),
        }
    }
}

/// 集合名称
///
/// 带验证的集合名称,禁止:
/// - 空名称
/// - 超过 128 字符
/// - 包含空白或 null 字符
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Result<Self, DuoError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DuoError::Validation(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.len() > 128 {
            return Err(DuoError::Validation(
                "Collection name cannot exceed 128 characters".to_string(),
            ));
        }
        if name.chars().any(|c| c.is_whitespace() || c == '\0') {
            return Err(DuoError::Validation(format!(
                "Collection name cannot contain whitespace: {:?}",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionName {
    type Error = DuoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
