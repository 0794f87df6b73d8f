//! 后端客户端模块
//!
//! 本模块提供查询编译结果的两个执行后端:
//! - **DocumentStoreClient**: 接收布尔查询 + 聚合树(Elasticsearch 兼容 JSON)的文档后端接口
//! - **MemoryDocumentStore**: 嵌入式文档后端,解释执行上述 JSON 查询
//! - **RelationalClient**: 接收参数化 SQL、返回分批预取游标的关系后端接口
//! - **SqliteClient**: 基于连接池的 SQLite 实现,注册了空间与时间函数
//!
//! 两个嵌入式后端共享 `duoquery-value` 的几何实现和 `duoquery-common` 的时间分桶实现,
//! 因此同一数据集在两边得到相同的判定结果。

pub mod document;
pub mod dsl;
pub mod pattern;
pub mod relational;
pub mod sqlite;
pub mod functions;

pub use document::{DocumentStoreClient, MemoryDocumentStore};
pub use pattern::WildcardPattern;
pub use relational::{
    BoundStatement, CursorOptions, RelationalClient, RowCursor, SqlParam, SqlRow, SqlValue,
};
pub use sqlite::{PooledConnection, SqliteClient};

use thiserror::Error;

/// 存储层错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite 错误
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON 错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 值或几何解析错误
    #[error("Value error: {0}")]
    Value(#[from] duoquery_value::ValueError),

    /// 索引或表不存在
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// 索引或表已存在
    #[error("Target already exists: {0}")]
    TargetExists(String),

    /// 查询体格式错误
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// 文档不符合映射
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// 结果解码失败
    #[error("Decode error: {0}")]
    Decode(String),

    /// 字段的存储特性不支持该操作
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// 连接池在等待期限内没有空闲连接
    #[error("Connection pool exhausted after {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// 语句执行超出时间预算被中断
    #[error("Interrupted after {elapsed_ms} ms (budget {budget_ms} ms)")]
    Interrupted { budget_ms: u64, elapsed_ms: u64 },

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// # Brief
    /// 对应的 HTTP 风格状态码,用于统一的后端错误信封
    pub fn status(&self) -> u16 {
        match self {
            StorageError::TargetNotFound(_) => 404,
            StorageError::TargetExists(_) => 409,
            StorageError::MalformedQuery(_)
            | StorageError::MalformedDocument(_)
            | StorageError::Unsupported(_)
            | StorageError::Value(_)
            | StorageError::Json(_) => 400,
            StorageError::Decode(_) => 502,
            StorageError::PoolExhausted { .. } => 503,
            StorageError::Interrupted { .. } => 504,
            StorageError::Sqlite(_) | StorageError::Internal(_) => 500,
        }
    }
}

/// 存储操作结果类型
pub type StorageResult<T> = Result<T, StorageError>;
