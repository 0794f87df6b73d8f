//! duoquery 查询模块
//!
//! 本模块把与后端无关的过滤/聚合请求编译成两种后端原生查询并执行:
//! - 请求模型与校验(operator / expression / filter / aggregation / request)
//! - 集合解析器:逻辑集合名到物理目标与字段路径的映射,几何形状推断与缓存
//! - 搜索引擎编译器:布尔查询 + 嵌套聚合树
//! - 关系编译器:参数化 SQL 片段,多层聚合用窗口子查询表达
//! - 执行器:分发到后端客户端,把结果归一化为行序列或计数
//!
//! 两个编译器必须对同一请求给出相同的命中集合与相同的分桶内容。

pub mod operator;
pub mod expression;
pub mod filter;
pub mod aggregation;
pub mod request;
pub mod resolver;
pub mod search;
pub mod sql;
pub mod compiler;
pub mod buckets;
pub mod executor;

pub use aggregation::{Aggregation, AggregationKind, AggregationSpec, Interval};
pub use compiler::{compile, CompiledQuery, NativeQuery};
pub use executor::{Backends, ExecutionOptions, QueryExecutor, QueryOutput, RowStream};
pub use expression::Expression;
pub use filter::{Filter, Group};
pub use operator::Operator;
pub use request::{ExpressionSpec, ProjectedField, Query, QueryRequest};
pub use resolver::{
    CollectionDefinition, CollectionReference, CollectionResolver, CollectionStore,
    FieldTypeCache, FieldTypeLookup, MemoryCollectionStore, ShapeTarget,
};

use duoquery_storage::StorageError;
use duoquery_value::ValueError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 后端失败的统一信封
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendFailure {
    /// HTTP 风格状态码
    pub status: u16,
    pub message: String,
    /// 后端原始诊断信息
    pub diagnostic: Option<String>,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status, self.message)?;
        if let Some(diagnostic) = &self.diagnostic {
            write!(f, " ({})", diagnostic)?;
        }
        Ok(())
    }
}

/// 查询错误类型
///
/// 校验错误在接触任何后端之前报告;后端错误不在内部重试。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// 过滤/聚合语法错误、操作符与字段类型不匹配、区间违规
    #[error("Validation error: {0}")]
    Validation(String),

    /// 集合或字段不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 后端失败
    #[error("Backend error: {0}")]
    Backend(BackendFailure),

    /// 后端往返超出调用方给定的时间预算
    #[error("Timeout after {elapsed_ms} ms (budget {budget_ms} ms)")]
    Timeout { budget_ms: u64, elapsed_ms: u64 },
}

impl QueryError {
    /// # Brief
    /// 构造后端错误
    pub fn backend(status: u16, message: impl Into<String>, diagnostic: Option<String>) -> Self {
        QueryError::Backend(BackendFailure {
            status,
            message: message.into(),
            diagnostic,
        })
    }

    /// 解码失败统一为 502
    pub fn decode(message: impl Into<String>) -> Self {
        QueryError::backend(502, message, None)
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Interrupted {
                budget_ms,
                elapsed_ms,
            } => QueryError::Timeout {
                budget_ms,
                elapsed_ms,
            },
            other => {
                let status = other.status();
                let diagnostic = match &other {
                    StorageError::Sqlite(e) => Some(format!("{:?}", e)),
                    _ => None,
                };
                QueryError::backend(status, other.to_string(), diagnostic)
            }
        }
    }
}

impl From<ValueError> for QueryError {
    fn from(err: ValueError) -> Self {
        QueryError::Validation(err.to_string())
    }
}

/// 查询结果类型
pub type QueryResult<T> = Result<T, QueryError>;
