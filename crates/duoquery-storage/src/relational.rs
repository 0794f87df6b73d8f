//! 关系后端接口模块
//!
//! 定义关系后端的边界类型:绑定参数、已绑定语句、解码后的行,
//! 以及按批预取的只进游标。游标只暴露 `next_batch`,调用方无需一次性取回全部结果。

use crate::StorageResult;
use chrono::{DateTime, Utc};
use duoquery_common::time::format_datetime;
use duoquery_common::SqlDialect;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// 绑定参数
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlParam {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Null => write!(f, "NULL"),
            SqlParam::Integer(n) => write!(f, "{}", n),
            SqlParam::Float(v) => write!(f, "{}", v),
            SqlParam::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            SqlParam::Timestamp(ts) => write!(f, "'{}'", format_datetime(ts)),
            SqlParam::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// 已绑定参数的语句
///
/// `params[i]` 对应占位符 `?{i+1}`(SQLite)或 `${i+1}`(PostgreSQL)。
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl BoundStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// 解码后的单元格
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(n) => Some(*n as f64),
            SqlValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// 一行结果
pub type SqlRow = Vec<SqlValue>;

/// 游标选项
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// 每批预取的行数
    pub batch_size: usize,
    /// 整个游标生命周期的时间预算
    pub timeout: Option<Duration>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: 256,
            timeout: None,
        }
    }
}

/// 只进游标
pub trait RowCursor: Send {
    /// # Brief
    /// 取下一批行
    ///
    /// 整批解码成功才返回;结果耗尽返回 `Ok(None)`。
    fn next_batch(&mut self) -> StorageResult<Option<Vec<SqlRow>>>;
}

/// 关系后端客户端
pub trait RelationalClient: Send + Sync {
    /// 客户端接受的 SQL 方言
    fn dialect(&self) -> SqlDialect;

    /// # Brief
    /// 打开游标
    ///
    /// 游标持有一个池化连接直到被丢弃。
    fn open_cursor(
        &self,
        statement: BoundStatement,
        options: CursorOptions,
    ) -> StorageResult<Box<dyn RowCursor>>;

    /// 读取全部行(用于结果有界的语句,例如分桶层级)
    fn fetch_all(&self, statement: BoundStatement, options: CursorOptions) -> StorageResult<Vec<SqlRow>> {
        let mut cursor = self.open_cursor(statement, options)?;
        let mut rows = Vec::new();
        while let Some(batch) = cursor.next_batch()? {
            rows.extend(batch);
        }
        Ok(rows)
    }
}
