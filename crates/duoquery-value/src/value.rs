//! 值类型定义模块
//!
//! 定义与后端无关的值类型。文档后端返回的 JSON 和关系后端返回的列
//! 都按字段声明类型归一化为 `Value`,两条执行路径的结果因此可以直接比较。
//! 使用 `CompactString` 优化短字符串的内存占用。

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 归一化后的值
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 空值
    #[default]
    Null,
    /// 布尔值
    Boolean(bool),
    /// 64位有符号整数
    Int64(i64),
    /// 64位浮点数
    Float64(f64),
    /// UTF-8 字符串
    String(CompactString),
    /// UTC 日期时间
    DateTime(DateTime<Utc>),
    /// 值数组
    Array(Vec<Value>),
    /// 嵌套文档(有序键值对)
    Document(IndexMap<CompactString, Value>),
}

impl Value {
    /// # Brief
    /// 返回值的类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::DateTime(_) => "dateTime",
            Value::Array(_) => "array",
            Value::Document(_) => "document",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// # Brief
    /// 数值类型统一取为 f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(n) => Some(*n as f64),
            Value::Float64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&IndexMap<CompactString, Value>> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// # Brief
    /// 从文档中取键,或从数组中取下标
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Document(doc) => doc.get(key),
            Value::Array(arr) => key.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        }
    }

    /// # Brief
    /// 按点分隔路径获取嵌套值
    ///
    /// # Arguments
    /// * `path` - 点分隔的路径,如 "address.city"
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// # Brief
    /// 用于分组和集合键的规范文本形式
    ///
    /// 浮点数使用位模式,保证相同计算得到的键在两条路径上文本一致。
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => "n".to_string(),
            Value::Boolean(b) => format!("b:{}", b),
            Value::Int64(n) => format!("i:{}", n),
            Value::Float64(f) => format!("f:{:x}", f.to_bits()),
            Value::String(s) => format!("s:{}", s),
            Value::DateTime(dt) => format!("t:{}", dt.timestamp_millis()),
            Value::Array(arr) => {
                let parts: Vec<String> = arr.iter().map(Value::key_repr).collect();
                format!("a:[{}]", parts.join(","))
            }
            Value::Document(doc) => {
                let parts: Vec<String> = doc
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.key_repr()))
                    .collect();
                format!("d:{{{}}}", parts.join(","))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int64(n) => write!(f, "{}", n),
            Value::Float64(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::DateTime(dt) => write!(f, "DateTime(\"{}\")", dt.to_rfc3339()),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Document(doc) => {
                write!(f, "{{")?;
                for (i, (k, v)) in doc.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// # Brief
/// 比较两个值的大小
///
/// 数值类型之间按数值比较,字符串按字节序,时间按时间先后。
/// 不同类型之间按类型序排列,Null 最小。
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Int64(_) | Value::Float64(_) => 2,
        Value::String(_) => 3,
        Value::DateTime(_) => 4,
        Value::Array(_) => 5,
        Value::Document(_) => 6,
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int64(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(CompactString::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(CompactString::from(v))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
