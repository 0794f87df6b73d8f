//! 操作符模块
//!
//! 过滤表达式的封闭操作符集合,以及操作符对字段类型的适用性规则。

use crate::{QueryError, QueryResult};
use duoquery_common::FieldType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 过滤操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// 子串或通配符匹配
    Like,
    /// `[min<max]` 区间
    Range,
    Within,
    NotWithin,
}

impl Operator {
    pub const ALL: [Operator; 10] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Ge,
        Operator::Lt,
        Operator::Le,
        Operator::Like,
        Operator::Range,
        Operator::Within,
        Operator::NotWithin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "like",
            Operator::Range => "range",
            Operator::Within => "within",
            Operator::NotWithin => "not_within",
        }
    }

    /// 缺失字段的记录是否匹配(仅否定类操作符)
    pub fn matches_missing(&self) -> bool {
        matches!(self, Operator::Ne | Operator::NotWithin)
    }

    /// # Brief
    /// 判断操作符能否作用于给定类型的字段
    ///
    /// 关键字字段不支持大小比较,两个后端的排序规则不同。
    pub fn applies_to(&self, field_type: FieldType) -> bool {
        match self {
            Operator::Eq | Operator::Ne => !field_type.is_geo(),
            Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le | Operator::Range => {
                field_type.is_ordered()
            }
            Operator::Like => field_type == FieldType::Keyword,
            Operator::Within | Operator::NotWithin => field_type.is_geo(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "=" | "eq" => Operator::Eq,
            "!=" | "ne" => Operator::Ne,
            ">" | "gt" => Operator::Gt,
            ">=" | "ge" => Operator::Ge,
            "<" | "lt" => Operator::Lt,
            "<=" | "le" => Operator::Le,
            "like" => Operator::Like,
            "range" => Operator::Range,
            "within" => Operator::Within,
            "not_within" => Operator::NotWithin,
            other => {
                return Err(QueryError::Validation(format!(
                    "unknown operator: {:?}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

impl TryFrom<String> for Operator {
    type Error = QueryError;

    fn try_from(value: String) -> QueryResult<Self> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}
