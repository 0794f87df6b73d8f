//! 过滤表达式模块
//!
//! 表达式 = 字段路径 + 操作符 + 值字符串。值字符串的语法由操作符决定,
//! 在构造时按字段声明类型解析和校验,执行阶段不再解析:
//! - 比较操作符:按字段类型解析的标量
//! - `range`:`[a<b]`,`=` 贴在 `<` 左侧表示下界闭,右侧表示上界闭
//! - `like`:含 `*`/`?` 时为锚定通配符,否则为子串匹配;`\` 转义
//! - `within`/`not_within`:bbox 或 `POLYGON((...))`

use crate::operator::Operator;
use crate::{QueryError, QueryResult};
use chrono::{DateTime, Utc};
use duoquery_common::time::{format_datetime, parse_datetime};
use duoquery_common::FieldType;
use duoquery_storage::{SqlParam, WildcardPattern};
use duoquery_value::geometry::parse_geometry;
use duoquery_value::json::to_json;
use duoquery_value::{Area, Value};
use serde_json::{json, Value as JsonValue};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// 标量
// ============================================================================

/// 按字段类型解析后的标量值
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Keyword(String),
    Integer(i64),
    Float(f64),
    Date(DateTime<Utc>),
    Boolean(bool),
}

impl Scalar {
    /// # Brief
    /// 按字段类型解析值字符串
    ///
    /// # Arguments
    /// * `raw` - 原始值字符串
    /// * `field_type` - 字段声明类型(不能是几何类型)
    pub fn parse(raw: &str, field_type: FieldType) -> QueryResult<Self> {
        let invalid = || {
            QueryError::Validation(format!("{:?} is not a valid {} value", raw, field_type))
        };
        let scalar = match field_type {
            FieldType::Keyword => Scalar::Keyword(raw.to_string()),
            FieldType::Integer => Scalar::Integer(raw.trim().parse().map_err(|_| invalid())?),
            FieldType::Float => {
                let f: f64 = raw.trim().parse().map_err(|_| invalid())?;
                if !f.is_finite() {
                    return Err(invalid());
                }
                Scalar::Float(f)
            }
            FieldType::Date => Scalar::Date(parse_datetime(raw).ok_or_else(invalid)?),
            FieldType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Scalar::Boolean(true),
                "false" => Scalar::Boolean(false),
                _ => return Err(invalid()),
            },
            FieldType::GeoPoint | FieldType::GeoShape => {
                return Err(QueryError::Validation(format!(
                    "{} fields have no scalar values",
                    field_type
                )))
            }
        };
        Ok(scalar)
    }

    /// # Brief
    /// 把记录中的值转换为同类型标量,用于参照求值
    ///
    /// # Returns
    /// 无法转换时返回 None
    pub fn from_value(value: &Value, field_type: FieldType) -> Option<Self> {
        match (field_type, value) {
            (FieldType::Keyword, Value::String(s)) => Some(Scalar::Keyword(s.to_string())),
            (FieldType::Keyword, Value::Int64(n)) => Some(Scalar::Keyword(n.to_string())),
            (FieldType::Keyword, Value::Float64(f)) => Some(Scalar::Keyword(f.to_string())),
            (FieldType::Keyword, Value::Boolean(b)) => Some(Scalar::Keyword(b.to_string())),
            (FieldType::Integer, Value::Int64(n)) => Some(Scalar::Integer(*n)),
            (FieldType::Float, v) if v.as_f64().is_some() => v.as_f64().map(Scalar::Float),
            (FieldType::Date, Value::DateTime(dt)) => Some(Scalar::Date(*dt)),
            (FieldType::Date, Value::Int64(ms)) => {
                DateTime::from_timestamp_millis(*ms).map(Scalar::Date)
            }
            (FieldType::Boolean, Value::Boolean(b)) => Some(Scalar::Boolean(*b)),
            (field_type, Value::String(s)) if field_type != FieldType::Keyword => {
                Scalar::parse(s, field_type).ok()
            }
            _ => None,
        }
    }

    /// 同类型比较;类型不同返回 None
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Keyword(a), Scalar::Keyword(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Scalar::Integer(a), Scalar::Integer(b)) => Some(a.cmp(b)),
            (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => Some(a.cmp(b)),
            (Scalar::Boolean(a), Scalar::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// 文档后端使用的 JSON 表示(时间为规范化文本)
    pub fn to_json(&self) -> JsonValue {
        match self {
            Scalar::Keyword(s) => json!(s),
            Scalar::Integer(n) => json!(n),
            Scalar::Float(f) => json!(f),
            Scalar::Date(dt) => json!(format_datetime(dt)),
            Scalar::Boolean(b) => json!(b),
        }
    }

    /// 关系后端的绑定参数
    pub fn to_param(&self) -> SqlParam {
        match self {
            Scalar::Keyword(s) => SqlParam::Text(s.clone()),
            Scalar::Integer(n) => SqlParam::Integer(*n),
            Scalar::Float(f) => SqlParam::Float(*f),
            Scalar::Date(dt) => SqlParam::Timestamp(*dt),
            Scalar::Boolean(b) => SqlParam::Boolean(*b),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Keyword(s) => f.write_str(s),
            Scalar::Integer(n) => write!(f, "{}", n),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Date(dt) => f.write_str(&format_datetime(dt)),
            Scalar::Boolean(b) => write!(f, "{}", b),
        }
    }
}

// ============================================================================
// 区间
// ============================================================================

/// `range` 操作符的两个边界
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBounds {
    pub min: Scalar,
    pub max: Scalar,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl RangeBounds {
    /// # Brief
    /// 解析 `[a<b]`、`[a=<b]`、`[a<=b]`、`[a=<=b]`
    ///
    /// 要求 `a < b`,两端都闭时允许 `a = b`。
    pub fn parse(raw: &str, field_type: FieldType) -> QueryResult<Self> {
        let syntax_error = || {
            QueryError::Validation(format!(
                "range value {:?} must look like [min<max], [min=<max], [min<=max] or [min=<=max]",
                raw
            ))
        };
        let inner = raw
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(syntax_error)?;
        let mut parts = inner.split('<');
        let (Some(left), Some(right), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(syntax_error());
        };
        let (left, min_inclusive) = match left.strip_suffix('=') {
            Some(rest) => (rest, true),
            None => (left, false),
        };
        let (right, max_inclusive) = match right.strip_prefix('=') {
            Some(rest) => (rest, true),
            None => (right, false),
        };
        if left.trim().is_empty() || right.trim().is_empty() {
            return Err(syntax_error());
        }
        let min = Scalar::parse(left.trim(), field_type)?;
        let max = Scalar::parse(right.trim(), field_type)?;
        let ordered = match min.compare(&max) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => min_inclusive && max_inclusive,
            _ => false,
        };
        if !ordered {
            return Err(QueryError::Validation(format!(
                "range minimum must be below maximum: {}",
                raw
            )));
        }
        Ok(Self {
            min,
            max,
            min_inclusive,
            max_inclusive,
        })
    }

    pub fn contains(&self, value: &Scalar) -> bool {
        let above = match value.compare(&self.min) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => self.min_inclusive,
            _ => false,
        };
        let below = match value.compare(&self.max) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => self.max_inclusive,
            _ => false,
        };
        above && below
    }
}

impl fmt::Display for RangeBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}<{}{}]",
            self.min,
            if self.min_inclusive { "=" } else { "" },
            if self.max_inclusive { "=" } else { "" },
            self.max
        )
    }
}

// ============================================================================
// like 模式
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum LikeToken {
    Literal(char),
    AnyRun,
    AnyOne,
}

/// `like` 模式
#[derive(Debug, Clone, PartialEq)]
pub struct LikePattern {
    raw: String,
    tokens: Vec<LikeToken>,
    matcher: WildcardPattern,
}

impl LikePattern {
    pub fn parse(raw: &str) -> QueryResult<Self> {
        if raw.is_empty() {
            return Err(QueryError::Validation("like pattern cannot be empty".to_string()));
        }
        let mut tokens = Vec::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            let token = match c {
                '\\' => match chars.next() {
                    Some(escaped) => LikeToken::Literal(escaped),
                    None => {
                        return Err(QueryError::Validation(format!(
                            "like pattern ends with a dangling escape: {:?}",
                            raw
                        )))
                    }
                },
                '*' => LikeToken::AnyRun,
                '?' => LikeToken::AnyOne,
                c => LikeToken::Literal(c),
            };
            tokens.push(token);
        }
        let matcher = WildcardPattern::wildcard(&wildcard_text(&anchored(&tokens)), true)
            .map_err(|e| QueryError::Validation(e.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            tokens,
            matcher,
        })
    }

    /// 是否为通配符模式(否则为子串匹配)
    pub fn is_wildcard(&self) -> bool {
        self.tokens.iter().any(|t| !matches!(t, LikeToken::Literal(_)))
    }

    /// 搜索引擎 wildcard 语法
    pub fn to_wildcard(&self) -> String {
        wildcard_text(&anchored(&self.tokens))
    }

    /// SQL LIKE 语法,转义字符为 `\`
    pub fn to_sql_like(&self) -> String {
        let mut out = String::with_capacity(self.raw.len() + 2);
        for token in anchored(&self.tokens) {
            match token {
                LikeToken::AnyRun => out.push('%'),
                LikeToken::AnyOne => out.push('_'),
                LikeToken::Literal(c) => {
                    if matches!(c, '%' | '_' | '\\') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
        out
    }

    /// 大小写不敏感的整串匹配
    pub fn matches(&self, text: &str) -> bool {
        self.matcher.matches(text)
    }
}

/// 锚定后的完整 token 序列:子串匹配两端补 `*`
fn anchored(tokens: &[LikeToken]) -> Vec<LikeToken> {
    if tokens.iter().any(|t| !matches!(t, LikeToken::Literal(_))) {
        tokens.to_vec()
    } else {
        let mut out = Vec::with_capacity(tokens.len() + 2);
        out.push(LikeToken::AnyRun);
        out.extend(tokens.iter().cloned());
        out.push(LikeToken::AnyRun);
        out
    }
}

fn wildcard_text(tokens: &[LikeToken]) -> String {
    let mut out = String::with_capacity(tokens.len() + 2);
    for token in tokens {
        match token {
            LikeToken::AnyRun => out.push('*'),
            LikeToken::AnyOne => out.push('?'),
            LikeToken::Literal(c) => {
                if matches!(c, '*' | '?' | '\\') {
                    out.push('\\');
                }
                out.push(*c);
            }
        }
    }
    out
}

impl fmt::Display for LikePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ============================================================================
// 表达式
// ============================================================================

/// 解析后的操作数
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Scalar(Scalar),
    Range(RangeBounds),
    Like(LikePattern),
    Area(Area),
}

/// 单个过滤表达式(构造即校验,之后不可变)
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    field: String,
    op: Operator,
    field_type: FieldType,
    operand: Operand,
}

impl Expression {
    /// # Brief
    /// 构造并校验表达式
    ///
    /// # Arguments
    /// * `field` - 逻辑字段名
    /// * `op` - 操作符
    /// * `raw` - 值字符串
    /// * `field_type` - 字段声明类型
    ///
    /// # Returns
    /// 操作符不适用于该字段类型或值语法错误时返回 Validation 错误
    pub fn new(
        field: impl Into<String>,
        op: Operator,
        raw: &str,
        field_type: FieldType,
    ) -> QueryResult<Self> {
        let field = field.into();
        if !op.applies_to(field_type) {
            return Err(QueryError::Validation(format!(
                "operator {} is not applicable to {} field {}",
                op, field_type, field
            )));
        }
        let context = |e: QueryError| match e {
            QueryError::Validation(msg) => QueryError::Validation(format!("field {}: {}", field, msg)),
            other => other,
        };
        let operand = match op {
            Operator::Range => Operand::Range(RangeBounds::parse(raw, field_type).map_err(context)?),
            Operator::Like => Operand::Like(LikePattern::parse(raw).map_err(context)?),
            Operator::Within | Operator::NotWithin => {
                Operand::Area(Area::parse(raw).map_err(|e| context(e.into()))?)
            }
            _ => Operand::Scalar(Scalar::parse(raw, field_type).map_err(context)?),
        };
        Ok(Self {
            field,
            op,
            field_type,
            operand,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// # Brief
    /// 参照语义:判断记录中该字段的值是否满足表达式
    ///
    /// 缺失或 null 只满足否定类操作符。
    pub fn evaluate(&self, value: Option<&Value>) -> bool {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return self.op.matches_missing();
        };
        match &self.operand {
            Operand::Area(area) => {
                let inside = parse_geometry(&to_json(value))
                    .map(|g| area.contains(&g))
                    .ok();
                match (self.op, inside) {
                    (Operator::Within, Some(inside)) => inside,
                    (Operator::NotWithin, Some(inside)) => !inside,
                    (op, None) => op.matches_missing(),
                    _ => false,
                }
            }
            Operand::Like(pattern) => match value {
                Value::String(s) => pattern.matches(s),
                _ => false,
            },
            Operand::Range(bounds) => Scalar::from_value(value, self.field_type)
                .map(|s| bounds.contains(&s))
                .unwrap_or(false),
            Operand::Scalar(operand) => {
                let ord = Scalar::from_value(value, self.field_type).and_then(|s| s.compare(operand));
                match self.op {
                    Operator::Eq => ord == Some(Ordering::Equal),
                    Operator::Ne => ord != Some(Ordering::Equal),
                    Operator::Gt => ord == Some(Ordering::Greater),
                    Operator::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                    Operator::Lt => ord == Some(Ordering::Less),
                    Operator::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match &self.operand {
            Operand::Scalar(s) => s.to_string(),
            Operand::Range(r) => r.to_string(),
            Operand::Like(p) => p.to_string(),
            Operand::Area(a) => a.to_string(),
        };
        write!(f, "{} {} {}", self.field, self.op, value)
    }
}
