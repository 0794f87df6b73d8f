//! 值与 JSON 互转模块
//!
//! 文档后端的请求与响应都是 JSON。时间值输出为规范化的 RFC 3339 文本,
//! JSON 输入中的字符串不会被猜测成时间,由调用方按字段声明类型转换。

use crate::value::Value;
use compact_str::CompactString;
use duoquery_common::time::format_datetime;
use indexmap::IndexMap;
use serde_json::{Map, Number, Value as JsonValue};

/// # Brief
/// 将值转换为 JSON
///
/// 非有限浮点数无法用 JSON 数字表示,输出为 null。
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Int64(n) => JsonValue::Number((*n).into()),
        Value::Float64(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.to_string()),
        Value::DateTime(dt) => JsonValue::String(format_datetime(dt)),
        Value::Array(arr) => JsonValue::Array(arr.iter().map(to_json).collect()),
        Value::Document(doc) => {
            let map: Map<String, JsonValue> = doc
                .iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect();
            JsonValue::Object(map)
        }
    }
}

/// # Brief
/// 将 JSON 转换为值
///
/// 能表示为 i64 的数字转为 Int64,其余数字转为 Float64。
pub fn from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int64(i),
            None => n.as_f64().map(Value::Float64).unwrap_or(Value::Null),
        },
        JsonValue::String(s) => Value::String(CompactString::from(s.as_str())),
        JsonValue::Array(arr) => Value::Array(arr.iter().map(from_json).collect()),
        JsonValue::Object(map) => {
            let doc: IndexMap<CompactString, Value> = map
                .iter()
                .map(|(k, v)| (CompactString::from(k.as_str()), from_json(v)))
                .collect();
            Value::Document(doc)
        }
    }
}
