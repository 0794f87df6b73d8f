//! 查询 DSL 解释模块
//!
//! 解释文档后端收到的 Elasticsearch 兼容查询体,支持的子集:
//! - 查询:`match_all`、`bool`(must/filter/should/must_not/minimum_should_match)、
//!   `term`、`range`、`wildcard`、`geo_shape`(relation = within)、`exists`
//! - 分桶聚合:`date_histogram`、`histogram`、`terms`、`geotile_grid`
//! - 指标聚合:`min`、`max`、`avg`、`sum`、`cardinality`、`geo_bounds`、`geo_centroid`
//! - 管道聚合:`bucket_sort`
//!
//! 查询体先整体解析为 `Clause`/`AggNode`,格式错误在求值前报告。

use crate::pattern::WildcardPattern;
use crate::{StorageError, StorageResult};
use duoquery_common::time::{format_datetime, parse_datetime, parse_short_interval, truncate};
use duoquery_common::{FieldType, IntervalUnit};
use duoquery_value::geometry::{bounding_box, geometry_within, parse_geometry, GeoTile};
use geo::Geometry;
use indexmap::IndexMap;
use serde_json::{json, Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

// ============================================================================
// 字段值
// ============================================================================

/// 按映射类型解析后的字段值
#[derive(Debug, Clone)]
pub enum Typed {
    Keyword(String),
    Long(i64),
    Double(f64),
    /// 毫秒时间戳
    Date(i64),
    Bool(bool),
    Geo(Geometry<f64>),
}

impl Typed {
    /// # Brief
    /// 按字段类型解析 JSON 值
    ///
    /// # Returns
    /// null 返回 `Ok(None)`;无法转换时返回错误
    pub fn from_json(value: &JsonValue, field_type: FieldType) -> Result<Option<Self>, String> {
        if value.is_null() {
            return Ok(None);
        }
        let typed = match field_type {
            FieldType::Keyword => match value {
                JsonValue::String(s) => Typed::Keyword(s.clone()),
                JsonValue::Number(n) => Typed::Keyword(n.to_string()),
                JsonValue::Bool(b) => Typed::Keyword(b.to_string()),
                other => return Err(format!("cannot index {} as keyword", other)),
            },
            FieldType::Integer => match value {
                JsonValue::Number(n) => match n.as_i64() {
                    Some(i) => Typed::Long(i),
                    None => return Err(format!("{} is not an integer", n)),
                },
                JsonValue::String(s) => Typed::Long(
                    s.trim()
                        .parse()
                        .map_err(|_| format!("{:?} is not an integer", s))?,
                ),
                other => return Err(format!("cannot index {} as integer", other)),
            },
            FieldType::Float => match value {
                JsonValue::Number(n) => Typed::Double(
                    n.as_f64()
                        .ok_or_else(|| format!("{} is not a float", n))?,
                ),
                JsonValue::String(s) => Typed::Double(
                    s.trim()
                        .parse()
                        .map_err(|_| format!("{:?} is not a float", s))?,
                ),
                other => return Err(format!("cannot index {} as float", other)),
            },
            FieldType::Date => match value {
                JsonValue::Number(n) => {
                    Typed::Date(n.as_i64().ok_or_else(|| format!("{} is not epoch millis", n))?)
                }
                JsonValue::String(s) => Typed::Date(
                    parse_datetime(s)
                        .ok_or_else(|| format!("{:?} is not a date", s))?
                        .timestamp_millis(),
                ),
                other => return Err(format!("cannot index {} as date", other)),
            },
            FieldType::Boolean => match value {
                JsonValue::Bool(b) => Typed::Bool(*b),
                JsonValue::String(s) if s == "true" => Typed::Bool(true),
                JsonValue::String(s) if s == "false" => Typed::Bool(false),
                other => return Err(format!("cannot index {} as boolean", other)),
            },
            FieldType::GeoPoint | FieldType::GeoShape => {
                Typed::Geo(parse_geometry(value).map_err(|e| e.to_string())?)
            }
        };
        Ok(Some(typed))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Typed::Long(n) | Typed::Date(n) => Some(*n as f64),
            Typed::Double(f) => Some(*f),
            _ => None,
        }
    }

    /// 同类值比较;不可比较时返回 None
    pub fn compare(&self, other: &Typed) -> Option<Ordering> {
        match (self, other) {
            (Typed::Keyword(a), Typed::Keyword(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Typed::Long(a), Typed::Long(b)) | (Typed::Date(a), Typed::Date(b)) => Some(a.cmp(b)),
            (Typed::Bool(a), Typed::Bool(b)) => Some(a.cmp(b)),
            (Typed::Double(_) | Typed::Long(_), Typed::Double(_) | Typed::Long(_)) => {
                Some(self.as_f64()?.total_cmp(&other.as_f64()?))
            }
            _ => None,
        }
    }

    fn group_key(&self) -> String {
        match self {
            Typed::Keyword(s) => format!("s:{}", s),
            Typed::Long(n) => format!("i:{}", n),
            Typed::Double(f) => format!("f:{:x}", f.to_bits()),
            Typed::Date(n) => format!("t:{}", n),
            Typed::Bool(b) => format!("b:{}", b),
            Typed::Geo(g) => format!("g:{:?}", g),
        }
    }

    /// 分桶键的 JSON 形式(与搜索引擎一致:日期为毫秒数,布尔为 1/0)
    fn key_json(&self) -> (JsonValue, Option<String>) {
        match self {
            Typed::Keyword(s) => (json!(s), None),
            Typed::Long(n) => (json!(n), None),
            Typed::Double(f) => (json!(f), None),
            Typed::Date(ms) => (
                json!(ms),
                chrono::DateTime::from_timestamp_millis(*ms).map(|dt| format_datetime(&dt)),
            ),
            Typed::Bool(b) => (json!(if *b { 1 } else { 0 }), Some(b.to_string())),
            Typed::Geo(_) => (JsonValue::Null, None),
        }
    }
}

/// 已解析映射字段的文档
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub source: JsonValue,
    pub fields: HashMap<String, Typed>,
}

/// 按点分隔路径读取 JSON 值
pub fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// ============================================================================
// 查询子句
// ============================================================================

/// 解析后的查询子句
#[derive(Debug, Clone)]
pub enum Clause {
    MatchAll,
    Bool {
        must: Vec<Clause>,
        should: Vec<Clause>,
        must_not: Vec<Clause>,
        minimum_should_match: usize,
    },
    Term {
        field: String,
        value: Typed,
    },
    Range {
        field: String,
        gt: Option<Typed>,
        gte: Option<Typed>,
        lt: Option<Typed>,
        lte: Option<Typed>,
    },
    Wildcard {
        field: String,
        pattern: WildcardPattern,
    },
    Within {
        field: String,
        area: Geometry<f64>,
    },
    Exists {
        field: String,
    },
}

fn malformed(message: impl Into<String>) -> StorageError {
    StorageError::MalformedQuery(message.into())
}

/// 单字段子句的 `{field: body}` 拆分
fn single_field<'a>(clause: &'a JsonValue, kind: &str) -> StorageResult<(&'a str, &'a JsonValue)> {
    let obj = clause
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| malformed(format!("[{}] expects exactly one field", kind)))?;
    let (field, body) = obj
        .iter()
        .next()
        .ok_or_else(|| malformed(format!("[{}] expects exactly one field", kind)))?;
    Ok((field.as_str(), body))
}

fn clause_list(value: Option<&JsonValue>, mapping: &IndexMap<String, FieldType>) -> StorageResult<Vec<Clause>> {
    match value {
        None => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items.iter().map(|c| parse_clause(c, mapping)).collect(),
        Some(single) => Ok(vec![parse_clause(single, mapping)?]),
    }
}

fn typed_operand(
    value: &JsonValue,
    field: &str,
    mapping: &IndexMap<String, FieldType>,
) -> StorageResult<Typed> {
    let field_type = mapping
        .get(field)
        .copied()
        .ok_or_else(|| malformed(format!("No mapping found for field [{}]", field)))?;
    Typed::from_json(value, field_type)
        .map_err(|e| malformed(format!("field [{}]: {}", field, e)))?
        .ok_or_else(|| malformed(format!("field [{}]: null operand", field)))
}

/// # Brief
/// 解析查询子句
///
/// # Arguments
/// * `value` - 查询 JSON
/// * `mapping` - 索引映射,用于把操作数转换为字段类型
pub fn parse_clause(value: &JsonValue, mapping: &IndexMap<String, FieldType>) -> StorageResult<Clause> {
    let (kind, body) = single_field(value, "query")?;
    match kind {
        "match_all" => Ok(Clause::MatchAll),
        "bool" => {
            let obj = body
                .as_object()
                .ok_or_else(|| malformed("[bool] body must be an object"))?;
            let mut must = clause_list(obj.get("must"), mapping)?;
            must.extend(clause_list(obj.get("filter"), mapping)?);
            let should = clause_list(obj.get("should"), mapping)?;
            let must_not = clause_list(obj.get("must_not"), mapping)?;
            let minimum_should_match = match obj.get("minimum_should_match") {
                Some(v) => v
                    .as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| malformed("minimum_should_match must be a non-negative integer"))?,
                None if must.is_empty() && !should.is_empty() => 1,
                None => 0,
            };
            Ok(Clause::Bool {
                must,
                should,
                must_not,
                minimum_should_match,
            })
        }
        "term" => {
            let (field, operand) = single_field(body, "term")?;
            let operand = match operand {
                JsonValue::Object(o) => o
                    .get("value")
                    .ok_or_else(|| malformed("[term] object form needs [value]"))?,
                other => other,
            };
            Ok(Clause::Term {
                field: field.to_string(),
                value: typed_operand(operand, field, mapping)?,
            })
        }
        "range" => {
            let (field, bounds) = single_field(body, "range")?;
            let bounds = bounds
                .as_object()
                .ok_or_else(|| malformed("[range] bounds must be an object"))?;
            let bound = |name: &str| -> StorageResult<Option<Typed>> {
                bounds
                    .get(name)
                    .map(|v| typed_operand(v, field, mapping))
                    .transpose()
            };
            Ok(Clause::Range {
                field: field.to_string(),
                gt: bound("gt")?,
                gte: bound("gte")?,
                lt: bound("lt")?,
                lte: bound("lte")?,
            })
        }
        "wildcard" => {
            let (field, spec) = single_field(body, "wildcard")?;
            let (raw, case_insensitive) = match spec {
                JsonValue::String(s) => (s.as_str(), false),
                JsonValue::Object(o) => (
                    o.get("value")
                        .and_then(JsonValue::as_str)
                        .ok_or_else(|| malformed("[wildcard] needs a string [value]"))?,
                    o.get("case_insensitive")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(false),
                ),
                _ => return Err(malformed("[wildcard] body must be a string or object")),
            };
            Ok(Clause::Wildcard {
                field: field.to_string(),
                pattern: WildcardPattern::wildcard(raw, case_insensitive)?,
            })
        }
        "geo_shape" => {
            let (field, spec) = single_field(body, "geo_shape")?;
            let shape = spec
                .get("shape")
                .ok_or_else(|| malformed("[geo_shape] needs [shape]"))?;
            let relation = spec
                .get("relation")
                .and_then(JsonValue::as_str)
                .unwrap_or("intersects");
            if relation != "within" {
                return Err(StorageError::Unsupported(format!(
                    "geo_shape relation [{}]",
                    relation
                )));
            }
            Ok(Clause::Within {
                field: field.to_string(),
                area: parse_geometry(shape)?,
            })
        }
        "exists" => {
            let field = body
                .get("field")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| malformed("[exists] needs a string [field]"))?;
            Ok(Clause::Exists {
                field: field.to_string(),
            })
        }
        other => Err(malformed(format!("unknown query [{}]", other))),
    }
}

impl Clause {
    /// 判断文档是否匹配
    pub fn matches(&self, doc: &StoredDocument) -> bool {
        match self {
            Clause::MatchAll => true,
            Clause::Bool {
                must,
                should,
                must_not,
                minimum_should_match,
            } => {
                must.iter().all(|c| c.matches(doc))
                    && !must_not.iter().any(|c| c.matches(doc))
                    && should.iter().filter(|c| c.matches(doc)).count() >= *minimum_should_match
            }
            Clause::Term { field, value } => doc
                .fields
                .get(field)
                .and_then(|v| v.compare(value))
                .map(|o| o == Ordering::Equal)
                .unwrap_or(false),
            Clause::Range {
                field,
                gt,
                gte,
                lt,
                lte,
            } => {
                let Some(v) = doc.fields.get(field) else {
                    return false;
                };
                let check = |bound: &Option<Typed>, ok: &dyn Fn(Ordering) -> bool| match bound {
                    None => true,
                    Some(b) => v.compare(b).map(ok).unwrap_or(false),
                };
                check(gt, &|o| o == Ordering::Greater)
                    && check(gte, &|o| o != Ordering::Less)
                    && check(lt, &|o| o == Ordering::Less)
                    && check(lte, &|o| o != Ordering::Greater)
            }
            Clause::Wildcard { field, pattern } => match doc.fields.get(field) {
                Some(Typed::Keyword(s)) => pattern.matches(s),
                _ => false,
            },
            Clause::Within { field, area } => match doc.fields.get(field) {
                Some(Typed::Geo(g)) => geometry_within(g, area),
                _ => false,
            },
            Clause::Exists { field } => doc.fields.contains_key(field),
        }
    }
}

// ============================================================================
// 聚合
// ============================================================================

/// 排序依据
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Key,
    Count,
    /// 子聚合名称(取其 `value`)
    Metric(String),
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub key: SortKey,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub enum AggKind {
    DateHistogram { field: String, unit: IntervalUnit, value: u32 },
    Histogram { field: String, interval: f64 },
    Terms { field: String, size: usize, order: Vec<SortSpec> },
    GeoTile { field: String, precision: u8, size: usize },
    BucketSort { sort: Vec<SortSpec>, from: usize, size: Option<usize> },
    Min(String),
    Max(String),
    Avg(String),
    Sum(String),
    Cardinality(String),
    GeoBounds(String),
    GeoCentroid(String),
}

/// 聚合树节点
#[derive(Debug, Clone)]
pub struct AggNode {
    pub name: String,
    pub kind: AggKind,
    pub subs: Vec<AggNode>,
}

fn field_of<'a>(body: &'a JsonValue, kind: &str) -> StorageResult<&'a str> {
    body.get("field")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| malformed(format!("[{}] needs a string [field]", kind)))
}

fn usize_of(body: &JsonValue, name: &str, default: usize) -> StorageResult<usize> {
    match body.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| malformed(format!("[{}] must be a non-negative integer", name))),
    }
}

fn parse_sort_entry(entry: &JsonValue) -> StorageResult<SortSpec> {
    let (path, spec) = single_field(entry, "sort")?;
    let direction = match spec {
        JsonValue::String(s) => s.as_str(),
        JsonValue::Object(o) => o.get("order").and_then(JsonValue::as_str).unwrap_or("asc"),
        _ => return Err(malformed("sort direction must be a string or {order}")),
    };
    let descending = match direction {
        "asc" => false,
        "desc" => true,
        other => return Err(malformed(format!("unknown sort order [{}]", other))),
    };
    let key = match path {
        "_key" => SortKey::Key,
        "_count" => SortKey::Count,
        other => SortKey::Metric(other.to_string()),
    };
    Ok(SortSpec { key, descending })
}

fn parse_sort_list(value: Option<&JsonValue>) -> StorageResult<Vec<SortSpec>> {
    match value {
        None => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items.iter().map(parse_sort_entry).collect(),
        Some(single) => Ok(vec![parse_sort_entry(single)?]),
    }
}

/// # Brief
/// 解析 `aggs` 对象
pub fn parse_aggs(aggs: &Map<String, JsonValue>) -> StorageResult<Vec<AggNode>> {
    let mut nodes = Vec::with_capacity(aggs.len());
    for (name, spec) in aggs {
        let obj = spec
            .as_object()
            .ok_or_else(|| malformed(format!("aggregation [{}] must be an object", name)))?;
        let subs = match obj.get("aggs").or_else(|| obj.get("aggregations")) {
            Some(JsonValue::Object(children)) => parse_aggs(children)?,
            Some(_) => return Err(malformed(format!("[{}].aggs must be an object", name))),
            None => Vec::new(),
        };
        let (kind_name, body) = obj
            .iter()
            .find(|(k, _)| k.as_str() != "aggs" && k.as_str() != "aggregations")
            .ok_or_else(|| malformed(format!("aggregation [{}] has no type", name)))?;
        let kind = match kind_name.as_str() {
            "date_histogram" => {
                let field = field_of(body, kind_name)?.to_string();
                let interval = body
                    .get("calendar_interval")
                    .or_else(|| body.get("fixed_interval"))
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| malformed("[date_histogram] needs an interval"))?;
                let (unit, value) = parse_short_interval(interval)
                    .ok_or_else(|| malformed(format!("bad interval [{}]", interval)))?;
                if body.get("calendar_interval").is_some() && (!unit.is_calendar() || value != 1) {
                    return Err(malformed(format!(
                        "The supplied interval [{}] can not be used as a calendar interval",
                        interval
                    )));
                }
                if body.get("fixed_interval").is_some() && unit.is_calendar() {
                    return Err(malformed(format!(
                        "fixed_interval [{}] uses a calendar unit",
                        interval
                    )));
                }
                AggKind::DateHistogram { field, unit, value }
            }
            "histogram" => {
                let interval = body
                    .get("interval")
                    .and_then(JsonValue::as_f64)
                    .filter(|i| *i > 0.0 && i.is_finite())
                    .ok_or_else(|| malformed("[histogram] interval must be > 0"))?;
                AggKind::Histogram {
                    field: field_of(body, kind_name)?.to_string(),
                    interval,
                }
            }
            "terms" => {
                let mut order = parse_sort_list(body.get("order"))?;
                if order.is_empty() {
                    order = vec![
                        SortSpec { key: SortKey::Count, descending: true },
                        SortSpec { key: SortKey::Key, descending: false },
                    ];
                }
                AggKind::Terms {
                    field: field_of(body, kind_name)?.to_string(),
                    size: usize_of(body, "size", 10)?,
                    order,
                }
            }
            "geotile_grid" => {
                let precision = usize_of(body, "precision", 7)?;
                let precision = u8::try_from(precision)
                    .ok()
                    .filter(|p| *p <= duoquery_value::geometry::MAX_GEOTILE_PRECISION)
                    .ok_or_else(|| malformed(format!("bad geotile precision [{}]", precision)))?;
                AggKind::GeoTile {
                    field: field_of(body, kind_name)?.to_string(),
                    precision,
                    size: usize_of(body, "size", 10_000)?,
                }
            }
            "bucket_sort" => AggKind::BucketSort {
                sort: parse_sort_list(body.get("sort"))?,
                from: usize_of(body, "from", 0)?,
                size: body.get("size").and_then(JsonValue::as_u64).map(|n| n as usize),
            },
            "min" => AggKind::Min(field_of(body, kind_name)?.to_string()),
            "max" => AggKind::Max(field_of(body, kind_name)?.to_string()),
            "avg" => AggKind::Avg(field_of(body, kind_name)?.to_string()),
            "sum" => AggKind::Sum(field_of(body, kind_name)?.to_string()),
            "cardinality" => AggKind::Cardinality(field_of(body, kind_name)?.to_string()),
            "geo_bounds" => AggKind::GeoBounds(field_of(body, kind_name)?.to_string()),
            "geo_centroid" => AggKind::GeoCentroid(field_of(body, kind_name)?.to_string()),
            other => return Err(malformed(format!("unknown aggregation type [{}]", other))),
        };
        nodes.push(AggNode {
            name: name.clone(),
            kind,
            subs,
        });
    }
    Ok(nodes)
}

struct BucketDraft<'a> {
    key: JsonValue,
    key_as_string: Option<String>,
    sort_key: Typed,
    docs: Vec<&'a StoredDocument>,
}

fn metric_value(result: &Map<String, JsonValue>, name: &str) -> Option<f64> {
    result.get(name)?.get("value")?.as_f64()
}

fn compare_buckets(
    sort: &[SortSpec],
    a: (&BucketDraft<'_>, &Map<String, JsonValue>),
    b: (&BucketDraft<'_>, &Map<String, JsonValue>),
) -> Ordering {
    for spec in sort {
        let ord = match &spec.key {
            SortKey::Key => a.0.sort_key.compare(&b.0.sort_key).unwrap_or(Ordering::Equal),
            SortKey::Count => a.0.docs.len().cmp(&b.0.docs.len()),
            SortKey::Metric(name) => {
                // 缺失的指标总是排在最后
                match (metric_value(a.1, name), metric_value(b.1, name)) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => {
                        return Ordering::Less;
                    }
                    (None, Some(_)) => {
                        return Ordering::Greater;
                    }
                    (None, None) => Ordering::Equal,
                }
            }
        };
        let ord = if spec.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn group<'a>(
    docs: &[&'a StoredDocument],
    key_of: impl Fn(&StoredDocument) -> StorageResult<Option<(Typed, JsonValue, Option<String>)>>,
) -> StorageResult<Vec<BucketDraft<'a>>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<BucketDraft<'a>> = Vec::new();
    for doc in docs {
        let Some((sort_key, key, key_as_string)) = key_of(doc)? else {
            continue;
        };
        let repr = sort_key.group_key();
        match index.get(&repr) {
            Some(&i) => buckets[i].docs.push(doc),
            None => {
                index.insert(repr, buckets.len());
                buckets.push(BucketDraft {
                    key,
                    key_as_string,
                    sort_key,
                    docs: vec![doc],
                });
            }
        }
    }
    Ok(buckets)
}

fn numeric_values(docs: &[&StoredDocument], field: &str) -> Vec<f64> {
    docs.iter()
        .filter_map(|d| d.fields.get(field).and_then(Typed::as_f64))
        .collect()
}

fn geometries<'a>(docs: &[&'a StoredDocument], field: &str) -> Vec<&'a Geometry<f64>> {
    docs.iter()
        .filter_map(|d| match d.fields.get(field) {
            Some(Typed::Geo(g)) => Some(g),
            _ => None,
        })
        .collect()
}

fn point_of<'a>(doc: &'a StoredDocument, field: &str, agg: &str) -> StorageResult<Option<&'a geo::Point<f64>>> {
    match doc.fields.get(field) {
        None => Ok(None),
        Some(Typed::Geo(Geometry::Point(p))) => Ok(Some(p)),
        Some(_) => Err(StorageError::Unsupported(format!(
            "[{}] requires point values in field [{}]",
            agg, field
        ))),
    }
}

/// # Brief
/// 对文档集合求值一组聚合
///
/// # Returns
/// `{聚合名: 结果}` 对象
pub fn evaluate_aggs(nodes: &[AggNode], docs: &[&StoredDocument]) -> StorageResult<Map<String, JsonValue>> {
    let mut out = Map::new();
    for node in nodes {
        if matches!(node.kind, AggKind::BucketSort { .. }) {
            continue;
        }
        out.insert(node.name.clone(), evaluate_node(node, docs)?);
    }
    Ok(out)
}

fn evaluate_node(node: &AggNode, docs: &[&StoredDocument]) -> StorageResult<JsonValue> {
    let (mut buckets, own_order, own_size) = match &node.kind {
        AggKind::DateHistogram { field, unit, value } => {
            let buckets = group(docs, |d| match d.fields.get(field) {
                Some(Typed::Date(ms)) => {
                    let start = chrono::DateTime::from_timestamp_millis(*ms)
                        .and_then(|ts| truncate(ts, *unit, *value))
                        .ok_or_else(|| StorageError::Internal(format!("date {} out of range", ms)))?;
                    let key = start.timestamp_millis();
                    Ok(Some((Typed::Date(key), json!(key), Some(format_datetime(&start)))))
                }
                _ => Ok(None),
            })?;
            (buckets, vec![SortSpec { key: SortKey::Key, descending: false }], None)
        }
        AggKind::Histogram { field, interval } => {
            let buckets = group(docs, |d| {
                Ok(d.fields.get(field).and_then(Typed::as_f64).map(|v| {
                    let key = (v / interval).floor() * interval;
                    (Typed::Double(key), json!(key), None)
                }))
            })?;
            (buckets, vec![SortSpec { key: SortKey::Key, descending: false }], None)
        }
        AggKind::Terms { field, size, order } => {
            let buckets = group(docs, |d| {
                Ok(d.fields.get(field).filter(|v| !matches!(v, Typed::Geo(_))).map(|v| {
                    let (key, key_as_string) = v.key_json();
                    (v.clone(), key, key_as_string)
                }))
            })?;
            (buckets, order.clone(), Some(*size))
        }
        AggKind::GeoTile { field, precision, size } => {
            let buckets = group(docs, |d| {
                Ok(point_of(d, field, "geotile_grid")?.map(|p| {
                    let key = GeoTile::from_point(p.x(), p.y(), *precision).key();
                    (Typed::Keyword(key.clone()), json!(key), None)
                }))
            })?;
            let order = vec![
                SortSpec { key: SortKey::Count, descending: true },
                SortSpec { key: SortKey::Key, descending: false },
            ];
            (buckets, order, Some(*size))
        }
        AggKind::Min(field) => {
            let v = numeric_values(docs, field).into_iter().reduce(f64::min);
            return Ok(json!({ "value": v }));
        }
        AggKind::Max(field) => {
            let v = numeric_values(docs, field).into_iter().reduce(f64::max);
            return Ok(json!({ "value": v }));
        }
        AggKind::Avg(field) => {
            let values = numeric_values(docs, field);
            let v = if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            };
            return Ok(json!({ "value": v }));
        }
        AggKind::Sum(field) => {
            let v: f64 = numeric_values(docs, field).iter().sum();
            return Ok(json!({ "value": v }));
        }
        AggKind::Cardinality(field) => {
            let distinct: HashSet<String> = docs
                .iter()
                .filter_map(|d| d.fields.get(field).map(Typed::group_key))
                .collect();
            return Ok(json!({ "value": distinct.len() }));
        }
        AggKind::GeoBounds(field) => {
            let boxes: Vec<[f64; 4]> = geometries(docs, field)
                .into_iter()
                .filter_map(bounding_box)
                .collect();
            if boxes.is_empty() {
                return Ok(json!({}));
            }
            let min_lon = boxes.iter().map(|b| b[0]).fold(f64::INFINITY, f64::min);
            let min_lat = boxes.iter().map(|b| b[1]).fold(f64::INFINITY, f64::min);
            let max_lon = boxes.iter().map(|b| b[2]).fold(f64::NEG_INFINITY, f64::max);
            let max_lat = boxes.iter().map(|b| b[3]).fold(f64::NEG_INFINITY, f64::max);
            return Ok(json!({
                "bounds": {
                    "top_left": { "lat": max_lat, "lon": min_lon },
                    "bottom_right": { "lat": min_lat, "lon": max_lon }
                }
            }));
        }
        AggKind::GeoCentroid(field) => {
            let mut points = Vec::new();
            for doc in docs {
                if let Some(p) = point_of(doc, field, "geo_centroid")? {
                    points.push(*p);
                }
            }
            if points.is_empty() {
                return Ok(json!({ "count": 0 }));
            }
            let n = points.len() as f64;
            let lon = points.iter().map(|p| p.x()).sum::<f64>() / n;
            let lat = points.iter().map(|p| p.y()).sum::<f64>() / n;
            return Ok(json!({
                "location": { "lat": lat, "lon": lon },
                "count": points.len()
            }));
        }
        AggKind::BucketSort { .. } => {
            return Err(malformed(format!(
                "[bucket_sort] {} must be nested under a multi-bucket aggregation",
                node.name
            )))
        }
    };

    // 按指标排序时必须先计算子聚合,否则先排序截断以减少计算量
    let needs_metrics = own_order.iter().any(|s| matches!(s.key, SortKey::Metric(_)));
    let empty = Map::new();
    if !needs_metrics {
        buckets.sort_by(|a, b| compare_buckets(&own_order, (a, &empty), (b, &empty)));
        if let Some(size) = own_size {
            buckets.truncate(size);
        }
    }
    let mut evaluated: Vec<(BucketDraft<'_>, Map<String, JsonValue>)> = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let subs = evaluate_aggs(&node.subs, &bucket.docs)?;
        evaluated.push((bucket, subs));
    }
    if needs_metrics {
        evaluated.sort_by(|a, b| compare_buckets(&own_order, (&a.0, &a.1), (&b.0, &b.1)));
        if let Some(size) = own_size {
            evaluated.truncate(size);
        }
    }

    if let Some(AggKind::BucketSort { sort, from, size }) = node
        .subs
        .iter()
        .map(|s| &s.kind)
        .find(|k| matches!(k, AggKind::BucketSort { .. }))
    {
        if !sort.is_empty() {
            evaluated.sort_by(|a, b| compare_buckets(sort, (&a.0, &a.1), (&b.0, &b.1)));
        }
        let end = size.map(|s| from + s).unwrap_or(evaluated.len());
        evaluated = evaluated
            .into_iter()
            .skip(*from)
            .take(end.saturating_sub(*from))
            .collect();
    }

    let out: Vec<JsonValue> = evaluated
        .into_iter()
        .map(|(bucket, subs)| {
            let mut obj = Map::new();
            obj.insert("key".to_string(), bucket.key);
            if let Some(s) = bucket.key_as_string {
                obj.insert("key_as_string".to_string(), JsonValue::String(s));
            }
            obj.insert("doc_count".to_string(), json!(bucket.docs.len()));
            obj.extend(subs);
            JsonValue::Object(obj)
        })
        .collect();
    Ok(json!({ "buckets": out }))
}
