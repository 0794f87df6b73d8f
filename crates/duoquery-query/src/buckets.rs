//! 分桶结果归一化模块
//!
//! 两种后端的分桶结果先归一化为同一棵 `Bucket` 树,再展开为行:
//! - 搜索引擎返回嵌套的聚合 JSON,逐级读取 `buckets` 数组
//! - 关系后端每级一个行集,按父级键路径挂接到上一级;
//!   父桶已被上一级截断的行直接丢弃
//!
//! 展开时每个叶子桶输出一行,没有子桶的父桶不输出。

use crate::aggregation::{Aggregation, AggregationKind, CollectFunction, Derived};
use crate::search::{BBOX_SUFFIX, CENTROID_SUFFIX, COLLECT_SUFFIX};
use crate::sql::{ColumnRole, SqlStatement};
use crate::{QueryError, QueryResult};
use chrono::{DateTime, Utc};
use duoquery_common::time::parse_datetime;
use duoquery_common::FieldType;
use duoquery_storage::relational::{SqlRow, SqlValue};
use duoquery_value::geometry::GeoTile;
use duoquery_value::{Document, Value};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// 归一化后的桶
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// 桶键;日期键保持为 `Value::DateTime`,展开时再按格式输出
    pub key: Value,
    pub doc_count: u64,
    pub metric: Option<Value>,
    /// `[minLon, minLat, maxLon, maxLat]`
    pub bbox: Option<[f64; 4]>,
    /// `[lon, lat]`
    pub centroid: Option<[f64; 2]>,
    pub children: Vec<Bucket>,
}

fn is_date_key(agg: &Aggregation) -> bool {
    matches!(agg.kind, AggregationKind::DateHistogram { .. }) || agg.key_type == FieldType::Date
}

fn bad_key(agg: &Aggregation, raw: impl std::fmt::Display) -> QueryError {
    QueryError::decode(format!("cannot decode key {} of aggregation {}", raw, agg.name))
}

fn date_from_millis(agg: &Aggregation, ms: i64) -> QueryResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| bad_key(agg, ms))
}

// ============================================================================
// 搜索引擎结果
// ============================================================================

fn key_from_json(agg: &Aggregation, raw: &JsonValue) -> QueryResult<Value> {
    if is_date_key(agg) {
        let dt = match raw {
            JsonValue::Number(n) => {
                let ms = n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| bad_key(agg, raw))?;
                date_from_millis(agg, ms)?
            }
            JsonValue::String(s) => parse_datetime(s).ok_or_else(|| bad_key(agg, raw))?,
            _ => return Err(bad_key(agg, raw)),
        };
        return Ok(Value::DateTime(dt));
    }
    match (&agg.kind, agg.key_type) {
        (AggregationKind::Histogram { .. }, _) | (_, FieldType::Float) => raw
            .as_f64()
            .map(Value::Float64)
            .ok_or_else(|| bad_key(agg, raw)),
        (AggregationKind::GeoGrid { .. }, _) | (_, FieldType::Keyword) => match raw {
            JsonValue::String(s) => Ok(Value::from(s.as_str())),
            JsonValue::Number(n) => Ok(Value::from(n.to_string())),
            _ => Err(bad_key(agg, raw)),
        },
        (_, FieldType::Integer) => raw.as_i64().map(Value::Int64).ok_or_else(|| bad_key(agg, raw)),
        (_, FieldType::Boolean) => match raw {
            JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
            JsonValue::Number(n) => Ok(Value::Boolean(n.as_i64() == Some(1))),
            _ => Err(bad_key(agg, raw)),
        },
        _ => Err(bad_key(agg, raw)),
    }
}

fn metric_from_f64(function: CollectFunction, value: f64) -> Value {
    match function {
        CollectFunction::Cardinality => Value::Int64(value.round() as i64),
        _ => Value::Float64(value),
    }
}

fn metric_from_json(function: CollectFunction, raw: Option<&JsonValue>) -> Option<Value> {
    raw.and_then(|m| m.get("value"))
        .and_then(JsonValue::as_f64)
        .map(|v| metric_from_f64(function, v))
}

fn bbox_from_json(raw: Option<&JsonValue>) -> Option<[f64; 4]> {
    let bounds = raw?.get("bounds")?;
    let top_left = bounds.get("top_left")?;
    let bottom_right = bounds.get("bottom_right")?;
    Some([
        top_left.get("lon")?.as_f64()?,
        bottom_right.get("lat")?.as_f64()?,
        bottom_right.get("lon")?.as_f64()?,
        top_left.get("lat")?.as_f64()?,
    ])
}

fn centroid_from_json(raw: Option<&JsonValue>) -> Option<[f64; 2]> {
    let location = raw?.get("location")?;
    Some([location.get("lon")?.as_f64()?, location.get("lat")?.as_f64()?])
}

/// # Brief
/// 从搜索响应的 `aggregations` 对象读取分桶树
///
/// # Arguments
/// * `levels` - 聚合管道
/// * `container` - 含有 `levels[0].name` 的对象(顶层 `aggregations` 或父桶)
pub fn from_search_response(levels: &[Aggregation], container: &JsonValue) -> QueryResult<Vec<Bucket>> {
    let Some((agg, rest)) = levels.split_first() else {
        return Ok(Vec::new());
    };
    let raw_buckets = container
        .get(&agg.name)
        .and_then(|a| a.get("buckets"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| QueryError::decode(format!("response has no buckets for aggregation {}", agg.name)))?;

    let mut buckets = Vec::with_capacity(raw_buckets.len());
    for raw in raw_buckets {
        let key = raw
            .get("key")
            .ok_or_else(|| QueryError::decode(format!("bucket without key in aggregation {}", agg.name)))
            .and_then(|k| key_from_json(agg, k))?;
        let doc_count = raw
            .get("doc_count")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| QueryError::decode(format!("bucket without doc_count in aggregation {}", agg.name)))?;
        let metric = agg.collect.as_ref().and_then(|c| {
            metric_from_json(c.function, raw.get(format!("{}{}", agg.name, COLLECT_SUFFIX).as_str()))
        });
        let bbox = if agg.wants(Derived::Bbox) {
            bbox_from_json(raw.get(format!("{}{}", agg.name, BBOX_SUFFIX).as_str()))
        } else {
            None
        };
        let centroid = if agg.wants(Derived::Centroid) {
            centroid_from_json(raw.get(format!("{}{}", agg.name, CENTROID_SUFFIX).as_str()))
        } else {
            None
        };
        buckets.push(Bucket {
            key,
            doc_count,
            metric,
            bbox,
            centroid,
            children: from_search_response(rest, raw)?,
        });
    }
    Ok(buckets)
}

// ============================================================================
// 关系结果
// ============================================================================

fn key_from_sql(agg: &Aggregation, raw: &SqlValue) -> QueryResult<Value> {
    let describe = || format!("{:?}", raw);
    if is_date_key(agg) {
        let dt = match raw {
            SqlValue::Text(s) => parse_datetime(s).ok_or_else(|| bad_key(agg, describe()))?,
            SqlValue::Integer(ms) => date_from_millis(agg, *ms)?,
            _ => return Err(bad_key(agg, describe())),
        };
        return Ok(Value::DateTime(dt));
    }
    match (&agg.kind, agg.key_type) {
        (AggregationKind::Histogram { .. }, _) | (_, FieldType::Float) => raw
            .as_f64()
            .map(Value::Float64)
            .ok_or_else(|| bad_key(agg, describe())),
        (AggregationKind::GeoGrid { .. }, _) | (_, FieldType::Keyword) => match raw {
            SqlValue::Text(s) => Ok(Value::from(s.as_str())),
            SqlValue::Integer(n) => Ok(Value::from(n.to_string())),
            _ => Err(bad_key(agg, describe())),
        },
        (_, FieldType::Integer) => raw.as_i64().map(Value::Int64).ok_or_else(|| bad_key(agg, describe())),
        (_, FieldType::Boolean) => match raw {
            SqlValue::Integer(n) => Ok(Value::Boolean(*n != 0)),
            SqlValue::Text(s) if s == "true" || s == "t" => Ok(Value::Boolean(true)),
            SqlValue::Text(s) if s == "false" || s == "f" => Ok(Value::Boolean(false)),
            _ => Err(bad_key(agg, describe())),
        },
        _ => Err(bad_key(agg, describe())),
    }
}

fn cell<'a>(row: &'a SqlRow, statement: &SqlStatement, role: &ColumnRole) -> QueryResult<&'a SqlValue> {
    statement
        .position(role)
        .and_then(|i| row.get(i))
        .ok_or_else(|| QueryError::decode(format!("row is missing column {:?}", role)))
}

fn optional_f64(row: &SqlRow, statement: &SqlStatement, role: ColumnRole) -> QueryResult<Option<f64>> {
    let value = cell(row, statement, &role)?;
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_f64()
        .map(Some)
        .ok_or_else(|| QueryError::decode(format!("column {:?} is not numeric", role)))
}

/// 单行解码为 (键路径, 桶)
fn bucket_from_row(
    levels: &[Aggregation],
    depth: usize,
    statement: &SqlStatement,
    row: &SqlRow,
) -> QueryResult<(Vec<String>, Bucket)> {
    let agg = &levels[depth];
    let mut path = Vec::with_capacity(depth + 1);
    let mut key = Value::Null;
    for (level, a) in levels[..=depth].iter().enumerate() {
        key = key_from_sql(a, cell(row, statement, &ColumnRole::Key(level))?)?;
        path.push(key.key_repr());
    }
    let doc_count = cell(row, statement, &ColumnRole::DocCount)?
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| QueryError::decode("doc_count is not a non-negative integer"))?;
    let metric = match &agg.collect {
        Some(c) => optional_f64(row, statement, ColumnRole::Metric)?.map(|v| metric_from_f64(c.function, v)),
        None => None,
    };
    let bbox = if agg.wants(Derived::Bbox) {
        let mut corners = [0.0; 4];
        let mut complete = true;
        for (i, corner) in corners.iter_mut().enumerate() {
            match optional_f64(row, statement, ColumnRole::Bbox(i))? {
                Some(v) => *corner = v,
                None => complete = false,
            }
        }
        complete.then_some(corners)
    } else {
        None
    };
    let centroid = if agg.wants(Derived::Centroid) {
        match (
            optional_f64(row, statement, ColumnRole::CentroidX)?,
            optional_f64(row, statement, ColumnRole::CentroidY)?,
        ) {
            (Some(x), Some(y)) => Some([x, y]),
            _ => None,
        }
    } else {
        None
    };
    Ok((
        path,
        Bucket {
            key,
            doc_count,
            metric,
            bbox,
            centroid,
            children: Vec::new(),
        },
    ))
}

/// # Brief
/// 把关系后端各级行集归并为分桶树
///
/// # Arguments
/// * `levels` - 聚合管道
/// * `statements` - 每级的语句(提供输出列描述)
/// * `rows` - 每级的行集,与 `statements` 一一对应
pub fn from_level_rows(
    levels: &[Aggregation],
    statements: &[SqlStatement],
    rows: Vec<Vec<SqlRow>>,
) -> QueryResult<Vec<Bucket>> {
    if statements.len() != levels.len() || rows.len() != levels.len() {
        return Err(QueryError::decode(format!(
            "expected {} level result sets, got {}",
            levels.len(),
            rows.len()
        )));
    }

    let mut per_level: Vec<Vec<(Vec<String>, Bucket)>> = Vec::with_capacity(levels.len());
    for (depth, (statement, level_rows)) in statements.iter().zip(rows).enumerate() {
        let decoded = level_rows
            .iter()
            .map(|row| bucket_from_row(levels, depth, statement, row))
            .collect::<QueryResult<Vec<_>>>()?;
        per_level.push(decoded);
    }

    for depth in (1..per_level.len()).rev() {
        let children = std::mem::take(&mut per_level[depth]);
        let parents = &mut per_level[depth - 1];
        let index: HashMap<Vec<String>, usize> = parents
            .iter()
            .enumerate()
            .map(|(i, (path, _))| (path.clone(), i))
            .collect();
        for (path, bucket) in children {
            if let Some(&i) = index.get(&path[..depth]) {
                parents[i].1.children.push(bucket);
            }
        }
    }

    Ok(per_level
        .into_iter()
        .next()
        .map(|roots| roots.into_iter().map(|(_, b)| b).collect())
        .unwrap_or_default())
}

// ============================================================================
// 展开
// ============================================================================

fn render_key(agg: &Aggregation, key: &Value) -> Value {
    match (key, &agg.format) {
        (Value::DateTime(dt), Some(format)) => Value::from(dt.format(format).to_string()),
        (Value::DateTime(dt), None) => Value::Int64(dt.timestamp_millis()),
        (other, _) => other.clone(),
    }
}

fn float_array(values: &[f64]) -> Value {
    Value::Array(values.iter().copied().map(Value::Float64).collect())
}

fn write_level(agg: &Aggregation, bucket: &Bucket, row: &mut Document) -> QueryResult<()> {
    row.insert(agg.name.as_str(), render_key(agg, &bucket.key));
    row.insert(format!("{}_count", agg.name), bucket.doc_count);
    if let (Some(name), Some(metric)) = (agg.metric_name(), &bucket.metric) {
        row.insert(name, metric.clone());
    }
    if let Some(bbox) = &bucket.bbox {
        row.insert(format!("{}_{}", agg.name, Derived::Bbox.suffix()), float_array(bbox));
    }
    if let Some(centroid) = &bucket.centroid {
        row.insert(format!("{}_{}", agg.name, Derived::Centroid.suffix()), float_array(centroid));
    }
    if agg.wants(Derived::Tile) || agg.wants(Derived::TileCenter) {
        let tile = bucket
            .key
            .as_str()
            .and_then(GeoTile::parse)
            .ok_or_else(|| QueryError::decode(format!("invalid tile key {}", bucket.key)))?;
        if agg.wants(Derived::Tile) {
            row.insert(format!("{}_{}", agg.name, Derived::Tile.suffix()), float_array(&tile.bounds()));
        }
        if agg.wants(Derived::TileCenter) {
            row.insert(
                format!("{}_{}", agg.name, Derived::TileCenter.suffix()),
                float_array(&tile.center()),
            );
        }
    }
    Ok(())
}

fn walk(
    levels: &[Aggregation],
    depth: usize,
    buckets: &[Bucket],
    prefix: &Document,
    out: &mut Vec<Document>,
) -> QueryResult<()> {
    for bucket in buckets {
        let mut row = prefix.clone();
        write_level(&levels[depth], bucket, &mut row)?;
        if depth + 1 == levels.len() {
            out.push(row);
        } else {
            walk(levels, depth + 1, &bucket.children, &row, out)?;
        }
    }
    Ok(())
}

/// # Brief
/// 分桶树展开为行,每个叶子桶一行
pub fn flatten(levels: &[Aggregation], buckets: &[Bucket]) -> QueryResult<Vec<Document>> {
    let mut rows = Vec::new();
    if !levels.is_empty() {
        walk(levels, 0, buckets, &Document::new(), &mut rows)?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationSpec;
    use crate::resolver::{CollectionDefinition, CollectionReference, FieldTypeCache};
    use crate::sql::{OutputColumn, SqlFragments, StatementKind};
    use duoquery_common::CompilerConfig;
    use serde_json::json;

    fn aggregations(specs: serde_json::Value) -> Vec<Aggregation> {
        let def: CollectionDefinition = serde_json::from_value(json!({
            "name": "sales",
            "backend": "document",
            "target": "sales",
            "id_field": "id",
            "geometry_field": "loc",
            "timestamp_field": "at",
            "fields": {"id": null, "loc": null, "at": null, "price": null, "shop": null, "open": null}
        }))
        .unwrap();
        let collection = CollectionReference::new(def);
        let cache = FieldTypeCache::new();
        for (f, t) in [
            ("id", FieldType::Keyword),
            ("loc", FieldType::GeoPoint),
            ("at", FieldType::Date),
            ("price", FieldType::Float),
            ("shop", FieldType::Keyword),
            ("open", FieldType::Boolean),
        ] {
            cache.register("sales", f, t);
        }
        let specs: Vec<AggregationSpec> = serde_json::from_value(specs).unwrap();
        specs
            .iter()
            .map(|s| Aggregation::build(s, &collection, &cache, &CompilerConfig::default()).unwrap())
            .collect()
    }

    fn statement(depth: usize, roles: Vec<ColumnRole>) -> SqlStatement {
        SqlStatement {
            kind: StatementKind::Level { depth },
            sql: String::new(),
            fragments: SqlFragments::default(),
            params: Vec::new(),
            columns: roles
                .into_iter()
                .map(|role| OutputColumn { name: String::new(), role })
                .collect(),
        }
    }

    #[test]
    fn test_search_response_normalization() {
        let levels = aggregations(json!([
            {"kind": "date_histogram", "interval": "1M", "name": "month", "format": "%Y-%m"},
            {"kind": "terms", "field": "open", "collect": {"function": "cardinality", "field": "shop"},
             "derived": ["bbox", "centroid"]}
        ]));
        let response = json!({
            "month": {"buckets": [{
                "key": 1704067200000i64, "key_as_string": "2024-01-01T00:00:00.000Z", "doc_count": 3,
                "open": {"buckets": [{
                    "key": 1, "key_as_string": "true", "doc_count": 2,
                    "open_collect": {"value": 2.0},
                    "open_bbox": {"bounds": {"top_left": {"lat": 4.0, "lon": 1.0},
                                             "bottom_right": {"lat": 2.0, "lon": 3.0}}},
                    "open_centroid": {"location": {"lat": 3.0, "lon": 2.0}, "count": 2}
                }]}
            }]}
        });
        let buckets = from_search_response(&levels, &response).unwrap();
        assert_eq!(buckets[0].children[0].key, Value::Boolean(true));
        let rows = flatten(&levels, &buckets).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("month"), Some(&Value::from("2024-01")));
        assert_eq!(row.get("month_count"), Some(&Value::Int64(3)));
        assert_eq!(row.get("open_cardinality"), Some(&Value::Int64(2)));
        assert_eq!(
            row.get("open_bbox"),
            Some(&Value::Array(vec![
                Value::Float64(1.0),
                Value::Float64(2.0),
                Value::Float64(3.0),
                Value::Float64(4.0)
            ]))
        );
        assert_eq!(
            row.get("open_centroid"),
            Some(&Value::Array(vec![Value::Float64(2.0), Value::Float64(3.0)]))
        );
    }

    #[test]
    fn test_missing_metric_omitted_and_bad_key_is_decode_error() {
        let levels = aggregations(json!([
            {"kind": "terms", "field": "shop", "collect": {"function": "avg", "field": "price"}}
        ]));
        let response = json!({"shop": {"buckets": [
            {"key": "a", "doc_count": 1, "shop_collect": {"value": null}}
        ]}});
        let rows = flatten(&levels, &from_search_response(&levels, &response).unwrap()).unwrap();
        assert!(rows[0].get("shop_avg").is_none());

        let levels = aggregations(json!([{"kind": "date_histogram", "interval": "1d"}]));
        let response = json!({"at": {"buckets": [{"key": true, "doc_count": 1}]}});
        match from_search_response(&levels, &response) {
            Err(QueryError::Backend(failure)) => assert_eq!(failure.status, 502),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_level_rows_recombination_drops_cut_parents() {
        let levels = aggregations(json!([
            {"kind": "terms", "field": "shop", "size": 2},
            {"kind": "histogram", "field": "price", "interval": 10}
        ]));
        let first = statement(0, vec![ColumnRole::Key(0), ColumnRole::DocCount]);
        let second = statement(
            1,
            vec![ColumnRole::Key(0), ColumnRole::Key(1), ColumnRole::DocCount, ColumnRole::Rank],
        );
        let text = |s: &str| SqlValue::Text(s.to_string());
        let rows = vec![
            vec![
                vec![text("b"), SqlValue::Integer(3)],
                vec![text("a"), SqlValue::Integer(2)],
            ],
            vec![
                vec![text("a"), SqlValue::Float(0.0), SqlValue::Integer(2), SqlValue::Integer(1)],
                vec![text("b"), SqlValue::Float(10.0), SqlValue::Integer(2), SqlValue::Integer(1)],
                vec![text("b"), SqlValue::Integer(20), SqlValue::Integer(1), SqlValue::Integer(2)],
                vec![text("c"), SqlValue::Float(0.0), SqlValue::Integer(1), SqlValue::Integer(1)],
            ],
        ];
        let buckets = from_level_rows(&levels, &[first, second], rows).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].key, Value::from("b"));
        assert_eq!(buckets[0].children.len(), 2);
        assert_eq!(buckets[0].children[1].key, Value::Float64(20.0));
        let rows = flatten(&levels, &buckets).unwrap();
        let summary: Vec<(String, f64)> = rows
            .iter()
            .map(|r| {
                (
                    r.get("shop").and_then(Value::as_str).unwrap().to_string(),
                    r.get("price").and_then(Value::as_f64).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![("b".to_string(), 10.0), ("b".to_string(), 20.0), ("a".to_string(), 0.0)]
        );
    }

    #[test]
    fn test_parent_without_children_emits_no_row_and_tiles() {
        let levels = aggregations(json!([
            {"kind": "geo_grid", "precision": 1, "name": "cell", "derived": ["tile", "tile_center"]},
            {"kind": "terms", "field": "shop"}
        ]));
        let response = json!({"cell": {"buckets": [
            {"key": "1/1/0", "doc_count": 1, "shop": {"buckets": [{"key": "x", "doc_count": 1}]}},
            {"key": "1/0/0", "doc_count": 1, "shop": {"buckets": []}}
        ]}});
        let rows = flatten(&levels, &from_search_response(&levels, &response).unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        let tile = GeoTile::parse("1/1/0").unwrap();
        assert_eq!(rows[0].get("cell_tile"), Some(&float_array(&tile.bounds())));
        assert_eq!(rows[0].get("cell_tile_center"), Some(&float_array(&tile.center())));
    }
}
