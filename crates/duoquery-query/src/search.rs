//! 搜索引擎编译器模块
//!
//! 把 `Query` 编译为 Elasticsearch 兼容的请求体:
//! - 过滤器:外层 `bool.filter` 逐组 AND,每组是 `minimum_should_match: 1` 的 `bool.should`
//! - 叶子:`term` / `range` / `wildcard` / `geo_shape`,否定操作符包在 `bool.must_not` 中
//! - 聚合:每一级嵌套在上一级的 `aggs` 下,附带指标、外包框、中心点和 `bucket_sort` 子聚合
//! - 命中:`_source.includes`、`from`/`size`、按标识字段升序

use crate::aggregation::{Aggregation, AggregationKind, CollectFunction, Derived, OrderKey};
use crate::expression::{Expression, Operand};
use crate::operator::Operator;
use crate::request::Query;
use crate::resolver::CollectionReference;
use crate::{QueryError, QueryResult};
use duoquery_common::FieldType;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

/// 编译后的搜索请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchQuery {
    pub index: String,
    pub body: JsonValue,
}

/// 子聚合名后缀
pub const COLLECT_SUFFIX: &str = "_collect";
pub const BBOX_SUFFIX: &str = "_bbox";
pub const CENTROID_SUFFIX: &str = "_centroid";
pub const SORT_SUFFIX: &str = "_sort";

/// `geotile_grid.size` 的上限
pub const GEOTILE_MAX_SIZE: usize = 65_536;

/// 精度 `z` 下 `geotile_grid` 请求的单元数:不超过上限时取全部 4^z 个单元,
/// 按计数截断不会发生,之后由 `bucket_sort` 按键排序截断
pub fn geotile_request_size(precision: u8) -> usize {
    1usize
        .checked_shl(2 * u32::from(precision))
        .map_or(GEOTILE_MAX_SIZE, |cells| cells.min(GEOTILE_MAX_SIZE))
}

/// 搜索引擎编译器
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchCompiler;

impl SearchCompiler {
    pub fn new() -> Self {
        Self
    }

    /// # Brief
    /// 编译查询
    ///
    /// # Arguments
    /// * `query` - 已校验的查询
    /// * `collection` - 目标集合
    ///
    /// # Returns
    /// 搜索请求;未知字段返回 NotFound,存储特性不支持的操作返回 Backend
    pub fn compile(&self, query: &Query, collection: &CollectionReference) -> QueryResult<SearchQuery> {
        let filter = self.compile_filter(query, collection)?;
        let body = if query.count_only {
            json!({
                "query": filter,
                "size": 0,
                "track_total_hits": true,
            })
        } else if query.is_aggregation() {
            json!({
                "query": filter,
                "size": 0,
                "aggs": self.compile_level(&query.aggregations, collection)?,
            })
        } else {
            let id = collection.physical(collection.id_field())?;
            let includes = query
                .projection
                .iter()
                .map(|f| collection.physical(&f.name).map(str::to_string))
                .collect::<QueryResult<Vec<String>>>()?;
            json!({
                "query": filter,
                "from": query.offset,
                "size": query.size,
                "sort": [{ id: { "order": "asc" } }],
                "_source": { "includes": includes },
                "track_total_hits": true,
            })
        };
        debug!(
            "Compiled search request for {} ({} groups, {} levels)",
            collection.name(),
            query.filter.len(),
            query.aggregations.len()
        );
        Ok(SearchQuery {
            index: collection.target().to_string(),
            body,
        })
    }

    /// 过滤器编译为布尔查询;空过滤器为 `match_all`
    pub fn compile_filter(&self, query: &Query, collection: &CollectionReference) -> QueryResult<JsonValue> {
        if query.filter.is_empty() {
            return Ok(json!({ "match_all": {} }));
        }
        let mut clauses = Vec::with_capacity(query.filter.len());
        for group in &query.filter {
            let should = group
                .iter()
                .map(|e| self.compile_leaf(e, collection))
                .collect::<QueryResult<Vec<JsonValue>>>()?;
            clauses.push(json!({
                "bool": { "should": should, "minimum_should_match": 1 }
            }));
        }
        Ok(json!({ "bool": { "filter": clauses } }))
    }

    fn compile_leaf(&self, expr: &Expression, collection: &CollectionReference) -> QueryResult<JsonValue> {
        let field = collection.physical(expr.field())?;
        let leaf = match (expr.op(), expr.operand()) {
            (Operator::Eq | Operator::Ne, Operand::Scalar(v)) => json!({ "term": { field: v.to_json() } }),
            (op @ (Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le), Operand::Scalar(v)) => {
                let bound = match op {
                    Operator::Gt => "gt",
                    Operator::Ge => "gte",
                    Operator::Lt => "lt",
                    _ => "lte",
                };
                json!({ "range": { field: { bound: v.to_json() } } })
            }
            (Operator::Range, Operand::Range(r)) => {
                let mut bounds = Map::new();
                bounds.insert(
                    if r.min_inclusive { "gte" } else { "gt" }.to_string(),
                    r.min.to_json(),
                );
                bounds.insert(
                    if r.max_inclusive { "lte" } else { "lt" }.to_string(),
                    r.max.to_json(),
                );
                json!({ "range": { field: bounds } })
            }
            (Operator::Like, Operand::Like(p)) => json!({
                "wildcard": { field: { "value": p.to_wildcard(), "case_insensitive": true } }
            }),
            (Operator::Within | Operator::NotWithin, Operand::Area(area)) => json!({
                "geo_shape": { field: { "shape": area.to_shape_json(), "relation": "within" } }
            }),
            (op, _) => {
                return Err(QueryError::Validation(format!(
                    "operator {} has a mismatched operand on field {}",
                    op,
                    expr.field()
                )))
            }
        };
        if expr.op().matches_missing() {
            Ok(json!({ "bool": { "must_not": [leaf] } }))
        } else {
            Ok(leaf)
        }
    }

    /// 编译从 `levels[0]` 开始的聚合管道
    fn compile_level(&self, levels: &[Aggregation], collection: &CollectionReference) -> QueryResult<JsonValue> {
        let Some((agg, rest)) = levels.split_first() else {
            return Ok(json!({}));
        };
        let field = collection.physical(agg.kind.field())?;
        let primary = match agg.order.key {
            OrderKey::Key => "_key".to_string(),
            OrderKey::Count => "_count".to_string(),
            OrderKey::Metric => format!("{}{}", agg.name, COLLECT_SUFFIX),
        };
        let direction = agg.order.direction.as_str();

        let mut subs = Map::new();
        let body = match &agg.kind {
            AggregationKind::DateHistogram { interval, .. } => {
                let key = if interval.is_calendar() {
                    "calendar_interval"
                } else {
                    "fixed_interval"
                };
                json!({ "date_histogram": { "field": field, key: interval.to_string(), "min_doc_count": 1 } })
            }
            AggregationKind::Histogram { interval, .. } => {
                json!({ "histogram": { "field": field, "interval": interval, "min_doc_count": 1 } })
            }
            AggregationKind::Terms { .. } => {
                let mut order = vec![json!({ primary.as_str(): direction })];
                if agg.order.key != OrderKey::Key {
                    order.push(json!({ "_key": "asc" }));
                }
                json!({ "terms": {
                    "field": field,
                    "size": agg.size,
                    "shard_size": agg.size.saturating_mul(3) / 2 + 10,
                    "order": order,
                } })
            }
            AggregationKind::GeoGrid { field: logical, precision } => {
                collection.require_point(logical, agg.field_type, "geo_grid")?;
                let cells = geotile_request_size(*precision);
                json!({ "geotile_grid": {
                    "field": field,
                    "precision": precision,
                    "size": cells,
                    "shard_size": cells,
                } })
            }
        };

        if let Some(collect) = &agg.collect {
            let metric_field = collection.physical(&collect.field)?;
            let metric = match collect.function {
                CollectFunction::Cardinality => json!({
                    "cardinality": { "field": metric_field, "precision_threshold": 40000 }
                }),
                f => json!({ f.as_str(): { "field": metric_field } }),
            };
            subs.insert(format!("{}{}", agg.name, COLLECT_SUFFIX), metric);
        }
        if agg.wants(Derived::Bbox) {
            let geometry = collection
                .geometry_field()
                .ok_or_else(|| QueryError::Validation("bbox output needs a geometry field".to_string()))?;
            subs.insert(
                format!("{}{}", agg.name, BBOX_SUFFIX),
                json!({ "geo_bounds": { "field": collection.physical(geometry)? } }),
            );
        }
        if agg.wants(Derived::Centroid) {
            let (source, _) = collection
                .point_source()
                .ok_or_else(|| QueryError::Validation("centroid output needs a point source".to_string()))?;
            let ft = agg.point_type.unwrap_or(FieldType::GeoShape);
            collection.require_point(source, ft, "centroid")?;
            subs.insert(
                format!("{}{}", agg.name, CENTROID_SUFFIX),
                json!({ "geo_centroid": { "field": collection.physical(source)? } }),
            );
        }
        if !matches!(agg.kind, AggregationKind::Terms { .. }) {
            let mut sort = vec![json!({ primary.as_str(): { "order": direction } })];
            if agg.order.key != OrderKey::Key {
                sort.push(json!({ "_key": { "order": "asc" } }));
            }
            subs.insert(
                format!("{}{}", agg.name, SORT_SUFFIX),
                json!({ "bucket_sort": { "sort": sort, "size": agg.size } }),
            );
        }
        if let JsonValue::Object(nested) = self.compile_level(rest, collection)? {
            subs.extend(nested);
        }

        let mut node = body;
        if !subs.is_empty() {
            node["aggs"] = JsonValue::Object(subs);
        }
        Ok(json!({ agg.name.as_str(): node }))
    }
}
