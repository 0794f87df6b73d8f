//! 查询请求模块
//!
//! `QueryRequest` 是调用方提交的原始请求(serde),
//! `Query::build` 在接触任何后端之前完成全部校验,得到不可变的 `Query`。

use crate::aggregation::{Aggregation, AggregationSpec};
use crate::expression::Expression;
use crate::filter::{Filter, Group};
use crate::operator::Operator;
use crate::resolver::{CollectionReference, FieldTypeLookup};
use crate::{QueryError, QueryResult};
use duoquery_common::{CompilerConfig, FieldType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// 请求中的单个表达式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionSpec {
    pub field: String,
    pub op: Operator,
    /// 字符串、数字或布尔值,统一按字符串解析
    pub value: JsonValue,
}

impl ExpressionSpec {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    fn raw_value(&self) -> QueryResult<String> {
        match &self.value {
            JsonValue::String(s) => Ok(s.clone()),
            JsonValue::Number(n) => Ok(n.to_string()),
            JsonValue::Bool(b) => Ok(b.to_string()),
            other => Err(QueryError::Validation(format!(
                "value for field {} must be a string, number or boolean, got {}",
                self.field, other
            ))),
        }
    }
}

/// 查询请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection: String,
    /// 组之间 AND,组内 OR
    #[serde(default)]
    pub filter: Vec<Vec<ExpressionSpec>>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,
    /// 要返回的逻辑字段;为空时返回全部已声明字段
    #[serde(default)]
    pub projection: Vec<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub count_only: bool,
}

impl QueryRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Vec::new(),
            aggregations: Vec::new(),
            projection: Vec::new(),
            offset: 0,
            size: None,
            count_only: false,
        }
    }

    /// 追加一个过滤组
    pub fn group(mut self, expressions: Vec<ExpressionSpec>) -> Self {
        self.filter.push(expressions);
        self
    }

    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.aggregations.push(spec);
        self
    }
}

/// 投影字段
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedField {
    pub name: String,
    pub field_type: FieldType,
}

/// 已校验的查询
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filter: Filter,
    pub aggregations: Vec<Aggregation>,
    /// 标识字段总在第一位
    pub projection: Vec<ProjectedField>,
    pub offset: usize,
    pub size: usize,
    pub count_only: bool,
}

impl Query {
    /// # Brief
    /// 校验请求并构造查询
    ///
    /// # Arguments
    /// * `request` - 原始请求
    /// * `collection` - 已解析的集合
    /// * `lookup` - 字段类型查询
    /// * `config` - 编译器配置
    ///
    /// # Returns
    /// 语法、类型或区间违规返回 Validation;未知字段返回 NotFound
    pub fn build(
        request: &QueryRequest,
        collection: &CollectionReference,
        lookup: &dyn FieldTypeLookup,
        config: &CompilerConfig,
    ) -> QueryResult<Self> {
        let mut groups = Vec::with_capacity(request.filter.len());
        for specs in &request.filter {
            let mut expressions = Vec::with_capacity(specs.len());
            for spec in specs {
                collection.physical(&spec.field)?;
                let field_type = lookup.field_type(collection, &spec.field)?;
                let raw = spec.raw_value()?;
                expressions.push(Expression::new(spec.field.clone(), spec.op, &raw, field_type)?);
            }
            groups.push(Group::new(expressions)?);
        }
        let filter = Filter::new(groups);

        let mut aggregations: Vec<Aggregation> = Vec::with_capacity(request.aggregations.len());
        let mut claimed: HashMap<String, String> = HashMap::new();
        for spec in &request.aggregations {
            let agg = Aggregation::build(spec, collection, lookup, config)?;
            collection.physical(agg.kind.field())?;
            if aggregations.iter().any(|a| a.name == agg.name) {
                return Err(QueryError::Validation(format!(
                    "duplicate aggregation name {}",
                    agg.name
                )));
            }
            for name in agg.claimed_names() {
                if let Some(owner) = claimed.insert(name.clone(), agg.name.clone()) {
                    return Err(QueryError::Validation(format!(
                        "aggregation name {} collides with {} of aggregation {}",
                        agg.name, name, owner
                    )));
                }
            }
            aggregations.push(agg);
        }

        if request.count_only && !aggregations.is_empty() {
            return Err(QueryError::Validation(
                "count_only cannot be combined with aggregations".to_string(),
            ));
        }

        let size = request.size.unwrap_or(config.default_page_size);
        if size > config.max_page_size {
            return Err(QueryError::Validation(format!(
                "size must be at most {}, got {}",
                config.max_page_size, size
            )));
        }

        let projection = Self::projection(request, collection, lookup)?;

        debug!(
            "Built query on {}: {} groups, {} aggregation levels",
            collection.name(),
            filter.len(),
            aggregations.len()
        );
        Ok(Self {
            collection: collection.name().to_string(),
            filter,
            aggregations,
            projection,
            offset: request.offset,
            size,
            count_only: request.count_only,
        })
    }

    /// (includes 或全部声明字段) − excludes,标识字段总是包含
    fn projection(
        request: &QueryRequest,
        collection: &CollectionReference,
        lookup: &dyn FieldTypeLookup,
    ) -> QueryResult<Vec<ProjectedField>> {
        let id = collection.id_field();
        let requested: Vec<&str> = if request.projection.is_empty() {
            collection.declared_fields().collect()
        } else {
            request.projection.iter().map(String::as_str).collect()
        };
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(requested.len() + 1);
        for name in std::iter::once(id).chain(requested) {
            if !seen.insert(name) {
                continue;
            }
            collection.physical(name)?;
            if name != id && collection.is_excluded(name) {
                continue;
            }
            fields.push(ProjectedField {
                name: name.to_string(),
                field_type: lookup.field_type(collection, name)?,
            });
        }
        Ok(fields)
    }

    /// 是否为分桶查询
    pub fn is_aggregation(&self) -> bool {
        !self.aggregations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{CollectionDefinition, FieldTypeCache};
    use serde_json::json;

    fn fixture() -> (CollectionReference, FieldTypeCache) {
        let def: CollectionDefinition = serde_json::from_value(json!({
            "name": "staff",
            "backend": "relational",
            "target": "staff",
            "id_field": "id",
            "fields": {"id": null, "job": null, "startdate": null, "secret": null},
            "exclude_fields": ["secret"]
        }))
        .unwrap();
        let cache = FieldTypeCache::new();
        cache.register("staff", "id", FieldType::Keyword);
        cache.register("staff", "job", FieldType::Keyword);
        cache.register("staff", "startdate", FieldType::Integer);
        cache.register("staff", "secret", FieldType::Keyword);
        (CollectionReference::new(def), cache)
    }

    fn build(request: serde_json::Value) -> QueryResult<Query> {
        let (collection, cache) = fixture();
        let request: QueryRequest = serde_json::from_value(request).unwrap();
        Query::build(&request, &collection, &cache, &CompilerConfig::default())
    }

    #[test]
    fn test_build_filter_and_projection() {
        let query = build(json!({
            "collection": "staff",
            "filter": [
                [{"field": "job", "op": "like", "value": "Architect"}],
                [{"field": "startdate", "op": "range", "value": "[1009799<1009801]"}]
            ]
        }))
        .unwrap();
        assert_eq!(query.filter.len(), 2);
        let names: Vec<&str> = query.projection.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "job", "startdate"]);
        assert_eq!(query.size, 100);
    }

    #[test]
    fn test_numeric_and_boolean_values_accepted() {
        let query = build(json!({
            "collection": "staff",
            "filter": [[{"field": "startdate", "op": ">=", "value": 5}]]
        }))
        .unwrap();
        assert_eq!(query.filter.expressions().count(), 1);
        assert!(build(json!({
            "collection": "staff",
            "filter": [[{"field": "startdate", "op": ">=", "value": [5]}]]
        }))
        .is_err());
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            build(json!({"collection": "staff", "filter": [[]]})),
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            build(json!({"collection": "staff", "filter": [[{"field": "nope", "op": "=", "value": "x"}]]})),
            Err(QueryError::NotFound(_))
        ));
        assert!(matches!(
            build(json!({"collection": "staff", "filter": [[{"field": "startdate", "op": "like", "value": "1"}]]})),
            Err(QueryError::Validation(_))
        ));
        assert!(build(json!({
            "collection": "staff", "count_only": true,
            "aggregations": [{"kind": "terms", "field": "job"}]
        }))
        .is_err());
        assert!(build(json!({
            "collection": "staff",
            "aggregations": [{"kind": "terms", "field": "job"}, {"kind": "terms", "field": "job"}]
        }))
        .is_err());
        assert!(build(json!({"collection": "staff", "size": 10001})).is_err());
    }

    #[test]
    fn test_level_name_collisions() {
        for reserved in ["job_collect", "job_sort", "job_bbox", "job_centroid", "job_count", "job_tile"] {
            let result = build(json!({
                "collection": "staff",
                "aggregations": [
                    {"kind": "terms", "field": "job"},
                    {"kind": "histogram", "field": "startdate", "interval": 10, "name": reserved}
                ]
            }));
            assert!(matches!(result, Err(QueryError::Validation(_))), "{}", reserved);
        }
        let metric = build(json!({
            "collection": "staff",
            "aggregations": [
                {"kind": "histogram", "field": "startdate", "interval": 10, "name": "start",
                 "collect": {"function": "max", "field": "startdate"}},
                {"kind": "terms", "field": "job", "name": "start_max"}
            ]
        }));
        assert!(matches!(metric, Err(QueryError::Validation(_))));

        let query = build(json!({
            "collection": "staff",
            "aggregations": [
                {"kind": "terms", "field": "job"},
                {"kind": "histogram", "field": "startdate", "interval": 10, "name": "job_start"}
            ]
        }))
        .unwrap();
        assert_eq!(query.aggregations.len(), 2);
    }

    #[test]
    fn test_explicit_projection_keeps_id_and_drops_excludes() {
        let query = build(json!({
            "collection": "staff",
            "projection": ["job", "secret"]
        }))
        .unwrap();
        let names: Vec<&str> = query.projection.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "job"]);
        assert!(matches!(
            build(json!({"collection": "staff", "projection": ["ghost"]})),
            Err(QueryError::NotFound(_))
        ));
    }
}
