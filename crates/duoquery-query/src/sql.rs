//! 关系编译器模块
//!
//! 把 `Query` 编译为参数化 SQL,支持 SQLite 与 PostgreSQL 两种方言:
//! - 标识符逐段校验后统一加双引号,值一律走绑定参数
//! - 命中查询按标识字段升序分页,计数查询只返回一行
//! - 分桶查询每一级一条语句:第一级 `GROUP BY ... ORDER BY ... LIMIT`,
//!   更深的层级用 `ROW_NUMBER() OVER (PARTITION BY 父级键 ...)` 在每个父桶内截断
//!
//! 每条语句都带输出列描述,解码时按位置取值,不依赖驱动返回的列名。

use crate::aggregation::{Aggregation, AggregationKind, CollectFunction, Derived, OrderKey};
use crate::expression::{Expression, Operand};
use crate::filter::Filter;
use crate::operator::Operator;
use crate::request::Query;
use crate::resolver::CollectionReference;
use crate::{QueryError, QueryResult};
use duoquery_common::{FieldType, SqlDialect};
use duoquery_storage::relational::{BoundStatement, SqlParam};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

// ============================================================================
// 标识符与参数
// ============================================================================

const SEGMENT_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

static SEGMENT: OnceLock<Regex> = OnceLock::new();

fn segment_regex() -> QueryResult<&'static Regex> {
    if let Some(re) = SEGMENT.get() {
        return Ok(re);
    }
    let re = Regex::new(SEGMENT_PATTERN)
        .map_err(|e| QueryError::Validation(format!("identifier pattern: {}", e)))?;
    Ok(SEGMENT.get_or_init(|| re))
}

/// 已校验并加引号的 SQL 标识符
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    /// # Brief
    /// 校验点分路径并逐段加双引号
    ///
    /// # Returns
    /// 任一段不满足 `[A-Za-z_][A-Za-z0-9_]*`(最长 63)时返回 Validation
    pub fn parse(path: &str) -> QueryResult<Self> {
        let re = segment_regex()?;
        let mut quoted = Vec::new();
        for segment in path.split('.') {
            if !re.is_match(segment) {
                return Err(QueryError::Validation(format!(
                    "invalid SQL identifier {:?}",
                    path
                )));
            }
            quoted.push(format!("\"{}\"", segment));
        }
        Ok(Self(quoted.join(".")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 参数收集器,按绑定顺序生成编号占位符
struct Bindings {
    dialect: SqlDialect,
    params: Vec<SqlParam>,
}

impl Bindings {
    fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        let n = self.params.len();
        match self.dialect {
            SqlDialect::Sqlite => format!("?{}", n),
            SqlDialect::Postgres => format!("${}", n),
        }
    }
}

// ============================================================================
// 语句
// ============================================================================

/// 输出列的含义
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", content = "of", rename_all = "snake_case")]
pub enum ColumnRole {
    /// 命中行中的逻辑字段
    Field(String),
    /// 计数查询的总数
    Count,
    /// 第 n 级(从 0 开始)的桶键
    Key(usize),
    DocCount,
    Metric,
    /// 外包框分量,下标依次为 minLon、minLat、maxLon、maxLat
    Bbox(usize),
    CentroidX,
    CentroidY,
    /// 父桶内的名次
    Rank,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputColumn {
    pub name: String,
    pub role: ColumnRole,
}

impl OutputColumn {
    fn new(name: impl Into<String>, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

/// 语句种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatementKind {
    Hits,
    Count,
    /// 第 depth 级分桶(从 0 开始)
    Level { depth: usize },
}

/// 语句的各个子句,不含关键字
///
/// 分桶的更深层级中 `order_by` 是窗口函数内的排序,`limit` 是父桶内名次的上限。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SqlFragments {
    pub select: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

impl SqlFragments {
    /// 拼成单条 SELECT
    pub fn render(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.select, self.from);
        for (keyword, fragment) in [
            ("WHERE", &self.where_clause),
            ("GROUP BY", &self.group_by),
            ("ORDER BY", &self.order_by),
            ("LIMIT", &self.limit),
            ("OFFSET", &self.offset),
        ] {
            if let Some(fragment) = fragment {
                sql.push(' ');
                sql.push_str(keyword);
                sql.push(' ');
                sql.push_str(fragment);
            }
        }
        sql
    }
}

/// 单条已绑定语句
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub fragments: SqlFragments,
    pub params: Vec<SqlParam>,
    pub columns: Vec<OutputColumn>,
}

impl SqlStatement {
    pub fn bound(&self) -> BoundStatement {
        BoundStatement::new(self.sql.clone(), self.params.clone())
    }

    /// 具有给定角色的列位置
    pub fn position(&self, role: &ColumnRole) -> Option<usize> {
        self.columns.iter().position(|c| &c.role == role)
    }
}

/// 编译后的关系查询
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    pub dialect: SqlDialect,
    pub statements: Vec<SqlStatement>,
}

// ============================================================================
// 编译器
// ============================================================================

fn key_alias(level: usize) -> String {
    format!("\"k{}\"", level + 1)
}

/// 关系编译器
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    dialect: SqlDialect,
}

impl SqlCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// # Brief
    /// 编译查询
    ///
    /// # Arguments
    /// * `query` - 已校验的查询
    /// * `collection` - 目标集合
    ///
    /// # Returns
    /// 命中与计数查询各一条语句;分桶查询每级一条语句
    pub fn compile(&self, query: &Query, collection: &CollectionReference) -> QueryResult<SqlQuery> {
        let statements = if query.count_only {
            vec![self.count_statement(query, collection)?]
        } else if query.is_aggregation() {
            (0..query.aggregations.len())
                .map(|depth| self.level_statement(query, collection, depth))
                .collect::<QueryResult<Vec<_>>>()?
        } else {
            vec![self.hits_statement(query, collection)?]
        };
        debug!(
            "Compiled {} SQL statement(s) for {} ({:?})",
            statements.len(),
            collection.name(),
            self.dialect
        );
        Ok(SqlQuery {
            dialect: self.dialect,
            statements,
        })
    }

    fn column(&self, collection: &CollectionReference, field: &str) -> QueryResult<Ident> {
        Ident::parse(collection.physical(field)?)
    }

    /// 过滤器渲染为 `(a OR b) AND (c)`;空过滤器返回 None
    fn render_filter(
        &self,
        filter: &Filter,
        collection: &CollectionReference,
        bindings: &mut Bindings,
    ) -> QueryResult<Option<String>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let mut groups = Vec::with_capacity(filter.len());
        for group in filter {
            let alternatives = group
                .iter()
                .map(|e| self.render_predicate(e, collection, bindings))
                .collect::<QueryResult<Vec<String>>>()?;
            groups.push(format!("({})", alternatives.join(" OR ")));
        }
        Ok(Some(groups.join(" AND ")))
    }

    fn render_predicate(
        &self,
        expr: &Expression,
        collection: &CollectionReference,
        bindings: &mut Bindings,
    ) -> QueryResult<String> {
        let c = self.column(collection, expr.field())?;
        let sql = match (expr.op(), expr.operand()) {
            (Operator::Eq, Operand::Scalar(v)) => format!("{} = {}", c, bindings.bind(v.to_param())),
            (Operator::Ne, Operand::Scalar(v)) => {
                format!("({} IS NULL OR {} <> {})", c, c, bindings.bind(v.to_param()))
            }
            (Operator::Gt, Operand::Scalar(v)) => format!("{} > {}", c, bindings.bind(v.to_param())),
            (Operator::Ge, Operand::Scalar(v)) => format!("{} >= {}", c, bindings.bind(v.to_param())),
            (Operator::Lt, Operand::Scalar(v)) => format!("{} < {}", c, bindings.bind(v.to_param())),
            (Operator::Le, Operand::Scalar(v)) => format!("{} <= {}", c, bindings.bind(v.to_param())),
            (Operator::Range, Operand::Range(r)) => {
                let low = if r.min_inclusive { ">=" } else { ">" };
                let high = if r.max_inclusive { "<=" } else { "<" };
                let min = bindings.bind(r.min.to_param());
                let max = bindings.bind(r.max.to_param());
                format!("({} {} {} AND {} {} {})", c, low, min, c, high, max)
            }
            (Operator::Like, Operand::Like(p)) => {
                let keyword = match self.dialect {
                    SqlDialect::Sqlite => "LIKE",
                    SqlDialect::Postgres => "ILIKE",
                };
                let pattern = bindings.bind(SqlParam::Text(p.to_sql_like()));
                format!("{} {} {} ESCAPE '\\'", c, keyword, pattern)
            }
            (Operator::Within, Operand::Area(area)) => {
                let shape = bindings.bind(SqlParam::Text(area.to_geojson_text()));
                format!("ST_Within({}, ST_GeomFromGeoJSON({}))", c, shape)
            }
            (Operator::NotWithin, Operand::Area(area)) => {
                let shape = bindings.bind(SqlParam::Text(area.to_geojson_text()));
                format!(
                    "({} IS NULL OR NOT ST_Within({}, ST_GeomFromGeoJSON({})))",
                    c, c, shape
                )
            }
            (op, _) => {
                return Err(QueryError::Validation(format!(
                    "operator {} has a mismatched operand on field {}",
                    op,
                    expr.field()
                )))
            }
        };
        Ok(sql)
    }

    fn select_column(&self, column: &Ident, field_type: FieldType, position: usize) -> String {
        match (self.dialect, field_type.is_geo()) {
            (SqlDialect::Postgres, true) => format!("ST_AsGeoJSON({}) AS \"f{}\"", column, position),
            _ => column.to_string(),
        }
    }

    fn hits_statement(&self, query: &Query, collection: &CollectionReference) -> QueryResult<SqlStatement> {
        let mut bindings = Bindings::new(self.dialect);
        let table = Ident::parse(collection.target())?;
        let id = self.column(collection, collection.id_field())?;

        let mut select = Vec::with_capacity(query.projection.len());
        let mut columns = Vec::with_capacity(query.projection.len());
        for (position, field) in query.projection.iter().enumerate() {
            let column = self.column(collection, &field.name)?;
            select.push(self.select_column(&column, field.field_type, position));
            columns.push(OutputColumn::new(
                field.name.clone(),
                ColumnRole::Field(field.name.clone()),
            ));
        }

        let where_clause = self.render_filter(&query.filter, collection, &mut bindings)?;
        let fragments = SqlFragments {
            select: select.join(", "),
            from: table.to_string(),
            where_clause,
            group_by: None,
            order_by: Some(format!("{} ASC", id)),
            limit: Some(bindings.bind(SqlParam::Integer(query.size as i64))),
            offset: Some(bindings.bind(SqlParam::Integer(query.offset as i64))),
        };
        Ok(SqlStatement {
            kind: StatementKind::Hits,
            sql: fragments.render(),
            fragments,
            params: bindings.params,
            columns,
        })
    }

    fn count_statement(&self, query: &Query, collection: &CollectionReference) -> QueryResult<SqlStatement> {
        let mut bindings = Bindings::new(self.dialect);
        let table = Ident::parse(collection.target())?;
        let fragments = SqlFragments {
            select: "COUNT(*) AS \"count\"".to_string(),
            from: table.to_string(),
            where_clause: self.render_filter(&query.filter, collection, &mut bindings)?,
            ..SqlFragments::default()
        };
        Ok(SqlStatement {
            kind: StatementKind::Count,
            sql: fragments.render(),
            fragments,
            params: bindings.params,
            columns: vec![OutputColumn::new("count", ColumnRole::Count)],
        })
    }

    /// 桶键表达式
    fn key_expr(&self, agg: &Aggregation, column: &Ident, bindings: &mut Bindings) -> String {
        match (&agg.kind, self.dialect) {
            (AggregationKind::DateHistogram { interval, .. }, SqlDialect::Sqlite) => {
                let unit = bindings.bind(SqlParam::Text(interval.unit().as_str().to_string()));
                let value = bindings.bind(SqlParam::Integer(i64::from(interval.value())));
                format!("time_bucket({}, {}, {})", unit, value, column)
            }
            (AggregationKind::DateHistogram { interval, .. }, SqlDialect::Postgres) => {
                match interval.fixed_seconds() {
                    Some(seconds) => {
                        let width = bindings.bind(SqlParam::Float(seconds as f64));
                        format!(
                            "to_timestamp(floor(extract(epoch from {}) / {}) * {})",
                            column, width, width
                        )
                    }
                    None => {
                        let unit = bindings.bind(SqlParam::Text(interval.unit().as_str().to_string()));
                        format!("date_trunc({}, {})", unit, column)
                    }
                }
            }
            (AggregationKind::Histogram { interval, .. }, _) => {
                let width = bindings.bind(SqlParam::Float(*interval));
                format!("floor({} / {}) * {}", column, width, width)
            }
            (AggregationKind::Terms { .. }, _) => column.to_string(),
            (AggregationKind::GeoGrid { precision, .. }, SqlDialect::Sqlite) => {
                let z = bindings.bind(SqlParam::Integer(i64::from(*precision)));
                format!("geotile_key({}, {})", z, column)
            }
            (AggregationKind::GeoGrid { precision, .. }, SqlDialect::Postgres) => {
                let z = bindings.bind(SqlParam::Text(precision.to_string()));
                let n = bindings.bind(SqlParam::Float(f64::from(1u32 << precision)));
                let x = format!(
                    "LEAST(GREATEST(floor((ST_X({c}) + 180.0) / 360.0 * {n}), 0), {n} - 1)::bigint",
                    c = column,
                    n = n
                );
                let y = format!(
                    "LEAST(GREATEST(floor((1.0 - ln(tan(radians(ST_Y({c}))) + 1.0 / cos(radians(ST_Y({c})))) / pi()) / 2.0 * {n}), 0), {n} - 1)::bigint",
                    c = column,
                    n = n
                );
                format!("({} || '/' || {} || '/' || {})", z, x, y)
            }
        }
    }

    fn metric_expr(function: CollectFunction) -> &'static str {
        match function {
            CollectFunction::Min => "MIN(\"m\")",
            CollectFunction::Max => "MAX(\"m\")",
            CollectFunction::Avg => "AVG(\"m\")",
            CollectFunction::Sum => "COALESCE(SUM(\"m\"), 0)",
            CollectFunction::Cardinality => "COUNT(DISTINCT \"m\")",
        }
    }

    /// # Brief
    /// 第 depth 级分桶语句
    ///
    /// 源子查询计算 0..=depth 各级桶键;外层按全部键分组。
    /// 被上一级截掉的父桶下的行仍会返回,由归并阶段丢弃。
    fn level_statement(
        &self,
        query: &Query,
        collection: &CollectionReference,
        depth: usize,
    ) -> QueryResult<SqlStatement> {
        let mut bindings = Bindings::new(self.dialect);
        let table = Ident::parse(collection.target())?;
        let levels = &query.aggregations[..=depth];
        let agg = &levels[depth];

        let mut source = Vec::with_capacity(depth + 4);
        for (level, a) in levels.iter().enumerate() {
            if let AggregationKind::GeoGrid { field, .. } = &a.kind {
                collection.require_point(field, a.field_type, "geo_grid")?;
            }
            let column = self.column(collection, a.kind.field())?;
            source.push(format!(
                "{} AS {}",
                self.key_expr(a, &column, &mut bindings),
                key_alias(level)
            ));
        }
        if let Some(collect) = &agg.collect {
            source.push(format!("{} AS \"m\"", self.column(collection, &collect.field)?));
        }
        if agg.wants(Derived::Bbox) {
            let geometry = collection
                .geometry_field()
                .ok_or_else(|| QueryError::Validation("bbox output needs a geometry field".to_string()))?;
            source.push(format!("{} AS \"g\"", self.column(collection, geometry)?));
        }
        if agg.wants(Derived::Centroid) {
            let (point, _) = collection
                .point_source()
                .ok_or_else(|| QueryError::Validation("centroid output needs a point source".to_string()))?;
            collection.require_point(point, agg.point_type.unwrap_or(FieldType::GeoShape), "centroid")?;
            source.push(format!("{} AS \"p\"", self.column(collection, point)?));
        }
        let source = SqlFragments {
            select: source.join(", "),
            from: table.to_string(),
            where_clause: self.render_filter(&query.filter, collection, &mut bindings)?,
            ..SqlFragments::default()
        };
        let source = format!("({}) AS src", source.render());

        let keys: Vec<String> = (0..=depth).map(key_alias).collect();
        let mut select = keys.clone();
        let mut columns: Vec<OutputColumn> = levels
            .iter()
            .enumerate()
            .map(|(level, a)| OutputColumn::new(a.name.clone(), ColumnRole::Key(level)))
            .collect();
        select.push("COUNT(*) AS \"doc_count\"".to_string());
        columns.push(OutputColumn::new("doc_count", ColumnRole::DocCount));
        if let Some(collect) = &agg.collect {
            select.push(format!("{} AS \"metric\"", Self::metric_expr(collect.function)));
            columns.push(OutputColumn::new("metric", ColumnRole::Metric));
        }
        if agg.wants(Derived::Bbox) {
            for (corner, (func, agg_fn, name)) in [
                ("ST_XMin", "MIN", "bbox_xmin"),
                ("ST_YMin", "MIN", "bbox_ymin"),
                ("ST_XMax", "MAX", "bbox_xmax"),
                ("ST_YMax", "MAX", "bbox_ymax"),
            ]
            .into_iter()
            .enumerate()
            {
                select.push(format!("{}({}(\"g\")) AS \"{}\"", agg_fn, func, name));
                columns.push(OutputColumn::new(name, ColumnRole::Bbox(corner)));
            }
        }
        if agg.wants(Derived::Centroid) {
            select.push("AVG(ST_X(\"p\")) AS \"centroid_x\"".to_string());
            columns.push(OutputColumn::new("centroid_x", ColumnRole::CentroidX));
            select.push("AVG(ST_Y(\"p\")) AS \"centroid_y\"".to_string());
            columns.push(OutputColumn::new("centroid_y", ColumnRole::CentroidY));
        }

        let current = &keys[depth];
        let mut order = match agg.order.key {
            OrderKey::Key => format!("{} {}", current, agg.order.direction.as_sql()),
            OrderKey::Count => format!("COUNT(*) {}", agg.order.direction.as_sql()),
            OrderKey::Metric => {
                let function = agg
                    .collect
                    .as_ref()
                    .map(|c| c.function)
                    .ok_or_else(|| QueryError::Validation(format!(
                        "aggregation {} orders by metric but has no collect function",
                        agg.name
                    )))?;
                format!(
                    "{} {} NULLS LAST",
                    Self::metric_expr(function),
                    agg.order.direction.as_sql()
                )
            }
        };
        if agg.order.key != OrderKey::Key {
            order.push_str(&format!(", {} ASC", current));
        }

        let not_null = keys
            .iter()
            .map(|k| format!("{} IS NOT NULL", k))
            .collect::<Vec<_>>()
            .join(" AND ");
        let size = bindings.bind(SqlParam::Integer(agg.size as i64));

        let (fragments, sql) = if depth == 0 {
            let fragments = SqlFragments {
                select: select.join(", "),
                from: source,
                where_clause: Some(not_null),
                group_by: Some(keys.join(", ")),
                order_by: Some(order),
                limit: Some(size),
                offset: None,
            };
            let sql = fragments.render();
            (fragments, sql)
        } else {
            let parents = keys[..depth].join(", ");
            columns.push(OutputColumn::new("bucket_rank", ColumnRole::Rank));
            let fragments = SqlFragments {
                select: format!(
                    "{}, ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}) AS \"bucket_rank\"",
                    select.join(", "),
                    parents,
                    order
                ),
                from: source,
                where_clause: Some(not_null),
                group_by: Some(keys.join(", ")),
                order_by: Some(order),
                limit: Some(size.clone()),
                offset: None,
            };
            let inner = SqlFragments {
                order_by: None,
                limit: None,
                ..fragments.clone()
            };
            let sql = format!(
                "SELECT * FROM ({}) AS ranked WHERE \"bucket_rank\" <= {} ORDER BY {}, \"bucket_rank\"",
                inner.render(),
                size,
                parents
            );
            (fragments, sql)
        };

        Ok(SqlStatement {
            kind: StatementKind::Level { depth },
            sql,
            fragments,
            params: bindings.params,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::QueryRequest;
    use crate::resolver::{CollectionDefinition, FieldTypeCache, ShapeTarget};
    use duoquery_common::CompilerConfig;
    use duoquery_value::ShapeClass;
    use serde_json::json;

    fn fixture(target: &str) -> (CollectionReference, FieldTypeCache) {
        let def: CollectionDefinition = serde_json::from_value(json!({
            "name": "staff",
            "backend": "relational",
            "target": target,
            "id_field": "id",
            "geometry_field": "site",
            "timestamp_field": "startdate",
            "fields": {"id": null, "job": "job_title", "startdate": null, "salary": null, "site": null}
        }))
        .unwrap();
        let cache = FieldTypeCache::new();
        for (f, t) in [
            ("id", FieldType::Keyword),
            ("job", FieldType::Keyword),
            ("startdate", FieldType::Date),
            ("salary", FieldType::Float),
            ("site", FieldType::GeoShape),
        ] {
            cache.register("staff", f, t);
        }
        (CollectionReference::new(def), cache)
    }

    fn compile_on(
        collection: &CollectionReference,
        cache: &FieldTypeCache,
        dialect: SqlDialect,
        request: serde_json::Value,
    ) -> QueryResult<SqlQuery> {
        let request: QueryRequest = serde_json::from_value(request).unwrap();
        let query = Query::build(&request, collection, cache, &CompilerConfig::default())?;
        SqlCompiler::new(dialect).compile(&query, collection)
    }

    fn compile(dialect: SqlDialect, request: serde_json::Value) -> QueryResult<SqlQuery> {
        let (collection, cache) = fixture("staff");
        compile_on(&collection, &cache, dialect, request)
    }

    #[test]
    fn test_identifier_allow_list() {
        assert_eq!(Ident::parse("public.staff").unwrap().as_str(), "\"public\".\"staff\"");
        assert!(Ident::parse("staff; DROP TABLE x").is_err());
        assert!(Ident::parse("1abc").is_err());
        assert!(Ident::parse("a\"b").is_err());
        assert!(Ident::parse(&"a".repeat(64)).is_err());
        assert!(Ident::parse(&"a".repeat(63)).is_ok());

        let (collection, cache) = fixture("bad-table");
        assert!(matches!(
            compile_on(&collection, &cache, SqlDialect::Sqlite, json!({"collection": "staff"})),
            Err(QueryError::Validation(_))
        ));
    }

    #[test]
    fn test_filter_predicates_sqlite() {
        let q = compile(
            SqlDialect::Sqlite,
            json!({
                "collection": "staff",
                "projection": ["job"],
                "filter": [
                    [{"field": "job", "op": "like", "value": "Arch"}, {"field": "job", "op": "!=", "value": "x"}],
                    [{"field": "startdate", "op": "range", "value": "[2001-01-01=<2002-01-01]"}]
                ]
            }),
        )
        .unwrap();
        let stmt = &q.statements[0];
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"job_title\" FROM \"staff\" WHERE (\"job_title\" LIKE ?1 ESCAPE '\\' \
             OR (\"job_title\" IS NULL OR \"job_title\" <> ?2)) AND (\"startdate\" >= ?3 AND \"startdate\" < ?4) \
             ORDER BY \"id\" ASC LIMIT ?5 OFFSET ?6"
        );
        assert_eq!(stmt.params[0], SqlParam::Text("%Arch%".to_string()));
        assert_eq!(stmt.params[4], SqlParam::Integer(100));
        assert_eq!(stmt.columns[1].role, ColumnRole::Field("job".to_string()));
    }

    #[test]
    fn test_postgres_placeholders_and_geo() {
        let q = compile(
            SqlDialect::Postgres,
            json!({
                "collection": "staff",
                "projection": ["site"],
                "filter": [[{"field": "job", "op": "like", "value": "a_b"}],
                           [{"field": "site", "op": "not_within", "value": "0,0,1,1"}]]
            }),
        )
        .unwrap();
        let sql = &q.statements[0].sql;
        assert!(sql.starts_with("SELECT \"id\", ST_AsGeoJSON(\"site\") AS \"f1\" FROM \"staff\""));
        assert!(sql.contains("\"job_title\" ILIKE $1 ESCAPE '\\'"));
        assert!(sql.contains("(\"site\" IS NULL OR NOT ST_Within(\"site\", ST_GeomFromGeoJSON($2)))"));
        assert!(sql.ends_with("LIMIT $3 OFFSET $4"));
    }

    #[test]
    fn test_empty_filter_and_count() {
        let q = compile(SqlDialect::Sqlite, json!({"collection": "staff", "count_only": true})).unwrap();
        assert_eq!(q.statements.len(), 1);
        assert_eq!(q.statements[0].sql, "SELECT COUNT(*) AS \"count\" FROM \"staff\"");
        assert!(q.statements[0].params.is_empty());
    }

    #[test]
    fn test_level_statements() {
        let q = compile(
            SqlDialect::Sqlite,
            json!({
                "collection": "staff",
                "aggregations": [
                    {"kind": "date_histogram", "interval": "1y", "name": "year", "size": 5},
                    {"kind": "terms", "field": "job", "collect": {"function": "avg", "field": "salary"},
                     "order": {"key": "metric"}, "derived": ["bbox"]}
                ]
            }),
        )
        .unwrap();
        assert_eq!(q.statements.len(), 2);

        let first = &q.statements[0];
        assert_eq!(
            first.sql,
            "SELECT \"k1\", COUNT(*) AS \"doc_count\" FROM (SELECT time_bucket(?1, ?2, \"startdate\") AS \"k1\" \
             FROM \"staff\") AS src WHERE \"k1\" IS NOT NULL GROUP BY \"k1\" ORDER BY \"k1\" ASC LIMIT ?3"
        );
        assert_eq!(first.params[0], SqlParam::Text("year".to_string()));
        assert_eq!(first.params[2], SqlParam::Integer(5));

        let second = &q.statements[1];
        assert!(second.sql.contains("ROW_NUMBER() OVER (PARTITION BY \"k1\" ORDER BY AVG(\"m\") DESC NULLS LAST, \"k2\" ASC)"));
        assert!(second.sql.contains("MIN(ST_XMin(\"g\")) AS \"bbox_xmin\""));
        assert!(second.sql.ends_with("WHERE \"bucket_rank\" <= ?3 ORDER BY \"k1\", \"bucket_rank\""));
        assert_eq!(second.position(&ColumnRole::Key(1)), Some(1));
        assert_eq!(second.position(&ColumnRole::Metric), Some(3));
        assert_eq!(second.position(&ColumnRole::Bbox(3)), Some(7));
        assert_eq!(second.position(&ColumnRole::Rank), Some(8));
        assert_eq!(second.fragments.group_by.as_deref(), Some("\"k1\", \"k2\""));
        assert_eq!(second.fragments.limit.as_deref(), Some("?3"));
    }

    #[test]
    fn test_fragments_render_statement() {
        let q = compile(
            SqlDialect::Sqlite,
            json!({
                "collection": "staff",
                "filter": [[{"field": "job", "op": "=", "value": "Architect"}]],
                "projection": ["id"],
                "offset": 4,
                "size": 2
            }),
        )
        .unwrap();
        let stmt = &q.statements[0];
        assert_eq!(stmt.fragments.select, "\"id\"");
        assert_eq!(stmt.fragments.from, "\"staff\"");
        assert_eq!(stmt.fragments.where_clause.as_deref(), Some("(\"job_title\" = ?1)"));
        assert_eq!(stmt.fragments.group_by, None);
        assert_eq!(stmt.fragments.order_by.as_deref(), Some("\"id\" ASC"));
        assert_eq!(stmt.fragments.limit.as_deref(), Some("?2"));
        assert_eq!(stmt.fragments.offset.as_deref(), Some("?3"));
        assert_eq!(stmt.fragments.render(), stmt.sql);
        assert_eq!(stmt.params[2], SqlParam::Integer(4));
    }

    #[test]
    fn test_postgres_key_expressions() {
        let q = compile(
            SqlDialect::Postgres,
            json!({
                "collection": "staff",
                "aggregations": [
                    {"kind": "date_histogram", "interval": "15m"},
                    {"kind": "histogram", "field": "salary", "interval": 1000},
                    {"kind": "date_histogram", "field": "startdate", "interval": "1M", "name": "month"}
                ]
            }),
        )
        .unwrap();
        let last = &q.statements[2].sql;
        assert!(last.contains("to_timestamp(floor(extract(epoch from \"startdate\") / $1) * $1) AS \"k1\""));
        assert!(last.contains("floor(\"salary\" / $2) * $2 AS \"k2\""));
        assert!(last.contains("date_trunc($3, \"startdate\") AS \"k3\""));
        assert_eq!(q.statements[2].params[0], SqlParam::Float(900.0));
    }

    #[test]
    fn test_geo_grid_requires_point_source() {
        let (collection, cache) = fixture("staff");
        let request = json!({
            "collection": "staff",
            "aggregations": [{"kind": "geo_grid", "precision": 6, "derived": ["centroid"]}]
        });
        let q = compile_on(&collection, &cache, SqlDialect::Sqlite, request.clone()).unwrap();
        assert!(q.statements[0].sql.contains("geotile_key(?1, \"site\") AS \"k1\""));
        assert!(q.statements[0].sql.contains("AVG(ST_X(\"p\")) AS \"centroid_x\""));

        collection.set_shape(ShapeTarget::Geometry, ShapeClass::MultiPolygon);
        match compile_on(&collection, &cache, SqlDialect::Sqlite, request) {
            Err(QueryError::Backend(failure)) => assert_eq!(failure.status, 400),
            other => panic!("unexpected {:?}", other),
        }
    }
}
