//! 聚合描述模块
//!
//! 聚合种类是一个带标签的枚举,每种携带各自的字段,两个编译器穷尽匹配:
//! - `DateHistogram`:日历或固定宽度的时间分桶
//! - `Histogram`:固定宽度的数值分桶
//! - `Terms`:按字段精确值分组
//! - `GeoGrid`:按 geotile `z/x/y` 单元分组
//!
//! 公共部分:名称、日期键格式、收集指标、排序、桶数上限、派生几何输出。
//! 聚合按顺序组成管道,后一级嵌套在前一级的每个桶内。

use crate::resolver::{CollectionReference, FieldTypeLookup};
use crate::search::{BBOX_SUFFIX, CENTROID_SUFFIX, COLLECT_SUFFIX, SORT_SUFFIX};
use crate::{QueryError, QueryResult};
use chrono::format::{Item, StrftimeItems};
use duoquery_common::time::parse_short_interval;
use duoquery_common::{CompilerConfig, FieldType, IntervalUnit};
use duoquery_value::geometry::MAX_GEOTILE_PRECISION;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// 区间
// ============================================================================

/// 时间区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    unit: IntervalUnit,
    value: u32,
}

impl Interval {
    /// # Brief
    /// 构造并校验区间
    ///
    /// 周及以上的单位只允许倍数 1。
    pub fn new(unit: IntervalUnit, value: u32) -> QueryResult<Self> {
        if value == 0 {
            return Err(QueryError::Validation(format!(
                "interval value for unit {} must be at least 1",
                unit
            )));
        }
        if unit.is_calendar() && value != 1 {
            return Err(QueryError::Validation(format!(
                "interval unit {} only supports a value of 1, got {}",
                unit, value
            )));
        }
        Ok(Self { unit, value })
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn is_calendar(&self) -> bool {
        self.unit.is_calendar()
    }

    /// 固定宽度区间的秒数
    pub fn fixed_seconds(&self) -> Option<i64> {
        self.unit
            .fixed_seconds()
            .map(|s| s * i64::from(self.value))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.short_suffix())
    }
}

/// 请求中的区间写法:`"1M"` 或 `{unit, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalSpec {
    Short(String),
    Full { unit: String, value: u32 },
}

impl IntervalSpec {
    pub fn resolve(&self) -> QueryResult<Interval> {
        match self {
            IntervalSpec::Short(s) => {
                let (unit, value) = parse_short_interval(s).ok_or_else(|| {
                    QueryError::Validation(format!("unrecognized interval {:?}", s))
                })?;
                Interval::new(unit, value)
            }
            IntervalSpec::Full { unit, value } => {
                let unit: IntervalUnit = unit
                    .parse()
                    .map_err(|e: duoquery_common::DuoError| QueryError::Validation(e.to_string()))?;
                Interval::new(unit, *value)
            }
        }
    }
}

// ============================================================================
// 公共部分
// ============================================================================

/// 收集函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectFunction {
    Min,
    Max,
    Avg,
    Sum,
    Cardinality,
}

impl CollectFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectFunction::Min => "min",
            CollectFunction::Max => "max",
            CollectFunction::Avg => "avg",
            CollectFunction::Sum => "sum",
            CollectFunction::Cardinality => "cardinality",
        }
    }
}

impl fmt::Display for CollectFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每个桶内计算的指标
#[derive(Debug, Clone, PartialEq)]
pub struct Collect {
    pub function: CollectFunction,
    pub field: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSpec {
    pub function: CollectFunction,
    pub field: String,
}

/// 排序依据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKey {
    Key,
    Count,
    /// 按收集指标排序
    Metric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// 桶排序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOrder {
    pub key: OrderKey,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub key: OrderKey,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// 派生几何输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derived {
    /// 桶内几何的外包框
    Bbox,
    /// 桶内点的均值中心
    Centroid,
    /// 网格单元外包框
    Tile,
    /// 网格单元中心
    TileCenter,
}

impl Derived {
    pub fn suffix(&self) -> &'static str {
        match self {
            Derived::Bbox => "bbox",
            Derived::Centroid => "centroid",
            Derived::Tile => "tile",
            Derived::TileCenter => "tile_center",
        }
    }
}

// ============================================================================
// 聚合
// ============================================================================

/// 聚合种类
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationKind {
    DateHistogram { field: String, interval: Interval },
    Histogram { field: String, interval: f64 },
    Terms { field: String },
    GeoGrid { field: String, precision: u8 },
}

impl AggregationKind {
    pub fn field(&self) -> &str {
        match self {
            AggregationKind::DateHistogram { field, .. }
            | AggregationKind::Histogram { field, .. }
            | AggregationKind::Terms { field }
            | AggregationKind::GeoGrid { field, .. } => field,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            AggregationKind::DateHistogram { .. } => "date_histogram",
            AggregationKind::Histogram { .. } => "histogram",
            AggregationKind::Terms { .. } => "terms",
            AggregationKind::GeoGrid { .. } => "geo_grid",
        }
    }

    fn default_order(&self) -> BucketOrder {
        match self {
            AggregationKind::Terms { .. } => BucketOrder {
                key: OrderKey::Count,
                direction: Direction::Desc,
            },
            _ => BucketOrder {
                key: OrderKey::Key,
                direction: Direction::Asc,
            },
        }
    }
}

/// 请求中的聚合种类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationKindSpec {
    DateHistogram {
        #[serde(default)]
        field: Option<String>,
        interval: IntervalSpec,
    },
    Histogram {
        field: String,
        interval: f64,
    },
    Terms {
        field: String,
    },
    GeoGrid {
        #[serde(default)]
        field: Option<String>,
        precision: u8,
    },
}

/// 请求中的聚合描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(flatten)]
    pub kind: AggregationKindSpec,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub collect: Option<CollectSpec>,
    #[serde(default)]
    pub order: Option<OrderSpec>,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub derived: Vec<Derived>,
}

/// 已校验的聚合
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub name: String,
    pub kind: AggregationKind,
    /// 分桶字段的声明类型
    pub field_type: FieldType,
    /// 桶键的类型(GeoGrid 为 Keyword,Histogram 为 Float)
    pub key_type: FieldType,
    /// 点来源字段的类型,仅在请求 centroid 输出时解析
    pub point_type: Option<FieldType>,
    /// 日期键的 strftime 格式
    pub format: Option<String>,
    pub collect: Option<Collect>,
    pub order: BucketOrder,
    pub size: usize,
    pub derived: BTreeSet<Derived>,
}

fn expect_type(kind: &str, field: &str, actual: FieldType, ok: bool, wanted: &str) -> QueryResult<()> {
    if ok {
        Ok(())
    } else {
        Err(QueryError::Validation(format!(
            "{} requires {} field, {} is {}",
            kind, wanted, field, actual
        )))
    }
}

impl Aggregation {
    /// # Brief
    /// 校验请求中的聚合描述
    ///
    /// # Arguments
    /// * `spec` - 请求描述
    /// * `collection` - 目标集合
    /// * `lookup` - 字段类型查询
    /// * `config` - 编译器配置(默认与最大桶数)
    pub fn build(
        spec: &AggregationSpec,
        collection: &CollectionReference,
        lookup: &dyn FieldTypeLookup,
        config: &CompilerConfig,
    ) -> QueryResult<Self> {
        let (kind, field_type, key_type) = match &spec.kind {
            AggregationKindSpec::DateHistogram { field, interval } => {
                let field = match field {
                    Some(f) => f.clone(),
                    None => collection.timestamp_field().map(str::to_string).ok_or_else(|| {
                        QueryError::Validation(format!(
                            "date_histogram needs a field: collection {} has no timestamp field",
                            collection.name()
                        ))
                    })?,
                };
                let ft = lookup.field_type(collection, &field)?;
                expect_type("date_histogram", &field, ft, ft == FieldType::Date, "a date")?;
                let interval = interval.resolve()?;
                (AggregationKind::DateHistogram { field, interval }, ft, FieldType::Date)
            }
            AggregationKindSpec::Histogram { field, interval } => {
                let ft = lookup.field_type(collection, field)?;
                expect_type("histogram", field, ft, ft.is_numeric(), "a numeric")?;
                if !interval.is_finite() || *interval <= 0.0 {
                    return Err(QueryError::Validation(format!(
                        "histogram interval must be a positive number, got {}",
                        interval
                    )));
                }
                (
                    AggregationKind::Histogram {
                        field: field.clone(),
                        interval: *interval,
                    },
                    ft,
                    FieldType::Float,
                )
            }
            AggregationKindSpec::Terms { field } => {
                let ft = lookup.field_type(collection, field)?;
                expect_type("terms", field, ft, !ft.is_geo(), "a scalar")?;
                (AggregationKind::Terms { field: field.clone() }, ft, ft)
            }
            AggregationKindSpec::GeoGrid { field, precision } => {
                let field = match field {
                    Some(f) => f.clone(),
                    None => collection
                        .point_source()
                        .map(|(f, _)| f.to_string())
                        .ok_or_else(|| {
                            QueryError::Validation(format!(
                                "geo_grid needs a field: collection {} has no geometry or centroid field",
                                collection.name()
                            ))
                        })?,
                };
                let ft = lookup.field_type(collection, &field)?;
                expect_type("geo_grid", &field, ft, ft.is_geo(), "a geo")?;
                if *precision > MAX_GEOTILE_PRECISION {
                    return Err(QueryError::Validation(format!(
                        "geo_grid precision must be within 0..={}, got {}",
                        MAX_GEOTILE_PRECISION, precision
                    )));
                }
                (
                    AggregationKind::GeoGrid {
                        field,
                        precision: *precision,
                    },
                    ft,
                    FieldType::Keyword,
                )
            }
        };

        let name = spec.name.clone().unwrap_or_else(|| kind.field().to_string());
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(QueryError::Validation(format!(
                "aggregation name {:?} may only contain letters, digits and underscores",
                name
            )));
        }

        if let Some(format) = &spec.format {
            if key_type != FieldType::Date {
                return Err(QueryError::Validation(format!(
                    "format is only valid on date keys, aggregation {} has {} keys",
                    name, key_type
                )));
            }
            if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(QueryError::Validation(format!(
                    "invalid date format {:?} on aggregation {}",
                    format, name
                )));
            }
        }

        let collect = match &spec.collect {
            None => None,
            Some(c) => {
                let ft = lookup.field_type(collection, &c.field)?;
                let ok = match c.function {
                    CollectFunction::Cardinality => !ft.is_geo(),
                    _ => ft.is_numeric(),
                };
                expect_type(
                    c.function.as_str(),
                    &c.field,
                    ft,
                    ok,
                    if c.function == CollectFunction::Cardinality {
                        "a scalar"
                    } else {
                        "a numeric"
                    },
                )?;
                Some(Collect {
                    function: c.function,
                    field: c.field.clone(),
                    field_type: ft,
                })
            }
        };

        let order = match &spec.order {
            None => kind.default_order(),
            Some(o) => BucketOrder {
                key: o.key,
                direction: o.direction.unwrap_or(match o.key {
                    OrderKey::Key => Direction::Asc,
                    OrderKey::Count | OrderKey::Metric => Direction::Desc,
                }),
            },
        };
        if order.key == OrderKey::Metric && collect.is_none() {
            return Err(QueryError::Validation(format!(
                "aggregation {} orders by metric but has no collect function",
                name
            )));
        }

        let size = spec.size.unwrap_or(config.default_bucket_size);
        if size == 0 || size > config.max_bucket_size {
            return Err(QueryError::Validation(format!(
                "aggregation {} size must be within 1..={}, got {}",
                name, config.max_bucket_size, size
            )));
        }

        let derived: BTreeSet<Derived> = spec.derived.iter().copied().collect();
        for d in &derived {
            match d {
                Derived::Tile | Derived::TileCenter
                    if !matches!(kind, AggregationKind::GeoGrid { .. }) =>
                {
                    return Err(QueryError::Validation(format!(
                        "{} output is only valid on geo_grid aggregations",
                        d.suffix()
                    )))
                }
                Derived::Bbox if collection.geometry_field().is_none() => {
                    return Err(QueryError::Validation(format!(
                        "bbox output needs a geometry field on collection {}",
                        collection.name()
                    )))
                }
                Derived::Centroid if collection.point_source().is_none() => {
                    return Err(QueryError::Validation(format!(
                        "centroid output needs a geometry or centroid field on collection {}",
                        collection.name()
                    )))
                }
                _ => {}
            }
        }

        let point_type = match collection.point_source() {
            Some((source, _)) if derived.contains(&Derived::Centroid) => {
                Some(lookup.field_type(collection, source)?)
            }
            _ => None,
        };

        Ok(Self {
            name,
            kind,
            field_type,
            key_type,
            point_type,
            format: spec.format.clone(),
            collect,
            order,
            size,
            derived,
        })
    }

    pub fn wants(&self, derived: Derived) -> bool {
        self.derived.contains(&derived)
    }

    /// 指标输出名 `<name>_<function>`
    pub fn metric_name(&self) -> Option<String> {
        self.collect
            .as_ref()
            .map(|c| format!("{}_{}", self.name, c.function))
    }

    /// 本级占用的全部名字:级名、结果行字段与搜索子聚合名
    pub fn claimed_names(&self) -> Vec<String> {
        let mut names = vec![self.name.clone(), format!("{}_count", self.name)];
        for suffix in [COLLECT_SUFFIX, BBOX_SUFFIX, CENTROID_SUFFIX, SORT_SUFFIX] {
            names.push(format!("{}{}", self.name, suffix));
        }
        for derived in [Derived::Tile, Derived::TileCenter] {
            names.push(format!("{}_{}", self.name, derived.suffix()));
        }
        names.extend(self.metric_name());
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{CollectionDefinition, FieldTypeCache};
    use serde_json::json;

    fn fixture() -> (CollectionReference, FieldTypeCache) {
        let def: CollectionDefinition = serde_json::from_value(json!({
            "name": "sales",
            "backend": "document",
            "target": "sales",
            "id_field": "id",
            "geometry_field": "loc",
            "timestamp_field": "at",
            "fields": {"id": null, "loc": null, "at": null, "price": null, "shop": null}
        }))
        .unwrap();
        let collection = CollectionReference::new(def);
        let cache = FieldTypeCache::new();
        cache.register("sales", "id", FieldType::Keyword);
        cache.register("sales", "loc", FieldType::GeoPoint);
        cache.register("sales", "at", FieldType::Date);
        cache.register("sales", "price", FieldType::Float);
        cache.register("sales", "shop", FieldType::Keyword);
        (collection, cache)
    }

    fn build(spec: serde_json::Value) -> QueryResult<Aggregation> {
        let (collection, cache) = fixture();
        let spec: AggregationSpec = serde_json::from_value(spec).unwrap();
        Aggregation::build(&spec, &collection, &cache, &CompilerConfig::default())
    }

    #[test]
    fn test_year_interval_must_be_one() {
        let err = build(json!({"kind": "date_histogram", "interval": {"unit": "year", "value": 2}}))
            .unwrap_err();
        match err {
            QueryError::Validation(msg) => assert!(msg.contains("year")),
            other => panic!("unexpected {:?}", other),
        }
        let agg = build(json!({"kind": "date_histogram", "interval": {"unit": "year", "value": 1}}))
            .unwrap();
        assert_eq!(agg.name, "at");
        assert!(build(json!({"kind": "date_histogram", "interval": "2w"})).is_err());
        let agg = build(json!({"kind": "date_histogram", "interval": "15m"})).unwrap();
        match agg.kind {
            AggregationKind::DateHistogram { interval, .. } => {
                assert_eq!(interval.fixed_seconds(), Some(900));
                assert_eq!(interval.to_string(), "15m");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let agg = build(json!({"kind": "terms", "field": "shop"})).unwrap();
        assert_eq!(agg.order.key, OrderKey::Count);
        assert_eq!(agg.order.direction, Direction::Desc);
        assert_eq!(agg.size, 10);
        let agg = build(json!({"kind": "geo_grid", "precision": 4})).unwrap();
        assert_eq!(agg.kind.field(), "loc");
        assert_eq!(agg.order.key, OrderKey::Key);
    }

    #[test]
    fn test_collect_and_order_rules() {
        let agg = build(json!({
            "kind": "terms", "field": "shop",
            "collect": {"function": "avg", "field": "price"},
            "order": {"key": "metric"}
        }))
        .unwrap();
        assert_eq!(agg.metric_name().as_deref(), Some("shop_avg"));
        assert_eq!(agg.order.direction, Direction::Desc);

        assert!(build(json!({"kind": "terms", "field": "shop", "order": {"key": "metric"}})).is_err());
        assert!(build(json!({
            "kind": "terms", "field": "shop",
            "collect": {"function": "sum", "field": "shop"}
        }))
        .is_err());
        assert!(build(json!({
            "kind": "terms", "field": "price",
            "collect": {"function": "cardinality", "field": "shop"}
        }))
        .is_ok());
    }

    #[test]
    fn test_field_and_output_rules() {
        assert!(build(json!({"kind": "histogram", "field": "shop", "interval": 5})).is_err());
        assert!(build(json!({"kind": "histogram", "field": "price", "interval": 0})).is_err());
        assert!(matches!(
            build(json!({"kind": "terms", "field": "nope"})),
            Err(QueryError::NotFound(_))
        ));
        assert!(build(json!({"kind": "terms", "field": "shop", "derived": ["tile"]})).is_err());
        assert!(build(json!({"kind": "geo_grid", "precision": 30})).is_err());
        assert!(build(json!({"kind": "terms", "field": "shop", "size": 0})).is_err());
        assert!(build(json!({"kind": "terms", "field": "shop", "size": 10001})).is_err());
        assert!(build(json!({"kind": "terms", "field": "shop", "format": "%Y"})).is_err());
        assert!(build(json!({"kind": "date_histogram", "interval": "1d", "format": "%Q"})).is_err());
        let agg = build(json!({
            "kind": "geo_grid", "precision": 3, "name": "cells",
            "derived": ["tile_center", "bbox", "tile", "bbox"]
        }))
        .unwrap();
        assert_eq!(agg.derived.len(), 3);
        assert!(agg.wants(Derived::Tile));
    }
}
