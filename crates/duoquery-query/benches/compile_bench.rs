use criterion::{criterion_group, criterion_main, Criterion};
use duoquery_common::{CompilerConfig, FieldType, SqlDialect};
use duoquery_query::{compile, CollectionDefinition, CollectionReference, FieldTypeCache, Query, QueryRequest};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

fn fixture(backend: &str) -> (Arc<CollectionReference>, FieldTypeCache) {
    let def: CollectionDefinition = serde_json::from_value(json!({
        "name": "staff",
        "backend": backend,
        "target": "staff",
        "id_field": "id",
        "geometry_field": "site",
        "timestamp_field": "startdate",
        "fields": {"id": null, "job": null, "startdate": null, "salary": null, "site": null}
    }))
    .unwrap();
    let cache = FieldTypeCache::new();
    cache.register("staff", "id", FieldType::Keyword);
    cache.register("staff", "job", FieldType::Keyword);
    cache.register("staff", "startdate", FieldType::Date);
    cache.register("staff", "salary", FieldType::Float);
    cache.register("staff", "site", FieldType::GeoPoint);
    (Arc::new(CollectionReference::new(def)), cache)
}

fn filter_request() -> QueryRequest {
    serde_json::from_value(json!({
        "collection": "staff",
        "filter": [
            [{"field": "job", "op": "=", "value": "Architect"}, {"field": "job", "op": "like", "value": "Eng"}],
            [{"field": "startdate", "op": "range", "value": "[2001-01-01=<2002-01-01]"}],
            [{"field": "site", "op": "within", "value": "-10,-10,10,10"}]
        ]
    }))
    .unwrap()
}

fn aggregation_request() -> QueryRequest {
    serde_json::from_value(json!({
        "collection": "staff",
        "aggregations": [
            {"kind": "date_histogram", "interval": "1y", "name": "year"},
            {"kind": "terms", "field": "job", "collect": {"function": "avg", "field": "salary"},
             "order": {"key": "metric"}, "derived": ["bbox", "centroid"]},
            {"kind": "geo_grid", "precision": 8, "derived": ["tile"]}
        ]
    }))
    .unwrap()
}

fn bench_compile(c: &mut Criterion, name: &str, backend: &str, request: QueryRequest) {
    let (collection, cache) = fixture(backend);
    let config = CompilerConfig::default();
    let query = Arc::new(Query::build(&request, &collection, &cache, &config).unwrap());
    c.bench_function(name, |b| {
        b.iter(|| {
            compile(
                black_box(query.clone()),
                collection.clone(),
                SqlDialect::Sqlite,
            )
        })
    });
}

fn bench_search_filter(c: &mut Criterion) {
    bench_compile(c, "search_filter_compile", "document", filter_request());
}

fn bench_sql_filter(c: &mut Criterion) {
    bench_compile(c, "sql_filter_compile", "relational", filter_request());
}

fn bench_search_aggregation(c: &mut Criterion) {
    bench_compile(c, "search_aggregation_compile", "document", aggregation_request());
}

fn bench_sql_aggregation(c: &mut Criterion) {
    bench_compile(c, "sql_aggregation_compile", "relational", aggregation_request());
}

fn bench_query_build(c: &mut Criterion) {
    let (collection, cache) = fixture("document");
    let config = CompilerConfig::default();
    let request = aggregation_request();
    c.bench_function("query_build", |b| {
        b.iter(|| Query::build(black_box(&request), &collection, &cache, &config))
    });
}

criterion_group!(
    benches,
    bench_search_filter,
    bench_sql_filter,
    bench_search_aggregation,
    bench_sql_aggregation,
    bench_query_build,
);

criterion_main!(benches);
