//! 同一请求在文档后端和关系后端上的端到端一致性

mod common;

use common::*;
use duoquery_core::{QueryError, Value};
use serde_json::json;

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

fn float(row: &duoquery_core::Document, field: &str) -> f64 {
    row.get(field)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing float {} in {:?}", field, row))
}

fn floats(row: &duoquery_core::Document, field: &str) -> Vec<f64> {
    row.get(field)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array {} in {:?}", field, row))
        .iter()
        .filter_map(Value::as_f64)
        .collect()
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-9, "{:?} != {:?}", a, b);
    }
}

#[test]
fn test_like_and_date_range_match_on_both_backends() {
    let engine = engine();
    let body = json!({
        "filter": [
            [{"field": "job", "op": "like", "value": "Architect"}],
            [{"field": "startdate", "op": "range", "value": "[1009799<1009801]"}]
        ]
    });
    let (doc, sql) = rows_both(&engine, body.clone());
    assert_eq!(sorted(ids(&doc)), vec!["p1", "p2"]);
    assert_eq!(sorted(ids(&sql)), vec!["p1", "p2"]);
    assert_eq!(count(&engine, DOC, body.clone()), 2);
    assert_eq!(count(&engine, SQL, body), 2);
}

#[test]
fn test_average_per_bucket_is_identical() {
    let engine = engine();
    let body = json!({
        "aggregations": [
            {"kind": "terms", "field": "category", "collect": {"function": "avg", "field": "price"}}
        ]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc.len(), 3);
    assert_eq!(sql.len(), 3);
    for (rows, expected) in [(&doc, [15.0, 35.0, 55.0]), (&sql, [15.0, 35.0, 55.0])] {
        let keys: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get("category").and_then(Value::as_str))
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        for (row, avg) in rows.iter().zip(expected) {
            assert_eq!(row.get("category_count"), Some(&Value::Int64(2)));
            assert!((float(row, "category_avg") - avg).abs() < 1e-9);
        }
    }
}

#[test]
fn test_year_interval_larger_than_one_is_rejected() {
    let engine = engine();
    for collection in [DOC, SQL] {
        let bad = request(
            collection,
            json!({"aggregations": [{"kind": "date_histogram", "interval": {"unit": "year", "value": 2}}]}),
        );
        match engine.compile(&bad) {
            Err(QueryError::Validation(message)) => assert!(message.contains("year")),
            other => panic!("unexpected {:?}", other),
        }
        let good = request(
            collection,
            json!({"aggregations": [{"kind": "date_histogram", "interval": {"unit": "year", "value": 1}}]}),
        );
        assert!(engine.compile(&good).is_ok());
    }
}

#[test]
fn test_multi_level_buckets_recombine() {
    let engine = engine();
    let body = json!({
        "aggregations": [
            {"kind": "date_histogram", "interval": "1y", "name": "year"},
            {"kind": "terms", "field": "category"}
        ]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc, sql);
    let flat: Vec<(i64, &str, i64)> = doc
        .iter()
        .map(|r| {
            (
                r.get("year").and_then(Value::as_i64).unwrap(),
                r.get("category").and_then(Value::as_str).unwrap(),
                r.get("category_count").and_then(Value::as_i64).unwrap(),
            )
        })
        .collect();
    assert_eq!(
        flat,
        vec![(0, "a", 2), (0, "b", 2), (1_988_150_400_000, "c", 1)]
    );
    assert_eq!(doc[0].get("year_count"), Some(&Value::Int64(4)));

    let body = json!({
        "aggregations": [
            {"kind": "date_histogram", "interval": "1y", "name": "year", "size": 1},
            {"kind": "terms", "field": "category", "size": 1}
        ]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc, sql);
    assert_eq!(doc.len(), 1);
    assert_eq!(doc[0].get("category"), Some(&Value::from("a")));
}

#[test]
fn test_formatted_date_keys() {
    let engine = engine();
    let body = json!({
        "aggregations": [{"kind": "date_histogram", "interval": "1y", "name": "year", "format": "%Y"}]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc, sql);
    let keys: Vec<&str> = doc.iter().filter_map(|r| r.get("year").and_then(Value::as_str)).collect();
    assert_eq!(keys, vec!["1970", "2033"]);
}

#[test]
fn test_histogram_with_geo_outputs() {
    let engine = engine();
    let body = json!({
        "aggregations": [{
            "kind": "histogram", "field": "price", "interval": 25,
            "collect": {"function": "sum", "field": "price"},
            "derived": ["bbox", "centroid"]
        }]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc.len(), 3);
    assert_eq!(sql.len(), 3);
    for (d, s) in doc.iter().zip(&sql) {
        assert_eq!(d.get("price"), s.get("price"));
        assert_eq!(d.get("price_count"), s.get("price_count"));
        assert!((float(d, "price_sum") - float(s, "price_sum")).abs() < 1e-9);
        assert_close(&floats(d, "price_bbox"), &floats(s, "price_bbox"));
        assert_close(&floats(d, "price_centroid"), &floats(s, "price_centroid"));
    }
    assert_eq!(doc[0].get("price"), Some(&Value::Float64(0.0)));
    assert_close(&floats(&doc[0], "price_bbox"), &[1.0, 1.0, 2.0, 2.0]);
    assert_close(&floats(&doc[1], "price_bbox"), &[-1.0, -1.0, 3.0, 3.0]);
    assert_close(&floats(&doc[0], "price_centroid"), &[1.5, 1.5]);
    assert!((float(&doc[2], "price_sum") - 110.0).abs() < 1e-9);
}

#[test]
fn test_geo_grid_tiles() {
    let engine = engine();
    let body = json!({
        "aggregations": [{"kind": "geo_grid", "field": "loc", "precision": 1, "derived": ["tile", "tile_center"]}]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc, sql);
    let keys: Vec<(&str, i64)> = doc
        .iter()
        .map(|r| {
            (
                r.get("loc").and_then(Value::as_str).unwrap(),
                r.get("loc_count").and_then(Value::as_i64).unwrap(),
            )
        })
        .collect();
    assert_eq!(keys, vec![("1/0/1", 1), ("1/1/0", 4)]);
    assert_eq!(floats(&doc[1], "loc_tile_center")[0], 90.0);
}

#[test]
fn test_geo_and_negated_predicates() {
    let engine = engine();
    let within = json!({"filter": [[{"field": "loc", "op": "within", "value": "0,0,5,5"}]]});
    let (doc, sql) = rows_both(&engine, within);
    assert_eq!(ids(&doc), vec!["p1", "p2", "p3"]);
    assert_eq!(ids(&sql), ids(&doc));

    let outside = json!({"filter": [[{"field": "loc", "op": "not_within", "value": "POLYGON((0 0, 5 0, 5 5, 0 5, 0 0))"}]]});
    let (doc, sql) = rows_both(&engine, outside);
    assert_eq!(ids(&doc), vec!["p4", "p5", "p6"]);
    assert_eq!(ids(&sql), ids(&doc));

    let inactive = json!({"filter": [[{"field": "active", "op": "!=", "value": true}]]});
    let (doc, sql) = rows_both(&engine, inactive);
    assert_eq!(ids(&doc), vec!["p2", "p4", "p6"]);
    assert_eq!(ids(&sql), ids(&doc));
}

#[test]
fn test_like_patterns() {
    let engine = engine();
    for (pattern, expected) in [
        ("architect", vec!["p1", "p2", "p3"]),
        ("*Architect", vec!["p1", "p2", "p3"]),
        ("Arch*", vec!["p1", "p3"]),
        ("Engin?er", vec!["p4", "p5"]),
    ] {
        let body = json!({"filter": [[{"field": "job", "op": "like", "value": pattern}]]});
        let (doc, sql) = rows_both(&engine, body);
        assert_eq!(ids(&doc), expected, "document store, pattern {}", pattern);
        assert_eq!(ids(&sql), expected, "relational, pattern {}", pattern);
    }
}

#[test]
fn test_projection_decodes_identically() {
    let engine = engine();
    let body = json!({
        "projection": ["name", "startdate", "loc", "active", "rank"],
        "filter": [[{"field": "id", "op": "=", "value": "p1"}, {"field": "id", "op": "=", "value": "p6"}]]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc, sql);
    assert_eq!(doc.len(), 2);
    assert_eq!(doc[0].get("rank"), Some(&Value::Int64(1)));
    assert_eq!(doc[0].get("active"), Some(&Value::Boolean(true)));
    assert_eq!(
        doc[0].get("startdate").and_then(Value::as_datetime).map(|d| d.timestamp_millis()),
        Some(1_009_800)
    );
    assert_eq!(doc[0].get_path("loc.type"), Some(&Value::from("Point")));
    assert!(!doc[1].contains_key("loc"));
    assert!(!doc[1].contains_key("startdate"));
}

#[test]
fn test_paging() {
    let engine = engine();
    let body = json!({"offset": 2, "size": 2});
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(ids(&doc), vec!["p3", "p4"]);
    assert_eq!(ids(&sql), vec!["p3", "p4"]);

    let too_far = request(DOC, json!({"offset": 9_995, "size": 10}));
    assert!(matches!(engine.compile(&too_far), Err(QueryError::Validation(_))));
}

#[test]
fn test_validation_before_backend() {
    let engine = engine();
    let ordered_keyword = request(SQL, json!({"filter": [[{"field": "job", "op": ">", "value": "A"}]]}));
    assert!(matches!(engine.compile(&ordered_keyword), Err(QueryError::Validation(_))));

    let unknown_field = request(DOC, json!({"filter": [[{"field": "salary", "op": "=", "value": 1}]]}));
    assert!(matches!(engine.compile(&unknown_field), Err(QueryError::NotFound(_))));

    let unknown_collection = request("nobody", json!({}));
    assert!(matches!(engine.compile(&unknown_collection), Err(QueryError::NotFound(_))));
}

#[test]
fn test_level_names_cannot_shadow_each_other() {
    let engine = engine();
    for (first, second) in [
        (
            json!({"kind": "terms", "field": "category", "collect": {"function": "avg", "field": "price"}}),
            json!({"kind": "terms", "field": "job", "name": "category_collect"}),
        ),
        (
            json!({"kind": "histogram", "field": "price", "interval": 10, "size": 1}),
            json!({"kind": "terms", "field": "category", "name": "price_sort"}),
        ),
        (
            json!({"kind": "terms", "field": "category"}),
            json!({"kind": "terms", "field": "job", "name": "category_count"}),
        ),
    ] {
        for collection in [DOC, SQL] {
            let body = json!({"aggregations": [first.clone(), second.clone()]});
            match engine.compile(&request(collection, body)) {
                Err(QueryError::Validation(message)) => assert!(message.contains("collides"), "{}", message),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    let body = json!({
        "aggregations": [
            {"kind": "histogram", "field": "price", "interval": 10, "size": 1,
             "collect": {"function": "avg", "field": "price"}},
            {"kind": "terms", "field": "category", "name": "price_bucket_category"}
        ]
    });
    let (doc, sql) = rows_both(&engine, body);
    assert_eq!(doc.len(), 1);
    assert_eq!(doc, sql);
    assert!((float(&doc[0], "price_avg") - 10.0).abs() < 1e-9);
}

#[test]
fn test_tied_buckets_follow_key_order() {
    let data = duoquery_core::Dataset::from_json(json!({
        "collection": {
            "name": "ties",
            "backend": "document",
            "target": "ties",
            "id_field": "id",
            "fields": {"id": null, "category": null, "price": null}
        },
        "field_types": {"id": "keyword", "category": "keyword", "price": "float"},
        "records": [
            {"id": "t1", "category": "delta", "price": 5.0},
            {"id": "t2", "category": "bravo", "price": 5.0},
            {"id": "t3", "category": "echo", "price": 7.0},
            {"id": "t4", "category": "echo", "price": 1.0},
            {"id": "t5", "category": "alpha", "price": 5.0},
            {"id": "t6", "category": "charlie", "price": 3.0}
        ]
    }))
    .unwrap();
    let engine = engine_with(data);
    let keys = |rows: &[duoquery_core::Document]| -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.get("category").and_then(Value::as_str).map(str::to_string))
            .collect()
    };

    let by_count = json!({"aggregations": [{"kind": "terms", "field": "category", "size": 3}]});
    let (doc, sql) = rows_both(&engine, by_count);
    assert_eq!(keys(&doc), vec!["echo", "alpha", "bravo"]);
    assert_eq!(keys(&sql), keys(&doc));

    let by_metric = json!({"aggregations": [{
        "kind": "terms", "field": "category",
        "collect": {"function": "max", "field": "price"},
        "order": {"key": "metric"}
    }]});
    let (doc, sql) = rows_both(&engine, by_metric);
    assert_eq!(keys(&doc), vec!["echo", "alpha", "bravo", "delta", "charlie"]);
    assert_eq!(keys(&sql), keys(&doc));
}

#[test]
fn test_dates_beyond_year_9999_compare_numerically() {
    let data = duoquery_core::Dataset::from_json(json!({
        "collection": {
            "name": "events",
            "backend": "relational",
            "target": "events",
            "id_field": "id",
            "fields": {"id": null, "at": null}
        },
        "field_types": {"id": "keyword", "at": "date"},
        "records": [
            {"id": "a", "at": 1_000_000_000_000_000i64},
            {"id": "b", "at": "2023-06-01"},
            {"id": "c", "at": -62_198_755_200_000i64}
        ]
    }))
    .unwrap();
    let engine = engine_with(data);

    let after = json!({"filter": [[{"field": "at", "op": ">", "value": "2024-01-01"}]]});
    let (doc, sql) = rows_both(&engine, after);
    assert_eq!(ids(&doc), vec!["a"]);
    assert_eq!(ids(&sql), vec!["a"]);

    let before = json!({"filter": [[{"field": "at", "op": "<", "value": "2000-01-01"}]]});
    let (doc, sql) = rows_both(&engine, before);
    assert_eq!(ids(&doc), vec!["c"]);
    assert_eq!(ids(&sql), vec!["c"]);

    let (doc, sql) = rows_both(&engine, json!({"projection": ["at"]}));
    assert_eq!(doc, sql);
    assert_eq!(
        doc[0].get("at").and_then(Value::as_datetime).map(|d| d.timestamp_millis()),
        Some(1_000_000_000_000_000)
    );

    let years = json!({"aggregations": [{"kind": "date_histogram", "interval": "1y", "name": "year"}]});
    let (doc, sql) = rows_both(&engine, years);
    assert_eq!(doc.len(), 3);
    assert_eq!(doc, sql);
}
