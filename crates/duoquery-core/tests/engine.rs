//! 引擎层:形状采样、explain、任务跟踪

mod common;

use common::*;
use duoquery_core::query::ShapeTarget;
use duoquery_core::value::ShapeClass;
use duoquery_core::{
    Backends, BackendKind, Dataset, DuoConfig, Engine, JobState, QueryError, QueryOutput,
};
use serde_json::json;

fn shapes_dataset(sample: serde_json::Value) -> Dataset {
    Dataset::from_json(json!({
        "collection": {
            "name": "sites",
            "backend": "document",
            "target": "sites",
            "id_field": "id",
            "geometry_field": "area",
            "fields": {"id": null, "area": null}
        },
        "field_types": {"id": "keyword", "area": "geo_shape"},
        "records": [
            {"id": "s0"},
            {"id": "s1", "area": sample}
        ]
    }))
    .unwrap()
}

#[test]
fn test_shape_sampled_from_each_backend() {
    let polygon = json!({"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]});
    let engine = engine_with(shapes_dataset(polygon));
    let grid = json!({"aggregations": [{"kind": "geo_grid", "precision": 3}]});

    for name in [DOC, SQL] {
        let collection = engine.resolver().resolve(name).unwrap();
        assert_eq!(collection.shape(ShapeTarget::Geometry), None);
        match engine.compile(&request(name, grid.clone())) {
            Err(QueryError::Backend(failure)) => {
                assert_eq!(failure.status, 400);
                assert!(failure.message.contains("unsupported by storage"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(collection.shape(ShapeTarget::Geometry), Some(ShapeClass::Polygon));
    }
}

#[test]
fn test_point_samples_allow_grid() {
    let engine = engine_with(shapes_dataset(json!("41.12,-71.34")));
    let grid = json!({"aggregations": [{"kind": "geo_grid", "precision": 2, "derived": ["centroid"]}]});
    let (doc, sql) = rows_both(&engine, grid);
    assert_eq!(doc.len(), 1);
    assert_eq!(sql.len(), 1);
    assert_eq!(doc[0].get("area"), sql[0].get("area"));
    let centroid = doc[0].get("area_centroid").and_then(|v| v.as_array()).unwrap();
    assert!((centroid[0].as_f64().unwrap() - -71.34).abs() < 1e-6);
    assert!((centroid[1].as_f64().unwrap() - 41.12).abs() < 1e-6);

    let collection = engine.resolver().resolve(SQL).unwrap();
    assert_eq!(collection.shape(ShapeTarget::Geometry), Some(ShapeClass::Point));
}

#[test]
fn test_explain_without_backends() {
    let data = dataset();
    let engine = Engine::new(DuoConfig::default(), Backends::new());
    engine
        .register_collection(data.definition_for(BackendKind::Relational), &data.field_types)
        .unwrap();
    let explained = engine
        .explain(&request(
            "people",
            json!({"filter": [[{"field": "job", "op": "=", "value": "Architect"}]], "count_only": true}),
        ))
        .unwrap();
    assert_eq!(explained["backend"], json!("relational"));
    assert_eq!(
        explained["document"]["body"],
        json!({
            "query": {"bool": {"filter": [{"bool": {"should": [{"term": {"job_title": "Architect"}}], "minimum_should_match": 1}}]}},
            "size": 0,
            "track_total_hits": true
        })
    );
    assert_eq!(
        explained["relational"]["statements"][0]["sql"],
        json!("SELECT COUNT(*) AS \"count\" FROM \"people\" WHERE (\"job_title\" = ?1)")
    );

    match engine.execute(&request("people", json!({})), &engine.default_options()) {
        Err(QueryError::Backend(failure)) => assert_eq!(failure.status, 503),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_tracked_execution() {
    let engine = engine();
    let options = engine.default_options();

    let (id, result) = engine.execute_tracked(&request(SQL, json!({"size": 3})), &options);
    assert_eq!(result.unwrap().into_rows().unwrap().len(), 3);
    let status = engine.job_status(&id).unwrap();
    assert_eq!(status.backend, Some(BackendKind::Relational));
    assert_eq!(
        status.state,
        JobState::Completed {
            rows: Some(3),
            count: None
        }
    );

    let (id, result) = engine.execute_tracked(&request(DOC, json!({"count_only": true})), &options);
    assert!(matches!(result, Ok(QueryOutput::Count(6))));
    assert_eq!(
        engine.job_status(&id).unwrap().state,
        JobState::Completed {
            rows: None,
            count: Some(6)
        }
    );

    let (id, result) = engine.execute_tracked(&request("ghost", json!({})), &options);
    assert!(matches!(result, Err(QueryError::NotFound(_))));
    let status = engine.job_status(&id).unwrap();
    assert_eq!(status.backend, None);
    assert!(matches!(status.state, JobState::Failed { .. }));
}

#[test]
fn test_config_file_drives_engine() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[compiler]\ndefault_page_size = 2\nsql_dialect = \"postgres\"\n\n[relational]\nprefetch_rows = 1"
    )
    .unwrap();
    let config = DuoConfig::from_file(file.path()).unwrap();
    let data = dataset();
    let engine = Engine::new(config, Backends::new());
    engine
        .register_collection(data.definition_for(BackendKind::Relational), &data.field_types)
        .unwrap();
    assert_eq!(engine.default_options().page_size, 1);
    let explained = engine.explain(&request("people", json!({}))).unwrap();
    assert_eq!(explained["relational"]["dialect"], json!("postgres"));
    assert_eq!(explained["document"]["body"]["size"], json!(2));
}

#[test]
fn test_job_status_honours_ttl() {
    let mut config = DuoConfig::default();
    config.jobs.ttl_secs = 0;
    let engine = Engine::new(config, Backends::new());
    let (id, result) = engine.execute_tracked(&request("ghost", json!({})), &engine.default_options());
    assert!(matches!(result, Err(QueryError::NotFound(_))));
    assert!(engine.job_status(&id).is_none());
}
