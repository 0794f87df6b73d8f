//! 跨后端测试的公共夹具:同一份数据集装入两个嵌入式后端,
//! 分别注册为 `people_doc`(文档后端)和 `people_sql`(关系后端)。

#![allow(dead_code)]

use duoquery_core::common::CollectionName;
use duoquery_core::{
    seed_document_store, seed_sqlite, Backends, BackendKind, Dataset, Document, DuoConfig, Engine,
    MemoryDocumentStore, QueryOutput, QueryRequest, SqliteClient,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

pub const DOC: &str = "people_doc";
pub const SQL: &str = "people_sql";

pub fn dataset() -> Dataset {
    Dataset::from_json(json!({
        "collection": {
            "name": "people",
            "backend": "document",
            "target": "people",
            "id_field": "id",
            "geometry_field": "loc",
            "timestamp_field": "startdate",
            "fields": {
                "id": null, "name": null, "job": "job_title", "startdate": null,
                "price": null, "rank": null, "category": null, "active": null, "loc": null
            }
        },
        "field_types": {
            "id": "keyword", "name": "keyword", "job": "keyword", "startdate": "date",
            "price": "float", "rank": "integer", "category": "keyword", "active": "boolean",
            "loc": "geo_point"
        },
        "records": [
            {"id": "p1", "name": "Ada", "job": "Architect", "startdate": 1009800, "price": 10.0,
             "rank": 1, "category": "a", "active": true, "loc": [1.0, 1.0]},
            {"id": "p2", "name": "Bo", "job": "Senior Architect", "startdate": 1009800, "price": 20.0,
             "rank": 2, "category": "a", "active": false, "loc": [2.0, 2.0]},
            {"id": "p3", "name": "Cy", "job": "Architect", "startdate": 1009900, "price": 30.0,
             "rank": 3, "category": "b", "active": true, "loc": [3.0, 3.0]},
            {"id": "p4", "name": "Di", "job": "Engineer", "startdate": 1009800, "price": 40.0,
             "rank": 4, "category": "b", "active": false, "loc": [-1.0, -1.0]},
            {"id": "p5", "name": "Ed", "job": "Engineer", "startdate": 2000000000000i64, "price": 50.0,
             "rank": 5, "category": "c", "active": true, "loc": [10.0, 10.0]},
            {"id": "p6", "name": "Flo", "job": "Analyst", "price": 60.0,
             "rank": 6, "category": "c"}
        ]
    }))
    .unwrap()
}

pub fn engine() -> Engine {
    engine_with(dataset())
}

pub fn engine_with(data: Dataset) -> Engine {
    let store = MemoryDocumentStore::new(10_000);
    seed_document_store(&store, &data).unwrap();
    let client = SqliteClient::open_in_memory(2).unwrap();
    seed_sqlite(&client, &data).unwrap();

    let engine = Engine::new(
        DuoConfig::default(),
        Backends::new()
            .with_document(Arc::new(store))
            .with_relational(Arc::new(client)),
    );
    for (name, backend) in [(DOC, BackendKind::Document), (SQL, BackendKind::Relational)] {
        let mut def = data.definition_for(backend);
        def.name = CollectionName::new(name).unwrap();
        engine.register_collection(def, &data.field_types).unwrap();
    }
    engine
}

pub fn request(collection: &str, mut body: JsonValue) -> QueryRequest {
    body["collection"] = JsonValue::from(collection);
    serde_json::from_value(body).unwrap()
}

pub fn rows(engine: &Engine, collection: &str, body: JsonValue) -> Vec<Document> {
    engine
        .execute(&request(collection, body), &engine.default_options())
        .unwrap()
        .into_rows()
        .unwrap()
}

/// 两个后端的结果行
pub fn rows_both(engine: &Engine, body: JsonValue) -> (Vec<Document>, Vec<Document>) {
    (rows(engine, DOC, body.clone()), rows(engine, SQL, body))
}

pub fn count(engine: &Engine, collection: &str, mut body: JsonValue) -> u64 {
    body["count_only"] = JsonValue::Bool(true);
    match engine
        .execute(&request(collection, body), &engine.default_options())
        .unwrap()
    {
        QueryOutput::Count(n) => n,
        QueryOutput::Rows(_) => panic!("expected a count"),
    }
}

pub fn ids(rows: &[Document]) -> Vec<String> {
    rows.iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}
