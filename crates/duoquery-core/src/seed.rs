//! 数据集装载模块
//!
//! 把一份 JSON 数据集同时写入两个嵌入式后端,用于 CLI 演示和跨后端测试。
//! 记录以逻辑字段名书写;写入时改为物理路径,并把日期和几何规范化为后端存储格式:
//! 关系后端中日期为规范化文本,几何为 GeoJSON 文本。

use duoquery_common::time::parse_datetime;
use duoquery_common::FieldType;
use duoquery_query::sql::Ident;
use duoquery_query::{CollectionDefinition, QueryError, QueryResult};
use duoquery_storage::{MemoryDocumentStore, SqlParam, SqliteClient};
use duoquery_value::geometry::{parse_geometry, to_geojson};
use chrono::DateTime;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

/// 数据集
#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    pub collection: CollectionDefinition,
    /// 逻辑字段名 → 类型
    pub field_types: IndexMap<String, FieldType>,
    #[serde(default)]
    pub records: Vec<JsonValue>,
}

impl Dataset {
    pub fn from_json(value: JsonValue) -> QueryResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| QueryError::Validation(format!("malformed dataset: {}", e)))
    }

    /// 为指定后端复制一份集合定义
    pub fn definition_for(&self, backend: duoquery_common::BackendKind) -> CollectionDefinition {
        let mut def = self.collection.clone();
        def.backend = backend;
        def
    }
}

fn physical(def: &CollectionDefinition, field: &str) -> String {
    match def.fields.get(field) {
        Some(Some(path)) => path.clone(),
        _ => field.to_string(),
    }
}

fn declared_type(types: &IndexMap<String, FieldType>, field: &str) -> QueryResult<FieldType> {
    types
        .get(field)
        .copied()
        .ok_or_else(|| QueryError::NotFound(format!("type of field {}", field)))
}

fn bad_value(field: &str, field_type: FieldType, raw: &JsonValue) -> QueryError {
    QueryError::Validation(format!(
        "field {} expects a {} value, got {}",
        field, field_type, raw
    ))
}

fn record_id(def: &CollectionDefinition, record: &JsonValue) -> QueryResult<String> {
    match record.get(&def.id_field) {
        Some(JsonValue::String(s)) => Ok(s.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(QueryError::Validation(format!(
            "record without identifier {}: {}",
            def.id_field, record
        ))),
    }
}

/// # Brief
/// 把记录写入内存文档后端
///
/// 以集合的 target 为索引名创建索引,映射使用物理路径。
///
/// # Returns
/// 写入的记录数
pub fn seed_document_store(store: &MemoryDocumentStore, dataset: &Dataset) -> QueryResult<usize> {
    let def = &dataset.collection;
    let mut mapping = IndexMap::new();
    for field in def.fields.keys() {
        mapping.insert(physical(def, field), declared_type(&dataset.field_types, field)?);
    }
    store.create_index(&def.target, mapping)?;

    for record in &dataset.records {
        let id = record_id(def, record)?;
        let mut source = serde_json::Map::new();
        for field in def.fields.keys() {
            if let Some(value) = record.get(field) {
                source.insert(physical(def, field), value.clone());
            }
        }
        store.index_document(&def.target, &id, JsonValue::Object(source))?;
    }
    info!(
        "Seeded {} records into document index {}",
        dataset.records.len(),
        def.target
    );
    Ok(dataset.records.len())
}

fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer | FieldType::Boolean | FieldType::Date => "INTEGER",
        FieldType::Float => "REAL",
        FieldType::Keyword | FieldType::GeoPoint | FieldType::GeoShape => "TEXT",
    }
}

fn to_param(field: &str, field_type: FieldType, raw: Option<&JsonValue>) -> QueryResult<SqlParam> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(SqlParam::Null);
    };
    let param = match field_type {
        FieldType::Keyword => match raw {
            JsonValue::String(s) => SqlParam::Text(s.clone()),
            JsonValue::Number(_) | JsonValue::Bool(_) => SqlParam::Text(raw.to_string()),
            _ => return Err(bad_value(field, field_type, raw)),
        },
        FieldType::Integer => SqlParam::Integer(raw.as_i64().ok_or_else(|| bad_value(field, field_type, raw))?),
        FieldType::Float => SqlParam::Float(raw.as_f64().ok_or_else(|| bad_value(field, field_type, raw))?),
        FieldType::Boolean => SqlParam::Boolean(raw.as_bool().ok_or_else(|| bad_value(field, field_type, raw))?),
        FieldType::Date => {
            let ts = match raw {
                JsonValue::String(s) => parse_datetime(s),
                JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
                _ => None,
            };
            let ts = ts.ok_or_else(|| bad_value(field, field_type, raw))?;
            SqlParam::Timestamp(ts)
        }
        FieldType::GeoPoint | FieldType::GeoShape => {
            let geometry = parse_geometry(raw).map_err(|_| bad_value(field, field_type, raw))?;
            SqlParam::Text(to_geojson(&geometry).to_string())
        }
    };
    Ok(param)
}

/// # Brief
/// 建表并把记录写入 SQLite
///
/// # Returns
/// 写入的记录数
pub fn seed_sqlite(client: &SqliteClient, dataset: &Dataset) -> QueryResult<usize> {
    let def = &dataset.collection;
    let table = Ident::parse(&def.target)?;
    let mut columns = Vec::with_capacity(def.fields.len());
    let mut names = Vec::with_capacity(def.fields.len());
    for field in def.fields.keys() {
        let column = Ident::parse(&physical(def, field))?;
        let field_type = declared_type(&dataset.field_types, field)?;
        let key = if *field == def.id_field { " PRIMARY KEY" } else { "" };
        columns.push(format!("{} {}{}", column, column_type(field_type), key));
        names.push(column.to_string());
    }
    client.execute_batch(&format!("CREATE TABLE {} ({});", table, columns.join(", ")))?;

    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        placeholders.join(", ")
    );
    let mut rows = Vec::with_capacity(dataset.records.len());
    for record in &dataset.records {
        let mut params = Vec::with_capacity(names.len());
        for field in def.fields.keys() {
            let field_type = declared_type(&dataset.field_types, field)?;
            params.push(to_param(field, field_type, record.get(field))?);
        }
        rows.push(params);
    }
    let written = client.execute_many(&insert, &rows)?;
    info!("Seeded {} rows into table {}", written, def.target);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duoquery_storage::{BoundStatement, CursorOptions, DocumentStoreClient, RelationalClient, SqlValue};
    use serde_json::json;

    fn dataset() -> Dataset {
        Dataset::from_json(json!({
            "collection": {
                "name": "people",
                "backend": "relational",
                "target": "people",
                "id_field": "id",
                "fields": {"id": null, "job": "job_title", "startdate": null, "loc": null}
            },
            "field_types": {"id": "keyword", "job": "keyword", "startdate": "date", "loc": "geo_point"},
            "records": [
                {"id": "a", "job": "Architect", "startdate": "2001-03-04", "loc": "10.0,20.0"},
                {"id": "b", "startdate": 0}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_seed_sqlite_normalizes_values() {
        let client = SqliteClient::open_in_memory(1).unwrap();
        assert_eq!(seed_sqlite(&client, &dataset()).unwrap(), 2);
        let rows = client
            .fetch_all(
                BoundStatement::new(
                    "SELECT \"job_title\", \"startdate\", \"loc\" FROM \"people\" ORDER BY \"id\"",
                    Vec::new(),
                ),
                CursorOptions::default(),
            )
            .unwrap();
        assert_eq!(rows[0][0], SqlValue::Text("Architect".to_string()));
        assert_eq!(rows[0][1], SqlValue::Integer(983_664_000_000));
        let loc: JsonValue = serde_json::from_str(rows[0][2].as_str().unwrap()).unwrap();
        assert_eq!(loc["coordinates"], json!([20.0, 10.0]));
        assert!(rows[1][0].is_null());
        assert_eq!(rows[1][1], SqlValue::Integer(0));
    }

    #[test]
    fn test_seed_document_store_uses_physical_paths() {
        let store = MemoryDocumentStore::new(100);
        assert_eq!(seed_document_store(&store, &dataset()).unwrap(), 2);
        assert_eq!(store.count("people").unwrap(), 2);
        let response = store
            .search("people", &json!({"query": {"term": {"job_title": "Architect"}}}))
            .unwrap();
        assert_eq!(response["hits"]["total"]["value"], 1);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut data = dataset();
        data.records.push(json!({"id": "c", "startdate": "yesterday"}));
        let client = SqliteClient::open_in_memory(1).unwrap();
        assert!(matches!(seed_sqlite(&client, &data), Err(QueryError::Validation(_))));

        data.records.pop();
        data.records.push(json!({"job": "x"}));
        let store = MemoryDocumentStore::new(100);
        assert!(matches!(seed_document_store(&store, &data), Err(QueryError::Validation(_))));
    }
}
