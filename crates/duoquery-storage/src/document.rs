//! 文档后端模块
//!
//! `DocumentStoreClient` 是文档后端的唯一接口:接收索引名与 JSON 查询体,返回 JSON 响应。
//! `MemoryDocumentStore` 是嵌入式实现,每个索引持有映射与已解析的文档,
//! 由 [`crate::dsl`] 解释查询。

use crate::dsl::{evaluate_aggs, json_path, parse_aggs, parse_clause, Clause, StoredDocument, Typed};
use crate::{StorageError, StorageResult};
use dashmap::DashMap;
use duoquery_common::FieldType;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Map, Value as JsonValue};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// 文档后端客户端
pub trait DocumentStoreClient: Send + Sync {
    /// # Brief
    /// 对索引执行搜索请求
    ///
    /// # Arguments
    /// * `index` - 索引名
    /// * `body` - 查询体(`query`、`aggs`、`size`、`from`、`sort`、`_source`、`track_total_hits`)
    ///
    /// # Returns
    /// 搜索引擎风格的响应 JSON
    fn search(&self, index: &str, body: &JsonValue) -> StorageResult<JsonValue>;
}

/// 单个索引
#[derive(Debug)]
struct MemoryIndex {
    mapping: IndexMap<String, FieldType>,
    docs: IndexMap<String, StoredDocument>,
}

impl MemoryIndex {
    fn parse_document(&self, id: &str, source: JsonValue) -> StorageResult<StoredDocument> {
        if !source.is_object() {
            return Err(StorageError::MalformedDocument(format!(
                "document [{}] must be a JSON object",
                id
            )));
        }
        let mut fields = std::collections::HashMap::new();
        for (field, field_type) in &self.mapping {
            let Some(raw) = json_path(&source, field) else {
                continue;
            };
            if raw.is_array() && !field_type.is_geo() {
                return Err(StorageError::MalformedDocument(format!(
                    "document [{}] field [{}]: arrays are not supported",
                    id, field
                )));
            }
            let typed = Typed::from_json(raw, *field_type).map_err(|e| {
                StorageError::MalformedDocument(format!("document [{}] field [{}]: {}", id, field, e))
            })?;
            if let Some(typed) = typed {
                fields.insert(field.clone(), typed);
            }
        }
        Ok(StoredDocument {
            id: id.to_string(),
            source,
            fields,
        })
    }
}

/// 嵌入式文档后端
pub struct MemoryDocumentStore {
    indices: DashMap<String, Arc<RwLock<MemoryIndex>>>,
    max_result_window: usize,
}

impl MemoryDocumentStore {
    /// # Brief
    /// 创建空存储
    ///
    /// # Arguments
    /// * `max_result_window` - `from + size` 的上限
    pub fn new(max_result_window: usize) -> Self {
        Self {
            indices: DashMap::new(),
            max_result_window,
        }
    }

    fn index(&self, name: &str) -> StorageResult<Arc<RwLock<MemoryIndex>>> {
        self.indices
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::TargetNotFound(format!("no such index [{}]", name)))
    }

    /// # Brief
    /// 按映射创建索引
    pub fn create_index(&self, name: &str, mapping: IndexMap<String, FieldType>) -> StorageResult<()> {
        match self.indices.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::TargetExists(format!(
                "index [{}] already exists",
                name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("Created index {} with {} mapped fields", name, mapping.len());
                slot.insert(Arc::new(RwLock::new(MemoryIndex {
                    mapping,
                    docs: IndexMap::new(),
                })));
                Ok(())
            }
        }
    }

    /// 删除索引
    pub fn delete_index(&self, name: &str) -> StorageResult<()> {
        self.indices
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::TargetNotFound(format!("no such index [{}]", name)))
    }

    /// # Brief
    /// 写入或覆盖一个文档
    ///
    /// 映射字段按类型解析;解析失败时整个文档被拒绝。
    pub fn index_document(&self, index: &str, id: &str, source: JsonValue) -> StorageResult<()> {
        let index = self.index(index)?;
        let mut guard = index.write();
        let doc = guard.parse_document(id, source)?;
        guard.docs.insert(id.to_string(), doc);
        Ok(())
    }

    /// 索引中的文档数
    pub fn count(&self, index: &str) -> StorageResult<usize> {
        Ok(self.index(index)?.read().docs.len())
    }
}

fn usize_field(body: &JsonValue, name: &str, default: usize) -> StorageResult<usize> {
    match body.get(name) {
        None | Some(JsonValue::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| StorageError::MalformedQuery(format!("[{}] must be a non-negative integer", name))),
    }
}

/// `_source` 过滤:`false`、字段数组,或 `{includes, excludes}`
fn filter_source(source: &JsonValue, spec: Option<&JsonValue>) -> JsonValue {
    let (includes, excludes): (Option<Vec<&str>>, Vec<&str>) = match spec {
        None | Some(JsonValue::Bool(true)) => return source.clone(),
        Some(JsonValue::Bool(false)) => return json!({}),
        Some(JsonValue::Array(items)) => (Some(items.iter().filter_map(JsonValue::as_str).collect()), Vec::new()),
        Some(JsonValue::String(s)) => (Some(vec![s.as_str()]), Vec::new()),
        Some(JsonValue::Object(o)) => (
            o.get("includes")
                .and_then(JsonValue::as_array)
                .map(|a| a.iter().filter_map(JsonValue::as_str).collect()),
            o.get("excludes")
                .and_then(JsonValue::as_array)
                .map(|a| a.iter().filter_map(JsonValue::as_str).collect())
                .unwrap_or_default(),
        ),
        Some(_) => return source.clone(),
    };
    let Some(obj) = source.as_object() else {
        return source.clone();
    };
    let out: Map<String, JsonValue> = obj
        .iter()
        .filter(|(k, _)| includes.as_ref().map_or(true, |inc| inc.contains(&k.as_str())))
        .filter(|(k, _)| !excludes.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    JsonValue::Object(out)
}

/// 命中排序:`[{field: {order}}]` 或 `[{field: "asc"}]`,`_id` 可用
fn sort_hits(hits: &mut [&StoredDocument], sort: Option<&JsonValue>) -> StorageResult<()> {
    let Some(sort) = sort else {
        return Ok(());
    };
    let entries = match sort {
        JsonValue::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut keys: Vec<(String, bool)> = Vec::with_capacity(entries.len());
    for entry in &entries {
        match entry {
            JsonValue::String(field) => keys.push((field.clone(), false)),
            JsonValue::Object(o) if o.len() == 1 => {
                for (field, spec) in o {
                    let order = match spec {
                        JsonValue::String(s) => s.as_str(),
                        JsonValue::Object(so) => so.get("order").and_then(JsonValue::as_str).unwrap_or("asc"),
                        _ => "asc",
                    };
                    keys.push((field.clone(), order == "desc"));
                }
            }
            _ => return Err(StorageError::MalformedQuery("bad sort entry".to_string())),
        }
    }
    hits.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ord = if field == "_id" {
                let ord = a.id.cmp(&b.id);
                if *descending { ord.reverse() } else { ord }
            } else {
                // 缺失值总是排在最后
                match (a.fields.get(field), b.fields.get(field)) {
                    (Some(x), Some(y)) => {
                        let ord = x.compare(y).unwrap_or(Ordering::Equal);
                        if *descending { ord.reverse() } else { ord }
                    }
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

impl DocumentStoreClient for MemoryDocumentStore {
    fn search(&self, index: &str, body: &JsonValue) -> StorageResult<JsonValue> {
        let started = Instant::now();
        let handle = self.index(index)?;
        let guard = handle.read();

        let clause = match body.get("query") {
            None => Clause::MatchAll,
            Some(q) => parse_clause(q, &guard.mapping)?,
        };
        let aggs = match body.get("aggs").or_else(|| body.get("aggregations")) {
            None => Vec::new(),
            Some(JsonValue::Object(o)) => parse_aggs(o)?,
            Some(_) => return Err(StorageError::MalformedQuery("[aggs] must be an object".to_string())),
        };
        let size = usize_field(body, "size", 10)?;
        let from = usize_field(body, "from", 0)?;
        if from + size > self.max_result_window {
            return Err(StorageError::MalformedQuery(format!(
                "Result window is too large, from + size must be less than or equal to: [{}] but was [{}]",
                self.max_result_window,
                from + size
            )));
        }

        let mut matched: Vec<&StoredDocument> = guard.docs.values().filter(|d| clause.matches(d)).collect();
        let total = matched.len();
        let aggregations = evaluate_aggs(&aggs, &matched)?;

        sort_hits(&mut matched, body.get("sort"))?;
        let hits: Vec<JsonValue> = matched
            .iter()
            .skip(from)
            .take(size)
            .map(|d| {
                json!({
                    "_index": index,
                    "_id": d.id,
                    "_source": filter_source(&d.source, body.get("_source")),
                })
            })
            .collect();

        let track = body.get("track_total_hits");
        let (value, relation) = match track {
            Some(JsonValue::Bool(true)) | None => (total, "eq"),
            Some(JsonValue::Number(n)) => {
                let cap = n.as_u64().unwrap_or(10_000) as usize;
                if total > cap {
                    (cap, "gte")
                } else {
                    (total, "eq")
                }
            }
            Some(_) => (total.min(10_000), if total > 10_000 { "gte" } else { "eq" }),
        };

        let took = started.elapsed().as_millis() as u64;
        debug!(
            "Search on {} matched {} documents, returned {} hits in {} ms",
            index,
            total,
            hits.len(),
            took
        );

        let mut response = json!({
            "took": took,
            "timed_out": false,
            "hits": {
                "total": { "value": value, "relation": relation },
                "hits": hits,
            }
        });
        if !aggregations.is_empty() {
            response["aggregations"] = JsonValue::Object(aggregations);
        }
        Ok(response)
    }
}
