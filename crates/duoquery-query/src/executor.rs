//! 执行器模块
//!
//! 把编译结果分发到对应的后端客户端,并把结果归一化为行序列或计数:
//! - 命中查询返回惰性的 `RowStream`:文档后端逐页改写 `from`/`size`,
//!   关系后端逐批读取游标;每页整体解码成功后才产出,不会产出半页
//! - 分桶查询先归一化为桶树,再展开为行
//! - 计数查询返回单个整数
//!
//! 时间预算覆盖整个执行过程。后端错误不在这里重试。

use crate::buckets::{flatten, from_level_rows, from_search_response, Bucket};
use crate::compiler::{CompiledQuery, NativeQuery};
use crate::request::ProjectedField;
use crate::resolver::CollectionReference;
use crate::search::SearchQuery;
use crate::sql::{ColumnRole, SqlQuery, SqlStatement};
use crate::{QueryError, QueryResult};
use chrono::DateTime;
use duoquery_common::time::parse_datetime;
use duoquery_common::FieldType;
use duoquery_storage::dsl::json_path;
use duoquery_storage::relational::{CursorOptions, RowCursor, SqlRow, SqlValue};
use duoquery_storage::{DocumentStoreClient, RelationalClient};
use duoquery_value::geometry::{parse_geometry, to_geojson};
use duoquery_value::{json, Document, Value};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 后端客户端集合
#[derive(Clone, Default)]
pub struct Backends {
    pub document: Option<Arc<dyn DocumentStoreClient>>,
    pub relational: Option<Arc<dyn RelationalClient>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, client: Arc<dyn DocumentStoreClient>) -> Self {
        self.document = Some(client);
        self
    }

    pub fn with_relational(mut self, client: Arc<dyn RelationalClient>) -> Self {
        self.relational = Some(client);
        self
    }

    fn document(&self) -> QueryResult<&Arc<dyn DocumentStoreClient>> {
        self.document
            .as_ref()
            .ok_or_else(|| QueryError::backend(503, "no document store client is configured", None))
    }

    fn relational(&self) -> QueryResult<&Arc<dyn RelationalClient>> {
        self.relational
            .as_ref()
            .ok_or_else(|| QueryError::backend(503, "no relational client is configured", None))
    }
}

/// 执行选项
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// 整个执行过程的时间预算
    pub timeout: Option<Duration>,
    /// 文档后端每页命中数;关系游标每批预取行数
    pub page_size: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            page_size: 256,
        }
    }
}

/// 时间预算
#[derive(Debug, Clone, Copy)]
struct Budget {
    started: Instant,
    timeout: Option<Duration>,
}

impl Budget {
    fn start(timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    fn check(&self) -> QueryResult<()> {
        let Some(budget) = self.timeout else {
            return Ok(());
        };
        let elapsed = self.started.elapsed();
        if elapsed > budget {
            warn!(
                "Query exceeded its time budget: {} ms > {} ms",
                elapsed.as_millis(),
                budget.as_millis()
            );
            return Err(QueryError::Timeout {
                budget_ms: budget.as_millis() as u64,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|budget| budget.saturating_sub(self.started.elapsed()))
    }
}

/// 惰性行序列
///
/// 产出一个错误后不再产出任何行。
pub struct RowStream {
    inner: Box<dyn Iterator<Item = QueryResult<Document>> + Send>,
    failed: bool,
}

impl RowStream {
    pub fn new(inner: impl Iterator<Item = QueryResult<Document>> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            failed: false,
        }
    }

    pub fn from_rows(rows: Vec<Document>) -> Self {
        Self::new(rows.into_iter().map(Ok))
    }

    /// 读取全部行,遇到第一个错误即返回
    pub fn collect_rows(self) -> QueryResult<Vec<Document>> {
        self.collect()
    }
}

impl Iterator for RowStream {
    type Item = QueryResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.inner.next();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").field("failed", &self.failed).finish()
    }
}

/// 执行结果
#[derive(Debug)]
pub enum QueryOutput {
    Rows(RowStream),
    Count(u64),
}

impl QueryOutput {
    /// # Brief
    /// 取出全部行;计数结果返回 Validation 错误
    pub fn into_rows(self) -> QueryResult<Vec<Document>> {
        match self {
            QueryOutput::Rows(stream) => stream.collect_rows(),
            QueryOutput::Count(_) => Err(QueryError::Validation(
                "count query produces no rows".to_string(),
            )),
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            QueryOutput::Count(n) => Some(*n),
            QueryOutput::Rows(_) => None,
        }
    }
}

// ============================================================================
// 值解码
// ============================================================================

fn decode_error(field: &ProjectedField, raw: impl std::fmt::Display) -> QueryError {
    QueryError::decode(format!(
        "cannot decode {} value {} for field {}",
        field.field_type, raw, field.name
    ))
}

fn geometry_value(field: &ProjectedField, raw: &JsonValue) -> QueryResult<Value> {
    let geometry = parse_geometry(raw).map_err(|e| decode_error(field, e))?;
    Ok(json::from_json(&to_geojson(&geometry)))
}

/// 文档来源中的值按字段类型解码;null 返回 None
fn value_from_json(field: &ProjectedField, raw: &JsonValue) -> QueryResult<Option<Value>> {
    if raw.is_null() {
        return Ok(None);
    }
    let value = match field.field_type {
        FieldType::Keyword => match raw {
            JsonValue::String(s) => Value::from(s.as_str()),
            JsonValue::Number(_) | JsonValue::Bool(_) => Value::from(raw.to_string()),
            _ => return Err(decode_error(field, raw)),
        },
        FieldType::Integer => raw.as_i64().map(Value::Int64).ok_or_else(|| decode_error(field, raw))?,
        FieldType::Float => raw.as_f64().map(Value::Float64).ok_or_else(|| decode_error(field, raw))?,
        FieldType::Date => {
            let dt = match raw {
                JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
                JsonValue::String(s) => parse_datetime(s),
                _ => None,
            };
            Value::DateTime(dt.ok_or_else(|| decode_error(field, raw))?)
        }
        FieldType::Boolean => match raw {
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::String(s) if s == "true" => Value::Boolean(true),
            JsonValue::String(s) if s == "false" => Value::Boolean(false),
            _ => return Err(decode_error(field, raw)),
        },
        FieldType::GeoPoint | FieldType::GeoShape => geometry_value(field, raw)?,
    };
    Ok(Some(value))
}

/// 关系后端单元格按字段类型解码;NULL 返回 None
fn value_from_sql(field: &ProjectedField, raw: &SqlValue) -> QueryResult<Option<Value>> {
    let describe = || format!("{:?}", raw);
    let value = match (field.field_type, raw) {
        (_, SqlValue::Null) => return Ok(None),
        (FieldType::Keyword, SqlValue::Text(s)) => Value::from(s.as_str()),
        (FieldType::Keyword, SqlValue::Integer(n)) => Value::from(n.to_string()),
        (FieldType::Keyword, SqlValue::Float(f)) => Value::from(f.to_string()),
        (FieldType::Integer, v) => v.as_i64().map(Value::Int64).ok_or_else(|| decode_error(field, describe()))?,
        (FieldType::Float, v) => v.as_f64().map(Value::Float64).ok_or_else(|| decode_error(field, describe()))?,
        (FieldType::Date, SqlValue::Text(s)) => {
            Value::DateTime(parse_datetime(s).ok_or_else(|| decode_error(field, describe()))?)
        }
        (FieldType::Date, SqlValue::Integer(ms)) => Value::DateTime(
            DateTime::from_timestamp_millis(*ms).ok_or_else(|| decode_error(field, describe()))?,
        ),
        (FieldType::Boolean, SqlValue::Integer(n)) => Value::Boolean(*n != 0),
        (FieldType::Boolean, SqlValue::Text(s)) => match s.as_str() {
            "true" | "t" => Value::Boolean(true),
            "false" | "f" => Value::Boolean(false),
            _ => return Err(decode_error(field, describe())),
        },
        (FieldType::GeoPoint | FieldType::GeoShape, SqlValue::Text(s)) => {
            geometry_value(field, &JsonValue::String(s.clone()))?
        }
        _ => return Err(decode_error(field, describe())),
    };
    Ok(Some(value))
}

// ============================================================================
// 文档后端分页
// ============================================================================

struct DocumentPager {
    client: Arc<dyn DocumentStoreClient>,
    collection: Arc<CollectionReference>,
    index: String,
    body: JsonValue,
    projection: Vec<ProjectedField>,
    next_from: usize,
    remaining: usize,
    page_size: usize,
    buffer: VecDeque<Document>,
    budget: Budget,
    exhausted: bool,
}

impl DocumentPager {
    fn decode_hit(&self, hit: &JsonValue) -> QueryResult<Document> {
        let source = hit
            .get("_source")
            .ok_or_else(|| QueryError::decode("hit without _source"))?;
        let mut doc = Document::new();
        for field in &self.projection {
            let path = self.collection.physical(&field.name)?;
            if let Some(raw) = json_path(source, path) {
                if let Some(value) = value_from_json(field, raw)? {
                    doc.insert(field.name.as_str(), value);
                }
            }
        }
        Ok(doc)
    }

    fn fetch_page(&mut self) -> QueryResult<()> {
        self.budget.check()?;
        let size = self.page_size.min(self.remaining);
        let mut body = self.body.clone();
        body["from"] = JsonValue::from(self.next_from);
        body["size"] = JsonValue::from(size);
        let response = self.client.search(&self.index, &body)?;
        self.budget.check()?;

        let hits = response
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| QueryError::decode("search response has no hits array"))?;
        let page = hits
            .iter()
            .map(|hit| self.decode_hit(hit))
            .collect::<QueryResult<Vec<_>>>()?;
        debug!(
            "Fetched page of {} hits from {} at offset {}",
            page.len(),
            self.index,
            self.next_from
        );
        if page.len() < size {
            self.exhausted = true;
        }
        self.next_from += page.len();
        self.remaining = self.remaining.saturating_sub(page.len());
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for DocumentPager {
    type Item = QueryResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(doc) = self.buffer.pop_front() {
            return Some(Ok(doc));
        }
        if self.exhausted || self.remaining == 0 {
            return None;
        }
        if let Err(e) = self.fetch_page() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

// ============================================================================
// 关系后端游标
// ============================================================================

struct SqlRowStream {
    cursor: Box<dyn RowCursor>,
    statement: SqlStatement,
    projection: Vec<ProjectedField>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl SqlRowStream {
    fn decode_row(&self, row: &SqlRow) -> QueryResult<Document> {
        let mut doc = Document::new();
        for field in &self.projection {
            let position = self
                .statement
                .position(&ColumnRole::Field(field.name.clone()))
                .ok_or_else(|| QueryError::decode(format!("statement has no column for {}", field.name)))?;
            let raw = row
                .get(position)
                .ok_or_else(|| QueryError::decode(format!("row is missing column {}", position)))?;
            if let Some(value) = value_from_sql(field, raw)? {
                doc.insert(field.name.as_str(), value);
            }
        }
        Ok(doc)
    }

    fn fetch_batch(&mut self) -> QueryResult<()> {
        match self.cursor.next_batch()? {
            None => self.exhausted = true,
            Some(rows) => {
                let batch = rows
                    .iter()
                    .map(|row| self.decode_row(row))
                    .collect::<QueryResult<Vec<_>>>()?;
                if batch.is_empty() {
                    self.exhausted = true;
                }
                self.buffer.extend(batch);
            }
        }
        Ok(())
    }
}

impl Iterator for SqlRowStream {
    type Item = QueryResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(Ok(doc));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_batch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

// ============================================================================
// 执行器
// ============================================================================

/// 查询执行器
#[derive(Clone)]
pub struct QueryExecutor {
    backends: Backends,
}

impl QueryExecutor {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// # Brief
    /// 执行编译后的查询
    ///
    /// # Arguments
    /// * `compiled` - 编译结果
    /// * `options` - 时间预算与分页大小
    ///
    /// # Returns
    /// 命中或分桶查询返回行序列,计数查询返回计数
    pub fn run(&self, compiled: &CompiledQuery, options: &ExecutionOptions) -> QueryResult<QueryOutput> {
        let budget = Budget::start(options.timeout);
        let query = &compiled.query;
        debug!(
            "Executing query on {} ({:?})",
            compiled.collection.name(),
            compiled.native.backend()
        );
        if query.is_aggregation() {
            let buckets = self.buckets_with(compiled, options, budget)?;
            return Ok(QueryOutput::Rows(RowStream::from_rows(flatten(
                &query.aggregations,
                &buckets,
            )?)));
        }
        match &compiled.native {
            NativeQuery::Search(search) if query.count_only => {
                Ok(QueryOutput::Count(self.search_count(search, budget)?))
            }
            NativeQuery::Search(search) => {
                let pager = DocumentPager {
                    client: self.backends.document()?.clone(),
                    collection: compiled.collection.clone(),
                    index: search.index.clone(),
                    body: search.body.clone(),
                    projection: query.projection.clone(),
                    next_from: query.offset,
                    remaining: query.size,
                    page_size: options.page_size.max(1),
                    buffer: VecDeque::new(),
                    budget,
                    exhausted: false,
                };
                Ok(QueryOutput::Rows(RowStream::new(pager)))
            }
            NativeQuery::Sql(sql) if query.count_only => {
                Ok(QueryOutput::Count(self.sql_count(sql, options, budget)?))
            }
            NativeQuery::Sql(sql) => {
                let statement = single_statement(sql)?.clone();
                let cursor = self.backends.relational()?.open_cursor(
                    statement.bound(),
                    CursorOptions {
                        batch_size: options.page_size.max(1),
                        timeout: budget.remaining(),
                    },
                )?;
                Ok(QueryOutput::Rows(RowStream::new(SqlRowStream {
                    cursor,
                    statement,
                    projection: query.projection.clone(),
                    buffer: VecDeque::new(),
                    exhausted: false,
                })))
            }
        }
    }

    /// # Brief
    /// 执行分桶查询并返回归一化的桶树
    pub fn run_buckets(&self, compiled: &CompiledQuery, options: &ExecutionOptions) -> QueryResult<Vec<Bucket>> {
        if !compiled.query.is_aggregation() {
            return Err(QueryError::Validation(
                "query has no aggregations".to_string(),
            ));
        }
        self.buckets_with(compiled, options, Budget::start(options.timeout))
    }

    fn buckets_with(
        &self,
        compiled: &CompiledQuery,
        options: &ExecutionOptions,
        budget: Budget,
    ) -> QueryResult<Vec<Bucket>> {
        let levels = &compiled.query.aggregations;
        match &compiled.native {
            NativeQuery::Search(search) => {
                let response = self.search(search, budget)?;
                let aggregations = response
                    .get("aggregations")
                    .ok_or_else(|| QueryError::decode("search response has no aggregations"))?;
                from_search_response(levels, aggregations)
            }
            NativeQuery::Sql(sql) => {
                let client = self.backends.relational()?;
                let mut rows = Vec::with_capacity(sql.statements.len());
                for statement in &sql.statements {
                    budget.check()?;
                    rows.push(client.fetch_all(
                        statement.bound(),
                        CursorOptions {
                            batch_size: options.page_size.max(1),
                            timeout: budget.remaining(),
                        },
                    )?);
                }
                budget.check()?;
                from_level_rows(levels, &sql.statements, rows)
            }
        }
    }

    fn search(&self, search: &SearchQuery, budget: Budget) -> QueryResult<JsonValue> {
        budget.check()?;
        let response = self.backends.document()?.search(&search.index, &search.body)?;
        budget.check()?;
        Ok(response)
    }

    fn search_count(&self, search: &SearchQuery, budget: Budget) -> QueryResult<u64> {
        let response = self.search(search, budget)?;
        response
            .get("hits")
            .and_then(|h| h.get("total"))
            .and_then(|t| t.get("value").or(Some(t)))
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| QueryError::decode("search response has no total hit count"))
    }

    fn sql_count(&self, sql: &SqlQuery, options: &ExecutionOptions, budget: Budget) -> QueryResult<u64> {
        let statement = single_statement(sql)?;
        let rows = self.backends.relational()?.fetch_all(
            statement.bound(),
            CursorOptions {
                batch_size: options.page_size.max(1),
                timeout: budget.remaining(),
            },
        )?;
        budget.check()?;
        rows.first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| QueryError::decode("count statement returned no count"))
    }
}

fn single_statement(sql: &SqlQuery) -> QueryResult<&SqlStatement> {
    match sql.statements.as_slice() {
        [statement] => Ok(statement),
        other => Err(QueryError::decode(format!(
            "expected a single statement, found {}",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::request::{Query, QueryRequest};
    use crate::resolver::{CollectionDefinition, FieldTypeCache};
    use duoquery_common::{CompilerConfig, SqlDialect};
    use duoquery_storage::{MemoryDocumentStore, SqliteClient, StorageResult};
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collection(backend: &str) -> (Arc<CollectionReference>, FieldTypeCache) {
        let def: CollectionDefinition = serde_json::from_value(json!({
            "name": "items",
            "backend": backend,
            "target": "items",
            "id_field": "id",
            "fields": {"id": null, "n": null, "tag": null}
        }))
        .unwrap();
        let cache = FieldTypeCache::new();
        cache.register("items", "id", FieldType::Keyword);
        cache.register("items", "n", FieldType::Integer);
        cache.register("items", "tag", FieldType::Keyword);
        (Arc::new(CollectionReference::new(def)), cache)
    }

    fn compiled(backend: &str, request: serde_json::Value) -> CompiledQuery {
        let (collection, cache) = collection(backend);
        let request: QueryRequest = serde_json::from_value(request).unwrap();
        let query = Query::build(&request, &collection, &cache, &CompilerConfig::default()).unwrap();
        compile(Arc::new(query), collection, SqlDialect::Sqlite).unwrap()
    }

    fn document_store() -> Arc<MemoryDocumentStore> {
        let store = MemoryDocumentStore::new(10_000);
        let mapping: IndexMap<String, FieldType> = [
            ("id".to_string(), FieldType::Keyword),
            ("n".to_string(), FieldType::Integer),
            ("tag".to_string(), FieldType::Keyword),
        ]
        .into_iter()
        .collect();
        store.create_index("items", mapping).unwrap();
        for i in 0..7 {
            store
                .index_document("items", &format!("i{}", i), json!({"id": format!("i{}", i), "n": i, "tag": if i % 2 == 0 { "even" } else { "odd" }}))
                .unwrap();
        }
        Arc::new(store)
    }

    fn sqlite() -> Arc<SqliteClient> {
        let client = SqliteClient::open_in_memory(2).unwrap();
        client
            .execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY, n INTEGER, tag TEXT);")
            .unwrap();
        for i in 0..7 {
            client
                .execute(
                    "INSERT INTO items (id, n, tag) VALUES (?1, ?2, ?3)",
                    &[
                        duoquery_storage::SqlParam::Text(format!("i{}", i)),
                        duoquery_storage::SqlParam::Integer(i),
                        duoquery_storage::SqlParam::Text(if i % 2 == 0 { "even" } else { "odd" }.to_string()),
                    ],
                )
                .unwrap();
        }
        Arc::new(client)
    }

    /// 记录调用次数的文档后端
    struct CountingStore {
        inner: Arc<MemoryDocumentStore>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl DocumentStoreClient for CountingStore {
        fn search(&self, index: &str, body: &JsonValue) -> StorageResult<JsonValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.search(index, body)
        }
    }

    #[test]
    fn test_document_paging_is_lazy() {
        let store = Arc::new(CountingStore {
            inner: document_store(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let executor = QueryExecutor::new(Backends::new().with_document(store.clone()));
        let compiled = compiled("document", json!({"collection": "items", "offset": 1, "size": 5}));
        let options = ExecutionOptions {
            timeout: None,
            page_size: 2,
        };
        let QueryOutput::Rows(mut rows) = executor.run(&compiled, &options).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        let first = rows.next().unwrap().unwrap();
        assert_eq!(first.get("id"), Some(&Value::from("i1")));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        let rest: Vec<Document> = rows.map(Result::unwrap).collect();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[3].get("n"), Some(&Value::Int64(5)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sql_rows_and_count() {
        let executor = QueryExecutor::new(Backends::new().with_relational(sqlite()));
        let compiled_rows = compiled(
            "relational",
            json!({"collection": "items", "filter": [[{"field": "tag", "op": "=", "value": "odd"}]]}),
        );
        let rows = executor
            .run(&compiled_rows, &ExecutionOptions { timeout: None, page_size: 1 })
            .unwrap()
            .into_rows()
            .unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r.get("id").and_then(Value::as_str)).collect();
        assert_eq!(ids, vec!["i1", "i3", "i5"]);

        let compiled_count = compiled(
            "relational",
            json!({"collection": "items", "count_only": true,
                   "filter": [[{"field": "n", "op": ">=", "value": 3}]]}),
        );
        let output = executor.run(&compiled_count, &ExecutionOptions::default()).unwrap();
        assert_eq!(output.count(), Some(4));
    }

    #[test]
    fn test_document_count() {
        let executor = QueryExecutor::new(Backends::new().with_document(document_store()));
        let compiled = compiled(
            "document",
            json!({"collection": "items", "count_only": true,
                   "filter": [[{"field": "tag", "op": "!=", "value": "odd"}]]}),
        );
        assert_eq!(executor.run(&compiled, &ExecutionOptions::default()).unwrap().count(), Some(4));
    }

    #[test]
    fn test_timeout_and_missing_backend() {
        let store = Arc::new(CountingStore {
            inner: document_store(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
        });
        let executor = QueryExecutor::new(Backends::new().with_document(store));
        let compiled_rows = compiled("document", json!({"collection": "items"}));
        let options = ExecutionOptions {
            timeout: Some(Duration::from_millis(5)),
            page_size: 10,
        };
        let QueryOutput::Rows(mut rows) = executor.run(&compiled_rows, &options).unwrap() else {
            panic!("expected rows");
        };
        assert!(matches!(rows.next(), Some(Err(QueryError::Timeout { budget_ms: 5, .. }))));
        assert!(rows.next().is_none());

        let executor = QueryExecutor::new(Backends::new());
        match executor.run(&compiled_rows, &ExecutionOptions::default()) {
            Ok(QueryOutput::Rows(mut rows)) => match rows.next() {
                Some(Err(QueryError::Backend(failure))) => assert_eq!(failure.status, 503),
                other => panic!("unexpected {:?}", other),
            },
            Err(QueryError::Backend(failure)) => assert_eq!(failure.status, 503),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_failure_yields_no_partial_page() {
        let json_field = ProjectedField {
            name: "n".to_string(),
            field_type: FieldType::Integer,
        };
        assert!(matches!(
            value_from_json(&json_field, &json!("seven")),
            Err(QueryError::Backend(ref f)) if f.status == 502
        ));
        assert_eq!(value_from_json(&json_field, &JsonValue::Null).unwrap(), None);
        let geo = ProjectedField {
            name: "loc".to_string(),
            field_type: FieldType::GeoPoint,
        };
        let value = value_from_sql(&geo, &SqlValue::Text("{\"type\":\"Point\",\"coordinates\":[1.0,2.0]}".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(value.get("type"), Some(&Value::from("Point")));
    }
}
