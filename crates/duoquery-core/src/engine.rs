//! 查询引擎
//!
//! `Engine` 把集合解析、查询构造、编译与执行串在一起,并持有任务状态存储。
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use duoquery_core::{Backends, Engine, QueryRequest};
//!
//! let engine = Engine::new(DuoConfig::default(), Backends::new().with_relational(client));
//! engine.register_collection(definition, &field_types)?;
//! let rows = engine.execute(&request, &engine.default_options())?.into_rows()?;
//! ```

use crate::jobs::{JobState, JobStatus, JobStatusStore};
use duoquery_common::{BackendKind, DuoConfig, FieldType, SqlDialect};
use duoquery_query::compiler::{compile, CompiledQuery};
use duoquery_query::search::SearchCompiler;
use duoquery_query::sql::{Ident, SqlCompiler};
use duoquery_query::{
    Backends, CollectionDefinition, CollectionReference, CollectionResolver, CollectionStore,
    ExecutionOptions, FieldTypeCache, FieldTypeLookup, MemoryCollectionStore, Query, QueryError,
    QueryExecutor, QueryOutput, QueryRequest, QueryResult, RowStream, ShapeTarget,
};
use duoquery_storage::dsl::json_path;
use duoquery_storage::{BoundStatement, CursorOptions, DocumentStoreClient, RelationalClient, SqlValue};
use duoquery_value::ShapeClass;
use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 查询引擎
pub struct Engine {
    config: DuoConfig,
    resolver: CollectionResolver,
    field_types: Arc<FieldTypeCache>,
    executor: QueryExecutor,
    jobs: JobStatusStore,
}

impl Engine {
    /// # Brief
    /// 使用内存集合存储创建引擎
    ///
    /// # Arguments
    /// * `config` - 引擎配置
    /// * `backends` - 已连接的后端客户端,缺失的后端在执行时报告 503
    pub fn new(config: DuoConfig, backends: Backends) -> Self {
        Self::with_store(config, Arc::new(MemoryCollectionStore::new()), backends)
    }

    /// 使用外部集合存储创建引擎
    pub fn with_store(config: DuoConfig, store: Arc<dyn CollectionStore>, backends: Backends) -> Self {
        let jobs = JobStatusStore::from_config(&config.jobs);
        Self {
            config,
            resolver: CollectionResolver::new(store),
            field_types: Arc::new(FieldTypeCache::new()),
            executor: QueryExecutor::new(backends),
            jobs,
        }
    }

    pub fn config(&self) -> &DuoConfig {
        &self.config
    }

    pub fn resolver(&self) -> &CollectionResolver {
        &self.resolver
    }

    pub fn field_types(&self) -> &FieldTypeCache {
        &self.field_types
    }

    /// 按配置得到的默认执行选项
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout: None,
            page_size: self.config.relational.prefetch_rows,
        }
    }

    /// # Brief
    /// 注册集合并登记字段类型
    ///
    /// # Arguments
    /// * `definition` - 集合定义
    /// * `field_types` - 逻辑字段名 → 声明类型
    pub fn register_collection(
        &self,
        definition: CollectionDefinition,
        field_types: &IndexMap<String, FieldType>,
    ) -> QueryResult<Arc<CollectionReference>> {
        let collection = Arc::new(CollectionReference::new(definition));
        self.resolver.store().put(collection.clone())?;
        self.field_types.invalidate_collection(collection.name());
        self.field_types.register_all(collection.name(), field_types);
        info!(
            "Registered collection {} on {} target {}",
            collection.name(),
            collection.backend(),
            collection.target()
        );
        Ok(collection)
    }

    /// # Brief
    /// 校验请求并构造查询,不接触后端
    ///
    /// # Returns
    /// 查询与其所属集合;`offset + size` 超出结果窗口时返回 Validation
    pub fn build_query(&self, request: &QueryRequest) -> QueryResult<(Arc<Query>, Arc<CollectionReference>)> {
        let collection = self.resolver.resolve(&request.collection)?;
        let query = Query::build(request, &collection, self.field_types.as_ref(), &self.config.compiler)?;
        let window = self.config.document.max_result_window;
        if !query.count_only && !query.is_aggregation() && query.offset + query.size > window {
            return Err(QueryError::Validation(format!(
                "offset + size must not exceed {}, got {}",
                window,
                query.offset + query.size
            )));
        }
        Ok((Arc::new(query), collection))
    }

    fn dialect(&self) -> SqlDialect {
        self.executor
            .backends()
            .relational
            .as_ref()
            .map(|client| client.dialect())
            .unwrap_or(self.config.compiler.sql_dialect)
    }

    /// # Brief
    /// 编译请求
    ///
    /// 未推断的几何形状会先从后端采样一条记录推断。
    /// 关系查询使用已连接客户端的方言,没有客户端时使用配置中的方言。
    pub fn compile(&self, request: &QueryRequest) -> QueryResult<CompiledQuery> {
        let collection = self.resolver.resolve(&request.collection)?;
        self.ensure_shapes(&collection)?;
        let (query, collection) = self.build_query(request)?;
        let started = Instant::now();
        let compiled = compile(query, collection, self.dialect())?;
        debug!(
            "Compiled query on {} in {} us",
            compiled.collection.name(),
            started.elapsed().as_micros()
        );
        Ok(compiled)
    }

    /// 编译并执行请求
    pub fn execute(&self, request: &QueryRequest, options: &ExecutionOptions) -> QueryResult<QueryOutput> {
        let compiled = self.compile(request)?;
        self.execute_on(&compiled, options)
    }

    /// 执行已编译的查询
    pub fn execute_on(&self, compiled: &CompiledQuery, options: &ExecutionOptions) -> QueryResult<QueryOutput> {
        self.executor.run(compiled, options)
    }

    /// # Brief
    /// 执行请求并在任务状态存储中记录进度
    ///
    /// 行在返回前全部读取,任务状态反映最终结果。
    ///
    /// # Returns
    /// 任务标识与执行结果
    pub fn execute_tracked(
        &self,
        request: &QueryRequest,
        options: &ExecutionOptions,
    ) -> (Uuid, QueryResult<QueryOutput>) {
        self.jobs.purge_expired();
        let backend = self
            .resolver
            .resolve(&request.collection)
            .ok()
            .map(|c| c.backend());
        let id = self
            .jobs
            .insert(JobStatus::running(request.collection.clone(), backend));

        let result = self.execute(request, options).and_then(|output| match output {
            QueryOutput::Rows(stream) => {
                let rows = stream.collect_rows()?;
                Ok((
                    JobState::Completed {
                        rows: Some(rows.len()),
                        count: None,
                    },
                    QueryOutput::Rows(RowStream::from_rows(rows)),
                ))
            }
            QueryOutput::Count(n) => Ok((
                JobState::Completed {
                    rows: None,
                    count: Some(n),
                },
                QueryOutput::Count(n),
            )),
        });

        match result {
            Ok((state, output)) => {
                self.jobs.update(&id, state);
                (id, Ok(output))
            }
            Err(e) => {
                warn!("Tracked job {} failed: {}", id, e);
                self.jobs.update(
                    &id,
                    JobState::Failed {
                        message: e.to_string(),
                    },
                );
                (id, Err(e))
            }
        }
    }

    pub fn job_status(&self, id: &Uuid) -> Option<JobStatus> {
        self.jobs.get(id)
    }

    /// # Brief
    /// 给出请求在两个后端上的编译结果,不接触任何后端
    ///
    /// # Returns
    /// `{collection, backend, document: {index, body}, relational: {dialect, statements}}`
    pub fn explain(&self, request: &QueryRequest) -> QueryResult<JsonValue> {
        let (query, collection) = self.build_query(request)?;
        let search = SearchCompiler::new().compile(&query, &collection)?;
        let sql = SqlCompiler::new(self.config.compiler.sql_dialect).compile(&query, &collection)?;
        Ok(json!({
            "collection": collection.name(),
            "backend": collection.backend(),
            "document": {
                "index": search.index,
                "body": search.body,
            },
            "relational": {
                "dialect": sql.dialect,
                "statements": sql.statements,
            },
        }))
    }

    /// # Brief
    /// 推断集合中尚未分类的几何/中心点形状
    ///
    /// 声明为点类型的字段直接记为点;其余字段从所在后端采样一条非空记录。
    /// 后端未连接、没有样本或样本无法分类时槽位保持未知。
    pub fn ensure_shapes(&self, collection: &CollectionReference) -> QueryResult<()> {
        for target in [ShapeTarget::Geometry, ShapeTarget::Centroid] {
            let Some(field) = collection.shape_field(target) else {
                continue;
            };
            if collection.shape(target).is_some() {
                continue;
            }
            match self.field_types.field_type(collection, field) {
                Ok(FieldType::GeoPoint) => {
                    collection.set_shape(target, ShapeClass::Point);
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }
            match self.sample(collection, field)? {
                Some(sample) => {
                    if let Err(e) = self.resolver.infer_shape(collection, &sample, target) {
                        warn!("{}", e);
                    }
                }
                None => debug!(
                    "No sample for {} of collection {}, shape stays unknown",
                    field,
                    collection.name()
                ),
            }
        }
        Ok(())
    }

    fn sample(&self, collection: &CollectionReference, field: &str) -> QueryResult<Option<JsonValue>> {
        let path = collection.physical(field)?;
        let backends = self.executor.backends();
        match collection.backend() {
            BackendKind::Document => {
                let Some(client) = backends.document.as_ref() else {
                    return Ok(None);
                };
                let body = json!({
                    "query": {"exists": {"field": path}},
                    "size": 1,
                    "_source": {"includes": [path]},
                });
                let response = client.search(collection.target(), &body)?;
                Ok(response
                    .get("hits")
                    .and_then(|h| h.get("hits"))
                    .and_then(|h| h.get(0))
                    .and_then(|hit| hit.get("_source"))
                    .and_then(|source| json_path(source, path))
                    .cloned())
            }
            BackendKind::Relational => {
                let Some(client) = backends.relational.as_ref() else {
                    return Ok(None);
                };
                let column = Ident::parse(path)?;
                let table = Ident::parse(collection.target())?;
                let select = match client.dialect() {
                    SqlDialect::Sqlite => column.to_string(),
                    SqlDialect::Postgres => format!("ST_AsGeoJSON({})", column),
                };
                let statement = BoundStatement::new(
                    format!(
                        "SELECT {} FROM {} WHERE {} IS NOT NULL LIMIT 1",
                        select, table, column
                    ),
                    Vec::new(),
                );
                let rows = client.fetch_all(statement, CursorOptions::default())?;
                Ok(rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(SqlValue::as_str)
                    .map(|text| JsonValue::String(text.to_string())))
            }
        }
    }
}
