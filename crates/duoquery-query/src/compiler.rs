//! 编译分发模块
//!
//! 按集合所在后端选择编译器,产出携带原查询与集合引用的 `CompiledQuery`。
//! 编译结果不可变,可以在多个执行之间共享。

use crate::request::Query;
use crate::resolver::CollectionReference;
use crate::search::{SearchCompiler, SearchQuery};
use crate::sql::{SqlCompiler, SqlQuery};
use crate::QueryResult;
use duoquery_common::{BackendKind, SqlDialect};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// 后端原生查询
#[derive(Debug, Clone, PartialEq)]
pub enum NativeQuery {
    Search(SearchQuery),
    Sql(SqlQuery),
}

impl NativeQuery {
    pub fn backend(&self) -> BackendKind {
        match self {
            NativeQuery::Search(_) => BackendKind::Document,
            NativeQuery::Sql(_) => BackendKind::Relational,
        }
    }
}

/// 编译后的查询
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub query: Arc<Query>,
    pub collection: Arc<CollectionReference>,
    pub native: NativeQuery,
}

impl CompiledQuery {
    /// # Brief
    /// 可读的编译结果:搜索请求体,或 SQL 文本与绑定参数
    pub fn explain(&self) -> JsonValue {
        match &self.native {
            NativeQuery::Search(search) => json!({
                "backend": "document",
                "collection": self.collection.name(),
                "index": search.index,
                "body": search.body,
            }),
            NativeQuery::Sql(sql) => json!({
                "backend": "relational",
                "collection": self.collection.name(),
                "dialect": sql.dialect,
                "statements": sql.statements,
            }),
        }
    }
}

/// # Brief
/// 编译查询
///
/// # Arguments
/// * `query` - 已校验的查询
/// * `collection` - 查询所属集合,决定目标后端
/// * `dialect` - 关系后端使用的 SQL 方言
pub fn compile(
    query: Arc<Query>,
    collection: Arc<CollectionReference>,
    dialect: SqlDialect,
) -> QueryResult<CompiledQuery> {
    let native = match collection.backend() {
        BackendKind::Document => {
            NativeQuery::Search(SearchCompiler::new().compile(&query, &collection)?)
        }
        BackendKind::Relational => NativeQuery::Sql(SqlCompiler::new(dialect).compile(&query, &collection)?),
    };
    Ok(CompiledQuery {
        query,
        collection,
        native,
    })
}
