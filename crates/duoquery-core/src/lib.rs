//! duoquery 核心模块
//!
//! 提供 duoquery 的高级 API:集合注册、查询编译与执行、任务状态跟踪,
//! 以及嵌入式后端的数据集装载。

pub mod engine;
pub mod jobs;
pub mod seed;

pub use duoquery_common as common;
pub use duoquery_query as query;
pub use duoquery_storage as storage;
pub use duoquery_value as value;

pub use engine::Engine;
pub use jobs::{JobState, JobStatus, JobStatusStore};
pub use seed::{seed_document_store, seed_sqlite, Dataset};

pub use common::{BackendKind, DuoConfig, FieldType, SqlDialect};
pub use query::{
    Backends, CollectionDefinition, ExecutionOptions, QueryError, QueryOutput, QueryRequest,
    QueryResult, RowStream,
};
pub use storage::{MemoryDocumentStore, SqliteClient};
pub use value::{Document, Value};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// # Brief
/// 安装全局日志订阅者
///
/// 日志写到标准错误。环境变量 `RUST_LOG` 优先于配置的级别,重复调用不生效。
///
/// # Arguments
/// * `level` - 默认日志级别
/// * `json` - 是否输出 JSON 格式
///
/// # Returns
/// 本次调用是否安装了订阅者
pub fn init_logging(level: &str, json: bool) -> bool {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true).with_thread_ids(true))
            .try_init()
    };
    installed.is_ok()
}
