//! duoquery 命令行
//!
//! - `explain`:输出请求在两种后端上的编译结果,不连接后端
//! - `run`:把数据集装入嵌入式后端并执行请求

pub mod formatter;

pub use formatter::{Formatter, OutputFormat};

use anyhow::{bail, Context};
use duoquery_core::{
    seed_document_store, seed_sqlite, Backends, BackendKind, Dataset, DuoConfig, Engine,
    ExecutionOptions, MemoryDocumentStore, QueryOutput, QueryRequest, SqliteClient,
};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 执行时选择的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    /// 数据集中声明的后端
    Declared,
    Document,
    Relational,
    Both,
}

impl BackendChoice {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "declared" => BackendChoice::Declared,
            "document" => BackendChoice::Document,
            "relational" => BackendChoice::Relational,
            "both" => BackendChoice::Both,
            other => bail!("unknown backend {}, expected declared, document, relational or both", other),
        })
    }

    fn kinds(self, declared: BackendKind) -> Vec<BackendKind> {
        match self {
            BackendChoice::Declared => vec![declared],
            BackendChoice::Document => vec![BackendKind::Document],
            BackendChoice::Relational => vec![BackendKind::Relational],
            BackendChoice::Both => vec![BackendKind::Document, BackendKind::Relational],
        }
    }
}

/// 单个后端上的执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    Rows(Vec<Value>),
    Count(u64),
}

fn read_json(path: &Path, what: &str) -> anyhow::Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {} file {}", what, path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("malformed {} file {}", what, path.display()))
}

pub fn load_request(path: &Path) -> anyhow::Result<QueryRequest> {
    let value = read_json(path, "request")?;
    serde_json::from_value(value).with_context(|| format!("malformed request in {}", path.display()))
}

pub fn load_dataset(path: &Path) -> anyhow::Result<Dataset> {
    Ok(Dataset::from_json(read_json(path, "dataset")?)?)
}

/// # Brief
/// 编译请求并返回 explain 结果
///
/// # Arguments
/// * `config` - 引擎配置,决定 SQL 方言与分页默认值
/// * `dataset` - 提供集合定义与字段类型
/// * `request` - 查询请求
pub fn explain(config: &DuoConfig, dataset: &Dataset, request: &QueryRequest) -> anyhow::Result<Value> {
    let engine = Engine::new(config.clone(), Backends::new());
    engine.register_collection(dataset.collection.clone(), &dataset.field_types)?;
    Ok(engine.explain(request)?)
}

/// # Brief
/// 装载数据集并在选定后端上执行请求
///
/// 文档后端使用内存索引,关系后端按 `relational.url` 打开 SQLite。
///
/// # Returns
/// 每个后端一项结果,顺序与 `backend` 展开后的顺序一致
pub fn run(
    config: &DuoConfig,
    dataset: &Dataset,
    request: &QueryRequest,
    backend: BackendChoice,
    timeout: Option<Duration>,
) -> anyhow::Result<Vec<(BackendKind, RunOutput)>> {
    let kinds = backend.kinds(dataset.collection.backend);
    let mut backends = Backends::new();
    if kinds.contains(&BackendKind::Document) {
        let store = MemoryDocumentStore::new(config.document.max_result_window);
        seed_document_store(&store, dataset)?;
        backends = backends.with_document(Arc::new(store));
    }
    if kinds.contains(&BackendKind::Relational) {
        let client = SqliteClient::open(&config.relational)
            .with_context(|| format!("failed to open {}", config.relational.url))?;
        seed_sqlite(&client, dataset)?;
        backends = backends.with_relational(Arc::new(client));
    }

    let mut results = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let engine = Engine::new(config.clone(), backends.clone());
        engine.register_collection(dataset.definition_for(kind), &dataset.field_types)?;
        let options = ExecutionOptions {
            timeout,
            ..engine.default_options()
        };
        let (job, output) = engine.execute_tracked(request, &options);
        let output = match output.with_context(|| format!("query failed on the {} backend", kind))? {
            QueryOutput::Rows(stream) => RunOutput::Rows(
                stream
                    .collect_rows()?
                    .iter()
                    .map(|row| row.to_json())
                    .collect(),
            ),
            QueryOutput::Count(n) => RunOutput::Count(n),
        };
        info!("Job {} finished on the {} backend", job, kind);
        results.push((kind, output));
    }
    Ok(results)
}
