//! 配置模块
//!
//! 本模块定义了 duoquery 的所有配置选项:
//! - 编译器配置(默认分桶数量、分页上限、SQL 方言)
//! - 关系型后端配置(连接地址、连接池、预取行数)
//! - 文档后端配置(结果窗口上限)
//! - 任务状态存储配置
//! - 日志配置
//!
//! 支持从 TOML 文件加载配置,所有字段均有默认值。

use crate::error::{DuoError, DuoResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// 主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuoConfig {
    /// 编译器配置
    #[serde(default)]
    pub compiler: CompilerConfig,

    /// 关系型后端配置
    #[serde(default)]
    pub relational: RelationalConfig,

    /// 文档后端配置
    #[serde(default)]
    pub document: DocumentConfig,

    /// 任务状态存储配置
    #[serde(default)]
    pub jobs: JobConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl DuoConfig {
    /// # Brief
    /// 从 TOML 文件加载配置
    ///
    /// # Arguments
    /// * `path` - 配置文件路径
    ///
    /// # Returns
    /// 解析并验证通过的配置
    pub fn from_file(path: impl AsRef<Path>) -> DuoResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> DuoResult<Self> {
        let config: DuoConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Brief
    /// 验证配置项之间的约束
    pub fn validate(&self) -> DuoResult<()> {
        let c = &self.compiler;
        if c.default_bucket_size == 0 || c.default_bucket_size > c.max_bucket_size {
            return Err(DuoError::Config(format!(
                "compiler.default_bucket_size must be in 1..={}",
                c.max_bucket_size
            )));
        }
        if c.default_page_size == 0 || c.default_page_size > c.max_page_size {
            return Err(DuoError::Config(format!(
                "compiler.default_page_size must be in 1..={}",
                c.max_page_size
            )));
        }
        if self.relational.pool_size == 0 {
            return Err(DuoError::Config(
                "relational.pool_size must be at least 1".to_string(),
            ));
        }
        if self.relational.prefetch_rows == 0 {
            return Err(DuoError::Config(
                "relational.prefetch_rows must be at least 1".to_string(),
            ));
        }
        if self.document.max_result_window < c.max_page_size {
            return Err(DuoError::Config(
                "document.max_result_window must not be smaller than compiler.max_page_size"
                    .to_string(),
            ));
        }
        if self.jobs.capacity == 0 {
            return Err(DuoError::Config("jobs.capacity must be at least 1".to_string()));
        }
        if self.jobs.ttl_secs == 0 {
            warn!("jobs.ttl_secs is 0, tracked job status expires as soon as it is recorded");
        }
        Ok(())
    }
}

/// SQL 方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Sqlite,
    Postgres,
}

/// 编译器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// 未指定 size 时每层的分桶数量 (默认: 10)
    #[serde(default = "default_bucket_size")]
    pub default_bucket_size: usize,

    /// 每层分桶数量上限 (默认: 10000)
    #[serde(default = "default_max_bucket_size")]
    pub max_bucket_size: usize,

    /// 未指定 size 时的命中分页大小 (默认: 100)
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// 命中分页大小上限 (默认: 10000)
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// 关系型编译器输出的方言
    #[serde(default)]
    pub sql_dialect: SqlDialect,
}

fn default_bucket_size() -> usize { 10 }
fn default_max_bucket_size() -> usize { 10_000 }
fn default_page_size() -> usize { 100 }
fn default_max_page_size() -> usize { 10_000 }

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_bucket_size: default_bucket_size(),
            max_bucket_size: default_max_bucket_size(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            sql_dialect: SqlDialect::default(),
        }
    }
}

/// 关系型后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// SQLite 文件路径或 `file:` URI
    #[serde(default = "default_url")]
    pub url: String,

    /// 连接池大小 (默认: 4)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// 每批预取的行数 (默认: 256)
    #[serde(default = "default_prefetch_rows")]
    pub prefetch_rows: usize,

    /// 获取连接的等待上限(毫秒) (默认: 5000)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_url() -> String { "file:duoquery?mode=memory&cache=shared".to_string() }
fn default_pool_size() -> usize { 4 }
fn default_prefetch_rows() -> usize { 256 }
fn default_acquire_timeout() -> u64 { 5000 }

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            prefetch_rows: default_prefetch_rows(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

/// 文档后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// from + size 的上限 (默认: 10000)
    #[serde(default = "default_max_result_window")]
    pub max_result_window: usize,
}

fn default_max_result_window() -> usize { 10_000 }

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_result_window: default_max_result_window(),
        }
    }
}

/// 任务状态存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// 状态保留时间(秒) (默认: 300)
    #[serde(default = "default_job_ttl")]
    pub ttl_secs: u64,

    /// 最多保留的任务数 (默认: 10000)
    #[serde(default = "default_job_capacity")]
    pub capacity: usize,
}

fn default_job_ttl() -> u64 { 300 }
fn default_job_capacity() -> usize { 10_000 }

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_job_ttl(),
            capacity: default_job_capacity(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别 (默认: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DuoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compiler.default_bucket_size, 10);
        assert_eq!(config.compiler.sql_dialect, SqlDialect::Sqlite);
    }

    #[test]
    fn test_partial_toml() {
        let config = DuoConfig::from_toml_str(
            r#"
            [compiler]
            sql_dialect = "postgres"
            default_bucket_size = 25

            [relational]
            prefetch_rows = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.compiler.sql_dialect, SqlDialect::Postgres);
        assert_eq!(config.compiler.default_bucket_size, 25);
        assert_eq!(config.compiler.max_bucket_size, 10_000);
        assert_eq!(config.relational.prefetch_rows, 64);
        assert_eq!(config.relational.pool_size, 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = DuoConfig::from_toml_str("[relational]\npool_size = 0\n").unwrap_err();
        assert!(matches!(err, DuoError::Config(_)));

        let err = DuoConfig::from_toml_str("[compiler]\ndefault_bucket_size = \"ten\"\n").unwrap_err();
        assert!(matches!(err, DuoError::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"debug\"\njson = true").unwrap();
        let config = DuoConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }
}
