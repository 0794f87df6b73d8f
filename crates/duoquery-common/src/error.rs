//! 错误类型定义模块
//!
//! 定义 duoquery 公共层的错误类型 DuoError 和 Result 别名。
//! 查询相关的错误分类见 `duoquery-query` 的 `QueryError`。

use thiserror::Error;

/// duoquery 公共错误类型
#[derive(Error, Debug)]
pub enum DuoError {
    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件解析失败
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 配置项无效
    #[error("Config error: {0}")]
    Config(String),

    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(String),
}

/// duoquery Result 类型别名
pub type DuoResult<T> = Result<T, DuoError>;
