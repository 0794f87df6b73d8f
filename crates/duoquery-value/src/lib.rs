//! # duoquery-value
//!
//! 两个后端共享的值模型:
//!
//! - **Value**: 与后端无关的标量/复合值,查询结果的每一列都归一化为它
//! - **Document**: 有序字段映射,结果行和文档来源都用它表示
//! - **geometry**: GeoJSON、数值对、`"lat,lon"`、geohash 的解析与形状分类,
//!   以及 bbox / `POLYGON((...))` 区域和 geotile 网格计算
//!
//! 几何计算使用 `geo` crate,两个嵌入式后端都调用这里的实现,
//! 保证同一份数据在两边得到相同的空间判断结果。

pub mod value;
pub mod document;
pub mod json;
pub mod geometry;

pub use document::Document;
pub use geometry::{Area, ShapeClass};
pub use value::Value;

use thiserror::Error;

/// 值层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// 无法识别的几何值
    #[error("Unrecognized geometry: {0}")]
    UnrecognizedGeometry(String),

    /// 几何值同时符合多种写法
    #[error("Ambiguous geometry: {0}")]
    AmbiguousGeometry(String),

    /// 几何结构无效(坐标越界、环未闭合等)
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// geohash 格式无效
    #[error("Invalid geohash: {0}")]
    InvalidGeohash(String),

    /// 值与期望类型不符
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

/// 值层 Result 类型别名
pub type ValueResult<T> = Result<T, ValueError>;
