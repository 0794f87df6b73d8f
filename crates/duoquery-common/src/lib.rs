pub mod error;
pub mod types;
pub mod config;
pub mod time;

pub use config::{
    CompilerConfig, DocumentConfig, DuoConfig, JobConfig, LogConfig, RelationalConfig, SqlDialect,
};
pub use error::{DuoError, DuoResult};
pub use time::IntervalUnit;
pub use types::*;
