//! SQLite 关系后端模块
//!
//! 本模块实现 `RelationalClient`:
//! - 固定大小的连接池,获取有等待期限,连接由 RAII 守卫在任何退出路径上归还
//! - 每个连接注册扩展函数(见 `functions` 模块)
//! - 按批预取的只进游标:语句外包一层 `LIMIT ?/OFFSET ?`,每批单独执行并完整解码
//! - 时间预算通过 progress handler 中断正在执行的语句

use crate::functions::register_functions;
use crate::relational::{
    BoundStatement, CursorOptions, RelationalClient, RowCursor, SqlParam, SqlRow, SqlValue,
};
use crate::{StorageError, StorageResult};
use duoquery_common::{RelationalConfig, SqlDialect};
use parking_lot::{Condvar, Mutex};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, ToSql};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            SqlParam::Integer(n) => ToSqlOutput::from(*n),
            SqlParam::Float(f) => ToSqlOutput::from(*f),
            SqlParam::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Timestamp(ts) => ToSqlOutput::from(ts.timestamp_millis()),
            SqlParam::Boolean(b) => ToSqlOutput::from(*b),
        })
    }
}

/// 连接池
struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    fn release(&self, conn: Connection) {
        self.idle.lock().push(conn);
        self.available.notify_one();
    }
}

/// 池化连接守卫
///
/// 丢弃时清除 progress handler 并把连接归还连接池。
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    /// 借出的连接;守卫释放后不可再用
    pub fn connection(&self) -> StorageResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::Internal("connection already released".to_string()))
    }

    fn connection_mut(&mut self) -> StorageResult<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::Internal("connection already released".to_string()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.progress_handler(0, None::<fn() -> bool>);
            self.pool.release(conn);
        }
    }
}

/// SQLite 客户端
#[derive(Clone)]
pub struct SqliteClient {
    pool: Arc<ConnectionPool>,
}

impl SqliteClient {
    /// # Brief
    /// 按配置打开连接池
    ///
    /// # Arguments
    /// * `config` - 关系后端配置,`url` 可以是文件路径或 `file:` URI
    pub fn open(config: &RelationalConfig) -> StorageResult<Self> {
        Self::open_url(
            &config.url,
            config.pool_size,
            Duration::from_millis(config.acquire_timeout_ms),
        )
    }

    /// # Brief
    /// 打开一个私有的共享缓存内存数据库
    ///
    /// 每次调用得到独立的数据库,池内连接共享同一份数据。
    pub fn open_in_memory(pool_size: usize) -> StorageResult<Self> {
        let url = format!("file:duoquery-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        Self::open_url(&url, pool_size, Duration::from_secs(5))
    }

    fn open_url(url: &str, pool_size: usize, acquire_timeout: Duration) -> StorageResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let mut idle = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open_with_flags(url, flags)?;
            register_functions(&conn)?;
            idle.push(conn);
        }
        debug!("Opened SQLite pool ({} connections) at {}", idle.len(), url);
        Ok(Self {
            pool: Arc::new(ConnectionPool {
                idle: Mutex::new(idle),
                available: Condvar::new(),
                acquire_timeout,
            }),
        })
    }

    /// # Brief
    /// 从连接池获取连接,超过等待期限返回 `PoolExhausted`
    pub fn acquire(&self) -> StorageResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.pool.acquire_timeout;
        let mut idle = self.pool.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.pool),
                });
            }
            if self.pool.available.wait_until(&mut idle, deadline).timed_out() && idle.is_empty() {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("SQLite pool exhausted after {} ms", waited_ms);
                return Err(StorageError::PoolExhausted { waited_ms });
            }
        }
    }

    /// 执行多条不带参数的语句(建表等)
    pub fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        let conn = self.acquire()?;
        conn.connection()?.execute_batch(sql)?;
        Ok(())
    }

    /// 执行一条带参数的写语句,返回影响行数
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> StorageResult<usize> {
        let conn = self.acquire()?;
        Ok(conn
            .connection()?
            .execute(sql, params_from_iter(params.iter()))?)
    }

    /// # Brief
    /// 在一个事务里批量执行同一条写语句
    pub fn execute_many(&self, sql: &str, rows: &[Vec<SqlParam>]) -> StorageResult<usize> {
        let mut pooled = self.acquire()?;
        let tx = pooled.connection_mut()?.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for params in rows {
                written += stmt.execute(params_from_iter(params.iter()))?;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

impl RelationalClient for SqliteClient {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn open_cursor(
        &self,
        statement: BoundStatement,
        options: CursorOptions,
    ) -> StorageResult<Box<dyn RowCursor>> {
        let conn = self.acquire()?;
        let n = statement.params.len();
        let sql = format!(
            "SELECT * FROM ({}) AS page LIMIT ?{} OFFSET ?{}",
            statement.sql,
            n + 1,
            n + 2
        );
        trace!("Opening cursor: {}", sql);
        Ok(Box::new(SqliteCursor {
            conn,
            sql,
            params: statement.params,
            offset: 0,
            batch_size: options.batch_size.max(1),
            started: Instant::now(),
            timeout: options.timeout,
            exhausted: false,
        }))
    }
}

/// 分批预取游标
struct SqliteCursor {
    conn: PooledConnection,
    sql: String,
    params: Vec<SqlParam>,
    offset: usize,
    batch_size: usize,
    started: Instant,
    timeout: Option<Duration>,
    exhausted: bool,
}

impl SqliteCursor {
    fn interrupted(&self, budget: Duration) -> StorageError {
        StorageError::Interrupted {
            budget_ms: budget.as_millis() as u64,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn fetch(&self) -> StorageResult<Vec<SqlRow>> {
        let mut stmt = self.conn.connection()?.prepare_cached(&self.sql)?;
        let columns = stmt.column_count();
        let mut params: Vec<&dyn ToSql> = self.params.iter().map(|p| p as &dyn ToSql).collect();
        let limit = self.batch_size as i64;
        let offset = self.offset as i64;
        params.push(&limit);
        params.push(&offset);

        let mut rows = stmt.query(params_from_iter(params))?;
        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(row) = rows.next()? {
            let mut decoded = Vec::with_capacity(columns);
            for idx in 0..columns {
                decoded.push(decode_cell(row.get_ref(idx)?, idx)?);
            }
            batch.push(decoded);
        }
        Ok(batch)
    }
}

fn decode_cell(cell: ValueRef<'_>, idx: usize) -> StorageResult<SqlValue> {
    match cell {
        ValueRef::Null => Ok(SqlValue::Null),
        ValueRef::Integer(n) => Ok(SqlValue::Integer(n)),
        ValueRef::Real(f) => Ok(SqlValue::Float(f)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| SqlValue::Text(s.to_string()))
            .map_err(|e| StorageError::Decode(format!("column {}: {}", idx, e))),
        ValueRef::Blob(_) => Err(StorageError::Decode(format!(
            "column {}: unexpected blob value",
            idx
        ))),
    }
}

impl RowCursor for SqliteCursor {
    fn next_batch(&mut self) -> StorageResult<Option<Vec<SqlRow>>> {
        if self.exhausted {
            return Ok(None);
        }

        if let Some(budget) = self.timeout {
            if self.started.elapsed() >= budget {
                self.exhausted = true;
                return Err(self.interrupted(budget));
            }
            let deadline = self.started + budget;
            self.conn
                .connection()?
                .progress_handler(1_000, Some(move || Instant::now() >= deadline));
        }

        let batch_started = Instant::now();
        let result = self.fetch();
        if self.timeout.is_some() {
            self.conn
                .connection()?
                .progress_handler(0, None::<fn() -> bool>);
        }

        let batch = match result {
            Ok(batch) => batch,
            Err(StorageError::Sqlite(err))
                if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) =>
            {
                self.exhausted = true;
                let budget = self.timeout.unwrap_or_default();
                return Err(self.interrupted(budget));
            }
            Err(err) => {
                self.exhausted = true;
                return Err(err);
            }
        };

        trace!(
            "Fetched {} rows at offset {} in {} ms",
            batch.len(),
            self.offset,
            batch_started.elapsed().as_millis()
        );
        self.offset += batch.len();
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}
