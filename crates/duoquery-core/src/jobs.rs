//! 任务状态模块
//!
//! 记录被跟踪执行的查询状态。存储由 `Engine` 显式持有:
//! - 每个任务有一个过期时刻,过期时刻放在最小堆里,清理时只弹出堆顶
//! - 更新任务会刷新过期时刻,旧的堆条目在弹出时被识别并丢弃
//! - 容量满时先淘汰最早过期的任务

use chrono::{DateTime, Utc};
use duoquery_common::{BackendKind, JobConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// 任务状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed {
        /// 命中或分桶查询产出的行数
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<usize>,
        /// 计数查询的结果
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
    Failed {
        message: String,
    },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// 单个任务的状态记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn running(collection: impl Into<String>, backend: Option<BackendKind>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            backend,
            state: JobState::Running,
            created_at: now,
            updated_at: now,
        }
    }
}

struct Entry {
    status: JobStatus,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    expiry: BinaryHeap<Reverse<(Instant, Uuid)>>,
}

impl Inner {
    /// 弹出堆顶;堆顶已失效(任务被删除或过期时刻已刷新)时返回 None
    fn pop_live(&mut self) -> Option<(Instant, Uuid)> {
        let Reverse((at, id)) = self.expiry.pop()?;
        match self.jobs.get(&id) {
            Some(entry) if entry.expires_at == at => Some((at, id)),
            _ => None,
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while !self.expiry.is_empty() {
            if let Some((_, id)) = self.pop_live() {
                self.jobs.remove(&id);
                return true;
            }
        }
        false
    }

    /// 未过期的任务;已过期的任务在这里被移除
    fn live_mut(&mut self, id: &Uuid, now: Instant) -> Option<&mut Entry> {
        if self.jobs.get(id).is_some_and(|e| e.expires_at <= now) {
            self.jobs.remove(id);
            trace!("Job {} expired", id);
            return None;
        }
        self.jobs.get_mut(id)
    }

    fn purge(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some(Reverse((at, _))) = self.expiry.peek() {
            if *at > now {
                break;
            }
            if let Some((_, id)) = self.pop_live() {
                self.jobs.remove(&id);
                purged += 1;
            }
        }
        purged
    }
}

/// 任务状态存储
pub struct JobStatusStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl JobStatusStore {
    /// # Brief
    /// 创建任务状态存储
    ///
    /// # Arguments
    /// * `ttl` - 任务最后一次更新后保留的时间
    /// * `capacity` - 最多保留的任务数,至少为 1
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &JobConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.capacity)
    }

    /// # Brief
    /// 插入任务;容量已满时先清理过期任务,仍然满则淘汰最早过期的任务
    pub fn insert(&self, status: JobStatus) -> Uuid {
        self.insert_at(status, Instant::now())
    }

    fn insert_at(&self, status: JobStatus, now: Instant) -> Uuid {
        let mut inner = self.inner.lock();
        if inner.jobs.len() >= self.capacity && !inner.jobs.contains_key(&status.id) {
            inner.purge(now);
            if inner.jobs.len() >= self.capacity && inner.evict_oldest() {
                debug!("Job store full, evicted the oldest job");
            }
        }
        let id = status.id;
        let expires_at = now + self.ttl;
        inner.expiry.push(Reverse((expires_at, id)));
        inner.jobs.insert(id, Entry { status, expires_at });
        trace!("Tracking job {}", id);
        id
    }

    /// # Brief
    /// 更新任务状态并刷新过期时刻
    ///
    /// # Returns
    /// 任务不存在(从未插入或已过期)时返回 false
    pub fn update(&self, id: &Uuid, state: JobState) -> bool {
        self.update_at(id, state, Instant::now())
    }

    fn update_at(&self, id: &Uuid, state: JobState, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let expires_at = now + self.ttl;
        let Some(entry) = inner.live_mut(id, now) else {
            return false;
        };
        entry.status.state = state;
        entry.status.updated_at = Utc::now();
        entry.expires_at = expires_at;
        inner.expiry.push(Reverse((expires_at, *id)));
        true
    }

    /// 已过期但尚未清理的任务视为不存在
    pub fn get(&self, id: &Uuid) -> Option<JobStatus> {
        self.get_at(id, Instant::now())
    }

    fn get_at(&self, id: &Uuid, now: Instant) -> Option<JobStatus> {
        self.inner.lock().live_mut(id, now).map(|e| e.status.clone())
    }

    /// 删除所有已过期的任务,返回删除数量
    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.lock().purge(Instant::now());
        if purged > 0 {
            debug!("Purged {} expired jobs", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobStatusStore {
    fn default() -> Self {
        Self::from_config(&JobConfig::default())
    }
}
