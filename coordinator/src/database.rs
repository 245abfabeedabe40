use async_trait::async_trait;
use sqlx::FromRow;

use crate::config::OrderSession;

/// Persistent status of a block task. The column value follows the listed
/// discriminants, so renumbering is a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unassigned = 0,
    Assigned = 1,
    Proved = 2,
    Verified = 3,
    Failed = 4,
}

impl TaskStatus {
    pub fn from_i32(value: i32) -> Option<TaskStatus> {
        match value {
            0 => Some(TaskStatus::Unassigned),
            1 => Some(TaskStatus::Assigned),
            2 => Some(TaskStatus::Proved),
            3 => Some(TaskStatus::Verified),
            4 => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// One row of the `block_task` table, keyed by block number.
#[derive(Debug, Clone, Default, FromRow)]
pub struct Task {
    pub id: u64,
    pub traces: Vec<u8>,
    pub status: i32,
    pub proof: Option<Vec<u8>>,
    pub final_pair: Option<Vec<u8>>,
    pub proof_time_sec: Option<u64>,
}

/// Durable queue of block-trace tasks. All operations are idempotent at the
/// status level; no multi-row transaction is assumed by callers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn fetch_by_status(
        &self,
        status: TaskStatus,
        order: OrderSession,
        limit: usize,
    ) -> anyhow::Result<Vec<Task>>;

    async fn fetch_by_id(&self, id: u64) -> anyhow::Result<Vec<Task>>;

    async fn set_status(&self, id: u64, status: TaskStatus) -> anyhow::Result<()>;

    async fn set_proof(
        &self,
        id: u64,
        proof: &[u8],
        final_pair: &[u8],
        proof_time_sec: u64,
    ) -> anyhow::Result<()>;
}

pub struct Database {
    db_pool: sqlx::mysql::MySqlPool,
}

impl Database {
    pub fn new(database_url: &str) -> anyhow::Result<Self> {
        let db_pool = sqlx::mysql::MySqlPool::connect_lazy(database_url)?;
        Ok(Database { db_pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.db_pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn fetch_by_status(
        &self,
        status: TaskStatus,
        order: OrderSession,
        limit: usize,
    ) -> anyhow::Result<Vec<Task>> {
        // The order direction cannot be bound as a parameter.
        let query = format!(
            "SELECT id, traces, status, proof, final_pair, proof_time_sec \
             FROM block_task WHERE status = ? ORDER BY id {} LIMIT ?",
            order.as_sql()
        );
        let tasks = sqlx::query_as::<_, Task>(&query)
            .bind(status as i32)
            .bind(limit as u32)
            .fetch_all(&self.db_pool)
            .await?;
        Ok(tasks)
    }

    async fn fetch_by_id(&self, id: u64) -> anyhow::Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT id, traces, status, proof, final_pair, proof_time_sec \
             FROM block_task WHERE id = ?",
        )
        .bind(id)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(tasks)
    }

    async fn set_status(&self, id: u64, status: TaskStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE block_task SET status = ? WHERE id = ?")
            .bind(status as i32)
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn set_proof(
        &self,
        id: u64,
        proof: &[u8],
        final_pair: &[u8],
        proof_time_sec: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE block_task SET proof = ?, final_pair = ?, proof_time_sec = ? WHERE id = ?",
        )
        .bind(proof)
        .bind(final_pair)
        .bind(proof_time_sec)
        .bind(id)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}
