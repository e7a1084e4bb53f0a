// ==========================================
// 生产排程引擎 - 批次数据仓储
// ==========================================
// 批次 / 子批次 / 初始工序 在同一事务内写入
// ==========================================

use crate::db::format_ts;
use crate::domain::production::{Batch, BatchPlan, SubBatch};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{bool_col, ts_col};
use crate::repository::stage_repo::StageExecutionRepository;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};

pub struct BatchRepository {
    conn: Arc<Mutex<Connection>>,
}

impl BatchRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 写入批次计划（事务）
    pub fn insert_plan(&self, plan: &BatchPlan) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO batch (batch_id, detail_id, quantity, priority, is_critical, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                plan.batch.batch_id,
                plan.batch.detail_id,
                plan.batch.quantity,
                plan.batch.priority,
                plan.batch.is_critical as i64,
                format_ts(&plan.batch.created_at),
            ],
        )?;

        for sub in &plan.sub_batches {
            tx.execute(
                "INSERT INTO sub_batch (sub_batch_id, batch_id, seq_no, quantity) VALUES (?1, ?2, ?3, ?4)",
                params![sub.sub_batch_id, sub.batch_id, sub.seq_no, sub.quantity],
            )?;
        }

        for stage in &plan.stages {
            StageExecutionRepository::insert_with(&tx, stage)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn find_batch(&self, batch_id: &str) -> RepositoryResult<Option<Batch>> {
        let conn = self.get_conn()?;
        let batch = conn
            .query_row(
                r#"
                SELECT batch_id, detail_id, quantity, priority, is_critical, created_at
                FROM batch WHERE batch_id = ?1
                "#,
                params![batch_id],
                |row| {
                    Ok(Batch {
                        batch_id: row.get(0)?,
                        detail_id: row.get(1)?,
                        quantity: row.get(2)?,
                        priority: row.get(3)?,
                        is_critical: bool_col(row, 4)?,
                        created_at: ts_col(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(batch)
    }

    pub fn find_sub_batches(&self, batch_id: &str) -> RepositoryResult<Vec<SubBatch>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT sub_batch_id, batch_id, seq_no, quantity
            FROM sub_batch WHERE batch_id = ?1
            ORDER BY seq_no ASC
            "#,
        )?;
        let subs = stmt
            .query_map(params![batch_id], |row| {
                Ok(SubBatch {
                    sub_batch_id: row.get(0)?,
                    batch_id: row.get(1)?,
                    seq_no: row.get(2)?,
                    quantity: row.get(3)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(subs)
    }
}
