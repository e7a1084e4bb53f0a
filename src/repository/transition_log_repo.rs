// ==========================================
// 生产排程引擎 - 工序迁移审计日志仓储
// ==========================================
// 红线: 所有迁移必须留痕（操作员 / 设备 / 原因）
// 写入随迁移事务一起提交，见 StageExecutionRepository::apply_transition
// ==========================================

use crate::db::format_ts;
use crate::domain::stage::StageTransitionRecord;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{bool_col, status_col, ts_col};
use rusqlite::{params, Connection, Result as SqliteResult};
use std::sync::{Arc, Mutex};

pub struct TransitionLogRepository {
    conn: Arc<Mutex<Connection>>,
}

impl TransitionLogRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 在调用方已持有的连接/事务上写入一条迁移记录
    pub(crate) fn insert_with(conn: &Connection, record: &StageTransitionRecord) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO stage_transition_log (
                log_id, stage_id, from_status, to_status, machine_id,
                operator_id, device_id, reason_note, paused_by_system, occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.log_id,
                record.stage_id,
                record.from_status.as_str(),
                record.to_status.as_str(),
                record.machine_id,
                record.operator_id,
                record.device_id,
                record.reason_note,
                record.paused_by_system as i64,
                format_ts(&record.occurred_at),
            ],
        )?;
        Ok(())
    }

    /// 查询工序的迁移历史（按发生时间升序）
    pub fn list_by_stage(&self, stage_id: &str) -> RepositoryResult<Vec<StageTransitionRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT log_id, stage_id, from_status, to_status, machine_id,
                   operator_id, device_id, reason_note, paused_by_system, occurred_at
            FROM stage_transition_log
            WHERE stage_id = ?1
            ORDER BY occurred_at ASC, rowid ASC
            "#,
        )?;

        let records = stmt
            .query_map(params![stage_id], |row| {
                Ok(StageTransitionRecord {
                    log_id: row.get(0)?,
                    stage_id: row.get(1)?,
                    from_status: status_col(row, 2)?,
                    to_status: status_col(row, 3)?,
                    machine_id: row.get(4)?,
                    operator_id: row.get(5)?,
                    device_id: row.get(6)?,
                    reason_note: row.get(7)?,
                    paused_by_system: bool_col(row, 8)?,
                    occurred_at: ts_col(row, 9)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }
}
