// ==========================================
// 生产排程引擎 - 换型时间数据仓储
// ==========================================
// 键: (machine_id, from_detail_id, to_detail_id)，有方向
// 红线: 记录缺失 = 未知，不等于 0
// ==========================================

use crate::domain::production::SetupTimeEntry;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};

pub struct SetupTimeRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SetupTimeRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 新增或覆盖换型时间
    pub fn upsert(&self, entry: &SetupTimeEntry) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO setup_time (machine_id, from_detail_id, to_detail_id, setup_hours)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(machine_id, from_detail_id, to_detail_id)
            DO UPDATE SET setup_hours = excluded.setup_hours
            "#,
            params![
                entry.machine_id,
                entry.from_detail_id,
                entry.to_detail_id,
                entry.setup_hours,
            ],
        )?;
        Ok(())
    }

    /// 查询换型时间（小时），无记录返回 None
    pub fn find(
        &self,
        machine_id: &str,
        from_detail_id: &str,
        to_detail_id: &str,
    ) -> RepositoryResult<Option<f64>> {
        let conn = self.get_conn()?;
        let hours = conn
            .query_row(
                r#"
                SELECT setup_hours FROM setup_time
                WHERE machine_id = ?1 AND from_detail_id = ?2 AND to_detail_id = ?3
                "#,
                params![machine_id, from_detail_id, to_detail_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(hours)
    }

    /// 查询机台的全部换型记录
    pub fn list_by_machine(&self, machine_id: &str) -> RepositoryResult<Vec<SetupTimeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT machine_id, from_detail_id, to_detail_id, setup_hours
            FROM setup_time
            WHERE machine_id = ?1
            ORDER BY from_detail_id ASC, to_detail_id ASC
            "#,
        )?;
        let entries = stmt
            .query_map(params![machine_id], |row| {
                Ok(SetupTimeEntry {
                    machine_id: row.get(0)?,
                    from_detail_id: row.get(1)?,
                    to_detail_id: row.get(2)?,
                    setup_hours: row.get(3)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(entries)
    }
}
