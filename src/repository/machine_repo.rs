// ==========================================
// 生产排程引擎 - 机台数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================

use crate::domain::production::{Machine, MachineType};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::bool_col;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::sync::{Arc, Mutex};

// ==========================================
// MachineRepository - 机台仓储
// ==========================================
/// 职责: 管理 machine_type / machine 表
pub struct MachineRepository {
    conn: Arc<Mutex<Connection>>,
}

impl MachineRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn map_machine(row: &Row<'_>) -> SqliteResult<Machine> {
        Ok(Machine {
            machine_id: row.get(0)?,
            machine_type_id: row.get(1)?,
            name: row.get(2)?,
            priority: row.get(3)?,
            is_active: bool_col(row, 4)?,
        })
    }

    /// 新增机台类型
    pub fn insert_machine_type(&self, machine_type: &MachineType) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO machine_type (machine_type_id, name) VALUES (?1, ?2)",
            params![machine_type.machine_type_id, machine_type.name],
        )?;
        Ok(())
    }

    /// 新增机台
    pub fn insert_machine(&self, machine: &Machine) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO machine (machine_id, machine_type_id, name, priority, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                machine.machine_id,
                machine.machine_type_id,
                machine.name,
                machine.priority,
                machine.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, machine_id: &str) -> RepositoryResult<Option<Machine>> {
        let conn = self.get_conn()?;
        let machine = conn
            .query_row(
                r#"
                SELECT machine_id, machine_type_id, name, priority, is_active
                FROM machine WHERE machine_id = ?1
                "#,
                params![machine_id],
                Self::map_machine,
            )
            .optional()?;
        Ok(machine)
    }

    /// 查询某类型下的在用机台（优先级降序）
    pub fn find_active_by_type(&self, machine_type_id: &str) -> RepositoryResult<Vec<Machine>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT machine_id, machine_type_id, name, priority, is_active
            FROM machine
            WHERE machine_type_id = ?1 AND is_active = 1
            ORDER BY priority DESC, machine_id ASC
            "#,
        )?;
        let machines = stmt
            .query_map(params![machine_type_id], Self::map_machine)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(machines)
    }
}
