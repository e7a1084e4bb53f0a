// ==========================================
// 生产排程引擎 - 工序执行数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑，迁移规则由领域状态机判定
// ==========================================
// 并发控制:
// - 每次迁移在 BEGIN IMMEDIATE 事务内完成: 读工序 → 读守卫事实 → 状态机 → 条件更新 → 写审计
// - revision 乐观锁: 调用方可携带快照 revision，快照过期即拒绝
// - 部分唯一索引 ux_stage_machine_running 兜底机台互斥
// ==========================================

use crate::db::format_ts;
use crate::domain::stage::{StageExecution, StageTransitionRecord};
use crate::domain::state_machine::{GuardContext, StageStateMachine, TransitionCommand};
use crate::domain::types::StageStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_mapping::{bool_col, opt_ts_col, status_col, ts_col};
use crate::repository::transition_log_repo::TransitionLogRepository;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row, TransactionBehavior};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const STAGE_COLUMNS: &str = r#"
    stage_id, batch_id, sub_batch_id, route_stage_id, detail_id, machine_type_id,
    stage_order, sequence_no, is_setup, quantity, planned_hours, priority, is_critical,
    status, machine_id, queue_position, queued_at, start_time, end_time, pause_time, resume_time,
    paused_by_system, operator_id, device_id, reason_note,
    batch_created_at, created_at, updated_at, revision, target_machine_id
"#;

/// 调度顺序: 优先级降序 → 批次创建时间升序 → 工序创建时间升序 → stage_id
const SCHEDULING_ORDER: &str =
    "ORDER BY priority DESC, batch_created_at ASC, created_at ASC, stage_id ASC";

// ==========================================
// StageExecutionRepository - 工序执行仓储
// ==========================================
pub struct StageExecutionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl StageExecutionRepository {
    /// 从已有连接创建仓储实例
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 获取数据库连接
    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn map_row(row: &Row<'_>) -> SqliteResult<StageExecution> {
        Ok(StageExecution {
            stage_id: row.get(0)?,
            batch_id: row.get(1)?,
            sub_batch_id: row.get(2)?,
            route_stage_id: row.get(3)?,
            detail_id: row.get(4)?,
            machine_type_id: row.get(5)?,
            stage_order: row.get(6)?,
            sequence_no: row.get(7)?,
            is_setup: bool_col(row, 8)?,
            quantity: row.get(9)?,
            planned_hours: row.get(10)?,
            priority: row.get(11)?,
            is_critical: bool_col(row, 12)?,
            status: status_col(row, 13)?,
            machine_id: row.get(14)?,
            queue_position: row.get(15)?,
            queued_at: opt_ts_col(row, 16)?,
            start_time: opt_ts_col(row, 17)?,
            end_time: opt_ts_col(row, 18)?,
            pause_time: opt_ts_col(row, 19)?,
            resume_time: opt_ts_col(row, 20)?,
            paused_by_system: bool_col(row, 21)?,
            operator_id: row.get(22)?,
            device_id: row.get(23)?,
            reason_note: row.get(24)?,
            batch_created_at: ts_col(row, 25)?,
            created_at: ts_col(row, 26)?,
            updated_at: ts_col(row, 27)?,
            revision: row.get(28)?,
            target_machine_id: row.get(29)?,
        })
    }

    fn query_list<P: rusqlite::Params>(
        conn: &Connection,
        where_clause: &str,
        order_clause: &str,
        params: P,
    ) -> RepositoryResult<Vec<StageExecution>> {
        let sql = format!(
            "SELECT {} FROM stage_execution {} {}",
            STAGE_COLUMNS, where_clause, order_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let stages = stmt
            .query_map(params, Self::map_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(stages)
    }

    fn load(conn: &Connection, stage_id: &str) -> RepositoryResult<Option<StageExecution>> {
        let sql = format!("SELECT {} FROM stage_execution WHERE stage_id = ?1", STAGE_COLUMNS);
        let stage = conn
            .query_row(&sql, params![stage_id], Self::map_row)
            .optional()?;
        Ok(stage)
    }

    // ==========================================
    // 写入操作
    // ==========================================

    /// 在调用方已持有的连接/事务上插入工序
    pub(crate) fn insert_with(conn: &Connection, stage: &StageExecution) -> RepositoryResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO stage_execution ({}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30
                )",
                STAGE_COLUMNS
            ),
            params![
                stage.stage_id,
                stage.batch_id,
                stage.sub_batch_id,
                stage.route_stage_id,
                stage.detail_id,
                stage.machine_type_id,
                stage.stage_order,
                stage.sequence_no,
                stage.is_setup as i64,
                stage.quantity,
                stage.planned_hours,
                stage.priority,
                stage.is_critical as i64,
                stage.status.as_str(),
                stage.machine_id,
                stage.queue_position,
                stage.queued_at.as_ref().map(format_ts),
                stage.start_time.as_ref().map(format_ts),
                stage.end_time.as_ref().map(format_ts),
                stage.pause_time.as_ref().map(format_ts),
                stage.resume_time.as_ref().map(format_ts),
                stage.paused_by_system as i64,
                stage.operator_id,
                stage.device_id,
                stage.reason_note,
                format_ts(&stage.batch_created_at),
                format_ts(&stage.created_at),
                format_ts(&stage.updated_at),
                stage.revision,
                stage.target_machine_id,
            ],
        )?;
        Ok(())
    }

    /// 同一子批次内序号更小且未完成的工序数量
    fn count_unfinished_predecessors(conn: &Connection, stage: &StageExecution) -> RepositoryResult<usize> {
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM stage_execution
            WHERE sub_batch_id = ?1 AND sequence_no < ?2 AND status <> 'COMPLETED'
            "#,
            params![stage.sub_batch_id, stage.sequence_no],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn running_stage_id_on(conn: &Connection, machine_id: &str) -> RepositoryResult<Option<String>> {
        let id = conn
            .query_row(
                "SELECT stage_id FROM stage_execution WHERE machine_id = ?1 AND status = 'IN_PROGRESS' LIMIT 1",
                params![machine_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    /// 应用状态迁移（原子）
    ///
    /// # 参数
    /// - `stage_id`: 工序ID
    /// - `command`: 迁移命令（含归属）
    /// - `expected_revision`: 快照 revision；Some 且不一致时返回 OptimisticLockFailure
    /// - `now`: 迁移时间
    ///
    /// # 返回
    /// - Ok(StageExecution): 迁移后的工序
    /// - Err(Transition): 守卫违反，工序保持不变
    pub fn apply_transition(
        &self,
        stage_id: &str,
        command: &TransitionCommand,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<StageExecution> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut stage = Self::load(&tx, stage_id)?.ok_or_else(|| RepositoryError::NotFound {
            entity: "StageExecution".to_string(),
            id: stage_id.to_string(),
        })?;

        if let Some(expected) = expected_revision {
            if expected != stage.revision {
                return Err(RepositoryError::OptimisticLockFailure {
                    stage_id: stage_id.to_string(),
                    expected,
                    actual: stage.revision,
                });
            }
        }

        let target_machine = command.target_machine(&stage).map(str::to_string);
        let guard = GuardContext {
            unfinished_predecessors: Self::count_unfinished_predecessors(&tx, &stage)?,
            machine_occupant: match &target_machine {
                Some(machine_id) => Self::running_stage_id_on(&tx, machine_id)?,
                None => None,
            },
        };

        let revision = stage.revision;
        let from = StageStateMachine::apply(&mut stage, command, &guard, now)?;

        let affected = tx.execute(
            r#"
            UPDATE stage_execution SET
                status = ?1, machine_id = ?2, queued_at = ?3, start_time = ?4, end_time = ?5,
                pause_time = ?6, resume_time = ?7, paused_by_system = ?8,
                operator_id = ?9, device_id = ?10, reason_note = ?11, updated_at = ?12,
                revision = revision + 1
            WHERE stage_id = ?13 AND revision = ?14
            "#,
            params![
                stage.status.as_str(),
                stage.machine_id,
                stage.queued_at.as_ref().map(format_ts),
                stage.start_time.as_ref().map(format_ts),
                stage.end_time.as_ref().map(format_ts),
                stage.pause_time.as_ref().map(format_ts),
                stage.resume_time.as_ref().map(format_ts),
                stage.paused_by_system as i64,
                stage.operator_id,
                stage.device_id,
                stage.reason_note,
                format_ts(&stage.updated_at),
                stage.stage_id,
                revision,
            ],
        )?;

        if affected == 0 {
            let actual: i32 = tx.query_row(
                "SELECT revision FROM stage_execution WHERE stage_id = ?1",
                params![stage_id],
                |row| row.get(0),
            )?;
            return Err(RepositoryError::OptimisticLockFailure {
                stage_id: stage_id.to_string(),
                expected: revision,
                actual,
            });
        }
        stage.revision = revision + 1;

        TransitionLogRepository::insert_with(
            &tx,
            &StageTransitionRecord {
                log_id: Uuid::new_v4().to_string(),
                stage_id: stage.stage_id.clone(),
                from_status: from,
                to_status: stage.status,
                machine_id: stage.machine_id.clone(),
                operator_id: command.actor.operator_id.clone(),
                device_id: command.actor.device_id.clone(),
                reason_note: command.actor.reason_note.clone(),
                paused_by_system: stage.paused_by_system,
                occurred_at: now,
            },
        )?;

        tx.commit()?;
        Ok(stage)
    }

    /// 为排队中的工序绑定机台（不开工）
    ///
    /// # 返回
    /// - Ok(true): 绑定成功
    /// - Ok(false): 工序已不在 IN_QUEUE 或快照过期
    pub fn assign_machine(
        &self,
        stage_id: &str,
        machine_id: &str,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE stage_execution
            SET machine_id = ?1, updated_at = ?2, revision = revision + 1
            WHERE stage_id = ?3 AND status = 'IN_QUEUE'
              AND (?4 IS NULL OR revision = ?4)
            "#,
            params![machine_id, format_ts(&now), stage_id, expected_revision],
        )?;
        Ok(affected == 1)
    }

    /// 指定工序的加工机台
    ///
    /// # 返回
    /// - Ok(true): 已指定
    /// - Ok(false): 工序已开工或进入终态
    pub fn pin_machine(&self, stage_id: &str, machine_id: &str, now: DateTime<Utc>) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE stage_execution
            SET target_machine_id = ?1, updated_at = ?2, revision = revision + 1
            WHERE stage_id = ?3 AND status IN ('PENDING', 'IN_QUEUE')
            "#,
            params![machine_id, format_ts(&now), stage_id],
        )?;
        Ok(affected == 1)
    }

    /// 在后继工序前插入换型工序（重排子批次序号）
    ///
    /// `setup.sequence_no` 必须等于 `successor.sequence_no`
    ///
    /// # 返回
    /// - Ok(true): 已插入
    /// - Ok(false): 后继已离开 PENDING 或其前一道已是换型，未插入
    pub fn insert_setup_before(
        &self,
        successor: &StageExecution,
        setup: &StageExecution,
    ) -> RepositoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = match Self::load(&tx, &successor.stage_id)? {
            Some(s) => s,
            None => {
                return Err(RepositoryError::NotFound {
                    entity: "StageExecution".to_string(),
                    id: successor.stage_id.clone(),
                })
            }
        };
        if current.status != StageStatus::Pending {
            return Ok(false);
        }

        let previous_is_setup: Option<bool> = tx
            .query_row(
                r#"
                SELECT is_setup FROM stage_execution
                WHERE sub_batch_id = ?1 AND sequence_no < ?2
                ORDER BY sequence_no DESC LIMIT 1
                "#,
                params![current.sub_batch_id, current.sequence_no],
                |row| Ok(row.get::<_, i64>(0)? != 0),
            )
            .optional()?;
        if previous_is_setup == Some(true) {
            return Ok(false);
        }

        tx.execute(
            r#"
            UPDATE stage_execution SET sequence_no = sequence_no + 1, revision = revision + 1
            WHERE sub_batch_id = ?1 AND sequence_no >= ?2
            "#,
            params![current.sub_batch_id, current.sequence_no],
        )?;

        let mut row = setup.clone();
        row.sequence_no = current.sequence_no;
        Self::insert_with(&tx, &row)?;

        tx.commit()?;
        Ok(true)
    }

    /// 批量写入队列位置
    pub fn save_queue_positions(&self, positions: &[(String, i32)]) -> RepositoryResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut count = 0;
        for (stage_id, position) in positions {
            count += tx.execute(
                "UPDATE stage_execution SET queue_position = ?1 WHERE stage_id = ?2 AND status = 'IN_QUEUE'",
                params![position, stage_id],
            )?;
        }
        tx.commit()?;
        Ok(count)
    }

    // ==========================================
    // 查询操作
    // ==========================================

    pub fn find_by_id(&self, stage_id: &str) -> RepositoryResult<Option<StageExecution>> {
        let conn = self.get_conn()?;
        Self::load(&conn, stage_id)
    }

    /// 按状态查询（调度顺序）
    pub fn find_by_status(&self, status: StageStatus) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(&conn, "WHERE status = ?1", SCHEDULING_ORDER, params![status.as_str()])
    }

    /// 系统暂停、可自动恢复的工序
    pub fn find_system_paused(&self) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(
            &conn,
            "WHERE status = 'PAUSED' AND paused_by_system = 1",
            SCHEDULING_ORDER,
            [],
        )
    }

    /// 前序全部完成的 PENDING 工序
    pub fn find_pending_ready(&self) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(
            &conn,
            r#"
            WHERE status = 'PENDING' AND NOT EXISTS (
                SELECT 1 FROM stage_execution p
                WHERE p.sub_batch_id = stage_execution.sub_batch_id
                  AND p.sequence_no < stage_execution.sequence_no
                  AND p.status <> 'COMPLETED'
            )
            "#,
            SCHEDULING_ORDER,
            [],
        )
    }

    /// 指定时间之后完成的工序（按完成时间升序）
    pub fn find_completed_since(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(
            &conn,
            "WHERE status = 'COMPLETED' AND end_time >= ?1",
            "ORDER BY end_time ASC, stage_id ASC",
            params![format_ts(&since)],
        )
    }

    /// 机台上当前 InProgress 的工序
    pub fn find_running_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<StageExecution>> {
        let conn = self.get_conn()?;
        let mut list = Self::query_list(
            &conn,
            "WHERE machine_id = ?1 AND status = 'IN_PROGRESS'",
            "LIMIT 1",
            params![machine_id],
        )?;
        Ok(list.pop())
    }

    /// 子批次内全部工序（按序号）
    pub fn find_by_sub_batch(&self, sub_batch_id: &str) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(
            &conn,
            "WHERE sub_batch_id = ?1",
            "ORDER BY sequence_no ASC",
            params![sub_batch_id],
        )
    }

    /// 批次内全部工序（按子批次、序号）
    pub fn find_by_batch(&self, batch_id: &str) -> RepositoryResult<Vec<StageExecution>> {
        let conn = self.get_conn()?;
        Self::query_list(
            &conn,
            "WHERE batch_id = ?1",
            "ORDER BY sub_batch_id ASC, sequence_no ASC",
            params![batch_id],
        )
    }

    /// 子批次内的下一道工序
    pub fn find_successor(&self, stage: &StageExecution) -> RepositoryResult<Option<StageExecution>> {
        let conn = self.get_conn()?;
        let mut list = Self::query_list(
            &conn,
            "WHERE sub_batch_id = ?1 AND sequence_no > ?2",
            "ORDER BY sequence_no ASC LIMIT 1",
            params![stage.sub_batch_id, stage.sequence_no],
        )?;
        Ok(list.pop())
    }

    /// 机台最近一次完成的非换型工序的零件
    ///
    /// 按 end_time 降序取第一条；机台无记录返回 None
    pub fn find_last_detail_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let detail = conn
            .query_row(
                r#"
                SELECT detail_id FROM stage_execution
                WHERE machine_id = ?1 AND status = 'COMPLETED' AND is_setup = 0
                  AND end_time IS NOT NULL
                ORDER BY end_time DESC
                LIMIT 1
                "#,
                params![machine_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(detail)
    }
}
