// ==========================================
// 生产排程引擎 - SQLite 持久化网关
// ==========================================
// 职责: 聚合各仓储，实现引擎层 ProductionGateway
// 全部仓储共享同一 Arc<Mutex<Connection>>，写入天然串行
// ==========================================

use crate::db::{ensure_schema, open_sqlite_connection};
use crate::domain::production::{BatchPlan, Machine, Route, RouteStage};
use crate::domain::stage::StageExecution;
use crate::domain::state_machine::TransitionCommand;
use crate::domain::types::StageStatus;
use crate::engine::gateway::ProductionGateway;
use crate::repository::error::RepositoryResult;
use crate::repository::{
    BatchRepository, MachineRepository, RouteRepository, SetupTimeRepository,
    StageExecutionRepository, TransitionLogRepository,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// SQLite 持久化网关
pub struct SqliteProductionGateway {
    stage_repo: StageExecutionRepository,
    machine_repo: MachineRepository,
    route_repo: RouteRepository,
    setup_time_repo: SetupTimeRepository,
    batch_repo: BatchRepository,
    transition_log_repo: TransitionLogRepository,
}

impl SqliteProductionGateway {
    /// 从已有连接创建网关
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            stage_repo: StageExecutionRepository::new(conn.clone()),
            machine_repo: MachineRepository::new(conn.clone()),
            route_repo: RouteRepository::new(conn.clone()),
            setup_time_repo: SetupTimeRepository::new(conn.clone()),
            batch_repo: BatchRepository::new(conn.clone()),
            transition_log_repo: TransitionLogRepository::new(conn),
        }
    }

    /// 打开数据库文件、建表并创建网关
    pub fn open(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        ensure_schema(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    pub fn stages(&self) -> &StageExecutionRepository {
        &self.stage_repo
    }

    pub fn machines(&self) -> &MachineRepository {
        &self.machine_repo
    }

    pub fn routes(&self) -> &RouteRepository {
        &self.route_repo
    }

    pub fn setup_times(&self) -> &SetupTimeRepository {
        &self.setup_time_repo
    }

    pub fn batches(&self) -> &BatchRepository {
        &self.batch_repo
    }

    pub fn transition_log(&self) -> &TransitionLogRepository {
        &self.transition_log_repo
    }
}

impl ProductionGateway for SqliteProductionGateway {
    fn find_stage(&self, stage_id: &str) -> RepositoryResult<Option<StageExecution>> {
        self.stage_repo.find_by_id(stage_id)
    }

    fn find_in_progress(&self) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_by_status(StageStatus::InProgress)
    }

    fn find_queued(&self) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_by_status(StageStatus::InQueue)
    }

    fn find_pending_ready(&self) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_pending_ready()
    }

    fn find_system_paused(&self) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_system_paused()
    }

    fn find_completed_since(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_completed_since(since)
    }

    fn find_running_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<StageExecution>> {
        self.stage_repo.find_running_on_machine(machine_id)
    }

    fn find_successor(&self, stage: &StageExecution) -> RepositoryResult<Option<StageExecution>> {
        self.stage_repo.find_successor(stage)
    }

    fn find_stages_by_sub_batch(&self, sub_batch_id: &str) -> RepositoryResult<Vec<StageExecution>> {
        self.stage_repo.find_by_sub_batch(sub_batch_id)
    }

    fn apply_transition(
        &self,
        stage_id: &str,
        command: &TransitionCommand,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<StageExecution> {
        self.stage_repo
            .apply_transition(stage_id, command, expected_revision, now)
    }

    fn assign_machine(
        &self,
        stage_id: &str,
        machine_id: &str,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        self.stage_repo
            .assign_machine(stage_id, machine_id, expected_revision, now)
    }

    fn insert_setup_stage_before(
        &self,
        successor: &StageExecution,
        setup: &StageExecution,
    ) -> RepositoryResult<bool> {
        self.stage_repo.insert_setup_before(successor, setup)
    }

    fn save_queue_positions(&self, positions: &[(String, i32)]) -> RepositoryResult<usize> {
        self.stage_repo.save_queue_positions(positions)
    }

    fn pin_machine(&self, stage_id: &str, machine_id: &str, now: DateTime<Utc>) -> RepositoryResult<bool> {
        self.stage_repo.pin_machine(stage_id, machine_id, now)
    }

    fn find_machine(&self, machine_id: &str) -> RepositoryResult<Option<Machine>> {
        self.machine_repo.find_by_id(machine_id)
    }

    fn find_machines_by_type(&self, machine_type_id: &str) -> RepositoryResult<Vec<Machine>> {
        self.machine_repo.find_active_by_type(machine_type_id)
    }

    fn find_route(&self, detail_id: &str) -> RepositoryResult<Option<Route>> {
        self.route_repo.find_route(detail_id)
    }

    fn find_route_stage(&self, route_stage_id: &str) -> RepositoryResult<Option<RouteStage>> {
        self.route_repo.find_route_stage(route_stage_id)
    }

    fn find_setup_time(
        &self,
        machine_id: &str,
        from_detail_id: &str,
        to_detail_id: &str,
    ) -> RepositoryResult<Option<f64>> {
        self.setup_time_repo
            .find(machine_id, from_detail_id, to_detail_id)
    }

    fn find_last_detail_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<String>> {
        self.stage_repo.find_last_detail_on_machine(machine_id)
    }

    fn insert_batch_plan(&self, plan: &BatchPlan) -> RepositoryResult<()> {
        self.batch_repo.insert_plan(plan)
    }
}
