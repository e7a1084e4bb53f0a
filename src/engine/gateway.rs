// ==========================================
// 生产排程引擎 - 持久化网关 Trait
// ==========================================
// 职责: 引擎层定义数据访问契约，仓储层实现（依赖倒置）
// 说明: 引擎不拼 SQL；超时/重试属于网关自身，引擎不关心
// ==========================================

use crate::domain::production::{BatchPlan, Machine, Route, RouteStage};
use crate::domain::stage::StageExecution;
use crate::domain::state_machine::TransitionCommand;
use crate::repository::RepositoryResult;
use chrono::{DateTime, Utc};

/// 持久化网关
///
/// # 实现说明
/// - `repository::SqliteProductionGateway` 为生产实现
/// - `apply_transition` 必须对同一工序、同一机台原子执行
/// - 所有列表查询按调度顺序返回: 优先级降序 → 批次创建时间升序 → 工序创建时间升序
pub trait ProductionGateway: Send + Sync {
    // ===== 工序读取 =====
    fn find_stage(&self, stage_id: &str) -> RepositoryResult<Option<StageExecution>>;
    fn find_in_progress(&self) -> RepositoryResult<Vec<StageExecution>>;
    fn find_queued(&self) -> RepositoryResult<Vec<StageExecution>>;
    /// 前序全部完成的 Pending 工序
    fn find_pending_ready(&self) -> RepositoryResult<Vec<StageExecution>>;
    fn find_system_paused(&self) -> RepositoryResult<Vec<StageExecution>>;
    fn find_completed_since(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<StageExecution>>;
    fn find_running_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<StageExecution>>;
    fn find_successor(&self, stage: &StageExecution) -> RepositoryResult<Option<StageExecution>>;
    fn find_stages_by_sub_batch(&self, sub_batch_id: &str) -> RepositoryResult<Vec<StageExecution>>;

    // ===== 工序写入 =====
    fn apply_transition(
        &self,
        stage_id: &str,
        command: &TransitionCommand,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<StageExecution>;
    fn assign_machine(
        &self,
        stage_id: &str,
        machine_id: &str,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool>;
    fn insert_setup_stage_before(
        &self,
        successor: &StageExecution,
        setup: &StageExecution,
    ) -> RepositoryResult<bool>;
    fn save_queue_positions(&self, positions: &[(String, i32)]) -> RepositoryResult<usize>;
    /// 指定工序的加工机台（仅 Pending/InQueue）
    fn pin_machine(&self, stage_id: &str, machine_id: &str, now: DateTime<Utc>) -> RepositoryResult<bool>;

    // ===== 主数据 =====
    fn find_machine(&self, machine_id: &str) -> RepositoryResult<Option<Machine>>;
    fn find_machines_by_type(&self, machine_type_id: &str) -> RepositoryResult<Vec<Machine>>;
    fn find_route(&self, detail_id: &str) -> RepositoryResult<Option<Route>>;
    fn find_route_stage(&self, route_stage_id: &str) -> RepositoryResult<Option<RouteStage>>;

    // ===== 换型 =====
    fn find_setup_time(
        &self,
        machine_id: &str,
        from_detail_id: &str,
        to_detail_id: &str,
    ) -> RepositoryResult<Option<f64>>;
    fn find_last_detail_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<String>>;

    // ===== 批次 =====
    fn insert_batch_plan(&self, plan: &BatchPlan) -> RepositoryResult<()>;
}
