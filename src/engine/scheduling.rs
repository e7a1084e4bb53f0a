// ==========================================
// 生产排程引擎 - 排程引擎
// ==========================================
// 职责:
// - 判定工序能否开工
// - 为排队工序选择机台（换型工时升序 → 机台优先级降序 → machine_id）
//   已被其他排队工序绑定或指定的机台不参与选择
// - 开工（机台竞争返回 false，不是故障）
// - 完工后续: 必要时插入换型工序，后继 Pending → InQueue
//   换型工序完工后，后继加工工序指定在同一机台
// - 队列重排
// - 人工操作: 暂停/恢复/完工/取消/标记异常
// ==========================================
// 红线: 不拼 SQL；所有迁移经网关的原子 apply_transition
// ==========================================

use crate::domain::production::Machine;
use crate::domain::stage::{StageExecution, TransitionActor};
use crate::domain::state_machine::{TransitionCommand, TransitionError};
use crate::domain::types::{StageStatus, TransitionKind};
use crate::engine::batch_planner::setup_stage_for;
use crate::engine::error::{SchedulingError, SchedulingResult};
use crate::engine::gateway::ProductionGateway;
use crate::engine::queue_order::QueueSorter;
use crate::engine::setup_time::{SetupRequirement, SetupTimeMatrix};
use crate::repository::error::RepositoryError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// 完工后续处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CompletionOutcome {
    /// 子批次已无后继工序
    NoSuccessor,
    /// 后继已离开 Pending（重复处理）
    AlreadyAdvanced { successor_stage_id: String },
    /// 后继仍有未完成前序
    SuccessorNotReady { successor_stage_id: String },
    /// 已入队（可能先插入换型工序）
    Promoted {
        stage_id: String,
        setup_inserted: bool,
    },
}

/// 队列重排结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueOptimization {
    pub queues: usize,
    pub positioned: usize,
}

// ==========================================
// SchedulingEngine - 排程引擎
// ==========================================
pub struct SchedulingEngine {
    gateway: Arc<dyn ProductionGateway>,
    setup_matrix: SetupTimeMatrix,
}

impl SchedulingEngine {
    pub fn new(gateway: Arc<dyn ProductionGateway>) -> Self {
        Self {
            setup_matrix: SetupTimeMatrix::new(gateway.clone()),
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ProductionGateway> {
        &self.gateway
    }

    fn load_stage(&self, stage_id: &str) -> SchedulingResult<StageExecution> {
        self.gateway
            .find_stage(stage_id)?
            .ok_or_else(|| SchedulingError::StageNotFound(stage_id.to_string()))
    }

    fn predecessors_completed(&self, stage: &StageExecution) -> SchedulingResult<bool> {
        Ok(self
            .gateway
            .find_stages_by_sub_batch(&stage.sub_batch_id)?
            .iter()
            .filter(|s| s.sequence_no < stage.sequence_no)
            .all(|s| s.status == StageStatus::Completed))
    }

    fn is_machine_free(&self, machine_id: &str, stage_id: &str) -> SchedulingResult<bool> {
        Ok(match self.gateway.find_running_on_machine(machine_id)? {
            Some(running) => running.stage_id == stage_id,
            None => true,
        })
    }

    /// 其他排队工序已绑定或指定的机台
    fn reserved_machines(&self, stage_id: &str) -> SchedulingResult<HashSet<String>> {
        Ok(self
            .gateway
            .find_queued()?
            .into_iter()
            .filter(|s| s.stage_id != stage_id)
            .flat_map(|s| [s.machine_id, s.target_machine_id])
            .flatten()
            .collect())
    }

    /// 可派工机台（按机台优先级降序）
    ///
    /// 指定机台的工序只看该机台；否则取机型下空闲且未被其他排队工序占用的启用机台
    fn dispatchable_machines(&self, stage: &StageExecution) -> SchedulingResult<Vec<Machine>> {
        if let Some(target) = &stage.target_machine_id {
            return Ok(match self.gateway.find_machine(target)? {
                Some(machine)
                    if machine.is_active && self.is_machine_free(target, &stage.stage_id)? =>
                {
                    vec![machine]
                }
                _ => Vec::new(),
            });
        }

        let reserved = self.reserved_machines(&stage.stage_id)?;
        let mut free = Vec::new();
        for machine in self.gateway.find_machines_by_type(&stage.machine_type_id)? {
            if reserved.contains(&machine.machine_id) {
                continue;
            }
            if self.is_machine_free(&machine.machine_id, &stage.stage_id)? {
                free.push(machine);
            }
        }
        Ok(free)
    }

    /// 换型工时升序 → 机台优先级降序 → machine_id
    fn rank_by_setup(
        &self,
        machines: Vec<Machine>,
        detail_id: &str,
    ) -> SchedulingResult<Vec<(SetupRequirement, Machine)>> {
        let mut ranked = Vec::with_capacity(machines.len());
        for machine in machines {
            let requirement = self
                .setup_matrix
                .resolve_for_machine(&machine.machine_id, detail_id)?;
            ranked.push((requirement, machine));
        }
        ranked.sort_by(|(ra, ma), (rb, mb)| {
            ra.cmp_rank(rb)
                .then_with(|| mb.priority.cmp(&ma.priority))
                .then_with(|| ma.machine_id.cmp(&mb.machine_id))
        });
        Ok(ranked)
    }

    /// 已绑定机台被其他工序占用、且未指定机台的排队工序（可改派）
    pub fn is_blocked_on_machine(&self, stage: &StageExecution) -> SchedulingResult<bool> {
        if stage.status != StageStatus::InQueue || stage.target_machine_id.is_some() {
            return Ok(false);
        }
        match &stage.machine_id {
            Some(machine_id) => Ok(!self.is_machine_free(machine_id, &stage.stage_id)?),
            None => Ok(false),
        }
    }

    // ==========================================
    // 核心操作
    // ==========================================

    /// 判断工序能否开工
    ///
    /// 条件: Pending/InQueue、前序全部完成、有可派工机台
    /// （已绑定机台时只看该机台）
    pub fn can_start_stage(&self, stage_id: &str) -> SchedulingResult<bool> {
        let stage = self.load_stage(stage_id)?;
        if !matches!(stage.status, StageStatus::Pending | StageStatus::InQueue) {
            return Ok(false);
        }
        if !self.predecessors_completed(&stage)? {
            return Ok(false);
        }
        match &stage.machine_id {
            Some(machine_id) => self.is_machine_free(machine_id, &stage.stage_id),
            None => Ok(!self.dispatchable_machines(&stage)?.is_empty()),
        }
    }

    /// 为工序选择并绑定机台（不开工）
    ///
    /// Pending 工序先入队；无可派工机台时返回 NoEligibleMachine，工序保持排队。
    /// 已绑定但未开工的工序会被改派
    ///
    /// # 返回
    /// 绑定的 machine_id
    pub fn schedule_stage_execution(&self, stage_id: &str, now: DateTime<Utc>) -> SchedulingResult<String> {
        let mut stage = self.load_stage(stage_id)?;

        if stage.status == StageStatus::Pending {
            let command = TransitionCommand::new(
                TransitionKind::Enqueue,
                TransitionActor::system("排程: 自动入队"),
            );
            stage = self
                .gateway
                .apply_transition(stage_id, &command, Some(stage.revision), now)?;
            tracing::info!(stage_id, "工序已入队");
        }

        if stage.status != StageStatus::InQueue {
            return Err(TransitionError::InvalidTransition {
                stage_id: stage_id.to_string(),
                from: stage.status,
                transition: TransitionKind::Enqueue,
            }
            .into());
        }

        let machines = self.dispatchable_machines(&stage)?;
        let (requirement, machine) = self
            .rank_by_setup(machines, &stage.detail_id)?
            .into_iter()
            .next().ok_or_else(|| {
            SchedulingError::NoEligibleMachine {
                stage_id: stage_id.to_string(),
                machine_type_id: stage.machine_type_id.clone(),
            }
        })?;

        if !self
            .gateway
            .assign_machine(stage_id, &machine.machine_id, Some(stage.revision), now)?
        {
            let actual = self.load_stage(stage_id)?.revision;
            return Err(RepositoryError::OptimisticLockFailure {
                stage_id: stage_id.to_string(),
                expected: stage.revision,
                actual,
            }
            .into());
        }

        tracing::info!(
            stage_id,
            machine_id = %machine.machine_id,
            setup = ?requirement,
            "工序已分配机台"
        );
        Ok(machine.machine_id)
    }

    /// 自动开工 InQueue → InProgress
    ///
    /// # 返回
    /// - Ok(true): 已开工
    /// - Ok(false): 机台在选择与开工之间被占用，或快照已过期（下个周期重试）
    /// - Err: 守卫违反或持久化失败
    pub fn start_pending_stage(&self, stage_id: &str, now: DateTime<Utc>) -> SchedulingResult<bool> {
        self.start_as(stage_id, TransitionActor::system("排程: 自动开工"), now)
    }

    fn start_as(&self, stage_id: &str, actor: TransitionActor, now: DateTime<Utc>) -> SchedulingResult<bool> {
        let stage = self.load_stage(stage_id)?;
        let command = TransitionCommand::new(TransitionKind::Start, actor);

        match self
            .gateway
            .apply_transition(stage_id, &command, Some(stage.revision), now)
        {
            Ok(started) => {
                tracing::info!(
                    stage_id,
                    machine_id = started.machine_id.as_deref().unwrap_or(""),
                    operator_id = %command.actor.operator_id,
                    "工序已开工"
                );
                Ok(true)
            }
            Err(e) if e.is_machine_race() => {
                tracing::debug!(stage_id, error = %e, "机台已被占用，本周期不开工");
                Ok(false)
            }
            Err(RepositoryError::OptimisticLockFailure { .. }) => {
                tracing::debug!(stage_id, "工序快照已过期，本周期不开工");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 完工后续处理（幂等）
    ///
    /// 后继为加工工序、且所有候选机台的上一零件都与后继不同时，
    /// 在后继前插入换型工序；随后把紧邻的下一道工序 Pending → InQueue
    pub fn handle_stage_completion(&self, stage_id: &str, now: DateTime<Utc>) -> SchedulingResult<CompletionOutcome> {
        let stage = self.load_stage(stage_id)?;
        if stage.status != StageStatus::Completed {
            return Err(TransitionError::InvalidTransition {
                stage_id: stage_id.to_string(),
                from: stage.status,
                transition: TransitionKind::Complete,
            }
            .into());
        }

        let successor = match self.gateway.find_successor(&stage)? {
            Some(s) => s,
            None => return Ok(CompletionOutcome::NoSuccessor),
        };
        if successor.status != StageStatus::Pending {
            return Ok(CompletionOutcome::AlreadyAdvanced {
                successor_stage_id: successor.stage_id,
            });
        }

        let mut promote_id = successor.stage_id.clone();
        let mut setup_inserted = false;

        if stage.is_setup && !successor.is_setup {
            if let Some(machine_id) = &stage.machine_id {
                if self.gateway.pin_machine(&successor.stage_id, machine_id, now)? {
                    tracing::info!(
                        stage_id = %successor.stage_id,
                        machine_id = %machine_id,
                        "后继工序已指定换型机台"
                    );
                }
            }
        }

        if !stage.is_setup && !successor.is_setup {
            if let Some(setup) = self.setup_needed_before(&successor, now)? {
                if self.gateway.insert_setup_stage_before(&successor, &setup)? {
                    tracing::info!(
                        stage_id = %setup.stage_id,
                        successor_stage_id = %successor.stage_id,
                        detail_id = %successor.detail_id,
                        setup_hours = setup.planned_hours,
                        "已插入换型工序"
                    );
                    promote_id = setup.stage_id;
                    setup_inserted = true;
                }
            }
        }

        let command = TransitionCommand::new(
            TransitionKind::Enqueue,
            TransitionActor::system(format!("排程: 前序完工自动入队 (前序 {})", stage_id)),
        );
        match self.gateway.apply_transition(&promote_id, &command, None, now) {
            Ok(_) => {
                tracing::info!(stage_id = %promote_id, predecessor_stage_id = stage_id, "后继工序已入队");
                Ok(CompletionOutcome::Promoted {
                    stage_id: promote_id,
                    setup_inserted,
                })
            }
            Err(RepositoryError::Transition(TransitionError::PredecessorNotCompleted { .. })) => {
                Ok(CompletionOutcome::SuccessorNotReady {
                    successor_stage_id: promote_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn setup_needed_before(
        &self,
        successor: &StageExecution,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Option<StageExecution>> {
        let setup_hours = match self.gateway.find_route_stage(&successor.route_stage_id)? {
            Some(route_stage) if route_stage.setup_hours > 0.0 => route_stage.setup_hours,
            _ => return Ok(None),
        };

        let candidates = self.gateway.find_machines_by_type(&successor.machine_type_id)?;
        // 免换型机台排在最前
        let machine = match self
            .rank_by_setup(candidates, &successor.detail_id)?
            .into_iter()
            .next()
        {
            Some((requirement, machine)) if requirement.requires_setup() => machine,
            _ => return Ok(None),
        };

        let mut setup = setup_stage_for(successor, setup_hours, &machine.machine_id, now);
        setup.sequence_no = successor.sequence_no;
        Ok(Some(setup))
    }

    /// 队列重排: 按机台（未绑定按机型）分组，组内按调度顺序写入 1..n
    pub fn optimize_queue(&self) -> SchedulingResult<QueueOptimization> {
        let queued = self.gateway.find_queued()?;
        let grouped = QueueSorter::sort_by_queue(queued);

        let mut positions = Vec::new();
        for queue in grouped.values() {
            for (idx, stage) in queue.iter().enumerate() {
                positions.push((stage.stage_id.clone(), idx as i32 + 1));
            }
        }

        let positioned = self.gateway.save_queue_positions(&positions)?;
        tracing::debug!(queues = grouped.len(), positioned, "队列已重排");
        Ok(QueueOptimization {
            queues: grouped.len(),
            positioned,
        })
    }

    // ==========================================
    // 迁移（自动与人工共用同一守卫）
    // ==========================================

    /// 应用迁移并记录日志
    pub fn transition(
        &self,
        stage_id: &str,
        command: &TransitionCommand,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let stage = self
            .gateway
            .apply_transition(stage_id, command, expected_revision, now)?;
        tracing::info!(
            stage_id,
            transition = %command.kind,
            status = %stage.status,
            operator_id = %command.actor.operator_id,
            device_id = %command.actor.device_id,
            reason = %command.actor.reason_note,
            "工序状态已迁移"
        );
        Ok(stage)
    }

    /// 人工开工（需已绑定机台）
    pub fn start_stage(&self, stage_id: &str, actor: TransitionActor, now: DateTime<Utc>) -> SchedulingResult<bool> {
        self.start_as(stage_id, actor, now)
    }

    pub fn pause_stage(
        &self,
        stage_id: &str,
        actor: TransitionActor,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let command = TransitionCommand::new(TransitionKind::Pause, actor);
        self.transition(stage_id, &command, expected_revision, now)
    }

    /// 恢复；机台被其他工序占用时返回 Transition(MachineOccupied)
    pub fn resume_stage(
        &self,
        stage_id: &str,
        actor: TransitionActor,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let command = TransitionCommand::new(TransitionKind::Resume, actor);
        self.transition(stage_id, &command, expected_revision, now)
    }

    /// 完工，并立即执行完工后续处理
    ///
    /// 后续处理失败只记录日志: 调和循环的完工回看阶段会再次处理
    pub fn complete_stage(
        &self,
        stage_id: &str,
        actor: TransitionActor,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let command = TransitionCommand::new(TransitionKind::Complete, actor);
        let stage = self.transition(stage_id, &command, expected_revision, now)?;
        if let Err(e) = self.handle_stage_completion(stage_id, now) {
            tracing::error!(stage_id, error = %e, "完工后续处理失败，等待调和循环重试");
        }
        Ok(stage)
    }

    pub fn cancel_stage(
        &self,
        stage_id: &str,
        actor: TransitionActor,
        expected_revision: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let command = TransitionCommand::new(TransitionKind::Cancel, actor);
        self.transition(stage_id, &command, expected_revision, now)
    }

    /// 标记异常（需人工处理）
    pub fn mark_stage_error(
        &self,
        stage_id: &str,
        actor: TransitionActor,
        now: DateTime<Utc>,
    ) -> SchedulingResult<StageExecution> {
        let command = TransitionCommand::new(TransitionKind::Fail, actor);
        let stage = self.transition(stage_id, &command, None, now)?;
        tracing::warn!(stage_id, machine_id = ?stage.machine_id, "工序已标记异常，需人工处理");
        Ok(stage)
    }
}
