// ==========================================
// 生产排程引擎 - 工序执行状态机
// ==========================================
// 合法迁移 (源 → 目标, 守卫, 副作用):
// - Pending → InQueue        前序全部完成、尚未绑定机台；记录入队时间
// - InQueue → InProgress     机台空闲、前序全部完成；start_time = now，绑定机台
// - InProgress → Paused      记录 pause_time；释放机台锁
// - Paused → InProgress      机台重新空闲；resume_time = now
// - InProgress|Paused → Completed   end_time = now；释放机台锁
// - 非终态 → Cancelled       管理操作
// - 任意 → Error             不可恢复故障，需人工处理
// ==========================================
// 纯函数: 外部事实（前序/机台占用）由调用方在同一事务内查询后传入
// ==========================================

use crate::domain::stage::{StageExecution, TransitionActor};
use crate::domain::types::{StageStatus, TransitionKind};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// 状态机守卫违反
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("无效的状态转换: stage_id={stage_id}, from={from}, transition={transition}")]
    InvalidTransition {
        stage_id: String,
        from: StageStatus,
        transition: TransitionKind,
    },

    #[error("前序工序未完成: stage_id={stage_id}, 未完成数量={unfinished}")]
    PredecessorNotCompleted { stage_id: String, unfinished: usize },

    #[error("机台被占用: machine_id={machine_id}, 占用工序={occupant_stage_id}")]
    MachineOccupied {
        machine_id: String,
        occupant_stage_id: String,
    },

    #[error("工序未绑定机台: stage_id={stage_id}")]
    MachineNotAssigned { stage_id: String },

    #[error("入队前工序已绑定机台: stage_id={stage_id}, machine_id={machine_id}")]
    MachineAlreadyAssigned { stage_id: String, machine_id: String },
}

/// 迁移命令
#[derive(Debug, Clone)]
pub struct TransitionCommand {
    pub kind: TransitionKind,
    /// 仅 Start 使用: 指定开工机台（None 时使用已绑定机台）
    pub machine_id: Option<String>,
    pub actor: TransitionActor,
}

impl TransitionCommand {
    pub fn new(kind: TransitionKind, actor: TransitionActor) -> Self {
        Self {
            kind,
            machine_id: None,
            actor,
        }
    }

    pub fn start_on(machine_id: impl Into<String>, actor: TransitionActor) -> Self {
        Self {
            kind: TransitionKind::Start,
            machine_id: Some(machine_id.into()),
            actor,
        }
    }

    /// 本次迁移将要占用的机台
    pub fn target_machine<'a>(&'a self, stage: &'a StageExecution) -> Option<&'a str> {
        match self.kind {
            TransitionKind::Start => self
                .machine_id
                .as_deref()
                .or(stage.machine_id.as_deref()),
            TransitionKind::Resume => stage.machine_id.as_deref(),
            _ => None,
        }
    }
}

/// 守卫上下文（在迁移所在事务内读取）
#[derive(Debug, Clone, Default)]
pub struct GuardContext {
    /// 同一子批次内序号更小且未完成的工序数量
    pub unfinished_predecessors: usize,
    /// 目标机台上当前 InProgress 的其他工序
    pub machine_occupant: Option<String>,
}

/// 工序执行状态机
pub struct StageStateMachine;

impl StageStateMachine {
    /// 判断迁移在源状态上是否合法（不检查外部守卫）
    pub fn is_allowed(from: StageStatus, kind: TransitionKind) -> bool {
        match kind {
            TransitionKind::Enqueue => from == StageStatus::Pending,
            TransitionKind::Start => from == StageStatus::InQueue,
            TransitionKind::Pause => from == StageStatus::InProgress,
            TransitionKind::Resume => from == StageStatus::Paused,
            TransitionKind::Complete => {
                matches!(from, StageStatus::InProgress | StageStatus::Paused)
            }
            TransitionKind::Cancel => !from.is_terminal(),
            TransitionKind::Fail => from != StageStatus::Error,
        }
    }

    /// 应用迁移
    ///
    /// # 返回
    /// - Ok(from): 迁移前状态；stage 已就地更新
    /// - Err: 守卫违反，stage 保持不变
    pub fn apply(
        stage: &mut StageExecution,
        command: &TransitionCommand,
        guard: &GuardContext,
        now: DateTime<Utc>,
    ) -> Result<StageStatus, TransitionError> {
        let from = stage.status;
        if !Self::is_allowed(from, command.kind) {
            return Err(TransitionError::InvalidTransition {
                stage_id: stage.stage_id.clone(),
                from,
                transition: command.kind,
            });
        }

        match command.kind {
            TransitionKind::Enqueue => {
                Self::check_predecessors(stage, guard)?;
                if let Some(machine_id) = &stage.machine_id {
                    return Err(TransitionError::MachineAlreadyAssigned {
                        stage_id: stage.stage_id.clone(),
                        machine_id: machine_id.clone(),
                    });
                }
                stage.queued_at = Some(now);
            }
            TransitionKind::Start => {
                let machine_id = command
                    .target_machine(stage)
                    .map(str::to_string)
                    .ok_or_else(|| TransitionError::MachineNotAssigned {
                        stage_id: stage.stage_id.clone(),
                    })?;
                Self::check_predecessors(stage, guard)?;
                Self::check_machine_free(stage, &machine_id, guard)?;
                stage.machine_id = Some(machine_id);
                stage.start_time = Some(now);
                stage.paused_by_system = false;
            }
            TransitionKind::Pause => {
                stage.pause_time = Some(now);
                stage.paused_by_system = command.actor.is_system();
            }
            TransitionKind::Resume => {
                let machine_id = stage.machine_id.clone().ok_or_else(|| {
                    TransitionError::MachineNotAssigned {
                        stage_id: stage.stage_id.clone(),
                    }
                })?;
                Self::check_machine_free(stage, &machine_id, guard)?;
                stage.resume_time = Some(now);
                stage.paused_by_system = false;
            }
            TransitionKind::Complete => {
                stage.end_time = Some(now);
                stage.paused_by_system = false;
            }
            TransitionKind::Cancel | TransitionKind::Fail => {
                stage.paused_by_system = false;
            }
        }

        stage.status = command.kind.target();
        stage.operator_id = Some(command.actor.operator_id.clone());
        stage.device_id = Some(command.actor.device_id.clone());
        stage.reason_note = Some(command.actor.reason_note.clone());
        stage.updated_at = now;
        Ok(from)
    }

    fn check_predecessors(
        stage: &StageExecution,
        guard: &GuardContext,
    ) -> Result<(), TransitionError> {
        if guard.unfinished_predecessors > 0 {
            return Err(TransitionError::PredecessorNotCompleted {
                stage_id: stage.stage_id.clone(),
                unfinished: guard.unfinished_predecessors,
            });
        }
        Ok(())
    }

    fn check_machine_free(
        stage: &StageExecution,
        machine_id: &str,
        guard: &GuardContext,
    ) -> Result<(), TransitionError> {
        match &guard.machine_occupant {
            Some(occupant) if occupant != &stage.stage_id => Err(TransitionError::MachineOccupied {
                machine_id: machine_id.to_string(),
                occupant_stage_id: occupant.clone(),
            }),
            _ => Ok(()),
        }
    }
}
