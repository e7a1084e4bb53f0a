// ==========================================
// 生产排程引擎 - 引擎层错误类型
// ==========================================

use crate::domain::state_machine::TransitionError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 排程引擎错误
#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("无可用机台: stage_id={stage_id}, machine_type_id={machine_type_id}")]
    NoEligibleMachine {
        stage_id: String,
        machine_type_id: String,
    },

    #[error("工序不存在: {0}")]
    StageNotFound(String),

    #[error("工艺路线不存在或为空: detail_id={0}")]
    RouteNotFound(String),

    #[error("无效的建批请求: {0}")]
    InvalidPlanRequest(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for SchedulingError {
    fn from(err: RepositoryError) -> Self {
        // 守卫违反提升为引擎层的一等错误，便于调用方匹配
        match err {
            RepositoryError::Transition(e) => SchedulingError::Transition(e),
            other => SchedulingError::Repository(other),
        }
    }
}

impl SchedulingError {
    /// 是否为机台竞争（预期竞态，下个周期重试）
    pub fn is_machine_race(&self) -> bool {
        match self {
            SchedulingError::Transition(TransitionError::MachineOccupied { .. }) => true,
            SchedulingError::Repository(e) => e.is_machine_race(),
            _ => false,
        }
    }
}

/// 引擎层 Result 类型别名
pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// 班次规则结构错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("休息窗口起止颠倒: {start}-{end}")]
    InvertedBreak { start: String, end: String },

    #[error("工作窗口为空: 上班与下班时间相同 ({0})")]
    EmptyWorkWindow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_is_lifted_out_of_repository() {
        let err: SchedulingError = RepositoryError::Transition(TransitionError::MachineOccupied {
            machine_id: "M1".to_string(),
            occupant_stage_id: "S9".to_string(),
        })
        .into();
        assert!(matches!(err, SchedulingError::Transition(_)));
        assert!(err.is_machine_race());

        let other: SchedulingError = RepositoryError::LockError("poisoned".to_string()).into();
        assert!(!other.is_machine_race());
    }
}
