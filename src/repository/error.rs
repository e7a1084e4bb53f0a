// ==========================================
// 生产排程引擎 - 仓储层错误类型
// ==========================================
// 工具: thiserror 派生宏
// ==========================================

use crate::domain::state_machine::TransitionError;
use thiserror::Error;

/// 仓储层错误类型
#[derive(Error, Debug)]
pub enum RepositoryError {
    // ===== 并发控制错误 =====
    #[error("乐观锁冲突: stage_id={stage_id}, expected_revision={expected}, actual_revision={actual}")]
    OptimisticLockFailure {
        stage_id: String,
        expected: i32,
        actual: i32,
    },

    // ===== 状态机守卫 =====
    #[error(transparent)]
    Transition(#[from] TransitionError),

    // ===== 数据库错误 =====
    #[error("记录未找到: {entity} with id={id}")]
    NotFound { entity: String, id: String },

    #[error("数据库锁获取失败: {0}")]
    LockError(String),

    #[error("数据库查询失败: {0}")]
    DatabaseQueryError(String),

    #[error("唯一约束违反: {0}")]
    UniqueConstraintViolation(String),

    #[error("外键约束违反: {0}")]
    ForeignKeyViolation(String),

    // ===== 数据质量错误 =====
    #[error("字段值错误 (field={field}): {message}")]
    FieldValueError { field: String, message: String },
}

impl RepositoryError {
    /// 是否为机台占用冲突
    pub fn is_machine_race(&self) -> bool {
        match self {
            RepositoryError::Transition(TransitionError::MachineOccupied { .. }) => true,
            // 部分唯一索引兜底触发
            RepositoryError::UniqueConstraintViolation(msg) => msg.contains("machine_id"),
            _ => false,
        }
    }
}

// 实现 From<rusqlite::Error>
impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) => {
                if msg.contains("UNIQUE") {
                    RepositoryError::UniqueConstraintViolation(msg)
                } else if msg.contains("FOREIGN KEY") {
                    RepositoryError::ForeignKeyViolation(msg)
                } else {
                    RepositoryError::DatabaseQueryError(msg)
                }
            }
            rusqlite::Error::QueryReturnedNoRows => RepositoryError::NotFound {
                entity: "Unknown".to_string(),
                id: "Unknown".to_string(),
            },
            _ => RepositoryError::DatabaseQueryError(err.to_string()),
        }
    }
}

/// Result 类型别名
pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_race_detection() {
        let err: RepositoryError = TransitionError::MachineOccupied {
            machine_id: "M1".to_string(),
            occupant_stage_id: "S9".to_string(),
        }
        .into();
        assert!(err.is_machine_race());

        let err = RepositoryError::UniqueConstraintViolation(
            "UNIQUE constraint failed: stage_execution.machine_id".to_string(),
        );
        assert!(err.is_machine_race());

        let err: RepositoryError = TransitionError::PredecessorNotCompleted {
            stage_id: "S1".to_string(),
            unfinished: 1,
        }
        .into();
        assert!(!err.is_machine_race());
    }
}
