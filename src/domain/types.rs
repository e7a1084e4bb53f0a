// ==========================================
// 生产排程引擎 - 领域类型定义
// ==========================================
// 工序执行状态、状态迁移类型
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 工序执行状态 (Stage Status)
// ==========================================
// 终态: Completed / Cancelled
// Error 需人工处理，不自动释放任何约束
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,    // 待处理（已创建，前序未完成）
    InQueue,    // 排队中（等待机台）
    InProgress, // 加工中（占用机台）
    Paused,     // 已暂停（释放机台锁，保留机台绑定）
    Completed,  // 已完成
    Cancelled,  // 已取消
    Error,      // 异常
}

impl StageStatus {
    /// 数据库存储值
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::InQueue => "IN_QUEUE",
            StageStatus::InProgress => "IN_PROGRESS",
            StageStatus::Paused => "PAUSED",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Cancelled => "CANCELLED",
            StageStatus::Error => "ERROR",
        }
    }

    /// 从数据库值解析
    ///
    /// 未知值返回 None，由调用方决定如何处理（仓储层会转为 FieldValueError）
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(StageStatus::Pending),
            "IN_QUEUE" | "WAITING" => Some(StageStatus::InQueue),
            "IN_PROGRESS" => Some(StageStatus::InProgress),
            "PAUSED" => Some(StageStatus::Paused),
            "COMPLETED" => Some(StageStatus::Completed),
            "CANCELLED" => Some(StageStatus::Cancelled),
            "ERROR" => Some(StageStatus::Error),
            _ => None,
        }
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Cancelled)
    }

    /// 是否持有机台锁
    pub fn holds_machine(&self) -> bool {
        matches!(self, StageStatus::InProgress)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 状态迁移类型 (Transition Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    Enqueue,  // Pending → InQueue
    Start,    // InQueue → InProgress
    Pause,    // InProgress → Paused
    Resume,   // Paused → InProgress
    Complete, // InProgress|Paused → Completed
    Cancel,   // 非终态 → Cancelled
    Fail,     // 任意 → Error
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enqueue => "ENQUEUE",
            TransitionKind::Start => "START",
            TransitionKind::Pause => "PAUSE",
            TransitionKind::Resume => "RESUME",
            TransitionKind::Complete => "COMPLETE",
            TransitionKind::Cancel => "CANCEL",
            TransitionKind::Fail => "FAIL",
        }
    }

    /// 迁移目标状态
    pub fn target(&self) -> StageStatus {
        match self {
            TransitionKind::Enqueue => StageStatus::InQueue,
            TransitionKind::Start | TransitionKind::Resume => StageStatus::InProgress,
            TransitionKind::Pause => StageStatus::Paused,
            TransitionKind::Complete => StageStatus::Completed,
            TransitionKind::Cancel => StageStatus::Cancelled,
            TransitionKind::Fail => StageStatus::Error,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_db_round_trip() {
        for status in [
            StageStatus::Pending,
            StageStatus::InQueue,
            StageStatus::InProgress,
            StageStatus::Paused,
            StageStatus::Completed,
            StageStatus::Cancelled,
            StageStatus::Error,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("waiting"), Some(StageStatus::InQueue));
        assert_eq!(StageStatus::parse("BOGUS"), None);
    }

    #[test]
    fn test_only_in_progress_holds_machine() {
        assert!(StageStatus::InProgress.holds_machine());
        assert!(!StageStatus::Paused.holds_machine());
        assert!(!StageStatus::InQueue.holds_machine());
    }
}
