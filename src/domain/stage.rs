// ==========================================
// 生产排程引擎 - 工序执行领域模型
// ==========================================
// StageExecution: 一条工艺路线工序作用于一个子批次
// 生命周期: 创建即 Pending，仅能通过状态机迁移修改，永不删除
// ==========================================

use crate::domain::types::StageStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 自动排程使用的保留操作员ID
pub const SYSTEM_OPERATOR_ID: &str = "SYSTEM";

/// 自动排程使用的保留设备ID
pub const SYSTEM_DEVICE_ID: &str = "AUTO-SCHEDULER";

/// 小时数转换为 chrono::Duration（毫秒精度）
pub fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

/// Duration 转换为小时数
pub fn duration_to_hours(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}

// ==========================================
// StageExecution - 工序执行
// ==========================================
// 对齐: stage_execution 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    // ===== 标识 =====
    pub stage_id: String,
    pub batch_id: String,
    pub sub_batch_id: String,
    pub route_stage_id: String,
    pub detail_id: String,
    pub machine_type_id: String,

    // ===== 顺序 =====
    pub stage_order: i32, // 工艺路线顺序
    pub sequence_no: i32, // 子批次内序号（含插入的换型工序）

    // ===== 计划 =====
    pub is_setup: bool,
    pub quantity: i32,
    pub planned_hours: f64,
    pub priority: i32,
    pub is_critical: bool,

    // ===== 执行状态 =====
    pub status: StageStatus,
    pub machine_id: Option<String>,
    /// 指定机台: 换型工序及其后继只能在该机台加工
    pub target_machine_id: Option<String>,
    pub queue_position: Option<i32>,
    pub queued_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub resume_time: Option<DateTime<Utc>>,
    pub paused_by_system: bool,

    // ===== 最近一次迁移归属 =====
    pub operator_id: Option<String>,
    pub device_id: Option<String>,
    pub reason_note: Option<String>,

    // ===== 审计 =====
    pub batch_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i32, // 乐观锁
}

impl StageExecution {
    /// 计划时长
    pub fn planned_duration(&self) -> Duration {
        hours_to_duration(self.planned_hours)
    }

    /// 已用时长 = now - start_time（未开工返回 None）
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.start_time.map(|start| now - start)
    }

    /// 剩余时长 = 计划 - 已用（可为负）
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.elapsed(now).map(|e| self.planned_duration() - e)
    }

    /// 超出计划的时长 = 已用 - 计划（可为负）
    pub fn overrun(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.elapsed(now).map(|e| e - self.planned_duration())
    }

    /// 是否由系统暂停（可被自动恢复）
    pub fn is_system_paused(&self) -> bool {
        self.status == StageStatus::Paused && self.paused_by_system
    }

    /// 最近一次迁移是否由系统发起
    pub fn last_transition_by_system(&self) -> bool {
        self.operator_id.as_deref() == Some(SYSTEM_OPERATOR_ID)
    }
}

// ==========================================
// TransitionActor - 迁移归属
// ==========================================
// 每次迁移必须可追溯: 操作员 / 设备 / 原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionActor {
    pub operator_id: String,
    pub device_id: String,
    pub reason_note: String,
}

impl TransitionActor {
    /// 自动排程发起的迁移
    pub fn system(reason_note: impl Into<String>) -> Self {
        Self {
            operator_id: SYSTEM_OPERATOR_ID.to_string(),
            device_id: SYSTEM_DEVICE_ID.to_string(),
            reason_note: reason_note.into(),
        }
    }

    /// 人工发起的迁移
    pub fn manual(
        operator_id: impl Into<String>,
        device_id: impl Into<String>,
        reason_note: impl Into<String>,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            device_id: device_id.into(),
            reason_note: reason_note.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.operator_id == SYSTEM_OPERATOR_ID && self.device_id == SYSTEM_DEVICE_ID
    }
}

// ==========================================
// StageTransitionRecord - 迁移审计记录
// ==========================================
// 对齐: stage_transition_log 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransitionRecord {
    pub log_id: String,
    pub stage_id: String,
    pub from_status: StageStatus,
    pub to_status: StageStatus,
    pub machine_id: Option<String>,
    pub operator_id: String,
    pub device_id: String,
    pub reason_note: String,
    pub paused_by_system: bool,
    pub occurred_at: DateTime<Utc>,
}
