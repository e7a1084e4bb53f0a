// ==========================================
// 生产排程引擎 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、工序状态机
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod production;
pub mod stage;
pub mod state_machine;
pub mod types;

// 重导出核心类型
pub use production::{
    Batch, BatchPlan, Detail, Machine, MachineType, Route, RouteStage, SetupTimeEntry, SubBatch,
};
pub use stage::{
    duration_to_hours, hours_to_duration, StageExecution, StageTransitionRecord, TransitionActor,
    SYSTEM_DEVICE_ID, SYSTEM_OPERATOR_ID,
};
pub use state_machine::{GuardContext, StageStateMachine, TransitionCommand, TransitionError};
pub use types::{StageStatus, TransitionKind};
