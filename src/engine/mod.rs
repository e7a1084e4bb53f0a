// ==========================================
// 生产排程引擎 - 引擎层
// ==========================================
// 职责: 实现排程业务规则,不拼 SQL
// 红线: Engine 不拼 SQL, 所有自动迁移必须携带 reason
// ==========================================

pub mod batch_planner;
pub mod error;
pub mod gateway;
pub mod queue_order;
pub mod reconciliation;
pub mod scheduling;
pub mod setup_time;
pub mod shift_calendar;

// 重导出核心引擎
pub use batch_planner::{BatchPlanner, BatchRequest, SplitRequest};
pub use error::{CalendarError, SchedulingError, SchedulingResult};
pub use gateway::ProductionGateway;
pub use queue_order::{QueueKey, QueueSorter};
pub use reconciliation::{
    is_overdue, should_continue_outside_working_hours, ReconciliationLoop, TickReport,
};
pub use scheduling::{CompletionOutcome, QueueOptimization, SchedulingEngine};
pub use setup_time::{SetupRequirement, SetupTimeMatrix};
pub use shift_calendar::ShiftCalendar;
