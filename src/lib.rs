// ==========================================
// 生产排程引擎 - 核心库
// ==========================================
// 班次日历 / 工序状态机 / 换型与选机 / 批次计划 / 调和循环
// 技术栈: Rust + SQLite + Tokio
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/建表）
pub mod db;

// 日志系统
pub mod logging;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{StageStatus, TransitionKind};

// 领域实体
pub use domain::{
    Batch, BatchPlan, Machine, Route, RouteStage, StageExecution, SubBatch, TransitionActor,
};

// 引擎
pub use engine::{
    BatchPlanner, ProductionGateway, ReconciliationLoop, SchedulingEngine, SchedulingError,
    SetupTimeMatrix, ShiftCalendar, TickReport,
};

// 仓储
pub use repository::{RepositoryError, SqliteProductionGateway};

// 配置
pub use config::{ConfigManager, SchedulerConfig, ShiftRules};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "生产排程引擎";
