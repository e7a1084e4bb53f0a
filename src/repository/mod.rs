// ==========================================
// 生产排程引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod batch_repo;
pub mod error;
pub mod machine_repo;
pub mod production_gateway;
pub mod route_repo;
mod row_mapping;
pub mod setup_time_repo;
pub mod stage_repo;
pub mod transition_log_repo;

// 重导出核心仓储
pub use batch_repo::BatchRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use machine_repo::MachineRepository;
pub use production_gateway::SqliteProductionGateway;
pub use route_repo::RouteRepository;
pub use setup_time_repo::SetupTimeRepository;
pub use stage_repo::StageExecutionRepository;
pub use transition_log_repo::TransitionLogRepository;
