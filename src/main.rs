// ==========================================
// 生产排程引擎 - 主入口
// ==========================================
// 初始化日志 → 打开数据库并建表 → 加载配置 → 运行调和循环直到 Ctrl-C
// ==========================================

use anyhow::{anyhow, Context};
use production_scheduler::config::ConfigManager;
use production_scheduler::db::{ensure_schema, open_sqlite_connection};
use production_scheduler::engine::{ReconciliationLoop, ShiftCalendar};
use production_scheduler::repository::SqliteProductionGateway;
use production_scheduler::{logging, APP_NAME, VERSION};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// 数据库路径环境变量
const DB_PATH_ENV: &str = "PRODUCTION_SCHEDULER_DB_PATH";

/// 获取默认数据库路径
fn get_default_db_path() -> String {
    // 允许通过环境变量显式指定 DB 路径（便于调试/测试/CI）
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./production_scheduler.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("production-scheduler");
        // 确保目录存在
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("production_scheduler.db");
        }
    }
    path.to_string_lossy().to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{} v{}", APP_NAME, VERSION);
    tracing::info!("==================================================");

    let db_path = get_default_db_path();
    tracing::info!("使用数据库: {}", db_path);

    let conn = open_sqlite_connection(&db_path)
        .with_context(|| format!("无法打开数据库: {}", db_path))?;
    ensure_schema(&conn).context("数据库建表失败")?;
    let conn = Arc::new(Mutex::new(conn));

    let config_manager = ConfigManager::from_connection(conn.clone())
        .map_err(|e| anyhow!(e))
        .context("配置表初始化失败")?;
    let scheduler_config = config_manager
        .load_scheduler_config()
        .map_err(|e| anyhow!(e))
        .context("加载调和循环配置失败")?;
    let shift_rules = config_manager
        .load_shift_rules()
        .map_err(|e| anyhow!(e))
        .context("加载班次规则失败")?;
    let overrides = config_manager
        .get_config_snapshot()
        .map_err(|e| anyhow!(e))
        .context("读取配置快照失败")?;
    tracing::info!(?scheduler_config, ?shift_rules, overrides = %overrides, "配置已加载");

    let calendar = ShiftCalendar::new(shift_rules, scheduler_config.facility_utc_offset_minutes);
    if let Err(e) = calendar.validate() {
        tracing::error!(error = %e, "班次规则无效，判定将按工作中放行");
    }

    let gateway = Arc::new(SqliteProductionGateway::new(conn));
    let reconciliation = Arc::new(ReconciliationLoop::new(gateway, calendar, scheduler_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(reconciliation.run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("无法监听 Ctrl-C")?;
    tracing::info!("收到停止信号，等待当前周期结束...");
    let _ = shutdown_tx.send(true);

    worker.await.context("调和循环任务异常退出")?;
    tracing::info!("已退出");
    Ok(())
}
