// ==========================================
// 生产排程引擎 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发写入时的偶发 busy 错误
// - 统一建表（幂等）与时间戳存储格式
// ==========================================

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开内存数据库并建表（单元测试用）
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_sqlite_connection(&conn)?;
    ensure_schema(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 建表（幂等）
///
/// 说明：
/// - 机台互斥的最终兜底是部分唯一索引 ux_stage_machine_running：
///   同一 machine_id 至多一行 status='IN_PROGRESS'
/// - 时间戳统一为 RFC3339 毫秒精度 UTC 文本，字典序即时间序
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS machine_type (
            machine_type_id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS machine (
            machine_id TEXT PRIMARY KEY,
            machine_type_id TEXT NOT NULL REFERENCES machine_type(machine_type_id),
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS detail (
            detail_id TEXT PRIMARY KEY,
            detail_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS route_stage (
            route_stage_id TEXT PRIMARY KEY,
            detail_id TEXT NOT NULL REFERENCES detail(detail_id),
            stage_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            machine_type_id TEXT NOT NULL REFERENCES machine_type(machine_type_id),
            norm_hours_per_unit REAL NOT NULL,
            setup_hours REAL NOT NULL DEFAULT 0,
            UNIQUE (detail_id, stage_order)
        );

        CREATE TABLE IF NOT EXISTS setup_time (
            machine_id TEXT NOT NULL REFERENCES machine(machine_id),
            from_detail_id TEXT NOT NULL REFERENCES detail(detail_id),
            to_detail_id TEXT NOT NULL REFERENCES detail(detail_id),
            setup_hours REAL NOT NULL,
            PRIMARY KEY (machine_id, from_detail_id, to_detail_id)
        );

        CREATE TABLE IF NOT EXISTS batch (
            batch_id TEXT PRIMARY KEY,
            detail_id TEXT NOT NULL REFERENCES detail(detail_id),
            quantity INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            is_critical INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sub_batch (
            sub_batch_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batch(batch_id),
            seq_no INTEGER NOT NULL,
            quantity INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stage_execution (
            stage_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batch(batch_id),
            sub_batch_id TEXT NOT NULL REFERENCES sub_batch(sub_batch_id),
            route_stage_id TEXT NOT NULL REFERENCES route_stage(route_stage_id),
            detail_id TEXT NOT NULL,
            machine_type_id TEXT NOT NULL,
            stage_order INTEGER NOT NULL,
            sequence_no INTEGER NOT NULL,
            is_setup INTEGER NOT NULL DEFAULT 0,
            quantity INTEGER NOT NULL,
            planned_hours REAL NOT NULL,
            priority INTEGER NOT NULL,
            is_critical INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            machine_id TEXT REFERENCES machine(machine_id),
            target_machine_id TEXT,
            queue_position INTEGER,
            queued_at TEXT,
            start_time TEXT,
            end_time TEXT,
            pause_time TEXT,
            resume_time TEXT,
            paused_by_system INTEGER NOT NULL DEFAULT 0,
            operator_id TEXT,
            device_id TEXT,
            reason_note TEXT,
            batch_created_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_stage_status
          ON stage_execution(status);

        CREATE INDEX IF NOT EXISTS idx_stage_sub_batch
          ON stage_execution(sub_batch_id, sequence_no);

        CREATE INDEX IF NOT EXISTS idx_stage_machine_end
          ON stage_execution(machine_id, status, end_time);

        CREATE UNIQUE INDEX IF NOT EXISTS ux_stage_machine_running
          ON stage_execution(machine_id) WHERE status = 'IN_PROGRESS';

        CREATE TABLE IF NOT EXISTS stage_transition_log (
            log_id TEXT PRIMARY KEY,
            stage_id TEXT NOT NULL REFERENCES stage_execution(stage_id),
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            machine_id TEXT,
            operator_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            reason_note TEXT NOT NULL,
            paused_by_system INTEGER NOT NULL DEFAULT 0,
            occurred_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transition_log_stage
          ON stage_transition_log(stage_id, occurred_at);
        "#,
    )?;

    // v2: 换型工序指定机台
    if !has_column(conn, "stage_execution", "target_machine_id")? {
        conn.execute_batch(
            "ALTER TABLE stage_execution ADD COLUMN target_machine_id TEXT;",
        )?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|n| n == column))
}

/// 时间戳 → 存储文本
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 存储文本 → 时间戳
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}
