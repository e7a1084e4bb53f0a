// ==========================================
// 生产排程引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::scheduler_config::{
    parse_breaks, parse_hhmm, parse_rest_days, SchedulerConfig, ShiftRules,
};
use crate::db::open_sqlite_connection;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// 配置读写结果（错误可跨线程传递）
pub type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// 配置键
pub mod config_keys {
    pub const TICK_INTERVAL_SECS: &str = "tick_interval_secs";
    pub const STARTUP_DELAY_SECS: &str = "startup_delay_secs";
    pub const OVERDUE_TOLERANCE_MINUTES: &str = "overdue_tolerance_minutes";
    pub const FINISH_WINDOW_MINUTES: &str = "finish_window_minutes";
    pub const CONTINUE_PRIORITY_THRESHOLD: &str = "continue_priority_threshold";
    pub const QUEUE_DRAIN_LIMIT: &str = "queue_drain_limit";
    pub const AUTO_START_LIMIT: &str = "auto_start_limit";
    pub const QUEUE_OPTIMIZE_EVERY_MINUTES: &str = "queue_optimize_every_minutes";
    pub const COMPLETION_LOOKBACK_MINUTES: &str = "completion_lookback_minutes";
    pub const FACILITY_UTC_OFFSET_MINUTES: &str = "facility_utc_offset_minutes";

    pub const SHIFT_WORK_START: &str = "shift_work_start";
    pub const SHIFT_WORK_END: &str = "shift_work_end";
    pub const SHIFT_BREAKS: &str = "shift_breaks";
    pub const SHIFT_REST_DAYS: &str = "shift_rest_days";
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取全部 global 配置的 JSON 快照（按 key 排序）
    pub fn get_config_snapshot(&self) -> ConfigResult<String> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config_map: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        Ok(serde_json::to_string(&config_map)?)
    }

    /// 读取并解析数值配置；缺失返回默认值，格式错误告警后返回默认值
    fn get_parsed_or_default<T>(&self, key: &str, default: T) -> ConfigResult<T>
    where
        T: FromStr + Display + Copy,
    {
        match self.get_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(
                        config_key = key,
                        raw_value = %raw,
                        default = %default,
                        "配置格式错误，使用默认值"
                    );
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 读取并用给定解析器解析；缺失或格式错误时返回默认值
    fn get_with_or_default<T, F>(&self, key: &str, default: T, parse: F) -> ConfigResult<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        match self.get_config_value(key)? {
            Some(raw) => match parse(&raw) {
                Some(v) => Ok(v),
                None => {
                    tracing::warn!(config_key = key, raw_value = %raw, "配置格式错误，使用默认值");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    // ===== 调和循环配置 =====

    /// 加载调和循环配置
    pub fn load_scheduler_config(&self) -> ConfigResult<SchedulerConfig> {
        let d = SchedulerConfig::default();
        Ok(SchedulerConfig {
            tick_interval_secs: self
                .get_parsed_or_default(config_keys::TICK_INTERVAL_SECS, d.tick_interval_secs)?
                .max(1),
            startup_delay_secs: self
                .get_parsed_or_default(config_keys::STARTUP_DELAY_SECS, d.startup_delay_secs)?,
            overdue_tolerance_minutes: self.get_parsed_or_default(
                config_keys::OVERDUE_TOLERANCE_MINUTES,
                d.overdue_tolerance_minutes,
            )?,
            finish_window_minutes: self
                .get_parsed_or_default(config_keys::FINISH_WINDOW_MINUTES, d.finish_window_minutes)?,
            continue_priority_threshold: self.get_parsed_or_default(
                config_keys::CONTINUE_PRIORITY_THRESHOLD,
                d.continue_priority_threshold,
            )?,
            queue_drain_limit: self
                .get_parsed_or_default(config_keys::QUEUE_DRAIN_LIMIT, d.queue_drain_limit)?,
            auto_start_limit: self
                .get_parsed_or_default(config_keys::AUTO_START_LIMIT, d.auto_start_limit)?,
            queue_optimize_every_minutes: self
                .get_parsed_or_default(
                    config_keys::QUEUE_OPTIMIZE_EVERY_MINUTES,
                    d.queue_optimize_every_minutes,
                )?
                .max(1),
            completion_lookback_minutes: self.get_parsed_or_default(
                config_keys::COMPLETION_LOOKBACK_MINUTES,
                d.completion_lookback_minutes,
            )?,
            facility_utc_offset_minutes: self.get_parsed_or_default(
                config_keys::FACILITY_UTC_OFFSET_MINUTES,
                d.facility_utc_offset_minutes,
            )?,
        })
    }

    // ===== 班次配置 =====

    /// 加载班次规则
    ///
    /// 说明：此处只做格式校验；窗口结构是否合理（如休息窗口起止颠倒）
    /// 由班次日历在判定时校验，失败按“工作中”放行并记录缺陷
    pub fn load_shift_rules(&self) -> ConfigResult<ShiftRules> {
        let d = ShiftRules::default();
        Ok(ShiftRules {
            work_start: self.get_with_or_default(config_keys::SHIFT_WORK_START, d.work_start, parse_hhmm)?,
            work_end: self.get_with_or_default(config_keys::SHIFT_WORK_END, d.work_end, parse_hhmm)?,
            breaks: self.get_with_or_default(config_keys::SHIFT_BREAKS, d.breaks, parse_breaks)?,
            rest_days: self.get_with_or_default(config_keys::SHIFT_REST_DAYS, d.rest_days, parse_rest_days)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use chrono::Weekday;

    fn manager() -> ConfigManager {
        let conn = Arc::new(Mutex::new(open_in_memory().unwrap()));
        ConfigManager::from_connection(conn).unwrap()
    }

    #[test]
    fn test_defaults_when_table_empty() {
        let cm = manager();
        assert_eq!(cm.load_scheduler_config().unwrap(), SchedulerConfig::default());
        assert_eq!(cm.load_shift_rules().unwrap(), ShiftRules::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cm = manager();
        cm.set_global_config_value(config_keys::QUEUE_DRAIN_LIMIT, "25").unwrap();
        cm.set_global_config_value(config_keys::AUTO_START_LIMIT, "many").unwrap();
        cm.set_global_config_value(config_keys::SHIFT_REST_DAYS, "SUN").unwrap();
        cm.set_global_config_value(config_keys::SHIFT_WORK_START, "7:61").unwrap();

        let cfg = cm.load_scheduler_config().unwrap();
        assert_eq!(cfg.queue_drain_limit, 25);
        assert_eq!(cfg.auto_start_limit, 5);

        let rules = cm.load_shift_rules().unwrap();
        assert_eq!(rules.rest_days, vec![Weekday::Sun]);
        assert_eq!(rules.work_start, ShiftRules::default().work_start);
    }

    #[test]
    fn test_config_snapshot_sorted_json() {
        let cm = manager();
        assert_eq!(cm.get_config_snapshot().unwrap(), "{}");
        cm.set_global_config_value("shift_rest_days", "SUN").unwrap();
        cm.set_global_config_value("auto_start_limit", "3").unwrap();
        assert_eq!(
            cm.get_config_snapshot().unwrap(),
            r#"{"auto_start_limit":"3","shift_rest_days":"SUN"}"#
        );
    }

    #[test]
    fn test_set_value_overwrites() {
        let cm = manager();
        cm.set_global_config_value("tick_interval_secs", "60").unwrap();
        cm.set_global_config_value("tick_interval_secs", "15").unwrap();
        assert_eq!(
            cm.get_global_config_value("tick_interval_secs").unwrap(),
            Some("15".to_string())
        );
        assert_eq!(cm.load_scheduler_config().unwrap().tick_interval_secs, 15);
    }
}
