// ==========================================
// 生产排程引擎 - 调度配置项
// ==========================================
// 每项均有默认值；config_kv 中缺失或格式错误时回退默认
// ==========================================

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

// ==========================================
// SchedulerConfig - 调和循环配置
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 调和周期（秒）
    pub tick_interval_secs: u64,
    /// 启动延迟（秒），等待依赖子系统初始化
    pub startup_delay_secs: u64,
    /// 超时容差（分钟）：已用 - 计划 超过此值即自动完成
    pub overdue_tolerance_minutes: i64,
    /// 收尾窗口（分钟）：剩余时长不超过此值时非工作时间继续加工
    pub finish_window_minutes: i64,
    /// 优先级阈值：严格大于此值时非工作时间继续加工
    pub continue_priority_threshold: i32,
    /// 每次调和最多分配的排队工序数
    pub queue_drain_limit: usize,
    /// 每次调和最多自动开工的工序数
    pub auto_start_limit: usize,
    /// 队列优化间隔（分钟，按整点分钟取模）
    pub queue_optimize_every_minutes: u32,
    /// 完工后续处理的回看窗口（分钟）
    pub completion_lookback_minutes: i64,
    /// 工厂本地时间相对 UTC 的偏移（分钟）
    pub facility_utc_offset_minutes: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            startup_delay_secs: 10,
            overdue_tolerance_minutes: 120,
            finish_window_minutes: 30,
            continue_priority_threshold: 7,
            queue_drain_limit: 10,
            auto_start_limit: 5,
            queue_optimize_every_minutes: 5,
            completion_lookback_minutes: 10,
            facility_utc_offset_minutes: 0,
        }
    }
}

// ==========================================
// ShiftRules - 班次规则
// ==========================================
// 工作窗口允许跨零点: work_start > work_end 表示次日结束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRules {
    /// 上班时间（含）
    pub work_start: NaiveTime,
    /// 下班时间（含，可跨零点）
    pub work_end: NaiveTime,
    /// 休息窗口 [start, end)
    pub breaks: Vec<BreakWindow>,
    /// 休息日
    pub rest_days: Vec<Weekday>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
}

impl Default for ShiftRules {
    fn default() -> Self {
        Self {
            work_start: hm(8, 0),
            work_end: hm(1, 30),
            breaks: vec![
                // 午餐
                BreakWindow {
                    start: hm(12, 0),
                    end: hm(13, 0),
                },
                // 晚餐
                BreakWindow {
                    start: hm(21, 0),
                    end: hm(21, 30),
                },
            ],
            rest_days: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}

/// 解析 "HH:MM"
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// 解析 "12:00-13:00,21:00-21:30"
pub fn parse_breaks(raw: &str) -> Option<Vec<BreakWindow>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            let (start, end) = part.split_once('-')?;
            Some(BreakWindow {
                start: parse_hhmm(start)?,
                end: parse_hhmm(end)?,
            })
        })
        .collect()
}

/// 解析 "SAT,SUN"
pub fn parse_rest_days(raw: &str) -> Option<Vec<Weekday>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    trimmed
        .split(',')
        .map(|d| d.trim().parse::<Weekday>().ok())
        .collect()
}
