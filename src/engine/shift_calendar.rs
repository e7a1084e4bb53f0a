// ==========================================
// 生产排程引擎 - 班次日历
// ==========================================
// 判定顺序（先命中先返回）:
// 1. 休息日 → 非工作
// 2. 休息窗口 [start, end) → 非工作
// 3. 上班时间 ≤ t 或 t ≤ 下班时间（跨零点）→ 工作
// 4. 其余 → 非工作
// ==========================================
// 失败策略: 规则结构异常时按“工作中”放行并以 error 级别记录缺陷，
// 避免日历缺陷导致在制工序被静默挂起
// ==========================================

use crate::config::scheduler_config::ShiftRules;
use crate::engine::error::CalendarError;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Offset, Utc};

/// 班次日历
#[derive(Debug, Clone)]
pub struct ShiftCalendar {
    rules: ShiftRules,
    utc_offset: FixedOffset,
}

impl ShiftCalendar {
    /// 创建班次日历
    ///
    /// # 参数
    /// - `rules`: 班次规则
    /// - `utc_offset_minutes`: 工厂本地时间相对 UTC 的偏移；越界时按 UTC 处理
    pub fn new(rules: ShiftRules, utc_offset_minutes: i32) -> Self {
        let utc_offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                tracing::warn!(utc_offset_minutes, "工厂时区偏移越界，按 UTC 处理");
                Utc.fix()
            });
        Self { rules, utc_offset }
    }

    pub fn rules(&self) -> &ShiftRules {
        &self.rules
    }

    /// UTC 时刻转换为工厂本地时间
    pub fn to_local(&self, t: DateTime<Utc>) -> NaiveDateTime {
        t.with_timezone(&self.utc_offset).naive_local()
    }

    /// 校验规则结构
    pub fn validate(&self) -> Result<(), CalendarError> {
        if self.rules.work_start == self.rules.work_end {
            return Err(CalendarError::EmptyWorkWindow(
                self.rules.work_start.format("%H:%M").to_string(),
            ));
        }
        for window in &self.rules.breaks {
            if window.start > window.end {
                return Err(CalendarError::InvertedBreak {
                    start: window.start.format("%H:%M").to_string(),
                    end: window.end.format("%H:%M").to_string(),
                });
            }
        }
        Ok(())
    }

    /// 按本地时间判定是否工作中
    pub fn try_is_working(&self, local: NaiveDateTime) -> Result<bool, CalendarError> {
        self.validate()?;

        if self.rules.rest_days.contains(&local.weekday()) {
            return Ok(false);
        }

        let tod = local.time();
        if self
            .rules
            .breaks
            .iter()
            .any(|w| tod >= w.start && tod < w.end)
        {
            return Ok(false);
        }

        let (start, end) = (self.rules.work_start, self.rules.work_end);
        let working = if start < end {
            tod >= start && tod <= end
        } else {
            // 跨零点: 上班至午夜，再从午夜至下班
            tod >= start || tod <= end
        };
        Ok(working)
    }

    /// 本地时间判定（失败放行）
    pub fn is_working_local(&self, local: NaiveDateTime) -> bool {
        match self.try_is_working(local) {
            Ok(working) => working,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    local_time = %local,
                    "班次日历判定失败，按工作中处理（缺陷）"
                );
                true
            }
        }
    }

    /// UTC 时刻判定（失败放行）
    pub fn is_working_instant(&self, t: DateTime<Utc>) -> bool {
        self.is_working_local(self.to_local(t))
    }
}
