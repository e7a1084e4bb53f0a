// ==========================================
// 生产排程引擎 - 行映射辅助
// ==========================================
// 职责: TEXT 时间戳 / 状态枚举 的列解析，解析失败转为 rusqlite 转换错误
// ==========================================

use crate::db::parse_ts;
use crate::domain::types::StageStatus;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// 必填时间戳列
pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, format!("时间戳格式错误: {} ({})", raw, e)))
}

/// 可空时间戳列
pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, format!("时间戳格式错误: {} ({})", raw, e))),
        None => Ok(None),
    }
}

/// 工序状态列
pub(crate) fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<StageStatus> {
    let raw: String = row.get(idx)?;
    StageStatus::parse(&raw).ok_or_else(|| conversion_error(idx, format!("未知工序状态: {}", raw)))
}

/// 0/1 整数列
pub(crate) fn bool_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(idx)? != 0)
}
