// ==========================================
// 生产排程引擎 - 零件与工艺路线数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================

use crate::domain::production::{Detail, Route, RouteStage};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::sync::{Arc, Mutex};

const ROUTE_STAGE_COLUMNS: &str = r#"
    route_stage_id, detail_id, stage_order, name, machine_type_id,
    norm_hours_per_unit, setup_hours
"#;

// ==========================================
// RouteRepository - 工艺路线仓储
// ==========================================
pub struct RouteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl RouteRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn map_route_stage(row: &Row<'_>) -> SqliteResult<RouteStage> {
        Ok(RouteStage {
            route_stage_id: row.get(0)?,
            detail_id: row.get(1)?,
            stage_order: row.get(2)?,
            name: row.get(3)?,
            machine_type_id: row.get(4)?,
            norm_hours_per_unit: row.get(5)?,
            setup_hours: row.get(6)?,
        })
    }

    /// 新增零件
    pub fn insert_detail(&self, detail: &Detail) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO detail (detail_id, detail_no, name) VALUES (?1, ?2, ?3)",
            params![detail.detail_id, detail.detail_no, detail.name],
        )?;
        Ok(())
    }

    pub fn find_detail(&self, detail_id: &str) -> RepositoryResult<Option<Detail>> {
        let conn = self.get_conn()?;
        let detail = conn
            .query_row(
                "SELECT detail_id, detail_no, name FROM detail WHERE detail_id = ?1",
                params![detail_id],
                |row| {
                    Ok(Detail {
                        detail_id: row.get(0)?,
                        detail_no: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(detail)
    }

    /// 新增工艺路线工序
    ///
    /// (detail_id, stage_order) 重复时返回 UniqueConstraintViolation
    pub fn insert_route_stage(&self, stage: &RouteStage) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO route_stage ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                ROUTE_STAGE_COLUMNS
            ),
            params![
                stage.route_stage_id,
                stage.detail_id,
                stage.stage_order,
                stage.name,
                stage.machine_type_id,
                stage.norm_hours_per_unit,
                stage.setup_hours,
            ],
        )?;
        Ok(())
    }

    pub fn find_route_stage(&self, route_stage_id: &str) -> RepositoryResult<Option<RouteStage>> {
        let conn = self.get_conn()?;
        let stage = conn
            .query_row(
                &format!(
                    "SELECT {} FROM route_stage WHERE route_stage_id = ?1",
                    ROUTE_STAGE_COLUMNS
                ),
                params![route_stage_id],
                Self::map_route_stage,
            )
            .optional()?;
        Ok(stage)
    }

    /// 查询零件的工艺路线（无工序时返回 None）
    pub fn find_route(&self, detail_id: &str) -> RepositoryResult<Option<Route>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM route_stage WHERE detail_id = ?1 ORDER BY stage_order ASC",
            ROUTE_STAGE_COLUMNS
        ))?;
        let stages = stmt
            .query_map(params![detail_id], Self::map_route_stage)?
            .collect::<SqliteResult<Vec<_>>>()?;

        if stages.is_empty() {
            return Ok(None);
        }

        // 表上 UNIQUE(detail_id, stage_order) 保证不会重复
        Route::new(detail_id.to_string(), stages)
            .map(Some)
            .map_err(|order| RepositoryError::FieldValueError {
                field: "stage_order".to_string(),
                message: format!("工艺路线顺序重复: detail_id={}, order={}", detail_id, order),
            })
    }
}
