// ==========================================
// 生产排程引擎 - 生产主数据领域模型
// ==========================================
// 零件 / 工艺路线 / 机台 / 批次 / 子批次 / 换型时间
// 红线: 不含数据访问逻辑
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Detail - 零件
// ==========================================
// 被工艺路线引用后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    pub detail_id: String,
    pub detail_no: String, // 零件号（唯一）
    pub name: String,
}

// ==========================================
// MachineType / Machine - 机台
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineType {
    pub machine_type_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    pub machine_type_id: String,
    pub name: String,
    pub priority: i32, // 多台机台同时可选时的优先级（越大越优先）
    pub is_active: bool,
}

// ==========================================
// RouteStage / Route - 工艺路线
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStage {
    pub route_stage_id: String,
    pub detail_id: String,
    pub stage_order: i32, // 路线内顺序，唯一
    pub name: String,
    pub machine_type_id: String,
    pub norm_hours_per_unit: f64, // 单件定额工时（小时）
    pub setup_hours: f64,         // 换型工时常量（小时）
}

/// 单个零件的工艺路线，按 stage_order 升序
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub detail_id: String,
    pub stages: Vec<RouteStage>,
}

impl Route {
    /// 构造路线，按 stage_order 排序
    ///
    /// 顺序值重复时返回 Err(重复的顺序值)
    pub fn new(detail_id: String, mut stages: Vec<RouteStage>) -> Result<Self, i32> {
        stages.sort_by_key(|s| s.stage_order);
        if let Some(dup) = stages
            .windows(2)
            .find(|w| w[0].stage_order == w[1].stage_order)
        {
            return Err(dup[0].stage_order);
        }
        Ok(Self { detail_id, stages })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ==========================================
// Batch / SubBatch - 生产批次
// ==========================================
// 不变量: sum(sub_batch.quantity) == batch.quantity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub detail_id: String,
    pub quantity: i32,
    pub priority: i32,
    pub is_critical: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubBatch {
    pub sub_batch_id: String,
    pub batch_id: String,
    pub seq_no: i32, // 批次内序号，从 1 开始
    pub quantity: i32,
}

/// 批次计划: 一次建批请求的完整产物，整体写入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batch: Batch,
    pub sub_batches: Vec<SubBatch>,
    pub stages: Vec<crate::domain::stage::StageExecution>,
}

impl BatchPlan {
    /// 插入的换型工序数量
    pub fn setup_stage_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_setup).count()
    }
}

// ==========================================
// SetupTimeEntry - 换型时间
// ==========================================
// 有方向: (machine, from, to) ≠ (machine, to, from)
// 缺失表示“未知”，不是 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupTimeEntry {
    pub machine_id: String,
    pub from_detail_id: String,
    pub to_detail_id: String,
    pub setup_hours: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(order: i32) -> RouteStage {
        RouteStage {
            route_stage_id: format!("RS{}", order),
            detail_id: "D1".to_string(),
            stage_order: order,
            name: format!("工序{}", order),
            machine_type_id: "MT1".to_string(),
            norm_hours_per_unit: 0.1,
            setup_hours: 0.5,
        }
    }

    #[test]
    fn test_route_sorts_by_order() {
        let route = Route::new("D1".to_string(), vec![stage(20), stage(10)]).unwrap();
        let orders: Vec<i32> = route.stages.iter().map(|s| s.stage_order).collect();
        assert_eq!(orders, vec![10, 20]);
    }

    #[test]
    fn test_route_rejects_duplicate_order() {
        let result = Route::new("D1".to_string(), vec![stage(10), stage(10)]);
        assert_eq!(result.unwrap_err(), 10);
    }
}
