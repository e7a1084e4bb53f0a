// ==========================================
// 生产排程引擎 - 批次计划器
// ==========================================
// 职责:
// - 数量拆分为子批次（指定尺寸 / 均分，余数并入第一个子批次）
// - 按工艺路线为每个子批次实例化 Pending 工序
// - 候选机台上一零件不同时插入换型工序
// - 计划工时: 换型 = 路线换型常量；加工 = 定额 × 子批次数量
// ==========================================

use crate::domain::production::{Batch, BatchPlan, RouteStage, SubBatch};
use crate::domain::stage::StageExecution;
use crate::domain::types::StageStatus;
use crate::engine::error::{SchedulingError, SchedulingResult};
use crate::engine::gateway::ProductionGateway;
use crate::engine::setup_time::SetupTimeMatrix;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// 关键批次的最低有效优先级
pub const CRITICAL_PRIORITY_FLOOR: i32 = 10;

/// 子批次拆分方式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitRequest {
    /// 不拆分
    Single,
    /// 均分为 n 份
    Count(i32),
    /// 调用方指定尺寸
    Sizes(Vec<i32>),
}

/// 建批请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub detail_id: String,
    pub quantity: i32,
    pub priority: i32,
    pub is_critical: bool,
    pub split: SplitRequest,
}

/// 计划工时（小时）
pub fn planned_duration_hours(route_stage: &RouteStage, quantity: i32, is_setup: bool) -> f64 {
    if is_setup {
        route_stage.setup_hours
    } else {
        route_stage.norm_hours_per_unit * f64::from(quantity)
    }
}

/// 有效优先级: 关键批次不低于 CRITICAL_PRIORITY_FLOOR
pub fn effective_priority(priority: i32, is_critical: bool) -> i32 {
    if is_critical {
        priority.max(CRITICAL_PRIORITY_FLOOR)
    } else {
        priority
    }
}

/// 拆分数量
pub fn split_quantity(total: i32, split: &SplitRequest) -> SchedulingResult<Vec<i32>> {
    if total <= 0 {
        return Err(SchedulingError::InvalidPlanRequest(format!(
            "批次数量必须为正: {}",
            total
        )));
    }

    match split {
        SplitRequest::Single => Ok(vec![total]),
        SplitRequest::Count(n) => {
            let n = *n;
            if n <= 0 || n > total {
                return Err(SchedulingError::InvalidPlanRequest(format!(
                    "子批次数量超出范围: count={}, quantity={}",
                    n, total
                )));
            }
            let base = total / n;
            let remainder = total % n;
            let mut sizes = vec![base; n as usize];
            sizes[0] += remainder;
            Ok(sizes)
        }
        SplitRequest::Sizes(sizes) => {
            if sizes.is_empty() || sizes.iter().any(|&s| s <= 0) {
                return Err(SchedulingError::InvalidPlanRequest(
                    "子批次尺寸必须为正".to_string(),
                ));
            }
            let sum: i64 = sizes.iter().map(|&s| i64::from(s)).sum();
            if sum != i64::from(total) {
                return Err(SchedulingError::InvalidPlanRequest(format!(
                    "子批次尺寸之和 {} 不等于批次数量 {}",
                    sum, total
                )));
            }
            Ok(sizes.clone())
        }
    }
}

/// 以后继工序为模板构造换型工序（尚未编号）
///
/// 换型针对具体机台的上一零件，工序指定在该机台加工
pub fn setup_stage_for(
    successor: &StageExecution,
    setup_hours: f64,
    machine_id: &str,
    now: DateTime<Utc>,
) -> StageExecution {
    StageExecution {
        stage_id: Uuid::new_v4().to_string(),
        is_setup: true,
        planned_hours: setup_hours,
        status: StageStatus::Pending,
        machine_id: None,
        target_machine_id: Some(machine_id.to_string()),
        queue_position: None,
        queued_at: None,
        start_time: None,
        end_time: None,
        pause_time: None,
        resume_time: None,
        paused_by_system: false,
        operator_id: None,
        device_id: None,
        reason_note: None,
        created_at: now,
        updated_at: now,
        revision: 0,
        ..successor.clone()
    }
}

// ==========================================
// BatchPlanner - 批次计划器
// ==========================================
pub struct BatchPlanner {
    gateway: Arc<dyn ProductionGateway>,
    setup_matrix: SetupTimeMatrix,
}

impl BatchPlanner {
    pub fn new(gateway: Arc<dyn ProductionGateway>) -> Self {
        Self {
            setup_matrix: SetupTimeMatrix::new(gateway.clone()),
            gateway,
        }
    }

    /// 生成批次计划（不落库）
    pub fn plan_batch(&self, request: &BatchRequest, now: DateTime<Utc>) -> SchedulingResult<BatchPlan> {
        let route = self
            .gateway
            .find_route(&request.detail_id)?
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SchedulingError::RouteNotFound(request.detail_id.clone()))?;

        let sizes = split_quantity(request.quantity, &request.split)?;
        let priority = effective_priority(request.priority, request.is_critical);

        let batch = Batch {
            batch_id: Uuid::new_v4().to_string(),
            detail_id: request.detail_id.clone(),
            quantity: request.quantity,
            priority,
            is_critical: request.is_critical,
            created_at: now,
        };

        // 候选机台（每种机型优先级最高者）上按计划顺序累计的“上一零件”
        let mut candidates: HashMap<String, Option<String>> = HashMap::new();
        let mut planned_prior: HashMap<String, Option<String>> = HashMap::new();

        let mut sub_batches = Vec::with_capacity(sizes.len());
        let mut stages = Vec::new();

        for (idx, quantity) in sizes.iter().copied().enumerate() {
            let sub_batch = SubBatch {
                sub_batch_id: Uuid::new_v4().to_string(),
                batch_id: batch.batch_id.clone(),
                seq_no: idx as i32 + 1,
                quantity,
            };
            let mut sequence_no = 0;

            for route_stage in &route.stages {
                let mut stage = StageExecution {
                    stage_id: Uuid::new_v4().to_string(),
                    batch_id: batch.batch_id.clone(),
                    sub_batch_id: sub_batch.sub_batch_id.clone(),
                    route_stage_id: route_stage.route_stage_id.clone(),
                    detail_id: request.detail_id.clone(),
                    machine_type_id: route_stage.machine_type_id.clone(),
                    stage_order: route_stage.stage_order,
                    sequence_no: 0,
                    is_setup: false,
                    quantity,
                    planned_hours: planned_duration_hours(route_stage, quantity, false),
                    priority,
                    is_critical: request.is_critical,
                    status: StageStatus::Pending,
                    machine_id: None,
                    target_machine_id: None,
                    queue_position: None,
                    queued_at: None,
                    start_time: None,
                    end_time: None,
                    pause_time: None,
                    resume_time: None,
                    paused_by_system: false,
                    operator_id: None,
                    device_id: None,
                    reason_note: None,
                    batch_created_at: now,
                    created_at: now,
                    updated_at: now,
                    revision: 0,
                };

                if let Some(machine_id) = self.candidate_machine(&mut candidates, route_stage)? {
                    let prior = match planned_prior.get(&machine_id) {
                        Some(prior) => prior.clone(),
                        None => self.setup_matrix.last_detail_on_machine(&machine_id)?,
                    };
                    let requirement =
                        self.setup_matrix
                            .lookup(&machine_id, prior.as_deref(), &request.detail_id)?;

                    if requirement.requires_setup() && route_stage.setup_hours > 0.0 {
                        let mut setup = setup_stage_for(
                            &stage,
                            planned_duration_hours(route_stage, quantity, true),
                            &machine_id,
                            now,
                        );
                        sequence_no += 1;
                        setup.sequence_no = sequence_no;
                        stages.push(setup);
                    }
                    planned_prior.insert(machine_id, Some(request.detail_id.clone()));
                } else {
                    tracing::warn!(
                        detail_id = %request.detail_id,
                        machine_type_id = %route_stage.machine_type_id,
                        "机型无可用机台，工序将在队列中等待"
                    );
                }

                sequence_no += 1;
                stage.sequence_no = sequence_no;
                stages.push(stage);
            }

            sub_batches.push(sub_batch);
        }

        Ok(BatchPlan {
            batch,
            sub_batches,
            stages,
        })
    }

    /// 生成批次计划并整体落库
    pub fn create_batch(&self, request: &BatchRequest, now: DateTime<Utc>) -> SchedulingResult<BatchPlan> {
        let plan = self.plan_batch(request, now)?;
        self.gateway.insert_batch_plan(&plan)?;

        tracing::info!(
            batch_id = %plan.batch.batch_id,
            detail_id = %plan.batch.detail_id,
            quantity = plan.batch.quantity,
            sub_batches = plan.sub_batches.len(),
            stages = plan.stages.len(),
            setup_stages = plan.setup_stage_count(),
            "批次已创建"
        );
        Ok(plan)
    }

    fn candidate_machine(
        &self,
        cache: &mut HashMap<String, Option<String>>,
        route_stage: &RouteStage,
    ) -> SchedulingResult<Option<String>> {
        if let Some(found) = cache.get(&route_stage.machine_type_id) {
            return Ok(found.clone());
        }
        let found = self
            .gateway
            .find_machines_by_type(&route_stage.machine_type_id)?
            .into_iter()
            .next()
            .map(|m| m.machine_id);
        cache.insert(route_stage.machine_type_id.clone(), found.clone());
        Ok(found)
    }
}
