// ==========================================
// 生产排程引擎 - 队列排序
// ==========================================
// 排序键（全序，重复调用结果一致）:
// 1) priority 降序
// 2) 批次创建时间 升序
// 3) 工序创建时间 升序
// 4) stage_id 升序
// ==========================================

use crate::domain::stage::StageExecution;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// 队列分组键: 已绑定机台按机台，未绑定按机型
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueKey {
    Machine(String),
    UnassignedType(String),
}

impl QueueKey {
    pub fn of(stage: &StageExecution) -> Self {
        match &stage.machine_id {
            Some(machine_id) => QueueKey::Machine(machine_id.clone()),
            None => QueueKey::UnassignedType(stage.machine_type_id.clone()),
        }
    }
}

// ==========================================
// QueueSorter - 队列排序器
// ==========================================
pub struct QueueSorter;

impl QueueSorter {
    /// 比较两个工序的调度先后
    pub fn compare(a: &StageExecution, b: &StageExecution) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.batch_created_at.cmp(&b.batch_created_at))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.stage_id.cmp(&b.stage_id))
    }

    /// 排序工序列表
    pub fn sort(mut stages: Vec<StageExecution>) -> Vec<StageExecution> {
        stages.sort_by(Self::compare);
        stages
    }

    /// 按队列分组排序
    pub fn sort_by_queue(stages: Vec<StageExecution>) -> BTreeMap<QueueKey, Vec<StageExecution>> {
        let mut grouped: BTreeMap<QueueKey, Vec<StageExecution>> = BTreeMap::new();
        for stage in stages {
            grouped.entry(QueueKey::of(&stage)).or_default().push(stage);
        }
        for queue in grouped.values_mut() {
            queue.sort_by(Self::compare);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::StageStatus;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn stage(id: &str, priority: i32, batch_offset_min: i64, created_offset_min: i64) -> StageExecution {
        StageExecution {
            stage_id: id.to_string(),
            batch_id: "B".to_string(),
            sub_batch_id: format!("SB-{}", id),
            route_stage_id: "RS".to_string(),
            detail_id: "D".to_string(),
            machine_type_id: "MT1".to_string(),
            stage_order: 10,
            sequence_no: 1,
            is_setup: false,
            quantity: 1,
            planned_hours: 1.0,
            priority,
            is_critical: false,
            status: StageStatus::InQueue,
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
            batch_created_at: base() + Duration::minutes(batch_offset_min),
            created_at: base() + Duration::minutes(created_offset_min),
            updated_at: base(),
            revision: 0,
        }
    }

    fn ids(stages: &[StageExecution]) -> Vec<&str> {
        stages.iter().map(|s| s.stage_id.as_str()).collect()
    }

    #[test]
    fn test_sort_chain() {
        let sorted = QueueSorter::sort(vec![
            stage("low", 1, 0, 0),
            stage("late-batch", 5, 10, 0),
            stage("early-batch-late-stage", 5, 0, 20),
            stage("early-batch-early-stage", 5, 0, 5),
            stage("high", 9, 30, 30),
        ]);
        assert_eq!(
            ids(&sorted),
            vec![
                "high",
                "early-batch-early-stage",
                "early-batch-late-stage",
                "late-batch",
                "low"
            ]
        );
    }

    #[test]
    fn test_stage_id_breaks_full_ties() {
        let a = QueueSorter::sort(vec![stage("S2", 5, 0, 0), stage("S1", 5, 0, 0)]);
        let b = QueueSorter::sort(vec![stage("S1", 5, 0, 0), stage("S2", 5, 0, 0)]);
        assert_eq!(ids(&a), vec!["S1", "S2"]);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_sort_by_queue_groups() {
        let mut on_m1 = stage("A", 1, 0, 0);
        on_m1.machine_id = Some("M1".to_string());
        let grouped = QueueSorter::sort_by_queue(vec![on_m1, stage("B", 3, 0, 0), stage("C", 4, 0, 0)]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(ids(&grouped[&QueueKey::UnassignedType("MT1".to_string())]), vec!["C", "B"]);
        assert_eq!(ids(&grouped[&QueueKey::Machine("M1".to_string())]), vec!["A"]);
    }
}
