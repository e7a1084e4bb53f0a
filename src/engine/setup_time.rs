// ==========================================
// 生产排程引擎 - 换型时间矩阵
// ==========================================
// 查询 (机台, 前零件, 后零件) → 换型工时
// - 前零件缺失（机台无完工记录）→ 不计换型
// - 前后零件相同 → 不计换型（无论矩阵内容）
// - 矩阵无记录 → 未知（不是 0）
// ==========================================

use crate::engine::gateway::ProductionGateway;
use crate::repository::RepositoryResult;
use std::cmp::Ordering;
use std::sync::Arc;

/// 换型需求
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetupRequirement {
    NotRequired,
    Known(f64),
    Unknown,
}

impl SetupRequirement {
    /// (工时, 是否找到)；未知时工时为 0
    pub fn as_lookup(&self) -> (f64, bool) {
        match self {
            SetupRequirement::NotRequired => (0.0, true),
            SetupRequirement::Known(hours) => (*hours, true),
            SetupRequirement::Unknown => (0.0, false),
        }
    }

    /// 选机排序键: 不需要换型视为 0，未知排在所有已知之后
    pub fn rank_hours(&self) -> f64 {
        match self {
            SetupRequirement::NotRequired => 0.0,
            SetupRequirement::Known(hours) => *hours,
            SetupRequirement::Unknown => f64::INFINITY,
        }
    }

    /// 是否需要插入换型工序: 已知工时大于 0，或未知
    pub fn requires_setup(&self) -> bool {
        match self {
            SetupRequirement::NotRequired => false,
            SetupRequirement::Known(hours) => *hours > 0.0,
            SetupRequirement::Unknown => true,
        }
    }

    pub fn cmp_rank(&self, other: &Self) -> Ordering {
        self.rank_hours().total_cmp(&other.rank_hours())
    }
}

/// 换型时间矩阵
pub struct SetupTimeMatrix {
    gateway: Arc<dyn ProductionGateway>,
}

impl SetupTimeMatrix {
    pub fn new(gateway: Arc<dyn ProductionGateway>) -> Self {
        Self { gateway }
    }

    /// 查询换型需求
    pub fn lookup(
        &self,
        machine_id: &str,
        from_detail_id: Option<&str>,
        to_detail_id: &str,
    ) -> RepositoryResult<SetupRequirement> {
        let from = match from_detail_id {
            None => return Ok(SetupRequirement::NotRequired),
            Some(from) if from == to_detail_id => return Ok(SetupRequirement::NotRequired),
            Some(from) => from,
        };

        Ok(
            match self.gateway.find_setup_time(machine_id, from, to_detail_id)? {
                Some(hours) => SetupRequirement::Known(hours),
                None => SetupRequirement::Unknown,
            },
        )
    }

    /// 以机台最近完工零件为前零件查询
    pub fn resolve_for_machine(
        &self,
        machine_id: &str,
        to_detail_id: &str,
    ) -> RepositoryResult<SetupRequirement> {
        let last = self.gateway.find_last_detail_on_machine(machine_id)?;
        self.lookup(machine_id, last.as_deref(), to_detail_id)
    }

    /// 机台最近完工的非换型零件
    pub fn last_detail_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<String>> {
        self.gateway.find_last_detail_on_machine(machine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_places_unknown_last() {
        let mut reqs = vec![
            SetupRequirement::Unknown,
            SetupRequirement::Known(0.5),
            SetupRequirement::NotRequired,
            SetupRequirement::Known(0.25),
        ];
        reqs.sort_by(|a, b| a.cmp_rank(b));
        assert_eq!(
            reqs,
            vec![
                SetupRequirement::NotRequired,
                SetupRequirement::Known(0.25),
                SetupRequirement::Known(0.5),
                SetupRequirement::Unknown,
            ]
        );
    }

    #[test]
    fn test_lookup_tuple() {
        assert_eq!(SetupRequirement::Unknown.as_lookup(), (0.0, false));
        assert_eq!(SetupRequirement::Known(1.5).as_lookup(), (1.5, true));
        assert!(!SetupRequirement::NotRequired.requires_setup());
        assert!(SetupRequirement::Unknown.requires_setup());
        assert!(SetupRequirement::Known(0.5).requires_setup());
        // 矩阵登记为 0 工时: 不插入换型
        assert!(!SetupRequirement::Known(0.0).requires_setup());
        assert_eq!(SetupRequirement::Known(0.0).as_lookup(), (0.0, true));
    }
}
