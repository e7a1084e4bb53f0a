// ==========================================
// 调和循环集成测试
// ==========================================
// 职责: 超时自动完工、非工作时间暂停、工作时间恢复、阶段隔离、循环停止
// ==========================================


#[cfg(test)]
mod reconciliation_test {
    use crate::test_helpers::*;
    use chrono::{DateTime, NaiveTime, Utc};
    use production_scheduler::config::{SchedulerConfig, ShiftRules};
    use production_scheduler::domain::production::{BatchPlan, Machine, Route, RouteStage};
    use production_scheduler::domain::{
        StageExecution, StageStatus, TransitionActor, TransitionCommand, TransitionKind,
        SYSTEM_DEVICE_ID, SYSTEM_OPERATOR_ID,
    };
    use production_scheduler::engine::{ProductionGateway, ReconciliationLoop, ShiftCalendar};
    use production_scheduler::repository::{RepositoryError, RepositoryResult};
    use std::sync::Arc;
    use tokio::sync::watch;

    fn reconciler(env: &TestEnv) -> ReconciliationLoop {
        ReconciliationLoop::new(
            env.gateway.clone(),
            ShiftCalendar::new(ShiftRules::default(), 0),
            SchedulerConfig::default(),
        )
    }

    /// 单机台、单工序路线，直接开工
    fn running_stage(env: &TestEnv, quantity: i32, start: DateTime<Utc>) -> String {
        let plan = create_batch(env, "DA", quantity, 3, start);
        let id = plan.stages[0].stage_id.clone();
        let engine = env.engine();
        engine.schedule_stage_execution(&id, start).unwrap();
        assert!(engine.start_pending_stage(&id, start).unwrap());
        id
    }

    fn single_machine_env() -> TestEnv {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        seed_machine(&env, "M1", "MT1", 1);
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 0.0)]);
        env
    }

    // ==========================================
    // 端到端: 超时自动完工
    // ==========================================

    #[test]
    fn test_e2e_overdue_stage_is_auto_completed() {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        seed_machine(&env, "M1", "MT1", 1);
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 0.5), (20, "MT1", 0.2, 0.5)]);

        let plan = create_batch(&env, "DA", 10, 5, monday(8, 55));
        assert_eq!(plan.stages.len(), 2);
        let first = plan.stages[0].stage_id.clone();
        let second = plan.stages[1].stage_id.clone();

        let rec = reconciler(&env);

        // 第一个周期: 分配并开工第一道
        let report = rec.run_tick(monday(9, 0));
        assert!(report.working);
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.started, 1);
        assert!(report.queue_optimized);
        let s1 = env.stage(&first);
        assert_eq!(s1.status, StageStatus::InProgress);
        assert_eq!(s1.machine_id.as_deref(), Some("M1"));
        assert_eq!(s1.start_time, Some(monday(9, 0)));
        assert_eq!(env.stage(&second).status, StageStatus::Pending);

        // 4 小时后: 已用 4h，计划 1h，超出 3h > 2h → 自动完工
        let report = rec.run_tick(monday(13, 0));
        assert_eq!(report.auto_completed, 1);
        assert_eq!(report.stage_errors, 0);
        assert_eq!(report.phase_errors, 0);

        let s1 = env.stage(&first);
        assert_eq!(s1.status, StageStatus::Completed);
        assert_eq!(s1.end_time, Some(monday(13, 0)));
        assert_eq!(s1.operator_id.as_deref(), Some(SYSTEM_OPERATOR_ID));
        assert_eq!(s1.device_id.as_deref(), Some(SYSTEM_DEVICE_ID));
        assert!(s1.last_transition_by_system());
        let note = s1.reason_note.unwrap_or_default();
        assert!(note.contains("超时"), "{}", note);
        assert!(note.contains("3.00"), "{}", note);

        // 后继同周期入队、分配并开工
        let s2 = env.stage(&second);
        assert_eq!(s2.status, StageStatus::InProgress);
        assert_eq!(s2.machine_id.as_deref(), Some("M1"));
    }

    #[test]
    fn test_not_overdue_within_tolerance() {
        let env = single_machine_env();
        let id = running_stage(&env, 10, monday(9, 0));

        // 已用 3h，计划 1h，超出恰好 2h → 不完工
        let report = reconciler(&env).run_tick(monday(12, 0));
        assert_eq!(report.auto_completed, 0);
        assert_eq!(env.stage(&id).status, StageStatus::InProgress);
    }

    // ==========================================
    // 端到端: 非工作时间暂停
    // ==========================================

    #[test]
    fn test_e2e_pause_at_0135_with_45_minutes_remaining() {
        let env = single_machine_env();
        // 计划 1h，01:20 开工，01:35 剩余 45 分钟
        let id = running_stage(&env, 10, monday(1, 20));

        let report = reconciler(&env).run_tick(monday(1, 35));
        assert!(!report.working);
        assert_eq!(report.auto_paused, 1);

        let stage = env.stage(&id);
        assert_eq!(stage.status, StageStatus::Paused);
        assert!(stage.paused_by_system);
        assert_eq!(stage.pause_time, Some(monday(1, 35)));
        // 暂停保留机台绑定，但不占用机台
        assert_eq!(stage.machine_id.as_deref(), Some("M1"));
        assert!(env.gateway.find_running_on_machine("M1").unwrap().is_none());
    }

    #[test]
    fn test_e2e_no_pause_at_0135_with_20_minutes_remaining() {
        let env = single_machine_env();
        // 计划 1h，00:55 开工，01:35 剩余 20 分钟
        let id = running_stage(&env, 10, monday(0, 55));

        let report = reconciler(&env).run_tick(monday(1, 35));
        assert!(!report.working);
        assert_eq!(report.auto_paused, 0);
        assert_eq!(env.stage(&id).status, StageStatus::InProgress);
    }

    #[test]
    fn test_setup_stage_runs_through_night() {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        seed_machine(&env, "M1", "MT1", 1);
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 3.0)]);
        seed_route(&env, "DB", &[(10, "MT1", 0.1, 0.0)]);

        let other = create_batch(&env, "DB", 1, 5, monday(0, 0));
        run_to_completion(&env, &other.stages[0].stage_id, monday(0, 0), monday(0, 5));

        let plan = create_batch(&env, "DA", 10, 1, monday(1, 0));
        let setup = plan.stages.iter().find(|s| s.is_setup).unwrap().stage_id.clone();
        let engine = env.engine();
        engine.schedule_stage_execution(&setup, monday(1, 0)).unwrap();
        assert!(engine.start_pending_stage(&setup, monday(1, 0)).unwrap());

        let report = reconciler(&env).run_tick(monday(2, 0));
        assert_eq!(report.auto_paused, 0);
        assert_eq!(env.stage(&setup).status, StageStatus::InProgress);
    }

    // ==========================================
    // 工作时间恢复
    // ==========================================

    #[test]
    fn test_system_paused_stage_resumes_when_shift_starts() {
        let env = single_machine_env();
        // 计划 10h，避免恢复前先被判为超时
        let id = running_stage(&env, 100, monday(1, 20));
        let rec = reconciler(&env);

        assert_eq!(rec.run_tick(monday(1, 35)).auto_paused, 1);
        // 夜间不恢复
        assert_eq!(rec.run_tick(monday(5, 0)).auto_resumed, 0);

        let report = rec.run_tick(monday(8, 0));
        assert_eq!(report.auto_resumed, 1);
        let stage = env.stage(&id);
        assert_eq!(stage.status, StageStatus::InProgress);
        assert_eq!(stage.resume_time, Some(monday(8, 0)));
        assert!(!stage.paused_by_system);
    }

    #[test]
    fn test_resume_never_violates_machine_exclusivity() {
        let env = single_machine_env();
        let paused = running_stage(&env, 100, monday(1, 20));
        let rec = reconciler(&env);
        assert_eq!(rec.run_tick(monday(1, 35)).auto_paused, 1);

        // 夜间人工在同一机台开工另一工序
        let other = create_batch(&env, "DA", 100, 9, monday(7, 0));
        let other_id = other.stages[0].stage_id.clone();
        let engine = env.engine();
        assert_eq!(
            engine.schedule_stage_execution(&other_id, monday(7, 0)).unwrap(),
            "M1"
        );
        assert!(engine
            .start_stage(&other_id, TransitionActor::manual("OP-2", "PANEL-1", "夜班插单"), monday(7, 0))
            .unwrap());

        let report = rec.run_tick(monday(8, 0));
        assert_eq!(report.auto_resumed, 0);
        assert_eq!(env.stage(&paused).status, StageStatus::Paused);
        assert_eq!(
            env.gateway.find_running_on_machine("M1").unwrap().unwrap().stage_id,
            other_id
        );

        engine
            .complete_stage(
                &other_id,
                TransitionActor::manual("OP-2", "PANEL-1", "完工"),
                None,
                monday(8, 30),
            )
            .unwrap();
        let report = rec.run_tick(monday(8, 31));
        assert_eq!(report.auto_resumed, 1);
        assert_eq!(env.stage(&paused).status, StageStatus::InProgress);
    }

    #[test]
    fn test_manually_paused_stage_is_not_auto_resumed() {
        let env = single_machine_env();
        let id = running_stage(&env, 100, monday(9, 0));
        env.engine()
            .pause_stage(
                &id,
                TransitionActor::manual("OP-1", "PANEL-1", "换刀"),
                None,
                monday(9, 10),
            )
            .unwrap();

        let report = reconciler(&env).run_tick(monday(9, 11));
        assert_eq!(report.auto_resumed, 0);
        assert_eq!(env.stage(&id).status, StageStatus::Paused);
    }

    // ==========================================
    // 排队与自动开工限流
    // ==========================================

    fn throttled_env() -> TestEnv {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        for i in 0..8 {
            seed_machine(&env, &format!("M{}", i), "MT1", 1);
        }
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 0.0)]);
        for _ in 0..12 {
            create_batch(&env, "DA", 1, 5, monday(8, 0));
        }
        env
    }

    fn throttled(env: &TestEnv, queue_drain_limit: usize, auto_start_limit: usize) -> ReconciliationLoop {
        ReconciliationLoop::new(
            env.gateway.clone(),
            ShiftCalendar::new(ShiftRules::default(), 0),
            SchedulerConfig {
                queue_drain_limit,
                auto_start_limit,
                ..SchedulerConfig::default()
            },
        )
    }

    #[test]
    fn test_queue_drain_is_throttled() {
        let env = throttled_env();
        let report = throttled(&env, 3, 0).run_tick(monday(9, 1));
        assert_eq!(report.scheduled, 3);
        assert_eq!(report.started, 0);
        assert!(!report.queue_optimized);
        assert_eq!(env.gateway.find_queued().unwrap().len(), 3);
        assert!(env.gateway.find_in_progress().unwrap().is_empty());
    }

    #[test]
    fn test_auto_start_attempts_are_throttled() {
        let env = throttled_env();
        // 无排队分配时，自动开工阶段对未绑定机台的工序只做分配
        let report = throttled(&env, 0, 2).run_tick(monday(9, 1));
        assert_eq!(report.scheduled, 2);
        assert_eq!(report.started, 0);
        assert_eq!(env.gateway.find_queued().unwrap().len(), 2);
    }

    // ==========================================
    // 多机台派工
    // ==========================================

    fn two_machine_env() -> TestEnv {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        seed_machine(&env, "M1", "MT1", 10);
        seed_machine(&env, "M2", "MT1", 5);
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 0.0)]);
        env
    }

    #[test]
    fn test_two_machines_two_stages_run_in_parallel() {
        let env = two_machine_env();
        let first = create_batch(&env, "DA", 1, 5, monday(8, 0)).stages[0].stage_id.clone();
        let second = create_batch(&env, "DA", 1, 5, monday(8, 0)).stages[0].stage_id.clone();

        let report = reconciler(&env).run_tick(monday(9, 1));
        assert_eq!(report.scheduled, 2);
        assert_eq!(report.started, 2);

        let mut machines: Vec<String> = [&first, &second]
            .iter()
            .map(|id| {
                let stage = env.stage(id);
                assert_eq!(stage.status, StageStatus::InProgress);
                stage.machine_id.unwrap()
            })
            .collect();
        machines.sort();
        assert_eq!(machines, vec!["M1".to_string(), "M2".to_string()]);
    }

    #[test]
    fn test_queued_stage_is_rerouted_off_busy_machine() {
        let env = two_machine_env();
        let engine = env.engine();
        let enqueue = TransitionCommand::new(TransitionKind::Enqueue, TransitionActor::system("测试: 入队"));

        // 两道工序都绑定 M1，其中一道已开工
        let ids: Vec<String> = (0..2)
            .map(|_| {
                // 计划 10h，本周期内不会超时
                let id = create_batch(&env, "DA", 100, 5, monday(8, 0)).stages[0].stage_id.clone();
                engine.transition(&id, &enqueue, None, monday(8, 0)).unwrap();
                assert!(env.gateway.assign_machine(&id, "M1", None, monday(8, 0)).unwrap());
                id
            })
            .collect();
        assert!(engine.start_pending_stage(&ids[0], monday(9, 0)).unwrap());
        assert!(engine.is_blocked_on_machine(&env.stage(&ids[1])).unwrap());

        let report = reconciler(&env).run_tick(monday(9, 1));
        assert_eq!(report.started, 1);

        let rerouted = env.stage(&ids[1]);
        assert_eq!(rerouted.status, StageStatus::InProgress);
        assert_eq!(rerouted.machine_id.as_deref(), Some("M2"));
        assert_eq!(env.stage(&ids[0]).machine_id.as_deref(), Some("M1"));
    }

    // ==========================================
    // 阶段与工序隔离
    // ==========================================

    /// 注入故障的网关: 指定工序的迁移失败、系统暂停查询失败
    struct FlakyGateway {
        inner: Arc<production_scheduler::repository::SqliteProductionGateway>,
        failing_stage: String,
    }

    fn injected() -> RepositoryError {
        RepositoryError::DatabaseQueryError("injected".to_string())
    }

    impl ProductionGateway for FlakyGateway {
        fn find_stage(&self, stage_id: &str) -> RepositoryResult<Option<StageExecution>> {
            self.inner.find_stage(stage_id)
        }
        fn find_in_progress(&self) -> RepositoryResult<Vec<StageExecution>> {
            self.inner.find_in_progress()
        }
        fn find_queued(&self) -> RepositoryResult<Vec<StageExecution>> {
            self.inner.find_queued()
        }
        fn find_pending_ready(&self) -> RepositoryResult<Vec<StageExecution>> {
            self.inner.find_pending_ready()
        }
        fn find_system_paused(&self) -> RepositoryResult<Vec<StageExecution>> {
            Err(injected())
        }
        fn find_completed_since(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<StageExecution>> {
            self.inner.find_completed_since(since)
        }
        fn find_running_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<StageExecution>> {
            self.inner.find_running_on_machine(machine_id)
        }
        fn find_successor(&self, stage: &StageExecution) -> RepositoryResult<Option<StageExecution>> {
            self.inner.find_successor(stage)
        }
        fn find_stages_by_sub_batch(&self, sub_batch_id: &str) -> RepositoryResult<Vec<StageExecution>> {
            self.inner.find_stages_by_sub_batch(sub_batch_id)
        }
        fn apply_transition(
            &self,
            stage_id: &str,
            command: &TransitionCommand,
            expected_revision: Option<i32>,
            now: DateTime<Utc>,
        ) -> RepositoryResult<StageExecution> {
            if stage_id == self.failing_stage {
                return Err(injected());
            }
            self.inner.apply_transition(stage_id, command, expected_revision, now)
        }
        fn assign_machine(
            &self,
            stage_id: &str,
            machine_id: &str,
            expected_revision: Option<i32>,
            now: DateTime<Utc>,
        ) -> RepositoryResult<bool> {
            self.inner.assign_machine(stage_id, machine_id, expected_revision, now)
        }
        fn insert_setup_stage_before(
            &self,
            successor: &StageExecution,
            setup: &StageExecution,
        ) -> RepositoryResult<bool> {
            self.inner.insert_setup_stage_before(successor, setup)
        }
        fn save_queue_positions(&self, positions: &[(String, i32)]) -> RepositoryResult<usize> {
            self.inner.save_queue_positions(positions)
        }
        fn pin_machine(&self, stage_id: &str, machine_id: &str, now: DateTime<Utc>) -> RepositoryResult<bool> {
            self.inner.pin_machine(stage_id, machine_id, now)
        }
        fn find_machine(&self, machine_id: &str) -> RepositoryResult<Option<Machine>> {
            self.inner.find_machine(machine_id)
        }
        fn find_machines_by_type(&self, machine_type_id: &str) -> RepositoryResult<Vec<Machine>> {
            self.inner.find_machines_by_type(machine_type_id)
        }
        fn find_route(&self, detail_id: &str) -> RepositoryResult<Option<Route>> {
            self.inner.find_route(detail_id)
        }
        fn find_route_stage(&self, route_stage_id: &str) -> RepositoryResult<Option<RouteStage>> {
            self.inner.find_route_stage(route_stage_id)
        }
        fn find_setup_time(
            &self,
            machine_id: &str,
            from_detail_id: &str,
            to_detail_id: &str,
        ) -> RepositoryResult<Option<f64>> {
            self.inner.find_setup_time(machine_id, from_detail_id, to_detail_id)
        }
        fn find_last_detail_on_machine(&self, machine_id: &str) -> RepositoryResult<Option<String>> {
            self.inner.find_last_detail_on_machine(machine_id)
        }
        fn insert_batch_plan(&self, plan: &BatchPlan) -> RepositoryResult<()> {
            self.inner.insert_batch_plan(plan)
        }
    }

    #[test]
    fn test_stage_and_phase_failures_are_isolated() {
        let env = setup_env();
        seed_machine_type(&env, "MT1");
        seed_machine(&env, "M1", "MT1", 1);
        seed_machine(&env, "M2", "MT1", 1);
        seed_route(&env, "DA", &[(10, "MT1", 0.1, 0.0)]);

        let broken = running_stage(&env, 10, monday(8, 0));
        let healthy = running_stage(&env, 10, monday(8, 0));
        let waiting = create_batch(&env, "DA", 1, 5, monday(8, 0)).stages[0].stage_id.clone();

        let rec = ReconciliationLoop::new(
            Arc::new(FlakyGateway {
                inner: env.gateway.clone(),
                failing_stage: broken.clone(),
            }),
            ShiftCalendar::new(ShiftRules::default(), 0),
            SchedulerConfig::default(),
        );

        let report = rec.run_tick(monday(11, 1));
        // 两道都超时；一道迁移失败不影响另一道
        assert_eq!(report.auto_completed, 1);
        assert_eq!(report.stage_errors, 1);
        // 恢复阶段查询失败，后续阶段照常执行
        assert_eq!(report.phase_errors, 1);
        assert_eq!(report.scheduled, 1);

        assert_eq!(env.stage(&broken).status, StageStatus::InProgress);
        assert_eq!(env.stage(&healthy).status, StageStatus::Completed);
        assert_ne!(env.stage(&waiting).status, StageStatus::Pending);
    }

    // ==========================================
    // 异步循环
    // ==========================================

    fn always_working() -> ShiftRules {
        ShiftRules {
            work_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            work_end: NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap(),
            breaks: vec![],
            rest_days: vec![],
        }
    }

    #[tokio::test]
    async fn test_loop_stops_during_startup_delay() {
        let env = single_machine_env();
        let pending = create_batch(&env, "DA", 1, 5, Utc::now()).stages[0].stage_id.clone();

        let rec = Arc::new(ReconciliationLoop::new(
            env.gateway.clone(),
            ShiftCalendar::new(always_working(), 0),
            SchedulerConfig {
                startup_delay_secs: 3600,
                ..SchedulerConfig::default()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(rec.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("循环未及时停止")
            .unwrap();

        // 未执行任何周期
        assert_eq!(env.stage(&pending).status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_loop_runs_tick_then_stops_between_ticks() {
        let env = single_machine_env();
        let pending = create_batch(&env, "DA", 100, 5, Utc::now()).stages[0].stage_id.clone();

        let rec = Arc::new(ReconciliationLoop::new(
            env.gateway.clone(),
            ShiftCalendar::new(always_working(), 0),
            SchedulerConfig {
                startup_delay_secs: 0,
                tick_interval_secs: 3600,
                ..SchedulerConfig::default()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(rec.run(rx));

        // 等待第一个周期开工
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while env.stage(&pending).status != StageStatus::InProgress {
            assert!(tokio::time::Instant::now() < deadline, "首个周期未执行");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("循环未及时停止")
            .unwrap();
        assert_eq!(env.stage(&pending).status, StageStatus::InProgress);
    }
}
