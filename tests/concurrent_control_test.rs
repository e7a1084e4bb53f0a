// ==========================================
// 并发控制测试
// ==========================================
// 职责: 验证机台独占与乐观锁在并发下成立
// ==========================================


#[cfg(test)]
mod concurrent_control_test {
    use crate::test_helpers::*;
    use production_scheduler::db::open_sqlite_connection;
    use production_scheduler::domain::{
        StageStatus, TransitionActor, TransitionCommand, TransitionError, TransitionKind,
    };
    use production_scheduler::engine::{ProductionGateway, SchedulingEngine, SchedulingError};
    use production_scheduler::repository::{RepositoryError, SqliteProductionGateway};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    // ==========================================
    // 测试辅助函数
    // ==========================================

    /// 单机台 M1，count 个批次均已绑定 M1 并排队
    fn queued_on_single_machine(env: &TestEnv, count: usize) -> Vec<String> {
        seed_machine_type(env, "MT1");
        seed_machine(env, "M1", "MT1", 1);
        seed_route(env, "DA", &[(10, "MT1", 0.1, 0.0)]);

        let engine = env.engine();
        (0..count)
            .map(|_| {
                let plan = create_batch(env, "DA", 10, 5, monday(9, 0));
                let id = plan.stages[0].stage_id.clone();
                let enqueue = TransitionCommand::new(
                    TransitionKind::Enqueue,
                    TransitionActor::system("测试: 入队"),
                );
                engine.transition(&id, &enqueue, None, monday(9, 0)).unwrap();
                assert!(env.gateway.assign_machine(&id, "M1", None, monday(9, 0)).unwrap());
                id
            })
            .collect()
    }

    fn running_on_m1(env: &TestEnv) -> usize {
        env.gateway
            .find_in_progress()
            .unwrap()
            .iter()
            .filter(|s| s.machine_id.as_deref() == Some("M1"))
            .count()
    }

    // ==========================================
    // 测试用例
    // ==========================================

    #[test]
    fn test_concurrent_starts_on_same_machine() {
        let env = setup_env();
        let stage_ids = queued_on_single_machine(&env, 6);
        let engine = Arc::new(env.engine());
        let barrier = Arc::new(Barrier::new(stage_ids.len()));

        let mut handles = vec![];
        for id in stage_ids.clone() {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let handle = thread::spawn(move || {
                barrier.wait();
                engine.start_pending_stage(&id, monday(9, 5))
            });
            handles.push(handle);
        }

        let mut success_count = 0;
        for handle in handles {
            if handle.join().unwrap().unwrap() {
                success_count += 1;
            }
        }

        assert_eq!(success_count, 1, "同一机台只能有 1 个工序开工");
        assert_eq!(running_on_m1(&env), 1);
        let queued = stage_ids
            .iter()
            .filter(|id| env.stage(id).status == StageStatus::InQueue)
            .count();
        assert_eq!(queued, stage_ids.len() - 1);
    }

    #[test]
    fn test_concurrent_starts_across_connections() {
        let env = setup_env();
        let stage_ids = queued_on_single_machine(&env, 4);
        let barrier = Arc::new(Barrier::new(stage_ids.len()));

        // 每个线程独立连接，独占由数据库事务与唯一索引保证
        let mut handles = vec![];
        for id in stage_ids {
            let db_path = env.db_path.clone();
            let barrier = barrier.clone();
            let handle = thread::spawn(move || -> Result<bool, SchedulingError> {
                let conn = Arc::new(Mutex::new(open_sqlite_connection(&db_path).unwrap()));
                let engine = SchedulingEngine::new(Arc::new(SqliteProductionGateway::new(conn)));
                barrier.wait();
                engine.start_pending_stage(&id, monday(9, 5))
            });
            handles.push(handle);
        }

        let mut success_count = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(true) => success_count += 1,
                Ok(false) => {}
                Err(e) => panic!("开工不应报错: {}", e),
            }
        }

        assert_eq!(success_count, 1);
        assert_eq!(running_on_m1(&env), 1);
    }

    #[test]
    fn test_concurrent_resume_and_start() {
        let env = setup_env();
        let stage_ids = queued_on_single_machine(&env, 2);
        let (paused, queued) = (stage_ids[0].clone(), stage_ids[1].clone());

        let engine = Arc::new(env.engine());
        assert!(engine.start_pending_stage(&paused, monday(9, 5)).unwrap());
        engine
            .pause_stage(
                &paused,
                TransitionActor::manual("OP-1", "PANEL-1", "检修"),
                None,
                monday(9, 10),
            )
            .unwrap();
        assert_eq!(running_on_m1(&env), 0);

        let barrier = Arc::new(Barrier::new(2));

        let resume = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.resume_stage(
                    &paused,
                    TransitionActor::manual("OP-1", "PANEL-1", "检修完毕"),
                    None,
                    monday(9, 20),
                )
            })
        };
        let start = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.start_pending_stage(&queued, monday(9, 20))
            })
        };

        let resumed = match resume.join().unwrap() {
            Ok(_) => true,
            Err(SchedulingError::Transition(TransitionError::MachineOccupied { .. })) => false,
            Err(e) => panic!("恢复失败: {}", e),
        };
        let started = start.join().unwrap().unwrap();

        assert!(resumed ^ started, "恢复与开工只能有一个成功");
        assert_eq!(running_on_m1(&env), 1);
    }

    #[test]
    fn test_concurrent_stale_revision_single_winner() {
        let env = setup_env();
        let stage_ids = queued_on_single_machine(&env, 1);
        let id = stage_ids[0].clone();
        let engine = Arc::new(env.engine());
        assert!(engine.start_pending_stage(&id, monday(9, 5)).unwrap());

        // 所有线程持有同一旧版本号
        let revision = env.stage(&id).revision;
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = vec![];
        for i in 0..4 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let id = id.clone();
            let handle = thread::spawn(move || {
                barrier.wait();
                engine.pause_stage(
                    &id,
                    TransitionActor::manual(format!("OP-{}", i), "PANEL-1", "并发暂停"),
                    Some(revision),
                    monday(9, 30),
                )
            });
            handles.push(handle);
        }

        let mut success_count = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => success_count += 1,
                Err(SchedulingError::Repository(RepositoryError::OptimisticLockFailure { .. })) => {}
                Err(e) => panic!("期望乐观锁冲突: {}", e),
            }
        }

        assert_eq!(success_count, 1);
        let stage = env.stage(&id);
        assert_eq!(stage.status, StageStatus::Paused);
        assert_eq!(stage.revision, revision + 1);
    }
}
