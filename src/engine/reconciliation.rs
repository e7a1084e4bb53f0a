// ==========================================
// 生产排程引擎 - 调和循环
// ==========================================
// 每个周期按固定顺序执行（每次重新读取状态，不跨周期缓存）:
// 1. 超时自动完工（不看班次）
// 2. 非工作时间: 自动暂停在制工序（换型/高优先级/关键/即将完工除外）
// 3. 工作时间: 恢复系统暂停 → 排队分配机台（含改派被占机台的排队工序） → 自动开工
// 4. 完工后续处理（不看班次）
// 5. 队列重排（工作时间，且本地分钟数整除间隔）
// ==========================================
// 隔离: 单工序失败记录后继续；阶段失败记录后进入下一阶段
// ==========================================

use crate::config::scheduler_config::SchedulerConfig;
use crate::domain::stage::{duration_to_hours, StageExecution, TransitionActor};
use crate::engine::error::{SchedulingError, SchedulingResult};
use crate::engine::gateway::ProductionGateway;
use crate::engine::queue_order::QueueSorter;
use crate::engine::scheduling::{CompletionOutcome, SchedulingEngine};
use crate::engine::shift_calendar::ShiftCalendar;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// 是否超时: (已用 - 计划) 严格大于容差
pub fn is_overdue(stage: &StageExecution, now: DateTime<Utc>, tolerance: Duration) -> bool {
    stage.overrun(now).map_or(false, |overrun| overrun > tolerance)
}

/// 非工作时间是否继续加工
pub fn should_continue_outside_working_hours(
    stage: &StageExecution,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> bool {
    stage.is_setup
        || stage.priority > config.continue_priority_threshold
        || stage.is_critical
        || stage
            .remaining(now)
            .map_or(false, |r| r <= Duration::minutes(config.finish_window_minutes))
}

/// 单个周期的执行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub working: bool,
    pub auto_completed: usize,
    pub auto_paused: usize,
    pub auto_resumed: usize,
    pub scheduled: usize,
    pub started: usize,
    pub completion_followups: usize,
    pub queue_optimized: bool,
    pub stage_errors: usize,
    pub phase_errors: usize,
}

impl TickReport {
    fn has_activity(&self) -> bool {
        self.auto_completed
            + self.auto_paused
            + self.auto_resumed
            + self.scheduled
            + self.started
            + self.completion_followups
            + self.stage_errors
            + self.phase_errors
            > 0
    }
}

// ==========================================
// ReconciliationLoop - 调和循环
// ==========================================
pub struct ReconciliationLoop {
    engine: SchedulingEngine,
    calendar: ShiftCalendar,
    config: SchedulerConfig,
}

impl ReconciliationLoop {
    pub fn new(gateway: Arc<dyn ProductionGateway>, calendar: ShiftCalendar, config: SchedulerConfig) -> Self {
        Self {
            engine: SchedulingEngine::new(gateway),
            calendar,
            config,
        }
    }

    pub fn engine(&self) -> &SchedulingEngine {
        &self.engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn gateway(&self) -> &Arc<dyn ProductionGateway> {
        self.engine.gateway()
    }

    /// 执行一个调和周期
    pub fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport {
            working: self.calendar.is_working_instant(now),
            ..TickReport::default()
        };

        self.phase("auto_complete_overdue", &mut report, |r| {
            self.auto_complete_overdue(now, r)
        });

        if report.working {
            self.phase("resume_system_paused", &mut report, |r| {
                self.resume_system_paused(now, r)
            });
            self.phase("drain_queue", &mut report, |r| self.drain_queue(now, r));
            self.phase("auto_start", &mut report, |r| self.auto_start(now, r));
        } else {
            self.phase("pause_outside_hours", &mut report, |r| {
                self.pause_outside_hours(now, r)
            });
        }

        self.phase("completion_followup", &mut report, |r| {
            self.completion_followup(now, r)
        });

        let local_minute = self.calendar.to_local(now).minute();
        if report.working && local_minute % self.config.queue_optimize_every_minutes.max(1) == 0 {
            self.phase("optimize_queue", &mut report, |r| {
                self.engine.optimize_queue()?;
                r.queue_optimized = true;
                Ok(())
            });
        }

        if report.has_activity() {
            tracing::info!(?report, "调和周期完成");
        } else {
            tracing::debug!(?report, "调和周期完成");
        }
        report
    }

    fn phase<F>(&self, name: &str, report: &mut TickReport, f: F)
    where
        F: FnOnce(&mut TickReport) -> SchedulingResult<()>,
    {
        if let Err(e) = f(report) {
            report.phase_errors += 1;
            tracing::error!(phase = name, error = %e, "调和阶段失败，继续后续阶段");
        }
    }

    fn stage_failed(report: &mut TickReport, stage_id: &str, action: &str, e: &SchedulingError) {
        report.stage_errors += 1;
        tracing::error!(stage_id, action, error = %e, "工序处理失败，继续处理其余工序");
    }

    // ===== 阶段 1 =====

    fn auto_complete_overdue(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        let tolerance = Duration::minutes(self.config.overdue_tolerance_minutes);

        for stage in self.gateway().find_in_progress()? {
            if !is_overdue(&stage, now, tolerance) {
                continue;
            }
            let overrun_hours = stage.overrun(now).map(duration_to_hours).unwrap_or_default();
            let actor = TransitionActor::system(format!(
                "调和: 超时自动完工, 超出计划 {:.2} 小时",
                overrun_hours
            ));
            match self
                .engine
                .complete_stage(&stage.stage_id, actor, Some(stage.revision), now)
            {
                Ok(_) => {
                    report.auto_completed += 1;
                    tracing::info!(
                        stage_id = %stage.stage_id,
                        machine_id = ?stage.machine_id,
                        overrun_hours,
                        "超时工序已自动完工"
                    );
                }
                Err(e) => Self::stage_failed(report, &stage.stage_id, "auto_complete", &e),
            }
        }
        Ok(())
    }

    // ===== 阶段 2 =====

    fn pause_outside_hours(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        for stage in self.gateway().find_in_progress()? {
            if should_continue_outside_working_hours(&stage, now, &self.config) {
                continue;
            }
            let remaining_min = stage.remaining(now).map_or(0, |r| r.num_minutes());
            let actor = TransitionActor::system(format!(
                "调和: 非工作时间自动暂停, 剩余 {} 分钟",
                remaining_min
            ));
            match self
                .engine
                .pause_stage(&stage.stage_id, actor, Some(stage.revision), now)
            {
                Ok(_) => report.auto_paused += 1,
                Err(e) => Self::stage_failed(report, &stage.stage_id, "auto_pause", &e),
            }
        }
        Ok(())
    }

    // ===== 阶段 3 =====

    fn resume_system_paused(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        for stage in self.gateway().find_system_paused()? {
            if let Some(machine_id) = &stage.machine_id {
                if let Some(running) = self.gateway().find_running_on_machine(machine_id)? {
                    tracing::debug!(
                        stage_id = %stage.stage_id,
                        machine_id = %machine_id,
                        occupant_stage_id = %running.stage_id,
                        "机台被占用，暂不恢复"
                    );
                    continue;
                }
            }
            let actor = TransitionActor::system("调和: 工作时间自动恢复");
            match self
                .engine
                .resume_stage(&stage.stage_id, actor, Some(stage.revision), now)
            {
                Ok(_) => report.auto_resumed += 1,
                Err(e) if e.is_machine_race() => {
                    tracing::debug!(stage_id = %stage.stage_id, "恢复时机台被抢占，下个周期重试");
                }
                Err(e) => Self::stage_failed(report, &stage.stage_id, "auto_resume", &e),
            }
        }
        Ok(())
    }

    fn drain_queue(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        // 未绑定机台的排队工序，以及绑定机台被占用、可改派的排队工序
        let mut candidates: Vec<StageExecution> = Vec::new();
        for stage in self.gateway().find_queued()? {
            if stage.machine_id.is_none() || self.engine.is_blocked_on_machine(&stage)? {
                candidates.push(stage);
            }
        }
        candidates.extend(self.gateway().find_pending_ready()?);

        for stage in QueueSorter::sort(candidates)
            .into_iter()
            .take(self.config.queue_drain_limit)
        {
            match self.engine.schedule_stage_execution(&stage.stage_id, now) {
                Ok(_) => report.scheduled += 1,
                Err(SchedulingError::NoEligibleMachine { .. }) => {
                    tracing::debug!(stage_id = %stage.stage_id, "无空闲机台，保持排队");
                }
                Err(e) => Self::stage_failed(report, &stage.stage_id, "schedule", &e),
            }
        }
        Ok(())
    }

    fn auto_start(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        let mut candidates = self.gateway().find_queued()?;
        candidates.extend(self.gateway().find_pending_ready()?);

        let mut attempted = 0;
        for stage in QueueSorter::sort(candidates) {
            if attempted >= self.config.auto_start_limit {
                break;
            }
            match self.engine.can_start_stage(&stage.stage_id) {
                Ok(true) => {}
                Ok(false) => {
                    self.reroute_blocked(&stage, now, report);
                    continue;
                }
                Err(e) => {
                    Self::stage_failed(report, &stage.stage_id, "can_start", &e);
                    continue;
                }
            }
            attempted += 1;

            if stage.machine_id.is_none() {
                match self.engine.schedule_stage_execution(&stage.stage_id, now) {
                    Ok(_) => report.scheduled += 1,
                    Err(SchedulingError::NoEligibleMachine { .. }) => {}
                    Err(e) => Self::stage_failed(report, &stage.stage_id, "schedule", &e),
                }
                continue;
            }

            match self.engine.start_pending_stage(&stage.stage_id, now) {
                Ok(true) => report.started += 1,
                Ok(false) => {
                    // 机台被抢占: 尝试改派其他空闲机台，下个周期开工
                    match self.engine.schedule_stage_execution(&stage.stage_id, now) {
                        Ok(_) | Err(SchedulingError::NoEligibleMachine { .. }) => {}
                        Err(e) => Self::stage_failed(report, &stage.stage_id, "reschedule", &e),
                    }
                }
                Err(e) => Self::stage_failed(report, &stage.stage_id, "start", &e),
            }
        }
        Ok(())
    }

    /// 绑定机台被占用时改派其他可用机台
    fn reroute_blocked(&self, stage: &StageExecution, now: DateTime<Utc>, report: &mut TickReport) {
        match self.engine.is_blocked_on_machine(stage) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                Self::stage_failed(report, &stage.stage_id, "reroute", &e);
                return;
            }
        }
        match self.engine.schedule_stage_execution(&stage.stage_id, now) {
            Ok(machine_id) => {
                tracing::info!(
                    stage_id = %stage.stage_id,
                    from_machine_id = stage.machine_id.as_deref().unwrap_or(""),
                    machine_id = %machine_id,
                    "排队工序已改派机台"
                );
                report.scheduled += 1;
            }
            Err(SchedulingError::NoEligibleMachine { .. }) => {}
            Err(e) => Self::stage_failed(report, &stage.stage_id, "reroute", &e),
        }
    }

    // ===== 阶段 4 =====

    fn completion_followup(&self, now: DateTime<Utc>, report: &mut TickReport) -> SchedulingResult<()> {
        let since = now - Duration::minutes(self.config.completion_lookback_minutes);

        for stage in self.gateway().find_completed_since(since)? {
            match self.engine.handle_stage_completion(&stage.stage_id, now) {
                Ok(CompletionOutcome::Promoted { .. }) => report.completion_followups += 1,
                Ok(_) => {}
                Err(e) => Self::stage_failed(report, &stage.stage_id, "completion_followup", &e),
            }
        }
        Ok(())
    }

    // ==========================================
    // 异步驱动
    // ==========================================

    /// 运行调和循环直到收到停止信号
    ///
    /// 周期在阻塞线程池执行并等待其结束；停止信号只在延迟等待期间生效，
    /// 不会打断进行中的周期
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let startup_delay = std::time::Duration::from_secs(self.config.startup_delay_secs);
        let interval = std::time::Duration::from_secs(self.config.tick_interval_secs.max(1));

        tracing::info!(
            startup_delay_secs = self.config.startup_delay_secs,
            tick_interval_secs = self.config.tick_interval_secs,
            "调和循环启动"
        );

        if wait_or_shutdown(&mut shutdown, startup_delay).await {
            tracing::info!("调和循环在启动延迟期间停止");
            return;
        }

        loop {
            let this = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || this.run_tick(Utc::now())).await {
                tracing::error!(error = %e, "调和周期任务异常终止");
            }

            if wait_or_shutdown(&mut shutdown, interval).await {
                break;
            }
        }

        tracing::info!("调和循环已停止");
    }
}

/// 等待 delay；期间收到停止信号（或发送端关闭）返回 true
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
