use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::{MetricSink, VUS};
use crate::runner;
use crate::sampler::Sampler;
use crate::scenario::{Scenario, SharedContext, VuContext};
use crate::schedule::Schedule;
use crate::transport::Transport;

/// Scheduler knobs. `tick` bounds how far the alive-VU count may lag the
/// ramp target; `max_vus` caps concurrency regardless of the stage plan.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub max_vus: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            max_vus: 10_000,
        }
    }
}

struct Vu {
    id: u64,
    retire: Arc<AtomicBool>,
    task: JoinHandle<u64>,
}

/// Ramps a pool of VUs up and down along the schedule. Retirement is always
/// graceful: a VU marked for retirement finishes its in-flight iteration and
/// then exits, never mid-iteration.
pub struct VuScheduler {
    schedule: Schedule,
    settings: SchedulerSettings,
}

impl VuScheduler {
    pub fn new(schedule: Schedule, settings: SchedulerSettings) -> Self {
        Self { schedule, settings }
    }

    /// Drives the whole schedule and resolves once every VU has drained.
    /// Returns the number of iterations completed across all VUs.
    pub async fn run(
        &self,
        scenario: Arc<dyn Scenario>,
        shared: Arc<SharedContext>,
        transport: Arc<dyn Transport>,
        metrics: MetricSink,
        seed: u64,
        cancel: watch::Receiver<bool>,
    ) -> u64 {
        let start = Instant::now();
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut alive: VecDeque<Vu> = VecDeque::new();
        let mut draining: Vec<Vu> = Vec::new();
        let mut next_id: u64 = 0;
        let mut current_stage: Option<usize> = None;
        let mut completed: u64 = 0;

        info!(
            stages = self.schedule.stages().len(),
            total_ms = self.schedule.total_duration().as_millis() as u64,
            "schedule started"
        );

        loop {
            interval.tick().await;
            if *cancel.borrow() {
                info!("cancellation requested, draining VUs");
                break;
            }

            let elapsed = start.elapsed();
            let Some(target) = self.schedule.target_at(elapsed) else {
                break;
            };
            let target = target.min(self.settings.max_vus);

            let stage = self.schedule.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(idx) = stage {
                    let entered = &self.schedule.stages()[idx];
                    info!(
                        stage = idx,
                        target = entered.target,
                        duration_ms = entered.duration.as_millis() as u64,
                        "entering stage"
                    );
                }
                current_stage = stage;
            }

            let alive_now = alive.len() as u64;
            if alive_now < target {
                for _ in 0..target - alive_now {
                    let vu = self.spawn_vu(next_id, &scenario, &shared, &transport, &metrics, seed, &cancel);
                    next_id += 1;
                    alive.push_back(vu);
                }
            } else if alive_now > target {
                // Oldest first. Moving a VU onto the draining list is what
                // guarantees it is never retired twice, and a tick either
                // spawns or retires, never both.
                for _ in 0..alive_now - target {
                    if let Some(vu) = alive.pop_front() {
                        debug!(vu = vu.id, "retiring");
                        vu.retire.store(true, Ordering::Relaxed);
                        draining.push(vu);
                    }
                }
            }

            metrics.add_trend(VUS, alive.len() as f64);
            completed += reap_finished(&mut draining).await;
        }

        for vu in alive.drain(..) {
            vu.retire.store(true, Ordering::Relaxed);
            draining.push(vu);
        }
        info!(draining = draining.len(), "waiting for in-flight iterations to finish");
        for vu in draining {
            completed += join_vu(vu).await;
        }
        info!(iterations = completed, "schedule complete");
        completed
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_vu(
        &self,
        id: u64,
        scenario: &Arc<dyn Scenario>,
        shared: &Arc<SharedContext>,
        transport: &Arc<dyn Transport>,
        metrics: &MetricSink,
        seed: u64,
        cancel: &watch::Receiver<bool>,
    ) -> Vu {
        let retire = Arc::new(AtomicBool::new(false));
        let ctx = VuContext::new(
            id,
            shared.clone(),
            transport.clone(),
            metrics.clone(),
            Sampler::for_vu(seed, id),
            cancel.clone(),
        );
        let scenario = scenario.clone();
        let retire_flag = retire.clone();
        let task = tokio::spawn(async move {
            debug!(vu = id, "spawned");
            let mut iterations = 0u64;
            // Retirement and cancellation are observed only between
            // iterations; an in-flight iteration always completes.
            while !retire_flag.load(Ordering::Relaxed) && !ctx.is_cancelled() {
                runner::run_iteration(scenario.as_ref(), &ctx).await;
                iterations += 1;
                tokio::task::yield_now().await;
            }
            debug!(vu = id, iterations, "exited");
            iterations
        });
        Vu { id, retire, task }
    }
}

async fn reap_finished(draining: &mut Vec<Vu>) -> u64 {
    let mut completed = 0;
    let mut idx = 0;
    while idx < draining.len() {
        if draining[idx].task.is_finished() {
            completed += join_vu(draining.swap_remove(idx)).await;
        } else {
            idx += 1;
        }
    }
    completed
}

async fn join_vu(vu: Vu) -> u64 {
    match vu.task.await {
        Ok(iterations) => iterations,
        Err(err) => {
            warn!(vu = vu.id, %err, "VU task aborted");
            0
        }
    }
}
