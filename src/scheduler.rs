//! Flow Scheduler: drives `schedule` triggers (cron or interval) and exposes
//! the start/stop hooks the Bus Client uses to bind a flow-set's schedule
//! triggers to the lifetime of the bus-name subscription that owns them.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;

use crate::broker::{EventBroker, FlowTriggerMessage};
use crate::config::flow::{FlowConfig, ScheduleSpec};

/// Misfire grace period: a schedule whose computed fire time has already
/// slipped further than this into the past is skipped rather than fired
/// late, and the next occurrence is recomputed instead (coalescing any
/// number of missed firings into at most one skip).
const MISFIRE_GRACE: Duration = Duration::from_secs(5);

/// Starts and stops the scheduled-trigger jobs belonging to a flow-set, as
/// the bus-name subscription that owns them comes and goes. Implemented by
/// [`FlowScheduler`]; abstracted behind a trait so the Bus Client doesn't
/// need to depend on the scheduler's internals.
pub trait FlowSetController: Send + Sync {
    /// Starts every `schedule`-triggered job in `flows` that isn't already
    /// running. Idempotent: flows already started are left untouched.
    fn start_flow_set(&self, flows: &[FlowConfig]);
    /// Stops every job started for `flows`, unconditionally — matching the
    /// upstream TODO about reference-counting flow-sets shared by several
    /// bus-name subscriptions; a flow bound to a still-active subscription
    /// is simply rescheduled the next time that subscription re-attaches.
    fn stop_flow_set(&self, flows: &[FlowConfig]);
}

struct Job {
    handle: JoinHandle<()>,
}

impl Drop for Job {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs one sleep-and-fire task per `schedule` trigger, keyed by the
/// `(flow_id, trigger_index)` pair so the same trigger is never scheduled
/// twice.
pub struct FlowScheduler {
    broker: EventBroker,
    jobs: Mutex<HashMap<String, Job>>,
}

impl FlowScheduler {
    pub fn new(broker: EventBroker) -> Self {
        Self { broker, jobs: Mutex::new(HashMap::new()) }
    }

    fn job_key(flow_id: &str, trigger_index: usize) -> String {
        format!("{flow_id}#{trigger_index}")
    }

    fn spawn_job(&self, flow_id: String, spec: ScheduleSpec) -> JoinHandle<()> {
        let trigger_tx = self.broker.flow_trigger.clone();
        tokio::spawn(async move {
            log::debug!("schedule job started for flow {flow_id}");
            loop {
                let sleep_for = match next_fire_delay(&spec) {
                    Some(d) => d,
                    None => {
                        log::warn!("schedule job for flow {flow_id} has no future occurrence, stopping");
                        return;
                    }
                };
                tokio::time::sleep(sleep_for).await;

                let message = FlowTriggerMessage {
                    flow_id: flow_id.clone(),
                    trigger_kind: "schedule",
                    context: serde_json::json!({}),
                };
                log::debug!("schedule trigger fired for flow {flow_id}");
                if trigger_tx.send(message).await.is_err() {
                    log::debug!("flow_trigger queue closed, stopping schedule job for flow {flow_id}");
                    return;
                }
            }
        })
    }
}

/// Computes how long to sleep before the next occurrence. For a cron
/// schedule, skips (and recomputes past) any occurrence that has already
/// slipped more than [`MISFIRE_GRACE`] into the past — coalescing a burst
/// of missed firings into a single upcoming one.
fn next_fire_delay(spec: &ScheduleSpec) -> Option<Duration> {
    match spec {
        ScheduleSpec::Interval(interval) => Some(interval.as_duration()),
        ScheduleSpec::Cron { cron } => {
            let schedule = CronSchedule::from_str(cron).ok()?;
            let now = Utc::now();
            for occurrence in schedule.upcoming(Utc) {
                let delay = occurrence - now;
                if delay < -chrono::Duration::from_std(MISFIRE_GRACE).unwrap() {
                    continue;
                }
                return Some(delay.to_std().unwrap_or(Duration::ZERO));
            }
            None
        }
    }
}

impl FlowSetController for FlowScheduler {
    fn start_flow_set(&self, flows: &[FlowConfig]) {
        let mut jobs = self.jobs.lock().unwrap();
        for flow in flows {
            for (index, trigger) in flow.triggers.iter().enumerate() {
                let crate::config::flow::FlowTriggerConfig::Schedule { schedule } = trigger else { continue };
                let key = Self::job_key(&flow.id, index);
                if jobs.contains_key(&key) {
                    continue;
                }
                let handle = self.spawn_job(flow.id.clone(), schedule.clone());
                jobs.insert(key, Job { handle });
            }
        }
    }

    fn stop_flow_set(&self, flows: &[FlowConfig]) {
        let mut jobs = self.jobs.lock().unwrap();
        for flow in flows {
            for (index, trigger) in flow.triggers.iter().enumerate() {
                if !matches!(trigger, crate::config::flow::FlowTriggerConfig::Schedule { .. }) {
                    continue;
                }
                jobs.remove(&Self::job_key(&flow.id, index));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::flow::{FlowTriggerConfig, IntervalSpec};

    fn flow_with_interval_schedule(id: &str, seconds: u64) -> FlowConfig {
        FlowConfig {
            id: id.to_string(),
            name: None,
            triggers: vec![FlowTriggerConfig::Schedule {
                schedule: ScheduleSpec::Interval(IntervalSpec { seconds, minutes: 0, hours: 0, days: 0 }),
            }],
            actions: vec![],
        }
    }

    #[test]
    fn interval_delay_matches_configured_duration() {
        let spec = ScheduleSpec::Interval(IntervalSpec { seconds: 30, minutes: 1, hours: 0, days: 0 });
        assert_eq!(next_fire_delay(&spec), Some(Duration::from_secs(90)));
    }

    #[test]
    fn cron_delay_finds_next_occurrence() {
        let spec = ScheduleSpec::Cron { cron: "* * * * * *".to_string() };
        let delay = next_fire_delay(&spec).expect("every-second cron always has an occurrence");
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn invalid_cron_expression_yields_no_delay() {
        let spec = ScheduleSpec::Cron { cron: "not a cron expression".to_string() };
        assert_eq!(next_fire_delay(&spec), None);
    }

    #[tokio::test]
    async fn starting_flow_set_twice_does_not_duplicate_jobs() {
        let (broker, _queues) = EventBroker::new(4);
        let scheduler = FlowScheduler::new(broker);
        let flow = flow_with_interval_schedule("flow-1", 3600);

        scheduler.start_flow_set(std::slice::from_ref(&flow));
        scheduler.start_flow_set(std::slice::from_ref(&flow));

        assert_eq!(scheduler.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stopping_flow_set_removes_its_jobs() {
        let (broker, _queues) = EventBroker::new(4);
        let scheduler = FlowScheduler::new(broker);
        let flow = flow_with_interval_schedule("flow-1", 3600);

        scheduler.start_flow_set(std::slice::from_ref(&flow));
        assert_eq!(scheduler.jobs.lock().unwrap().len(), 1);

        scheduler.stop_flow_set(std::slice::from_ref(&flow));
        assert_eq!(scheduler.jobs.lock().unwrap().len(), 0);
    }
}
