/// Deferred and periodic task scheduling for the wisp script host
///
/// One-shot, repeating, and calendar-anchored (daily/weekly) invocations of
/// host callables, each identified by an opaque task id. Tasks run on the
/// scheduler's own fixed-size worker pool; cancellation is best-effort and
/// never interrupts a callable that is already mid-execution.
///
/// Calendar tasks compute their first fire time with wall-clock arithmetic
/// in local time: a target already past in the current period is pushed to
/// the next day or week. After the first fire they repeat on a fixed 24h /
/// 7×24h period, so daylight-saving shifts and clock jumps drift the
/// time-of-day rather than re-anchoring it.
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, NaiveTime, Weekday};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use wisp_core::WorkerPool;

/// Opaque, monotonically distinguishable task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Numeric form, for crossing the script boundary.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild from [`TaskId::raw`]. A forged id is harmless: cancellation
    /// with it simply finds nothing.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// What a task was scheduled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Once,
    Repeating,
    Daily,
    Weekly,
}

/// The deferred work itself. Panics are caught and logged per invocation.
pub type TaskFn = Arc<dyn Fn() + Send + Sync>;

/// Rejected calendar schedule: hour or minute out of range.
#[derive(Debug, Clone, Error)]
#[error("invalid schedule time {hour:02}:{minute:02}")]
pub struct InvalidScheduleTime {
    pub hour: u32,
    pub minute: u32,
}

struct TaskEntry {
    kind: TaskKind,
    next_fire: Arc<Mutex<Instant>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct TaskTable {
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
}

impl TaskTable {
    fn contains(&self, id: TaskId) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    fn remove(&self, id: TaskId) -> Option<TaskEntry> {
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

/// The scheduler. Share behind an `Arc`; callables may schedule and cancel
/// further tasks from inside their own invocation.
pub struct Scheduler {
    table: Arc<TaskTable>,
    pool: WorkerPool,
    next_task_id: AtomicU64,
}

impl Scheduler {
    /// Build a scheduler with a fixed-size worker pool of `workers`
    /// threads.
    pub fn new(workers: usize) -> io::Result<Self> {
        Ok(Self {
            table: Arc::new(TaskTable::default()),
            pool: WorkerPool::new("scheduler", workers)?,
            next_task_id: AtomicU64::new(0),
        })
    }

    /// Fire `callable` once after `delay`. The task leaves the active set
    /// after firing.
    pub fn schedule_once(&self, callable: TaskFn, delay: Duration) -> TaskId {
        let id = self.allocate_id();
        let next_fire = Arc::new(Mutex::new(Instant::now() + delay));
        let table = Arc::clone(&self.table);

        self.install(id, TaskKind::Once, Arc::clone(&next_fire), async move {
            tokio::time::sleep(delay).await;
            if !table.contains(id) {
                return; // cancelled while sleeping
            }
            run_callable(id, &callable);
            table.remove(id);
        });
        id
    }

    /// Fire `callable` every `interval`, first fire one interval from now.
    pub fn schedule_repeating(&self, callable: TaskFn, interval: Duration) -> TaskId {
        self.schedule_periodic(TaskKind::Repeating, callable, interval, interval)
    }

    /// Fire `callable` daily at `hour:minute` local time, starting today if
    /// that time is still ahead, otherwise tomorrow.
    pub fn schedule_daily(
        &self,
        callable: TaskFn,
        hour: u32,
        minute: u32,
    ) -> Result<TaskId, InvalidScheduleTime> {
        let first = delay_until_daily(hour, minute)?;
        Ok(self.schedule_periodic(TaskKind::Daily, callable, first, DAY))
    }

    /// Fire `callable` weekly on `weekday` at `hour:minute` local time.
    pub fn schedule_weekly(
        &self,
        callable: TaskFn,
        weekday: Weekday,
        hour: u32,
        minute: u32,
    ) -> Result<TaskId, InvalidScheduleTime> {
        let first = delay_until_weekly(weekday, hour, minute)?;
        Ok(self.schedule_periodic(TaskKind::Weekly, callable, first, WEEK))
    }

    /// Cancel a task: removes it from tracking and best-effort-cancels the
    /// underlying timer. A callable already mid-execution is not
    /// interrupted. Returns false for an unknown or already-finished id.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.table.remove(id) {
            Some(entry) => {
                if let Some(handle) = entry
                    .handle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    handle.abort();
                }
                debug!(target: "scheduler", "Cancelled task {id:?}");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.table.contains(id)
    }

    /// Time until the task's next fire, or None for an unknown id. Zero
    /// when the fire time has arrived but the callable has not finished
    /// relinquishing the entry yet.
    pub fn remaining_time(&self, id: TaskId) -> Option<Duration> {
        let tasks = self.table.tasks.read().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.get(&id)?;
        let next_fire = *entry.next_fire.lock().unwrap_or_else(|e| e.into_inner());
        Some(next_fire.saturating_duration_since(Instant::now()))
    }

    pub fn kind(&self, id: TaskId) -> Option<TaskKind> {
        self.table
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|entry| entry.kind)
    }

    /// Active task ids, ordered by creation.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .table
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn cancel_all(&self) {
        let ids = self.active_tasks();
        debug!(target: "scheduler", "Cancelling {} task(s)", ids.len());
        for id in ids {
            self.cancel(id);
        }
    }

    /// Drain the worker pool within `grace`, then force-stop it. Tasks
    /// scheduled afterwards never run.
    pub fn shutdown(&self, grace: Duration) {
        self.cancel_all();
        self.pool.shutdown(grace);
    }

    fn schedule_periodic(
        &self,
        kind: TaskKind,
        callable: TaskFn,
        first: Duration,
        period: Duration,
    ) -> TaskId {
        let id = self.allocate_id();
        let next_fire = Arc::new(Mutex::new(Instant::now() + first));
        let table = Arc::clone(&self.table);
        let loop_next_fire = Arc::clone(&next_fire);

        self.install(id, kind, next_fire, async move {
            let mut sleep_for = first;
            loop {
                tokio::time::sleep(sleep_for).await;
                if !table.contains(id) {
                    return;
                }
                run_callable(id, &callable);
                sleep_for = period;
                *loop_next_fire.lock().unwrap_or_else(|e| e.into_inner()) =
                    Instant::now() + period;
            }
        });
        id
    }

    fn allocate_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Insert the entry before spawning so the task future always finds
    /// itself in the table, then attach the join handle after the fact.
    fn install(
        &self,
        id: TaskId,
        kind: TaskKind,
        next_fire: Arc<Mutex<Instant>>,
        future: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        self.table
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                TaskEntry {
                    kind,
                    next_fire,
                    handle: Mutex::new(None),
                },
            );

        match self.pool.spawn_future(future) {
            Some(handle) => {
                let tasks = self.table.tasks.read().unwrap_or_else(|e| e.into_inner());
                // A zero-delay one-shot may already have fired and removed
                // itself; the finished handle is simply dropped then.
                if let Some(entry) = tasks.get(&id) {
                    *entry.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
            }
            None => {
                warn!(target: "scheduler", "Scheduler is shut down, dropping task {id:?}");
                self.table.remove(id);
            }
        }
    }
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn run_callable(id: TaskId, callable: &TaskFn) {
    debug!(target: "scheduler", "Firing task {id:?}");
    if catch_unwind(AssertUnwindSafe(|| callable())).is_err() {
        error!(target: "scheduler", "Task {id:?} panicked");
    }
}

/// Wall-clock delay until the next local `hour:minute`, today or tomorrow.
fn delay_until_daily(hour: u32, minute: u32) -> Result<Duration, InvalidScheduleTime> {
    let target = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or(InvalidScheduleTime { hour, minute })?;

    let now = Local::now().naive_local();
    let mut candidate = now.date().and_time(target);
    if candidate <= now {
        candidate += chrono::Duration::days(1);
    }
    Ok((candidate - now).to_std().unwrap_or_default())
}

/// Wall-clock delay until the next local `weekday` at `hour:minute`.
fn delay_until_weekly(
    weekday: Weekday,
    hour: u32,
    minute: u32,
) -> Result<Duration, InvalidScheduleTime> {
    let target = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or(InvalidScheduleTime { hour, minute })?;

    let now = Local::now().naive_local();
    let days_ahead = (weekday.num_days_from_monday() as i64
        - now.date().weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    let mut candidate = (now.date() + chrono::Duration::days(days_ahead)).and_time(target);
    if candidate <= now {
        candidate += chrono::Duration::days(7);
    }
    Ok((candidate - now).to_std().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> Scheduler {
        Scheduler::new(2).unwrap()
    }

    fn counter_task(counter: &Arc<AtomicUsize>) -> TaskFn {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn one_shot_fires_and_leaves_active_set() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule_once(counter_task(&fired), Duration::from_millis(30));

        assert!(scheduler.is_active(id));
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_active(id));
    }

    #[test]
    fn immediate_cancel_prevents_firing() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule_once(counter_task(&fired), Duration::from_millis(100));

        assert!(scheduler.cancel(id));
        assert!(!scheduler.is_active(id));

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_unknown_id_is_false() {
        let scheduler = scheduler();
        let id = scheduler.schedule_once(Arc::new(|| {}), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        // Fired and removed itself; a second cancel finds nothing.
        assert!(!scheduler.cancel(id));
    }

    #[test]
    fn repeating_fires_multiple_times() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule_repeating(counter_task(&fired), Duration::from_millis(40));

        std::thread::sleep(Duration::from_millis(400));
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 fires, got {count}");
        assert!(scheduler.is_active(id));

        scheduler.cancel(id);
        let after_cancel = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        // At most one in-flight fire can land after cancel.
        assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[test]
    fn panicking_task_keeps_repeating() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_task = Arc::clone(&fired);
        let id = scheduler.schedule_repeating(
            Arc::new(move || {
                fired_in_task.fetch_add(1, Ordering::SeqCst);
                panic!("task panic");
            }),
            Duration::from_millis(40),
        );

        std::thread::sleep(Duration::from_millis(300));
        assert!(fired.load(Ordering::SeqCst) >= 2);
        scheduler.cancel(id);
    }

    #[test]
    fn remaining_time_counts_down() {
        let scheduler = scheduler();
        let id = scheduler.schedule_once(Arc::new(|| {}), Duration::from_secs(60));

        let remaining = scheduler.remaining_time(id).unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(55));

        scheduler.cancel(id);
        assert!(scheduler.remaining_time(id).is_none());
    }

    #[test]
    fn daily_past_time_lands_tomorrow() {
        let scheduler = scheduler();
        // One minute in the past (handle midnight wrap via modular hour).
        let now = Local::now().naive_local();
        let past = now - chrono::Duration::minutes(1);
        let id = scheduler
            .schedule_daily(Arc::new(|| {}), past.time().hour(), past.time().minute())
            .unwrap();

        let remaining = scheduler.remaining_time(id).unwrap();
        assert!(
            remaining > Duration::from_secs(23 * 60 * 60),
            "expected ~24h, got {remaining:?}"
        );
        assert!(remaining <= DAY);
        assert_eq!(scheduler.kind(id), Some(TaskKind::Daily));
        scheduler.cancel(id);
    }

    #[test]
    fn daily_future_time_lands_today() {
        let scheduler = scheduler();
        let now = Local::now().naive_local();
        // Ten minutes ahead; skip the wrap-around minute before midnight.
        let ahead = now + chrono::Duration::minutes(10);
        if ahead.date() != now.date() {
            return;
        }
        let id = scheduler
            .schedule_daily(Arc::new(|| {}), ahead.time().hour(), ahead.time().minute())
            .unwrap();

        let remaining = scheduler.remaining_time(id).unwrap();
        assert!(remaining <= Duration::from_secs(10 * 60));
        scheduler.cancel(id);
    }

    #[test]
    fn daily_rejects_invalid_time() {
        let scheduler = scheduler();
        assert!(scheduler.schedule_daily(Arc::new(|| {}), 24, 0).is_err());
        assert!(scheduler.schedule_daily(Arc::new(|| {}), 0, 60).is_err());
    }

    #[test]
    fn weekly_past_slot_lands_next_week() {
        let scheduler = scheduler();
        let now = Local::now().naive_local();
        let past = now - chrono::Duration::minutes(1);
        if past.date() != now.date() {
            return; // midnight wrap would change the weekday
        }
        let id = scheduler
            .schedule_weekly(
                Arc::new(|| {}),
                now.date().weekday(),
                past.time().hour(),
                past.time().minute(),
            )
            .unwrap();

        let remaining = scheduler.remaining_time(id).unwrap();
        assert!(
            remaining > Duration::from_secs(6 * 24 * 60 * 60),
            "expected ~7d, got {remaining:?}"
        );
        assert!(remaining <= WEEK);
        scheduler.cancel(id);
    }

    #[test]
    fn active_tasks_ordered_by_creation() {
        let scheduler = scheduler();
        let first = scheduler.schedule_once(Arc::new(|| {}), Duration::from_secs(60));
        let second = scheduler.schedule_once(Arc::new(|| {}), Duration::from_secs(60));
        let third = scheduler.schedule_once(Arc::new(|| {}), Duration::from_secs(60));

        assert_eq!(scheduler.active_tasks(), vec![first, second, third]);

        scheduler.cancel(second);
        assert_eq!(scheduler.active_tasks(), vec![first, third]);
        scheduler.cancel_all();
        assert!(scheduler.active_tasks().is_empty());
    }

    #[test]
    fn shutdown_stops_everything() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_repeating(counter_task(&fired), Duration::from_millis(30));

        scheduler.shutdown(Duration::from_millis(100));
        assert!(scheduler.active_tasks().is_empty());

        let id = scheduler.schedule_once(counter_task(&fired), Duration::from_millis(10));
        assert!(!scheduler.is_active(id));
    }

    #[test]
    fn task_can_schedule_another_task() {
        let scheduler = Arc::new(scheduler());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_fired = Arc::clone(&fired);
        scheduler.schedule_once(
            Arc::new(move || {
                inner_scheduler.schedule_once(counter_task(&inner_fired), Duration::from_millis(20));
            }),
            Duration::from_millis(20),
        );

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
