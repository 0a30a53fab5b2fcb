use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Deferred work owned by the synchronization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTask {
    Ping,
    FlushBatch,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct ScheduledTimer<T> {
    due: Instant,
    id: u64,
    period: Option<Duration>,
    task: T,
}

impl<T> PartialEq for ScheduledTimer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl<T> Eq for ScheduledTimer<T> {}

impl<T> PartialOrd for ScheduledTimer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledTimer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap; ties fire in scheduling order
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Timers driven by the host's tick loop. Nothing fires on its own: `poll`
/// returns the tasks that came due since the previous call.
#[derive(Debug)]
pub struct Scheduler<T> {
    queue: BinaryHeap<ScheduledTimer<T>>,
    live: HashSet<u64>,
    next_id: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            next_id: 0,
        }
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_after(&mut self, now: Instant, delay: Duration, task: T) -> TimerHandle {
        self.insert(now + delay, None, task)
    }

    /// First run is one full `period` after `now`.
    pub fn run_every(&mut self, now: Instant, period: Duration, task: T) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        self.insert(now + period, Some(period), task)
    }

    fn insert(&mut self, due: Instant, period: Option<Duration>, task: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;

        self.queue.push(ScheduledTimer {
            due,
            id,
            period,
            task,
        });
        self.live.insert(id);

        TimerHandle(id)
    }

    /// Returns `false` if the timer already fired (one-shot) or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle.0)
    }

    pub fn cancel_all(&mut self) {
        self.queue.clear();
        self.live.clear();
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle.0)
    }

    pub fn pending_count(&self) -> usize {
        self.live.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|timer| self.live.contains(&timer.id))
            .map(|timer| timer.due)
            .min()
    }

    pub fn poll(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();

        while self.queue.peek().is_some_and(|timer| timer.due <= now) {
            let Some(mut timer) = self.queue.pop() else {
                break;
            };

            if !self.live.contains(&timer.id) {
                continue;
            }

            fired.push(timer.task.clone());

            match timer.period {
                Some(period) => {
                    timer.due += period;
                    // A host that stalls gets one catch-up run, not a burst
                    if timer.due <= now {
                        timer.due = now + period;
                    }
                    self.queue.push(timer);
                }
                None => {
                    self.live.remove(&timer.id);
                }
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        let handle = scheduler.run_after(start, Duration::from_millis(100), TimerTask::FlushBatch);

        assert!(scheduler.poll(start + Duration::from_millis(99)).is_empty());
        assert_eq!(
            scheduler.poll(start + Duration::from_millis(100)),
            vec![TimerTask::FlushBatch]
        );
        assert!(scheduler.poll(start + Duration::from_secs(5)).is_empty());
        assert!(!scheduler.is_pending(handle));
    }

    #[test]
    fn test_periodic_reschedules() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.run_every(start, Duration::from_secs(2), TimerTask::Ping);

        assert!(scheduler.poll(start + Duration::from_secs(1)).is_empty());
        assert_eq!(scheduler.poll(start + Duration::from_secs(2)).len(), 1);
        assert!(scheduler.poll(start + Duration::from_secs(3)).is_empty());
        assert_eq!(scheduler.poll(start + Duration::from_secs(4)).len(), 1);
    }

    #[test]
    fn test_stalled_host_gets_single_catch_up() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.run_every(start, Duration::from_secs(1), TimerTask::Ping);

        assert_eq!(scheduler.poll(start + Duration::from_secs(10)).len(), 1);
        assert!(scheduler.poll(start + Duration::from_millis(10_500)).is_empty());
        assert_eq!(scheduler.poll(start + Duration::from_secs(11)).len(), 1);
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        let ping = scheduler.run_every(start, Duration::from_secs(1), TimerTask::Ping);
        scheduler.run_after(start, Duration::from_secs(1), TimerTask::Reconnect);

        assert!(scheduler.cancel(ping));
        assert!(!scheduler.cancel(ping));
        assert_eq!(
            scheduler.poll(start + Duration::from_secs(3)),
            vec![TimerTask::Reconnect]
        );
    }

    #[test]
    fn test_cancel_all() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.run_every(start, Duration::from_secs(1), TimerTask::Ping);
        scheduler.run_after(start, Duration::from_millis(100), TimerTask::FlushBatch);
        assert_eq!(scheduler.pending_count(), 2);

        scheduler.cancel_all();

        assert_eq!(scheduler.pending_count(), 0);
        assert!(scheduler.next_due().is_none());
        assert!(scheduler.poll(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_same_deadline_keeps_scheduling_order() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.run_after(start, Duration::from_millis(50), TimerTask::Reconnect);
        scheduler.run_after(start, Duration::from_millis(50), TimerTask::FlushBatch);

        assert_eq!(
            scheduler.poll(start + Duration::from_millis(50)),
            vec![TimerTask::Reconnect, TimerTask::FlushBatch]
        );
    }
}
