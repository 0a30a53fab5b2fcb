use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::net::{ClientMessage, ClientMessageKind};
use crate::scheduler::{Scheduler, TimerHandle, TimerTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub flush_delay: Duration,
    /// A pending payload waits at most `flush_delay * max_wait_factor`.
    pub max_wait_factor: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(100),
            max_wait_factor: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct OutboundBatch {
    pending: BTreeMap<ClientMessageKind, ClientMessage>,
    first_pending_at: Option<Instant>,
}

impl OutboundBatch {
    fn insert(&mut self, message: ClientMessage, now: Instant) {
        self.pending.insert(message.kind(), message);
        self.first_pending_at.get_or_insert(now);
    }

    fn take(&mut self) -> Vec<ClientMessage> {
        self.first_pending_at = None;
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn get(&self, kind: ClientMessageKind) -> Option<&ClientMessage> {
        self.pending.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Now(ClientMessage),
    Queued,
}

#[derive(Debug)]
pub struct BatchingQueue {
    config: BatchConfig,
    flush_delay: Duration,
    batch: OutboundBatch,
    timer: Option<TimerHandle>,
}

impl BatchingQueue {
    pub fn new(config: BatchConfig) -> Self {
        let flush_delay = config.flush_delay;
        Self {
            config,
            flush_delay,
            batch: OutboundBatch::default(),
            timer: None,
        }
    }

    pub fn flush_delay(&self) -> Duration {
        self.flush_delay
    }

    pub fn set_flush_delay(&mut self, flush_delay: Duration) {
        self.flush_delay = flush_delay;
    }

    fn max_wait(&self) -> Duration {
        self.flush_delay * self.config.max_wait_factor.max(1)
    }

    pub fn enqueue(
        &mut self,
        message: ClientMessage,
        now: Instant,
        scheduler: &mut Scheduler<TimerTask>,
    ) -> Dispatch {
        if message.delivery().is_immediate() {
            return Dispatch::Now(message);
        }

        self.batch.insert(message, now);

        let first = self.batch.first_pending_at.unwrap_or(now);
        let deadline = (now + self.flush_delay).min(first + self.max_wait());

        if let Some(timer) = self.timer.take() {
            scheduler.cancel(timer);
        }
        self.timer = Some(scheduler.run_after(
            now,
            deadline.saturating_duration_since(now),
            TimerTask::FlushBatch,
        ));

        Dispatch::Queued
    }

    pub fn on_timer(&mut self) -> Vec<ClientMessage> {
        self.timer = None;
        self.batch.take()
    }

    pub fn flush(&mut self, scheduler: &mut Scheduler<TimerTask>) -> Vec<ClientMessage> {
        if let Some(timer) = self.timer.take() {
            scheduler.cancel(timer);
        }
        self.batch.take()
    }

    pub fn clear(&mut self, scheduler: &mut Scheduler<TimerTask>) {
        self.flush(scheduler);
        self.flush_delay = self.config.flush_delay;
    }

    pub fn batch(&self) -> &OutboundBatch {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(x: f32) -> ClientMessage {
        ClientMessage::PositionUpdate { x, y: 0.0 }
    }

    fn fire(
        queue: &mut BatchingQueue,
        scheduler: &mut Scheduler<TimerTask>,
        now: Instant,
    ) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        for task in scheduler.poll(now) {
            if task == TimerTask::FlushBatch {
                sent.extend(queue.on_timer());
            }
        }
        sent
    }

    #[test]
    fn test_latest_wins_within_window() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut queue = BatchingQueue::new(BatchConfig::default());

        for (i, x) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            let now = start + Duration::from_millis(10 * i as u64);
            assert_eq!(queue.enqueue(position(x), now, &mut scheduler), Dispatch::Queued);
        }
        assert_eq!(queue.len(), 1);

        // Debounce restarted at the last enqueue (t=20ms)
        assert!(fire(&mut queue, &mut scheduler, start + Duration::from_millis(110)).is_empty());
        assert_eq!(
            fire(&mut queue, &mut scheduler, start + Duration::from_millis(120)),
            vec![position(3.0)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_immediate_bypasses_window() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut queue = BatchingQueue::new(BatchConfig::default());

        queue.enqueue(position(1.0), now, &mut scheduler);
        let action = ClientMessage::PlaceAction { x: 4.0, y: 5.0 };

        assert_eq!(
            queue.enqueue(action.clone(), now, &mut scheduler),
            Dispatch::Now(action)
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_max_wait_prevents_starvation() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut queue = BatchingQueue::new(BatchConfig::default());

        let mut flushed_at = None;
        for step in 0..40u64 {
            let now = start + Duration::from_millis(step * 20);
            if !fire(&mut queue, &mut scheduler, now).is_empty() {
                flushed_at = Some(step * 20);
                break;
            }
            queue.enqueue(position(step as f32), now, &mut scheduler);
        }

        assert_eq!(flushed_at, Some(300));
    }

    #[test]
    fn test_explicit_flush_cancels_timer() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut queue = BatchingQueue::new(BatchConfig::default());

        queue.enqueue(position(1.0), now, &mut scheduler);
        queue.enqueue(position(2.0), now, &mut scheduler);

        assert_eq!(queue.flush(&mut scheduler), vec![position(2.0)]);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(fire(&mut queue, &mut scheduler, now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_shorter_delay_applies_to_next_enqueue() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut queue = BatchingQueue::new(BatchConfig::default());

        queue.set_flush_delay(Duration::from_millis(50));
        queue.enqueue(position(1.0), start, &mut scheduler);

        assert_eq!(
            fire(&mut queue, &mut scheduler, start + Duration::from_millis(50)),
            vec![position(1.0)]
        );
    }
}
