use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

use crate::codec::frame::FrameKind;
use crate::config::NodeConfig;
use crate::mesh::dutycycle::Priority;

/// How hard to try to deliver a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryLevel {
    /// Single attempt, no ack.
    BestEffort,
    /// Ack required, bounded retries.
    Confirmed,
    /// Ack required, extended retries, dead-letter on exhaustion.
    Guaranteed,
}

/// Exponential backoff with uniform jitter:
/// `initial · multiplier^attempt + U(0, jitter)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl BackoffPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            initial_ms: config.backoff_initial_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_ms: config.backoff_jitter_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = (self.initial_ms as f64 * self.multiplier.powi(attempt as i32)) as u64;
        let capped = base.min(self.max_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        capped + jitter
    }
}

/// An unacknowledged reliable send.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub message_id: u64,
    pub frame_bytes: Vec<u8>,
    pub kind: FrameKind,
    pub priority: Priority,
    pub level: DeliveryLevel,
    pub destination: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: u64,
    pub deadline: u64,
}

/// A send that exhausted its retries or deadline.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: u64,
    pub destination: Option<String>,
    pub attempts: u32,
    pub failed_at: u64,
}

/// What one retry sweep produced.
#[derive(Debug, Default)]
pub struct RetrySweep {
    /// Frames to hand back to the scheduler.
    pub retries: Vec<PendingSend>,
    /// Message ids moved to the dead-letter queue this sweep.
    pub failed: Vec<u64>,
}

/// Ack bookkeeping for confirmed and guaranteed sends.
pub struct ReliabilityTracker {
    policy: BackoffPolicy,
    ack_timeout_ms: u64,
    confirmed_attempts: u32,
    guaranteed_attempts: u32,
    pending: Mutex<HashMap<u64, PendingSend>>,
    dead_letter: Mutex<Vec<DeadLetter>>,
}

impl ReliabilityTracker {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            policy: BackoffPolicy::from_config(config),
            ack_timeout_ms: config.ack_timeout_ms,
            confirmed_attempts: config.max_retries,
            // Guaranteed keeps trying well past the confirmed budget.
            guaranteed_attempts: config.max_retries * 3 + 2,
            pending: Mutex::new(HashMap::new()),
            dead_letter: Mutex::new(Vec::new()),
        }
    }

    /// Register a sent message for ack tracking. Best-effort sends are
    /// not tracked.
    pub fn track(
        &self,
        message_id: u64,
        frame_bytes: Vec<u8>,
        kind: FrameKind,
        priority: Priority,
        level: DeliveryLevel,
        destination: Option<String>,
        now: u64,
    ) {
        if level == DeliveryLevel::BestEffort {
            return;
        }
        let max_attempts = match level {
            DeliveryLevel::Confirmed => self.confirmed_attempts,
            DeliveryLevel::Guaranteed => self.guaranteed_attempts,
            DeliveryLevel::BestEffort => unreachable!(),
        };
        let deadline = now
            + (max_attempts as u64 + 1) * (self.ack_timeout_ms + self.policy.max_ms)
            + self.ack_timeout_ms;
        self.pending.lock().insert(
            message_id,
            PendingSend {
                message_id,
                frame_bytes,
                kind,
                priority,
                level,
                destination,
                attempts: 0,
                max_attempts,
                next_retry_at: now + self.ack_timeout_ms,
                deadline,
            },
        );
    }

    /// Resolve a pending send. Duplicate acks are idempotent: the second
    /// and later return false and change nothing.
    pub fn handle_ack(&self, message_id: u64) -> bool {
        self.pending.lock().remove(&message_id).is_some()
    }

    /// Cancellation: the transmission may already be on the air, but its
    /// ack bookkeeping is dropped.
    pub fn cancel(&self, message_id: u64) -> bool {
        self.pending.lock().remove(&message_id).is_some()
    }

    /// Sweep due entries: emit retries with bumped backoff, move
    /// exhausted or expired entries to the dead-letter queue.
    pub fn sweep(&self, now: u64) -> RetrySweep {
        let mut outcome = RetrySweep::default();
        let mut pending = self.pending.lock();
        let due: Vec<u64> = pending
            .values()
            .filter(|p| p.next_retry_at <= now || p.deadline <= now)
            .map(|p| p.message_id)
            .collect();

        for id in due {
            let entry = pending.get_mut(&id).expect("id from this map");
            let exhausted = entry.attempts >= entry.max_attempts || entry.deadline <= now;
            if exhausted {
                let entry = pending.remove(&id).unwrap();
                self.dead_letter.lock().push(DeadLetter {
                    message_id: entry.message_id,
                    destination: entry.destination,
                    attempts: entry.attempts,
                    failed_at: now,
                });
                outcome.failed.push(id);
            } else {
                entry.attempts += 1;
                entry.next_retry_at =
                    now + self.ack_timeout_ms + self.policy.delay_for_attempt(entry.attempts - 1);
                outcome.retries.push(entry.clone());
            }
        }
        outcome
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, message_id: u64) -> bool {
        self.pending.lock().contains_key(&message_id)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letter.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReliabilityTracker {
        let config = NodeConfig {
            ack_timeout_ms: 1_000,
            max_retries: 2,
            backoff_initial_ms: 100,
            backoff_max_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_jitter_ms: 0,
            ..Default::default()
        };
        ReliabilityTracker::new(&config)
    }

    fn track_one(t: &ReliabilityTracker, id: u64, level: DeliveryLevel, now: u64) {
        t.track(
            id,
            vec![0u8; 16],
            FrameKind::Transaction,
            Priority::Normal,
            level,
            Some("lora1dest".into()),
            now,
        );
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy {
            initial_ms: 100,
            max_ms: 500,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for_attempt(0), 100);
        assert_eq!(policy.delay_for_attempt(1), 200);
        assert_eq!(policy.delay_for_attempt(2), 400);
        assert_eq!(policy.delay_for_attempt(3), 500); // capped
        assert_eq!(policy.delay_for_attempt(10), 500);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = BackoffPolicy {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 50,
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0);
            assert!((100..=150).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_best_effort_not_tracked() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::BestEffort, 0);
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_ack_resolves_idempotently() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Confirmed, 0);
        assert!(t.handle_ack(1));
        assert!(!t.handle_ack(1)); // duplicate ack: no effect
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Confirmed, 0);

        // First due at ack_timeout.
        let sweep = t.sweep(1_000);
        assert_eq!(sweep.retries.len(), 1);
        assert_eq!(sweep.retries[0].attempts, 1);
        assert!(sweep.failed.is_empty());

        let sweep = t.sweep(10_000);
        assert_eq!(sweep.retries.len(), 1);
        assert_eq!(sweep.retries[0].attempts, 2);

        // max_retries = 2: next due sweep exhausts.
        let sweep = t.sweep(20_000);
        assert!(sweep.retries.is_empty());
        assert_eq!(sweep.failed, vec![1]);
        assert_eq!(t.pending_count(), 0);
        let letters = t.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
    }

    #[test]
    fn test_guaranteed_outlasts_confirmed() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Confirmed, 0);
        track_one(&t, 2, DeliveryLevel::Guaranteed, 0);

        let mut now = 0;
        let mut confirmed_failed_at = None;
        for round in 0..20 {
            now += 10_000;
            let sweep = t.sweep(now);
            if sweep.failed.contains(&1) {
                confirmed_failed_at = Some(round);
            }
            if sweep.failed.contains(&2) {
                assert!(
                    confirmed_failed_at.map(|c| round > c).unwrap_or(false),
                    "guaranteed must outlast confirmed"
                );
                return;
            }
        }
        panic!("guaranteed send never exhausted");
    }

    #[test]
    fn test_deadline_fails_entry() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Confirmed, 0);
        // Far past any deadline.
        let sweep = t.sweep(10_000_000);
        assert_eq!(sweep.failed, vec![1]);
    }

    #[test]
    fn test_cancel_drops_bookkeeping() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Guaranteed, 0);
        assert!(t.cancel(1));
        assert!(!t.cancel(1));
        assert!(t.sweep(100_000).failed.is_empty());
    }

    #[test]
    fn test_not_due_not_swept() {
        let t = tracker();
        track_one(&t, 1, DeliveryLevel::Confirmed, 0);
        let sweep = t.sweep(500); // before ack_timeout
        assert!(sweep.retries.is_empty());
        assert!(sweep.failed.is_empty());
        assert!(t.is_pending(1));
    }
}
