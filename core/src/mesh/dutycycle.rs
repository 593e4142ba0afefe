use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::frame::FrameKind;
use crate::error::{CoreError, Result};
use crate::mesh::radio::{airtime_ms, LoraParams, TransmissionPort};
use crate::mesh::regions::{sub_band_for, RegionConstraint};

/// Transmission priority, most urgent first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Emergency,
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Emergency => 0,
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// One completed transmission, persisted on a rolling window to compute
/// duty-cycle occupancy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransmissionRecord {
    pub timestamp: u64,
    pub duration_ms: u64,
    pub frequency_mhz: f64,
    pub power_dbm: i8,
    pub priority: Priority,
    pub message_type: String,
    pub message_size: usize,
}

/// A frame waiting for airtime.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message_id: u64,
    pub kind: FrameKind,
    pub priority: Priority,
    pub frame_bytes: Vec<u8>,
    pub enqueued_at: u64,
    pub ttl_ms: u64,
}

impl QueuedMessage {
    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.enqueued_at) > self.ttl_ms
    }
}

/// Priority-ordered outgoing queue.
///
/// Ordering key is (priority rank, enqueue sequence): strictly higher
/// priority first, FIFO within a level. Overflow evicts from the tail —
/// the lowest-priority, newest entries.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: BTreeMap<(u8, u64), QueuedMessage>,
    capacity: usize,
    seq: u64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            seq: 0,
        }
    }

    /// Enqueue; returns the entries evicted to stay within capacity.
    pub fn push(&mut self, message: QueuedMessage) -> Vec<QueuedMessage> {
        let key = (message.priority.rank(), self.seq);
        self.seq += 1;
        self.entries.insert(key, message);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some((&key, _)) = self.entries.iter().next_back() {
                if let Some(dropped) = self.entries.remove(&key) {
                    evicted.push(dropped);
                }
            }
        }
        evicted
    }

    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.entries.values().next()
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key)
    }

    /// Cancel a queued message that has not been admitted yet.
    pub fn remove(&mut self, message_id: u64) -> Option<QueuedMessage> {
        let key = *self
            .entries
            .iter()
            .find(|(_, m)| m.message_id == message_id)
            .map(|(k, _)| k)?;
        self.entries.remove(&key)
    }

    /// Drop entries whose TTL elapsed; returns them for event emission.
    pub fn purge_expired(&mut self, now: u64) -> Vec<QueuedMessage> {
        let expired_keys: Vec<(u8, u64)> = self
            .entries
            .iter()
            .filter(|(_, m)| m.expired(now))
            .map(|(k, _)| *k)
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Duty-cycle accounting against a regional constraint.
pub struct DutyCycleManager {
    constraint: RegionConstraint,
    /// Sliding compliance window (1 h for duty-cycle regions).
    window_ms: u64,
    /// Retention horizon for records (configured tracking window).
    retention_ms: u64,
    emergency_override: bool,
    records: Mutex<VecDeque<TransmissionRecord>>,
}

impl DutyCycleManager {
    pub fn new(constraint: RegionConstraint, retention_ms: u64, emergency_override: bool) -> Self {
        let window_ms = match &constraint {
            RegionConstraint::DutyCycle { window_ms, .. } => *window_ms,
            _ => 60 * 60 * 1_000,
        };
        Self {
            constraint,
            window_ms,
            retention_ms,
            emergency_override,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Reload the in-memory window after a restart.
    pub fn seed(&self, mut records: Vec<TransmissionRecord>) {
        records.sort_by_key(|r| r.timestamp);
        *self.records.lock() = records.into();
    }

    /// Occupancy inside the sliding window on the sub-band covering
    /// `frequency_mhz`.
    pub fn occupancy_ms(&self, frequency_mhz: f64, now: u64) -> u64 {
        let band = sub_band_for(&self.constraint, frequency_mhz);
        let cutoff = now.saturating_sub(self.window_ms);
        self.records
            .lock()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .filter(|r| match band {
                Some(b) => b.contains(r.frequency_mhz),
                None => true,
            })
            .map(|r| r.duration_ms)
            .sum()
    }

    /// May a frame with `airtime` be transmitted now?
    ///
    /// At the exact occupancy limit only a zero-airtime message is
    /// admitted. Emergency traffic bypasses the limit when the override
    /// is configured. Denials carry the computed wait until enough of
    /// the window ages out.
    pub fn check_admission(
        &self,
        airtime: u64,
        frequency_mhz: f64,
        priority: Priority,
        now: u64,
    ) -> Result<()> {
        if priority == Priority::Emergency && self.emergency_override {
            return Ok(());
        }

        match &self.constraint {
            RegionConstraint::Unlimited => Ok(()),
            RegionConstraint::DwellTime { max_dwell_ms } => {
                if airtime <= *max_dwell_ms {
                    Ok(())
                } else {
                    // Over the dwell cap: no amount of waiting helps;
                    // the frame must shrink.
                    Err(CoreError::DutyCycleDenied { wait_ms: u64::MAX })
                }
            }
            RegionConstraint::DutyCycle { .. } => {
                let band = sub_band_for(&self.constraint, frequency_mhz).ok_or_else(|| {
                    CoreError::Protocol(format!(
                        "frequency {} MHz outside every permitted sub-band",
                        frequency_mhz
                    ))
                })?;
                let limit_ms =
                    (self.window_ms as f64 * band.duty_cycle_percent / 100.0).floor() as u64;
                if airtime > limit_ms {
                    return Err(CoreError::DutyCycleDenied { wait_ms: u64::MAX });
                }
                let occupancy = self.occupancy_ms(frequency_mhz, now);
                if occupancy + airtime <= limit_ms {
                    return Ok(());
                }
                Err(CoreError::DutyCycleDenied {
                    wait_ms: self.wait_for_budget(occupancy + airtime - limit_ms, &band, now),
                })
            }
        }
    }

    /// How long until `needed_ms` of occupancy ages out of the window.
    fn wait_for_budget(
        &self,
        needed_ms: u64,
        band: &crate::mesh::regions::SubBand,
        now: u64,
    ) -> u64 {
        let cutoff = now.saturating_sub(self.window_ms);
        let mut reclaimed = 0u64;
        for record in self.records.lock().iter() {
            if record.timestamp < cutoff || !band.contains(record.frequency_mhz) {
                continue;
            }
            reclaimed += record.duration_ms;
            if reclaimed >= needed_ms {
                return (record.timestamp + self.window_ms).saturating_sub(now);
            }
        }
        self.window_ms
    }

    pub fn record_transmission(&self, record: TransmissionRecord) {
        let mut records = self.records.lock();
        let cutoff = record.timestamp.saturating_sub(self.retention_ms);
        records.push_back(record);
        while records.front().map(|r| r.timestamp < cutoff).unwrap_or(false) {
            records.pop_front();
        }
    }
}

/// What one scheduler tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    /// A frame went out; the record has been accounted.
    Transmitted {
        message: QueuedMessage,
        record: TransmissionRecord,
    },
    /// The head of the queue is inadmissible for `wait_ms`.
    Deferred { wait_ms: u64 },
    /// Entries dropped before admission (TTL or overflow).
    Dropped(Vec<QueuedMessage>),
}

/// The transmission scheduler: priority queue + duty-cycle admission +
/// the radio port, driven at a fixed cadence.
pub struct Scheduler {
    pub queue: Mutex<PriorityQueue>,
    pub duty: DutyCycleManager,
    params: LoraParams,
    frequency_mhz: f64,
    power_dbm: i8,
    next_message_id: AtomicU64,
}

impl Scheduler {
    pub fn new(
        duty: DutyCycleManager,
        params: LoraParams,
        frequency_mhz: f64,
        power_dbm: i8,
        capacity: usize,
    ) -> Self {
        Self {
            queue: Mutex::new(PriorityQueue::new(capacity)),
            duty,
            params,
            frequency_mhz,
            power_dbm,
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn estimate_airtime_ms(&self, frame_len: usize) -> u64 {
        airtime_ms(&self.params, frame_len).ceil() as u64
    }

    /// Enqueue a frame; returns entries evicted by overflow.
    pub fn enqueue(&self, message: QueuedMessage) -> Vec<QueuedMessage> {
        self.queue.lock().push(message)
    }

    pub fn cancel(&self, message_id: u64) -> bool {
        self.queue.lock().remove(message_id).is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// One admission cycle: purge expired entries, peek the most urgent
    /// message, check the duty-cycle budget, transmit, account.
    pub fn tick(&self, port: &dyn TransmissionPort, now: u64) -> TickOutcome {
        let mut queue = self.queue.lock();

        let expired = queue.purge_expired(now);
        if !expired.is_empty() {
            return TickOutcome::Dropped(expired);
        }

        let (airtime, priority) = match queue.peek() {
            Some(head) => (
                self.estimate_airtime_ms(head.frame_bytes.len()),
                head.priority,
            ),
            None => return TickOutcome::Idle,
        };

        match self
            .duty
            .check_admission(airtime, self.frequency_mhz, priority, now)
        {
            Ok(()) => {}
            Err(CoreError::DutyCycleDenied { wait_ms }) => {
                return TickOutcome::Deferred { wait_ms };
            }
            Err(_) => return TickOutcome::Deferred { wait_ms: u64::MAX },
        }

        let message = match queue.pop_front() {
            Some(message) => message,
            None => return TickOutcome::Idle,
        };
        drop(queue);

        let duration_ms = match port.transmit(
            &message.frame_bytes,
            self.frequency_mhz,
            &self.params,
            self.power_dbm,
        ) {
            Ok(d) => d,
            Err(_) => airtime, // port failure still consumed the attempt
        };

        let record = TransmissionRecord {
            timestamp: now,
            duration_ms,
            frequency_mhz: self.frequency_mhz,
            power_dbm: self.power_dbm,
            priority: message.priority,
            message_type: message.kind.name().to_string(),
            message_size: message.frame_bytes.len(),
        };
        self.duty.record_transmission(record.clone());

        TickOutcome::Transmitted { message, record }
    }
}
