use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Counters for one demux → decoder → sink leg, updated by the owning stages.
#[derive(Debug, Default)]
pub struct LegStats {
    pub packets_routed: AtomicU64,
    pub packets_reformat_dropped: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub transient_errors: AtomicU64,
    pub frames_presented: AtomicU64,
    pub frames_queue_dropped: AtomicU64,
    pub frames_late_dropped: AtomicU64,
}

impl LegStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LegSnapshot {
        LegSnapshot {
            packets_routed: self.packets_routed.load(Ordering::Relaxed),
            packets_reformat_dropped: self.packets_reformat_dropped.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_queue_dropped: self.frames_queue_dropped.load(Ordering::Relaxed),
            frames_late_dropped: self.frames_late_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegSnapshot {
    pub packets_routed: u64,
    pub packets_reformat_dropped: u64,
    pub frames_decoded: u64,
    pub transient_errors: u64,
    pub frames_presented: u64,
    pub frames_queue_dropped: u64,
    pub frames_late_dropped: u64,
}

/// Leg counters keyed by stream index.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    legs: Mutex<BTreeMap<u32, Arc<LegStats>>>,
}

impl StatsRegistry {
    pub fn leg(&self, stream_index: u32) -> Arc<LegStats> {
        self.legs.lock().entry(stream_index).or_default().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<u32, LegSnapshot> {
        self.legs
            .lock()
            .iter()
            .map(|(&index, stats)| (index, stats.snapshot()))
            .collect()
    }

    pub fn clear(&self) {
        self.legs.lock().clear();
    }
}
