use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub index: usize,
    pub duration_ms: u128,
    pub panicked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub parallelism: usize,
    /// Items handed to a worker lane by the fan-out.
    pub items_distributed: u64,
    /// Items relayed to the output boundary by the fan-in.
    pub items_merged: u64,
    /// Items dropped by the fan-out because no worker lane was left.
    pub items_discarded: u64,
    /// Time from launch until the fan-in closed the output boundary.
    pub duration_ms: u128,
    pub workers: Vec<WorkerMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub run_id: String,
    pub items_fed: u64,
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Items that left the final stage.
    pub fn items_emitted(&self) -> u64 {
        self.stages.last().map_or(0, |stage| stage.items_merged)
    }

    pub fn worker_panics(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|stage| stage.workers.iter())
            .filter(|worker| worker.panicked)
            .count()
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkerRecorder {
    duration_ms: AtomicU64,
    panicked: AtomicBool,
}

impl WorkerRecorder {
    pub fn finish(&self, started: Instant, panicked: bool) {
        self.duration_ms
            .store(elapsed_ms(started), Ordering::Relaxed);
        self.panicked.store(panicked, Ordering::Relaxed);
    }
}

/// Lock-free counters updated by the tasks of one stage.
#[derive(Debug)]
pub(crate) struct StageRecorder {
    index: usize,
    name: String,
    started: Instant,
    items_distributed: AtomicU64,
    items_merged: AtomicU64,
    items_discarded: AtomicU64,
    duration_ms: AtomicU64,
    workers: Vec<WorkerRecorder>,
}

impl StageRecorder {
    pub fn new(index: usize, name: &str, parallelism: usize) -> Self {
        Self {
            index,
            name: name.to_string(),
            started: Instant::now(),
            items_distributed: AtomicU64::new(0),
            items_merged: AtomicU64::new(0),
            items_discarded: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            workers: (0..parallelism).map(|_| WorkerRecorder::default()).collect(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_distributed(&self) {
        self.items_distributed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_merged(&self) {
        self.items_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_discarded(&self) {
        self.items_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerRecorder> {
        self.workers.get(index)
    }

    pub fn mark_drained(&self) {
        self.duration_ms
            .store(elapsed_ms(self.started), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageMetrics {
        StageMetrics {
            index: self.index,
            name: self.name.clone(),
            parallelism: self.workers.len(),
            items_distributed: self.items_distributed.load(Ordering::Relaxed),
            items_merged: self.items_merged.load(Ordering::Relaxed),
            items_discarded: self.items_discarded.load(Ordering::Relaxed),
            duration_ms: self.duration_ms.load(Ordering::Relaxed) as u128,
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(index, worker)| WorkerMetrics {
                    index,
                    duration_ms: worker.duration_ms.load(Ordering::Relaxed) as u128,
                    panicked: worker.panicked.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let recorder = StageRecorder::new(2, "sum", 3);
        recorder.add_distributed();
        recorder.add_distributed();
        recorder.add_merged();
        recorder.add_discarded();
        recorder.worker(1).unwrap().finish(Instant::now(), true);
        assert!(recorder.worker(3).is_none());

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.index, 2);
        assert_eq!(snapshot.parallelism, 3);
        assert_eq!(snapshot.items_distributed, 2);
        assert_eq!(snapshot.items_merged, 1);
        assert_eq!(snapshot.items_discarded, 1);
        assert!(snapshot.workers[1].panicked);
        assert!(!snapshot.workers[0].panicked);
    }

    #[test]
    fn test_pipeline_lookup_helpers() {
        let split = StageRecorder::new(0, "split", 1);
        let sum = StageRecorder::new(1, "sum", 2);
        sum.add_merged();
        sum.worker(0).unwrap().finish(Instant::now(), true);

        let metrics = PipelineMetrics {
            run_id: "run".into(),
            items_fed: 1,
            total_duration_ms: 0,
            stages: vec![split.snapshot(), sum.snapshot()],
        };

        assert_eq!(metrics.stage("sum").unwrap().index, 1);
        assert!(metrics.stage("missing").is_none());
        assert_eq!(metrics.items_emitted(), 1);
        assert_eq!(metrics.worker_panics(), 1);
    }
}
