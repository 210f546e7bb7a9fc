//! Flat channel graph and per-stage layouts.
//!
//! ```text
//!            stage 1 (p = 2)                      stage 2 (p = 1)
//!  [0] ─fan-out─┬─[1]─worker─[3]─┬─fan-in─[5] ─fan-out──[6]─worker─[7]──fan-in─[8]
//!               └─[2]─worker─[4]─┘
//! ```
//!
//! Channel 0 is the external input. A stage of parallelism `p` starting at
//! `begin` owns `2p + 1` slots: `p` worker-input lanes, `p` worker-output
//! lanes and its output boundary. Its input boundary is the slot right
//! before `begin`, which is the previous stage's output boundary.

use crate::error::{PipelineError, PipelineResult};
use super::lane::{self, LaneReceiver, LaneSender};
use std::ops::Range;

/// Channel offsets of one stage, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLayout {
    begin: usize,
    parallelism: usize,
}

impl StageLayout {
    /// `begin` must be at least 1; slot 0 is the external input.
    pub(crate) fn new(begin: usize, parallelism: usize) -> Self {
        debug_assert!(begin >= 1);
        debug_assert!(parallelism >= 1);
        Self { begin, parallelism }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn input_boundary(&self) -> usize {
        self.begin - 1
    }

    pub fn worker_inputs(&self) -> Range<usize> {
        self.begin..self.begin + self.parallelism
    }

    pub fn worker_outputs(&self) -> Range<usize> {
        self.begin + self.parallelism..self.begin + 2 * self.parallelism
    }

    pub fn output_boundary(&self) -> usize {
        self.begin + 2 * self.parallelism
    }

    /// Number of graph slots this stage consumes.
    pub fn slots(&self) -> usize {
        2 * self.parallelism + 1
    }
}

/// Lanes of a single worker.
pub(crate) struct WorkerLanes<T> {
    pub input: LaneReceiver<T>,
    pub output: LaneSender<T>,
}

/// Every endpoint one stage needs, taken from the graph.
pub(crate) struct StageWiring<T> {
    pub input: LaneReceiver<T>,
    pub worker_inputs: Vec<LaneSender<T>>,
    pub workers: Vec<WorkerLanes<T>>,
    pub worker_outputs: Vec<LaneReceiver<T>>,
    pub output: LaneSender<T>,
}

/// Indexed lanes; each endpoint can be taken exactly once.
pub(crate) struct ChannelGraph<T> {
    senders: Vec<Option<LaneSender<T>>>,
    receivers: Vec<Option<LaneReceiver<T>>>,
}

impl<T> ChannelGraph<T> {
    /// `buffer` items may run ahead of each receiver; 0 makes every lane a rendezvous.
    pub fn new(num_channels: usize, buffer: usize) -> Self {
        let (senders, receivers) = (0..num_channels)
            .map(|_| {
                let (tx, rx) = lane::channel(buffer);
                (Some(tx), Some(rx))
            })
            .unzip();
        Self { senders, receivers }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn take_sender(&mut self, index: usize) -> PipelineResult<LaneSender<T>> {
        self.senders
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                PipelineError::Internal(format!("sender of channel {} unavailable", index))
            })
    }

    pub fn take_receiver(&mut self, index: usize) -> PipelineResult<LaneReceiver<T>> {
        self.receivers
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                PipelineError::Internal(format!("receiver of channel {} unavailable", index))
            })
    }

    /// Sender of the external input boundary.
    pub fn take_input(&mut self) -> PipelineResult<LaneSender<T>> {
        self.take_sender(0)
    }

    /// Receiver of the final output boundary.
    pub fn take_output(&mut self) -> PipelineResult<LaneReceiver<T>> {
        let last = self
            .len()
            .checked_sub(1)
            .ok_or_else(|| PipelineError::Internal("empty channel graph".into()))?;
        self.take_receiver(last)
    }

    pub fn wire(&mut self, layout: &StageLayout) -> PipelineResult<StageWiring<T>> {
        let input = self.take_receiver(layout.input_boundary())?;
        let mut worker_inputs = Vec::with_capacity(layout.parallelism());
        let mut workers = Vec::with_capacity(layout.parallelism());
        let mut worker_outputs = Vec::with_capacity(layout.parallelism());

        for (lane_in, lane_out) in layout.worker_inputs().zip(layout.worker_outputs()) {
            worker_inputs.push(self.take_sender(lane_in)?);
            workers.push(WorkerLanes {
                input: self.take_receiver(lane_in)?,
                output: self.take_sender(lane_out)?,
            });
            worker_outputs.push(self.take_receiver(lane_out)?);
        }

        let output = self.take_sender(layout.output_boundary())?;

        Ok(StageWiring {
            input,
            worker_inputs,
            workers,
            worker_outputs,
            output,
        })
    }

    #[cfg(test)]
    fn untaken(&self) -> (Vec<usize>, Vec<usize>) {
        let senders = (0..self.len())
            .filter(|&i| self.senders[i].is_some())
            .collect();
        let receivers = (0..self.len())
            .filter(|&i| self.receivers[i].is_some())
            .collect();
        (senders, receivers)
    }
}
