use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::controller::RecorderCore;

/// Element type of a channel sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    U16,
    I32,
    F64,
}

/// One channel's worth of samples for one burst.
#[derive(Debug, Clone)]
pub enum SampleBuf {
    U16(Array1<u16>),
    I32(Array1<i32>),
    F64(Array1<f64>),
}

impl SampleBuf {
    pub fn zeros(dtype: SampleType, num_samples: usize) -> Self {
        match dtype {
            SampleType::U16 => SampleBuf::U16(Array1::zeros(num_samples)),
            SampleType::I32 => SampleBuf::I32(Array1::zeros(num_samples)),
            SampleType::F64 => SampleBuf::F64(Array1::zeros(num_samples)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBuf::U16(a) => a.len(),
            SampleBuf::I32(a) => a.len(),
            SampleBuf::F64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_u16_mut(&mut self) -> Option<&mut Array1<u16>> {
        match self {
            SampleBuf::U16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut Array1<i32>> {
        match self {
            SampleBuf::I32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f64_mut(&mut self) -> Option<&mut Array1<f64>> {
        match self {
            SampleBuf::F64(a) => Some(a),
            _ => None,
        }
    }
}

/// One channel's data for one burst, with its delivery metadata.
#[derive(Debug, Clone)]
pub struct ChannelBurst {
    pub channel: usize,
    /// Caller-chosen identifier, normally the burst id.
    pub unique_id: i32,
    /// Relative timestamp in seconds, as defined by the adapter.
    pub timestamp: f64,
    /// Wall-clock time of the burst.
    pub wall_clock: SystemTime,
    /// Display sample rate of the arming that produced the burst, in Hz.
    pub sample_rate: f64,
    pub data: SampleBuf,
}

/// Callback run just before a burst is delivered, with the channels port
/// lock held. It may adjust the metadata; returning false inhibits the
/// delivery entirely. It must not call back into the controller.
pub type CompletionCallback<'a> = &'a mut dyn FnMut(&mut ChannelBurst) -> bool;

struct ChannelsInner {
    last_bursts: Vec<Option<Arc<ChannelBurst>>>,
    keep_last: Vec<bool>,
    callbacks_enabled: Vec<bool>,
    subscribers: Vec<Sender<Arc<ChannelBurst>>>,
}

/// Distribution point for per-channel burst data.
///
/// Subscribers get every delivered burst over a channel; in addition the
/// port can retain the most recent burst per channel for pull-style
/// consumers. The controller clears the retained slots at each arming.
///
/// Lock order: the controller's port lock may be held while calling into
/// this port, never the other way around.
pub struct ChannelsPort {
    inner: Mutex<ChannelsInner>,
}

impl ChannelsPort {
    pub(crate) fn new(num_channels: usize, keep_last: bool) -> Self {
        ChannelsPort {
            inner: Mutex::new(ChannelsInner {
                last_bursts: vec![None; num_channels],
                keep_last: vec![keep_last; num_channels],
                callbacks_enabled: vec![true; num_channels],
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.inner.lock().unwrap().last_bursts.len()
    }

    /// Receive every burst delivered on any channel.
    pub fn subscribe(&self) -> Receiver<Arc<ChannelBurst>> {
        let (tx, rx) = unbounded();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// The most recent burst retained for a channel, if any.
    pub fn last_burst(&self, channel: usize) -> Option<Arc<ChannelBurst>> {
        self.inner.lock().unwrap().last_bursts[channel].clone()
    }

    /// Enable or disable retention of the most recent burst per channel.
    pub fn set_keep_last(&self, channel: usize, keep: bool) {
        self.inner.lock().unwrap().keep_last[channel] = keep;
    }

    /// Enable or disable subscriber delivery for a channel.
    pub fn set_callbacks_enabled(&self, channel: usize, enabled: bool) {
        self.inner.lock().unwrap().callbacks_enabled[channel] = enabled;
    }

    /// Drop the retained bursts of every channel.
    pub(crate) fn reset_arrays(&self) {
        let mut inner = self.inner.lock().unwrap();
        for slot in &mut inner.last_bursts {
            *slot = None;
        }
    }

    pub(crate) fn submit_burst(
        &self,
        mut burst: ChannelBurst,
        completion: Option<CompletionCallback<'_>>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let channel = burst.channel;

        let deliver = match completion {
            Some(cb) => cb(&mut burst),
            None => true,
        };
        if !deliver {
            debug!("burst delivery inhibited on channel {}", channel);
            return;
        }

        let burst = Arc::new(burst);
        if inner.keep_last[channel] {
            inner.last_bursts[channel] = Some(Arc::clone(&burst));
        }
        let targets: Vec<Sender<Arc<ChannelBurst>>> = if inner.callbacks_enabled[channel] {
            inner.subscribers.clone()
        } else {
            Vec::new()
        };
        drop(inner);

        // Fan out with the lock released; slow consumers never stall the
        // acquisition thread since the channels are unbounded.
        for tx in targets {
            let _ = tx.send(Arc::clone(&burst));
        }
    }
}

/// Helper for submitting one channel's data of one burst.
///
/// Usage: [`allocate`](Self::allocate) a buffer, fill it through
/// [`data`](Self::data), then [`submit`](Self::submit). Submission is
/// discarded silently while the controller is not accepting data, so the
/// adapter does not need to handle disarm races itself.
#[derive(Default)]
pub struct ChannelDataSubmit {
    buf: Option<SampleBuf>,
}

impl ChannelDataSubmit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of `num_samples` elements. Any previously
    /// allocated, unsubmitted buffer is discarded.
    pub fn allocate(&mut self, dtype: SampleType, num_samples: usize) {
        self.buf = Some(SampleBuf::zeros(dtype, num_samples));
    }

    /// The allocated buffer, for the adapter to fill.
    pub fn data(&mut self) -> Option<&mut SampleBuf> {
        self.buf.as_mut()
    }

    /// Submit the buffer for channel `channel`. No-op when nothing is
    /// allocated; silently discards the data when disarming has already
    /// revoked data submission.
    pub fn submit(
        &mut self,
        core: &RecorderCore,
        channel: usize,
        unique_id: i32,
        timestamp: f64,
        wall_clock: SystemTime,
        completion: Option<CompletionCallback<'_>>,
    ) {
        let Some(data) = self.buf.take() else {
            return;
        };
        debug_assert!(channel < core.channels().num_channels());

        // Check the data gate and grab the display rate under the port
        // lock, then hand off to the channels port under its own lock.
        let Some(sample_rate) = core.data_gate() else {
            debug!("discarding burst data for channel {}: not accepting data", channel);
            return;
        };

        core.channels().submit_burst(
            ChannelBurst {
                channel,
                unique_id,
                timestamp,
                wall_clock,
                sample_rate,
                data,
            },
            completion,
        );
    }
}
