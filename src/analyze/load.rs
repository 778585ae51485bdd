//! Attribution of sampled CPU load to frames.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use super::sample_cache::{CallchainFrame, SampleCache};
use super::PerfSample;

const VSYNC_ON_READABLE: &str = "VSyncCallBackListener::OnReadable";
const VSYNC_HANDLE_CALLBACKS: &str = "VSyncCallBackListener::HandleVsyncCallbacks";

/// Samples at or above this event count are real work even inside the
/// VSync callback path.
pub const VSYNC_NOISE_MAX_EVENTS: i64 = 2_000_000;

/// Samples grouped by thread and sorted by timestamp for range lookups.
#[derive(Debug, Default)]
pub struct SampleIndex {
    by_thread: HashMap<i64, Vec<PerfSample>>,
}

impl SampleIndex {
    pub fn new(samples: Vec<PerfSample>) -> Self {
        let mut by_thread: HashMap<i64, Vec<PerfSample>> = HashMap::new();
        for sample in samples {
            by_thread.entry(sample.thread_id).or_default().push(sample);
        }
        for samples in by_thread.values_mut() {
            samples.sort_by_key(|s| s.timestamp);
        }
        Self { by_thread }
    }

    pub fn is_empty(&self) -> bool {
        self.by_thread.is_empty()
    }

    /// Samples of `thread_id` with `start <= timestamp <= end`, oldest first.
    pub fn in_range(&self, thread_id: i64, start: i64, end: i64) -> &[PerfSample] {
        let Some(samples) = self.by_thread.get(&thread_id) else {
            return &[];
        };
        let lo = samples.partition_point(|s| s.timestamp < start);
        let hi = samples.partition_point(|s| s.timestamp <= end);
        if lo >= hi {
            return &[];
        }
        &samples[lo..hi]
    }
}

/// One symbolized sample attributed to a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleCallchain {
    pub timestamp: i64,
    pub event_count: i64,
    pub load_percentage: f64,
    pub callchain: Vec<CallchainFrame>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameLoad {
    pub frame_load: i64,
    /// Sorted by `event_count`, largest first.
    pub sample_callchains: Vec<SampleCallchain>,
}

/// True when `chain` shows the VSync listener waking up to dispatch
/// callbacks and the sample is too small to be real work.
pub fn is_vsync_callback_noise(chain: &[CallchainFrame], event_count: i64) -> bool {
    if event_count >= VSYNC_NOISE_MAX_EVENTS {
        return false;
    }
    chain.windows(2).any(|pair| {
        pair[0].symbol.contains(VSYNC_ON_READABLE)
            && pair[1].symbol.contains(VSYNC_HANDLE_CALLBACKS)
    })
}

/// Sum the samples of thread `tid` that fall inside `[start, end]`.
///
/// With `suppress_vsync_noise` set, samples matching
/// [`is_vsync_callback_noise`] are left out. Samples whose chain cannot be
/// resolved still count toward the load but are not listed. Returns `None`
/// when the thread has no samples in the range at all; a range whose samples
/// were all suppressed yields a zero load.
pub fn attribute_frame_load(
    index: &SampleIndex,
    cache: &SampleCache<'_>,
    tid: i64,
    start: i64,
    end: i64,
    suppress_vsync_noise: bool,
) -> Result<Option<FrameLoad>> {
    let samples = index.in_range(tid, start, end);
    if samples.is_empty() {
        return Ok(None);
    }

    let mut frame_load = 0i64;
    let mut resolved = Vec::new();
    for sample in samples {
        let chain = match sample.callchain_id {
            Some(id) => cache.resolve(id)?,
            None => None,
        };
        if suppress_vsync_noise {
            if let Some(chain) = &chain {
                if is_vsync_callback_noise(chain, sample.event_count) {
                    continue;
                }
            }
        }
        frame_load += sample.event_count;
        if let Some(chain) = chain {
            resolved.push((sample, chain));
        }
    }
    let mut sample_callchains: Vec<SampleCallchain> = resolved
        .into_iter()
        .map(|(sample, callchain)| SampleCallchain {
            timestamp: sample.timestamp,
            event_count: sample.event_count,
            load_percentage: if frame_load > 0 {
                sample.event_count as f64 / frame_load as f64 * 100.0
            } else {
                0.0
            },
            callchain,
        })
        .collect();
    // Stable, so equal counts keep timestamp order.
    sample_callchains.sort_by(|a, b| b.event_count.cmp(&a.event_count));

    Ok(Some(FrameLoad {
        frame_load,
        sample_callchains,
    }))
}
