//! Gapless playback scheduling for streamed response audio.
//!
//! Response chunks arrive one network message at a time, but must sound like
//! a single continuous stream.  [`Scheduler`] keeps a `next_start` cursor on
//! the output clock: each arriving chunk is scheduled at
//! `max(next_start, now)` and the cursor advances by the chunk's duration,
//! so consecutive chunks butt up sample-accurately with no gap and no
//! overlap.
//!
//! The scheduler is deliberately hardware-free: the output device calls
//! [`Scheduler::fill`] from its callback to pull mixed samples, and tests
//! drive `fill` directly to simulate the passage of output-clock time.
//! Share it as [`SharedScheduler`] between the device thread and the session
//! event loop; every entry point takes the lock for one short pass, so
//! chunks are never reordered.
//!
//! Interruption (the user starts speaking over the assistant) stops every
//! active source at once and resets the cursor so the next chunk plays
//! immediately instead of at a stale future offset.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::pcm::DecodedChunk;
use super::resample::{mix_to_mono, resample};

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// One scheduled playback source: a mono sample buffer pinned to an absolute
/// start position on the output clock.
#[derive(Debug)]
struct Source {
    id: u64,
    /// Absolute start position in output-clock samples.
    start: u64,
    /// Mono samples at the scheduler's output rate.
    samples: Vec<f32>,
}

impl Source {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Back-to-back playback scheduler with a single `next_start` cursor.
///
/// Invariants:
/// - the cursor is monotonically non-decreasing between [`stop_all`] calls,
/// - sources play in arrival order and never overlap,
/// - a source leaves the active set exactly once, either by playing to
///   completion inside [`fill`] or by [`stop_all`].
///
/// [`fill`]: Self::fill
/// [`stop_all`]: Self::stop_all
#[derive(Debug)]
pub struct Scheduler {
    /// Output clock rate in Hz.
    sample_rate: u32,
    /// Timeline position (seconds) where the next chunk must begin.
    next_start: f64,
    /// Output-clock samples consumed by `fill` so far.
    playhead: u64,
    /// Scheduled and playing sources, in start order.
    sources: VecDeque<Source>,
    next_id: u64,
    speaking: bool,
}

impl Scheduler {
    /// Create a scheduler driving an output clock at `sample_rate` Hz.
    ///
    /// # Panics
    ///
    /// Panics if `sample_rate == 0`.
    pub fn new(sample_rate: u32) -> Self {
        assert!(sample_rate > 0, "Scheduler sample rate must be > 0");
        Self {
            sample_rate,
            next_start: 0.0,
            playhead: 0,
            sources: VecDeque::new(),
            next_id: 0,
            speaking: false,
        }
    }

    /// Current output-clock time in seconds (samples consumed / rate).
    pub fn now(&self) -> f64 {
        self.playhead as f64 / self.sample_rate as f64
    }

    /// Output clock rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// `true` while at least one source is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Number of sources currently in the active set.
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    /// Schedule `chunk` for gapless playback and return its start time in
    /// seconds on the output clock.
    ///
    /// The chunk is downmixed to mono and resampled to the output rate if it
    /// was decoded at a different one.  Scheduling never reaches into the
    /// past: a chunk arriving after its slot would have begun plays from
    /// `now` instead.
    pub fn enqueue(&mut self, chunk: &DecodedChunk) -> f64 {
        let samples = self.conform(chunk);

        let start = self.next_start.max(self.now());
        let duration = samples.len() as f64 / self.sample_rate as f64;
        self.next_start = start + duration;

        let id = self.next_id;
        self.next_id += 1;
        self.sources.push_back(Source {
            id,
            start: (start * self.sample_rate as f64).round() as u64,
            samples,
        });
        self.speaking = true;

        log::trace!(
            "scheduled source {id}: start={start:.3}s dur={duration:.3}s active={}",
            self.sources.len()
        );
        start
    }

    /// Non-streaming playback entry point: stop whatever is playing, then
    /// schedule `chunk` immediately.
    ///
    /// The live stream and one-shot speech playback share this scheduler;
    /// whichever path starts last wins the output.
    pub fn play_now(&mut self, chunk: &DecodedChunk) -> f64 {
        self.stop_all();
        self.enqueue(chunk)
    }

    /// Interruption: drop every active source, reset the cursor to the
    /// immediate-playback baseline, and force the speaking flag off.
    ///
    /// Safe to call at any time, including when nothing is playing.
    pub fn stop_all(&mut self) {
        if !self.sources.is_empty() {
            log::debug!("stopping {} active playback source(s)", self.sources.len());
        }
        self.sources.clear();
        self.next_start = 0.0;
        self.speaking = false;
    }

    /// Pull the next `out.len()` mono samples of the mixed output timeline.
    ///
    /// Called from the output device callback.  Gaps between the playhead
    /// and the next scheduled source are zero-filled; sources that play to
    /// completion within this pass are retired from the active set.  When
    /// the set empties, the speaking flag drops.
    pub fn fill(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let window_start = self.playhead;
        let window_end = window_start + out.len() as u64;

        for source in &self.sources {
            if source.start >= window_end || source.end() <= window_start {
                continue;
            }
            // Overlap of [source.start, source.end) with the output window.
            let from = source.start.max(window_start);
            let to = source.end().min(window_end);
            let src_offset = (from - source.start) as usize;
            let dst_offset = (from - window_start) as usize;
            let len = (to - from) as usize;

            out[dst_offset..dst_offset + len]
                .copy_from_slice(&source.samples[src_offset..src_offset + len]);
        }

        self.playhead = window_end;

        // Retire sources the playhead has passed; each leaves exactly once.
        while let Some(front) = self.sources.front() {
            if front.end() <= self.playhead {
                let id = front.id;
                self.sources.pop_front();
                log::trace!("source {id} finished, {} remaining", self.sources.len());
            } else {
                break;
            }
        }

        if self.sources.is_empty() {
            self.speaking = false;
        }
    }

    /// Downmix and resample a decoded chunk to this scheduler's clock.
    fn conform(&self, chunk: &DecodedChunk) -> Vec<f32> {
        let mono = if chunk.channels.len() == 1 {
            chunk.channels[0].clone()
        } else {
            // Interleave back so mix_to_mono can average the channels.
            let frames = chunk.frames();
            let n = chunk.channels.len();
            let mut interleaved = Vec::with_capacity(frames * n);
            for i in 0..frames {
                for ch in &chunk.channels {
                    interleaved.push(ch[i]);
                }
            }
            mix_to_mono(&interleaved, n as u16)
        };
        resample(&mono, chunk.sample_rate, self.sample_rate)
    }
}

// ---------------------------------------------------------------------------
// SharedScheduler
// ---------------------------------------------------------------------------

/// Thread-safe scheduler handle shared by the session event loop (enqueue,
/// stop) and the output device thread (fill).
///
/// Lock for one short pass; never hold the lock across `.await` points.
pub type SharedScheduler = Arc<Mutex<Scheduler>>;

/// Construct a [`SharedScheduler`] at the given output rate.
pub fn new_shared_scheduler(sample_rate: u32) -> SharedScheduler {
    Arc::new(Mutex::new(Scheduler::new(sample_rate)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
