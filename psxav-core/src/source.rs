//! Pull-style source contract for the encoding pipelines
//!
//! The pipelines are synchronous consumers: they ask the source to buffer a minimum amount of
//! decoded data, read slices out of the buffers, and retire what they consumed. Decoding and
//! resampling to the target sample rate and frame size happen behind this trait.

pub trait AvSource {
    type Err;

    /// Buffer at least the requested amounts of decoded data, reading more input as required.
    /// Returns `true` as long as each requested kind of data has *something* buffered, even if
    /// less than the amount asked for (the tail of the stream); `false` only once the input is
    /// exhausted and the respective buffer is empty.
    ///
    /// # Errors
    ///
    /// Propagates any decode/read error from the underlying input.
    fn ensure(&mut self, samples_needed: usize, frames_needed: usize) -> Result<bool, Self::Err>;

    /// Buffered PCM samples, signed 16-bit, channel-interleaved.
    fn samples(&self) -> &[i16];

    /// Buffered video frames, NV21 planar, densely packed at `width * height * 3 / 2` bytes per
    /// frame.
    fn frames(&self) -> &[u8];

    /// Consume data from the front of the buffers.
    fn retire(&mut self, samples: usize, frames: usize);

    /// Latched to `true` once the underlying input has been fully read.
    fn end_of_input(&self) -> bool;

    fn has_audio(&self) -> bool;

    fn has_video(&self) -> bool;

    /// Loop point metadata from the container, in milliseconds from the start.
    fn loop_point_ms(&self) -> Option<u32> {
        None
    }
}

/// A source over fully in-memory data; the backbone of the test suite and of callers that
/// already hold decoded samples.
#[derive(Debug, Default)]
pub struct MemorySource {
    samples: Vec<i16>,
    frames: Vec<u8>,
    frame_size: usize,
    sample_pos: usize,
    frame_pos: usize,
    loop_point_ms: Option<u32>,
}

impl MemorySource {
    #[must_use]
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples, ..Self::default() }
    }

    /// `frame_size` is the byte length of one NV21 frame.
    #[must_use]
    pub fn from_frames(frames: Vec<u8>, frame_size: usize) -> Self {
        Self { frames, frame_size, ..Self::default() }
    }

    #[must_use]
    pub fn from_samples_and_frames(samples: Vec<i16>, frames: Vec<u8>, frame_size: usize) -> Self {
        Self { samples, frames, frame_size, ..Self::default() }
    }

    #[must_use]
    pub fn with_loop_point_ms(mut self, loop_point_ms: u32) -> Self {
        self.loop_point_ms = Some(loop_point_ms);
        self
    }
}

impl AvSource for MemorySource {
    type Err = std::convert::Infallible;

    fn ensure(&mut self, samples_needed: usize, frames_needed: usize) -> Result<bool, Self::Err> {
        let samples_ok = samples_needed == 0 || self.sample_pos < self.samples.len();
        let frames_ok = frames_needed == 0 || self.frame_pos * self.frame_size < self.frames.len();
        Ok(samples_ok && frames_ok)
    }

    fn samples(&self) -> &[i16] {
        &self.samples[self.sample_pos..]
    }

    fn frames(&self) -> &[u8] {
        &self.frames[self.frame_pos * self.frame_size..]
    }

    fn retire(&mut self, samples: usize, frames: usize) {
        self.sample_pos = (self.sample_pos + samples).min(self.samples.len());

        let frame_count = if self.frame_size == 0 { 0 } else { self.frames.len() / self.frame_size };
        self.frame_pos = (self.frame_pos + frames).min(frame_count);
    }

    fn end_of_input(&self) -> bool {
        true
    }

    fn has_audio(&self) -> bool {
        !self.samples.is_empty()
    }

    fn has_video(&self) -> bool {
        !self.frames.is_empty()
    }

    fn loop_point_ms(&self) -> Option<u32> {
        self.loop_point_ms
    }
}
