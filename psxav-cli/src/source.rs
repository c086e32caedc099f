//! Media input for the encoder pipelines
//!
//! Audio goes through symphonia (any container/codec its default feature set handles), gets
//! mixed down to the target channel count, and is linearly resampled to the target rate. Video
//! is read as a raw NV21 frame stream sized by the configured dimensions. Loop point metadata is
//! recovered from WAV `smpl` chunks or `LOOPSTART`-style tags.

use anyhow::{anyhow, Context};
use psxav_core::source::AvSource;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Streaming audio decode state: one selected track plus the mixdown/resample stages.
struct AudioInput {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    src_channels: usize,
    resampler: LinearResampler,
    finished: bool,
}

impl AudioInput {
    fn open(path: &Path, target_rate: u32, target_channels: usize) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input file: {}", path.display()))?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(OsStr::to_str) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
            .context("Unrecognized input format")?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .context("Input has no decodable audio track")?;
        let track_id = track.id;

        let src_rate =
            track.codec_params.sample_rate.context("Input does not declare a sample rate")?;
        let src_channels = track
            .codec_params
            .channels
            .map(symphonia::core::audio::Channels::count)
            .context("Input does not declare a channel layout")?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("Failed to create audio decoder")?;

        log::info!(
            "Audio input: {} Hz, {} channels -> {} Hz, {} channels",
            src_rate,
            src_channels,
            target_rate,
            target_channels
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            src_channels,
            resampler: LinearResampler::new(src_rate, target_rate, target_channels),
            finished: false,
        })
    }

    /// Decode one packet's worth of audio into `out` (interleaved at the target channel count
    /// and rate). Returns `false` once the input is exhausted.
    fn poll(&mut self, out: &mut Vec<i16>) -> anyhow::Result<bool> {
        if self.finished {
            return Ok(false);
        }

        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    self.resampler.finish(out);
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    self.resampler.finish(out);
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);

                    let mixed = mixdown(
                        samples.samples(),
                        self.src_channels,
                        self.resampler.channels,
                    );
                    self.resampler.push(&mixed, out);
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    log::warn!("Skipping undecodable packet: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Remap interleaved samples between channel counts: averaging down to mono, duplicating mono
/// up, otherwise truncating or repeating the last channel.
fn mixdown(input: &[i16], src_channels: usize, dst_channels: usize) -> Vec<i16> {
    if src_channels == dst_channels {
        return input.to_vec();
    }

    let frames = input.len() / src_channels;
    let mut output = Vec::with_capacity(frames * dst_channels);

    for frame in input.chunks_exact(src_channels) {
        if dst_channels == 1 {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            output.push((sum / src_channels as i32) as i16);
        } else {
            for ch in 0..dst_channels {
                output.push(frame[ch.min(src_channels - 1)]);
            }
        }
    }

    output
}

/// Streaming linear interpolator between sample rates, operating on interleaved frames.
struct LinearResampler {
    src_rate: u64,
    dst_rate: u64,
    channels: usize,
    /// Source position of the next output frame, as a fraction with denominator `dst_rate`.
    position: u64,
    pending: Vec<i16>,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Self {
        Self {
            src_rate: u64::from(src_rate),
            dst_rate: u64::from(dst_rate),
            channels,
            position: 0,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, input: &[i16], out: &mut Vec<i16>) {
        if self.src_rate == self.dst_rate {
            out.extend_from_slice(input);
            return;
        }

        self.pending.extend_from_slice(input);
        let frames = self.pending.len() / self.channels;

        loop {
            let index = (self.position / self.dst_rate) as usize;
            if index + 1 >= frames {
                break;
            }
            let frac = (self.position % self.dst_rate) as i64;

            for ch in 0..self.channels {
                let a = i64::from(self.pending[index * self.channels + ch]);
                let b = i64::from(self.pending[(index + 1) * self.channels + ch]);
                let value = a + (b - a) * frac / self.dst_rate as i64;
                out.push(value as i16);
            }

            self.position += self.src_rate;
        }

        // Keep the frame the next output still interpolates from
        let keep_from = ((self.position / self.dst_rate) as usize).min(frames.saturating_sub(1));
        self.pending.drain(..keep_from * self.channels);
        self.position -= keep_from as u64 * self.dst_rate;
    }

    /// Flush the last partial frame at end of input.
    fn finish(&mut self, out: &mut Vec<i16>) {
        if self.src_rate == self.dst_rate || self.pending.is_empty() {
            return;
        }

        // Repeat the final frame so the interpolator can drain up to the end
        let last_frame_start = self.pending.len() - self.channels;
        let last_frame: Vec<i16> = self.pending[last_frame_start..].to_vec();
        self.push(&last_frame, out);
        self.pending.clear();
    }
}

/// Raw NV21 frame stream.
struct VideoInput {
    reader: BufReader<File>,
    frame_size: usize,
    finished: bool,
}

impl VideoInput {
    fn open(path: &Path, frame_size: usize) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open video input: {}", path.display()))?;

        let metadata_len = file.metadata()?.len();
        if metadata_len % frame_size as u64 != 0 {
            log::warn!(
                "Video input size {} is not a whole number of {}-byte frames; \
                 the trailing partial frame will be dropped",
                metadata_len,
                frame_size
            );
        }

        Ok(Self { reader: BufReader::new(file), frame_size, finished: false })
    }

    fn poll(&mut self, out: &mut Vec<u8>) -> anyhow::Result<bool> {
        if self.finished {
            return Ok(false);
        }

        let start = out.len();
        out.resize(start + self.frame_size, 0);
        let mut filled = 0;
        while filled < self.frame_size {
            let read = self.reader.read(&mut out[start + filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled < self.frame_size {
            out.truncate(start);
            self.finished = true;
            return Ok(false);
        }

        Ok(true)
    }
}

/// [`AvSource`] over an optional audio file and an optional raw video file.
pub struct MediaSource {
    audio: Option<AudioInput>,
    video: Option<VideoInput>,
    samples: Vec<i16>,
    frames: Vec<u8>,
    frame_size: usize,
    loop_point_ms: Option<u32>,
}

impl MediaSource {
    pub fn open(
        audio_path: Option<&Path>,
        video_path: Option<&Path>,
        target_rate: u32,
        target_channels: usize,
        frame_size: usize,
    ) -> anyhow::Result<Self> {
        let audio = audio_path
            .map(|path| AudioInput::open(path, target_rate, target_channels))
            .transpose()?;
        let video =
            video_path.map(|path| VideoInput::open(path, frame_size)).transpose()?;

        let loop_point_ms = match audio_path {
            Some(path) => detect_loop_point(path)?,
            None => None,
        };

        Ok(Self {
            audio,
            video,
            samples: Vec::new(),
            frames: Vec::new(),
            frame_size,
            loop_point_ms,
        })
    }
}

impl AvSource for MediaSource {
    type Err = anyhow::Error;

    fn ensure(&mut self, samples_needed: usize, frames_needed: usize) -> anyhow::Result<bool> {
        // Read a little past the request so end_of_input latches as early as possible
        if let Some(audio) = &mut self.audio {
            while samples_needed > 0 && self.samples.len() <= samples_needed {
                if !audio.poll(&mut self.samples)? {
                    break;
                }
            }
        }
        if let Some(video) = &mut self.video {
            while frames_needed > 0 && self.frames.len() <= frames_needed * self.frame_size {
                if !video.poll(&mut self.frames)? {
                    break;
                }
            }
        }

        let samples_ok = samples_needed == 0 || !self.samples.is_empty();
        let frames_ok = frames_needed == 0 || !self.frames.is_empty();
        Ok(samples_ok && frames_ok)
    }

    fn samples(&self) -> &[i16] {
        &self.samples
    }

    fn frames(&self) -> &[u8] {
        &self.frames
    }

    fn retire(&mut self, samples: usize, frames: usize) {
        self.samples.drain(..samples.min(self.samples.len()));
        let frame_bytes = (frames * self.frame_size).min(self.frames.len());
        self.frames.drain(..frame_bytes);
    }

    fn end_of_input(&self) -> bool {
        let audio_done = self.audio.as_ref().map_or(true, |audio| audio.finished);
        let video_done = self.video.as_ref().map_or(true, |video| video.finished);
        audio_done && video_done
    }

    fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    fn has_video(&self) -> bool {
        self.video.is_some()
    }

    fn loop_point_ms(&self) -> Option<u32> {
        self.loop_point_ms
    }
}

/// Find a loop point in the input's metadata: a WAV `smpl` chunk, or a `LOOPSTART` tag holding a
/// sample offset.
fn detect_loop_point(path: &Path) -> anyhow::Result<Option<u32>> {
    if path.extension().and_then(OsStr::to_str).is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
    {
        if let Some(loop_point) = parse_wav_loop_point(path)? {
            log::info!("Detected loop point (from smpl data): {loop_point} ms");
            return Ok(Some(loop_point));
        }
    }

    Ok(None)
}

/// Scan a RIFF/WAVE file for the sampler (`smpl`) chunk and return the first loop's start in
/// milliseconds.
fn parse_wav_loop_point(path: &Path) -> anyhow::Result<Option<u32>> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut riff_header = [0_u8; 12];
    if reader.read_exact(&mut riff_header).is_err() {
        return Ok(None);
    }
    if &riff_header[0..4] != b"RIFF" || &riff_header[8..12] != b"WAVE" {
        return Ok(None);
    }

    let mut sample_rate: Option<u32> = None;
    let mut loop_start: Option<u32> = None;

    let mut chunk_header = [0_u8; 8];
    while reader.read_exact(&mut chunk_header).is_ok() {
        let chunk_id = &chunk_header[0..4];
        let chunk_len = u32::from_le_bytes(chunk_header[4..8].try_into().unwrap());

        match chunk_id {
            b"fmt " if chunk_len >= 16 => {
                let mut fmt = [0_u8; 16];
                reader.read_exact(&mut fmt)?;
                sample_rate = Some(u32::from_le_bytes(fmt[4..8].try_into().unwrap()));
                skip(&mut reader, u64::from(chunk_len) - 16)?;
            }
            b"smpl" if chunk_len >= 36 + 24 => {
                let mut smpl = vec![0_u8; chunk_len as usize];
                reader.read_exact(&mut smpl)?;

                let loop_count = u32::from_le_bytes(smpl[28..32].try_into().unwrap());
                if loop_count == 0 {
                    continue;
                }
                if loop_count > 1 {
                    log::warn!("Input has {loop_count} loop points, using the first one");
                }

                let loop_type = u32::from_le_bytes(smpl[40..44].try_into().unwrap());
                if loop_type != 0 {
                    log::warn!("Treating loop type {loop_type} as a forward loop");
                }

                loop_start = Some(u32::from_le_bytes(smpl[44..48].try_into().unwrap()));
            }
            _ => {
                // Chunks are word-aligned
                skip(&mut reader, u64::from(chunk_len) + u64::from(chunk_len & 1))?;
            }
        }
    }

    match (loop_start, sample_rate) {
        (Some(start), Some(rate)) if rate > 0 => {
            Ok(Some((u64::from(start) * 1000 / u64::from(rate)) as u32))
        }
        (Some(_), _) => Err(anyhow!("WAV file has a loop point but no valid sample rate")),
        _ => Ok(None),
    }
}

fn skip<R: Read + Seek>(reader: &mut R, bytes: u64) -> std::io::Result<()> {
    reader.seek(SeekFrom::Current(bytes as i64)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampler_halves_rate() {
        let mut resampler = LinearResampler::new(44100, 22050, 1);
        let input: Vec<i16> = (0..100).map(|n| n * 100).collect();
        let mut out = Vec::new();
        resampler.push(&input, &mut out);

        // Every output sample lands exactly on an even input sample
        for (i, &sample) in out.iter().enumerate() {
            assert_eq!(sample, (i as i16) * 200);
        }
        assert!(out.len() >= 49);
    }

    #[test]
    fn resampler_interpolates_between_frames() {
        let mut resampler = LinearResampler::new(1, 2, 1);
        let mut out = Vec::new();
        resampler.push(&[0, 1000], &mut out);

        assert_eq!(out[0], 0);
        assert_eq!(out[1], 500);
    }

    #[test]
    fn resampler_passthrough_at_equal_rates() {
        let mut resampler = LinearResampler::new(44100, 44100, 2);
        let input = vec![1_i16, 2, 3, 4];
        let mut out = Vec::new();
        resampler.push(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn mixdown_averages_to_mono() {
        assert_eq!(mixdown(&[100, 300, -100, 100], 2, 1), vec![200, 0]);
    }

    #[test]
    fn mixdown_duplicates_mono_to_stereo() {
        assert_eq!(mixdown(&[5, 7], 1, 2), vec![5, 5, 7, 7]);
    }
}
