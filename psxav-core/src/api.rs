//! Public encoding pipelines and error surface
//!
//! Each pipeline pulls decoded data from an [`AvSource`], runs the appropriate encoders, and
//! writes finished bytes to an [`std::io::Write`] sink in file order. Errors are never
//! swallowed: source, I/O, and encoder failures all bubble out of the pipeline call.

use crate::adpcm::SAMPLES_PER_BLOCK;
use crate::mdec::{BsCodec, MdecEncoder};
use crate::mux::{FrameBudget, StrFormat, StrVideoStream};
use crate::source::AvSource;
use crate::spu::{self, LoopMode, SpuEncoder};
use crate::vag::{align_up, VagHeader, VAG_HEADER_SIZE};
use crate::xa::{XaEncoder, XaFormat, XaSettings};
use cd_sector::sector::submode;
use cd_sector::{Sector, SectorType, XaSubheader};
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError<E> {
    #[error("Error reading from input source: {0}")]
    Source(E),
    #[error("Error writing encoded output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Input has no audio stream, but audio is required")]
    NoAudio,
    #[error("Input has no video stream, but video is required")]
    NoVideo,
    #[error("Frame {frame_index} does not fit in its byte budget at any quantization scale")]
    FrameTooComplex { frame_index: u32 },
}

pub type EncodeResult<E> = Result<(), EncodeError<E>>;

/// Configuration for the SPU-ADPCM pipelines.
#[derive(Debug, Clone, Copy)]
pub struct SpuConfig {
    pub sample_rate: u32,
    pub channels: usize,
    /// Bytes of SPU data per channel per chunk (interleaved output only).
    pub interleave: usize,
    /// Output padding granularity.
    pub alignment: usize,
    /// `None` defers to the source's loop point metadata, falling back to an end flag.
    pub loop_override: Option<LoopMode>,
    /// Emit a silent block before the sample data to prime the SPU decoder state.
    pub leading_dummy: bool,
}

/// Whether the SPU pipelines wrap their data in a `.vag` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpuOutput {
    Raw,
    Vag,
}

/// Configuration for the STR muxing pipeline.
#[derive(Debug, Clone, Copy)]
pub struct StrConfig {
    pub format: StrFormat,
    pub codec: BsCodec,
    pub width: usize,
    pub height: usize,
    pub fps_num: u32,
    pub fps_den: u32,
    pub cd_speed: u32,
    pub video_id: u16,
    /// Place the audio sector after the video sectors of each interleave block instead of
    /// before them.
    pub trailing_audio: bool,
    /// Audio parameters; the sector format is derived from the STR format.
    pub xa: XaSettings,
}

/// Encode an XA or XACD audio stream: one pass over the source, one Form 2 sector per
/// `samples_per_sector` samples, EOF submode on the final sector.
///
/// # Errors
///
/// Propagates source and sink errors; fails with [`EncodeError::NoAudio`] if the source has no
/// audio stream.
pub fn encode_xa<S: AvSource, W: Write>(
    source: &mut S,
    sink: &mut W,
    settings: XaSettings,
) -> EncodeResult<S::Err> {
    if !source.has_audio() {
        return Err(EncodeError::NoAudio);
    }

    let channels = if settings.stereo { 2 } else { 1 };
    let samples_per_sector = settings.samples_per_sector();

    let mut encoder = XaEncoder::new(settings);
    let mut buffer = Vec::with_capacity(settings.sector_size());
    let mut lba = 0_u32;

    while source
        .ensure(samples_per_sector * channels, 0)
        .map_err(EncodeError::Source)?
    {
        let available = source.samples().len() / channels;
        let samples_length = available.min(samples_per_sector);
        if samples_length == 0 {
            // A trailing partial frame can never fill a whole sample slot
            break;
        }

        buffer.clear();
        let sectors =
            encoder.encode_sectors(&source.samples()[..samples_length * channels], lba, &mut buffer);
        source.retire(samples_length * channels, 0);

        if source.end_of_input() && source.samples().is_empty() {
            XaEncoder::finalize(&mut buffer);
        }

        sink.write_all(&buffer)?;
        lba += sectors as u32;
    }

    log::debug!("Encoded {lba} XA sectors");
    Ok(())
}

fn resolve_loop_mode<S: AvSource>(config: &SpuConfig, source: &S) -> LoopMode {
    if let Some(mode) = config.loop_override {
        return mode;
    }

    match source.loop_point_ms() {
        Some(ms) => {
            let sample = (u64::from(ms) * u64::from(config.sample_rate) / 1000) as u32;
            log::debug!("Using loop point from input metadata: {ms} ms (sample {sample})");
            LoopMode::Loop(sample)
        }
        None => LoopMode::End,
    }
}

/// Encode mono SPU-ADPCM data, raw or wrapped in a `.vag` header. The data is assembled in
/// memory because the header carries the total data length.
///
/// # Errors
///
/// Propagates source and sink errors; fails with [`EncodeError::NoAudio`] if the source has no
/// audio stream.
pub fn encode_spu<S: AvSource, W: Write>(
    source: &mut S,
    sink: &mut W,
    config: &SpuConfig,
    output: SpuOutput,
    name: &str,
) -> EncodeResult<S::Err> {
    if !source.has_audio() {
        return Err(EncodeError::NoAudio);
    }
    debug_assert_eq!(config.channels, 1);

    let loop_mode = resolve_loop_mode(config, source);

    let mut encoder = SpuEncoder::new();
    let mut data = Vec::new();
    if config.leading_dummy {
        data.extend_from_slice(&spu::DUMMY_BLOCK);
    }

    while source.ensure(SAMPLES_PER_BLOCK, 0).map_err(EncodeError::Source)? {
        let samples_length = source.samples().len().min(SAMPLES_PER_BLOCK);
        encoder.encode_blocks(&source.samples()[..samples_length], samples_length, 1, &mut data);
        source.retire(samples_length, 0);
    }

    spu::apply_loop_flags(&mut data, loop_mode, config.leading_dummy);

    // The header length field reflects the data before alignment padding
    let data_length = data.len();
    data.resize(align_up(data_length, config.alignment), 0);

    if output == SpuOutput::Vag {
        let header = VagHeader {
            interleaved: false,
            interleave: 0,
            bytes_per_channel: data_length as u32,
            sample_rate: config.sample_rate,
            loop_offset: None,
            channels: 1,
            name,
        };
        sink.write_all(&header.to_bytes())?;
    }

    sink.write_all(&data)?;
    Ok(())
}

/// Encode multi-channel SPU-ADPCM data as interleaved chunks, raw or with a `.vag` header
/// padded to the alignment. Loop points are recorded in the header; looping chunks get a repeat
/// flag on their final block.
///
/// # Errors
///
/// Propagates source and sink errors; fails with [`EncodeError::NoAudio`] if the source has no
/// audio stream.
pub fn encode_spu_interleaved<S: AvSource, W: Write>(
    source: &mut S,
    sink: &mut W,
    config: &SpuConfig,
    output: SpuOutput,
    name: &str,
) -> EncodeResult<S::Err> {
    if !source.has_audio() {
        return Err(EncodeError::NoAudio);
    }

    let channels = config.channels;
    let loop_mode = resolve_loop_mode(config, source);

    // Some tools only play interleaved files with chunk and header sizes padded alike
    let chunk_size = align_up(config.interleave, config.alignment);
    let header_size = align_up(VAG_HEADER_SIZE, config.alignment);
    let samples_per_chunk = config.interleave / spu::BLOCK_SIZE * SAMPLES_PER_BLOCK;

    let mut encoders: Vec<SpuEncoder> = (0..channels).map(|_| SpuEncoder::new()).collect();
    let mut body = Vec::new();
    let mut encoded = Vec::with_capacity(chunk_size);
    let mut chunk_count = 0_u32;

    while source
        .ensure(samples_per_chunk * channels, 0)
        .map_err(EncodeError::Source)?
    {
        let available = source.samples().len() / channels;
        let samples_length = available.min(samples_per_chunk);
        if samples_length == 0 {
            break;
        }
        let last_chunk = source.end_of_input() && available <= samples_per_chunk;

        for (ch, encoder) in encoders.iter_mut().enumerate() {
            encoded.clear();
            let written =
                encoder.encode_blocks(&source.samples()[ch..], samples_length, channels, &mut encoded);

            if written > 0 {
                let flag_offset = written - spu::BLOCK_SIZE + 1;
                match loop_mode {
                    LoopMode::Loop(_) => encoded[flag_offset] |= spu::flags::LOOP_REPEAT,
                    LoopMode::End if last_chunk => encoded[flag_offset] |= spu::flags::LOOP_END,
                    _ => {}
                }
            }

            encoded.resize(chunk_size, 0);
            body.extend_from_slice(&encoded);
        }

        source.retire(samples_length * channels, 0);
        chunk_count += 1;
    }

    if output == SpuOutput::Vag {
        let loop_offset = match loop_mode {
            LoopMode::Loop(sample) => {
                Some((sample as usize / SAMPLES_PER_BLOCK * spu::BLOCK_SIZE) as u32)
            }
            _ => None,
        };

        let header = VagHeader {
            interleaved: true,
            interleave: config.interleave as u32,
            bytes_per_channel: chunk_count * config.interleave as u32,
            sample_rate: config.sample_rate,
            loop_offset,
            channels: channels as u8,
            name,
        };

        let mut padded_header = vec![0_u8; header_size];
        padded_header[..VAG_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        sink.write_all(&padded_header)?;
    }

    sink.write_all(&body)?;
    Ok(())
}

fn init_video_sector(sector: &mut Sector, lba: u32, xa: &XaSettings) {
    sector.init(lba, SectorType::Mode2Form1);
    sector.set_subheader(XaSubheader {
        file: xa.file_number,
        channel: xa.channel_number,
        submode: submode::DATA | submode::REAL_TIME,
        coding: 0,
    });
}

/// Mux BS video (and optionally XA audio) into an STR sector stream.
///
/// Sector slots alternate on a fixed interleave derived from the audio format and CD speed;
/// audio takes the first slot of each block unless `trailing_audio` is set. If the audio track
/// runs dry mid-stream, its slots are converted to video for the remainder (this drifts the
/// interleave ratio, matching the historical behavior of these streams).
///
/// # Errors
///
/// Propagates source and sink errors; fails with [`EncodeError::NoVideo`] if the source has no
/// video stream, or [`EncodeError::FrameTooComplex`] if a frame cannot fit its sector budget.
pub fn encode_str<S: AvSource, W: Write>(
    source: &mut S,
    sink: &mut W,
    config: &StrConfig,
) -> EncodeResult<S::Err> {
    if !source.has_video() {
        return Err(EncodeError::NoVideo);
    }

    let mut xa_settings = config.xa;
    xa_settings.format =
        if config.format == StrFormat::StrCd { XaFormat::XaCd } else { XaFormat::Xa };

    let has_audio = source.has_audio() && config.format != StrFormat::StrV;

    let (interleave, audio_samples_per_sector) = if has_audio {
        (xa_settings.sector_interleave() * config.cd_speed, xa_settings.samples_per_sector())
    } else {
        (1, 0)
    };
    let mut video_sectors_per_block = if has_audio { interleave - 1 } else { 1 };

    if has_audio {
        log::info!(
            "Interleave: {}/{interleave} audio, {video_sectors_per_block}/{interleave} video",
            interleave - video_sectors_per_block
        );
    }

    let budget_base = 75 * config.cd_speed * video_sectors_per_block * config.fps_den;
    let budget_den = interleave * config.fps_num;
    let budget = FrameBudget::new(budget_base, budget_den);
    log::info!("Frame size: {:.2} sectors", budget.sectors_per_frame());

    // Lookahead so a sector's worth of frames is always buffered; one extra to avoid A/V desync
    let frames_needed =
        (((video_sectors_per_block * budget_den + budget_base - 1) / budget_base) as usize).max(2);

    let encoder = MdecEncoder::new(config.codec, config.width, config.height);
    let frame_size = encoder.frame_size();
    let mut video = StrVideoStream::new(encoder, budget, config.video_id);

    let channels = if xa_settings.stereo { 2 } else { 1 };
    let mut audio = XaEncoder::new(xa_settings);
    let mut audio_buffer = Vec::with_capacity(xa_settings.sector_size());

    let mut sector = Sector::new();
    let mut lba = 0_u32;

    loop {
        source
            .ensure(audio_samples_per_sector * channels, frames_needed)
            .map_err(EncodeError::Source)?;

        let frames_buffered = source.frames().len() / frame_size;
        if !video.has_staged_data() && frames_buffered == 0 {
            break;
        }

        let slot = lba % interleave;
        let audio_slot = if config.trailing_audio {
            slot >= video_sectors_per_block
        } else {
            slot < interleave - video_sectors_per_block
        };

        if has_audio && audio_slot {
            let available = source.samples().len() / channels;
            let samples_length = available.min(audio_samples_per_sector);

            if samples_length > 0 {
                audio_buffer.clear();
                audio.encode_sectors(
                    &source.samples()[..samples_length * channels],
                    lba,
                    &mut audio_buffer,
                );
                source.retire(samples_length * channels, 0);

                if source.end_of_input() && source.samples().is_empty() {
                    XaEncoder::finalize(&mut audio_buffer);
                }

                sink.write_all(&audio_buffer)?;
                lba += 1;
                continue;
            }

            // The audio track ended before the video track; hand its slots to video
            log::warn!("Audio ran dry at sector {lba}; converting audio slots to video");
            video_sectors_per_block = (video_sectors_per_block + 1).min(interleave);
        }

        init_video_sector(&mut sector, lba, &xa_settings);

        let frames_used = video
            .fill_sector(
                &source.frames()[..frames_buffered * frame_size],
                &mut sector.mode_2_data_mut()[..2048],
            )
            .map_err(|_| EncodeError::FrameTooComplex { frame_index: video.frame_index() })?;
        source.retire(0, frames_used);

        sector.compute_checksums(SectorType::Mode2Form1);

        let bytes: &[u8] = match config.format {
            StrFormat::StrCd => sector.as_bytes(),
            StrFormat::Str => sector.trailing(cd_sector::MODE_2_PAYLOAD_LEN),
            StrFormat::StrV => {
                &sector.as_bytes()[cd_sector::MODE_2_DATA_OFFSET..]
                    [..cd_sector::FORM_1_DATA_LEN]
            }
        };
        sink.write_all(bytes)?;
        lba += 1;
    }

    log::info!(
        "Encoded {} frames in {lba} sectors, average quant scale {:.2}",
        video.encoder().frames_encoded(),
        video.encoder().average_quant_scale()
    );
    Ok(())
}

/// Encode BS frames into fixed-size slots of `alignment` bytes each.
///
/// # Errors
///
/// Propagates source and sink errors; fails with [`EncodeError::NoVideo`] if the source has no
/// video stream, or [`EncodeError::FrameTooComplex`] if a frame exceeds the slot size.
pub fn encode_sbs<S: AvSource, W: Write>(
    source: &mut S,
    sink: &mut W,
    codec: BsCodec,
    width: usize,
    height: usize,
    alignment: usize,
) -> EncodeResult<S::Err> {
    if !source.has_video() {
        return Err(EncodeError::NoVideo);
    }

    let mut encoder = MdecEncoder::new(codec, width, height);
    let frame_size = encoder.frame_size();
    let padding = vec![0_u8; alignment];
    let mut frame_index = 0_u32;

    while source.ensure(0, 1).map_err(EncodeError::Source)? {
        frame_index += 1;
        encoder
            .encode_frame(&source.frames()[..frame_size], alignment)
            .map_err(|_| EncodeError::FrameTooComplex { frame_index })?;
        source.retire(0, 1);

        sink.write_all(encoder.frame_data())?;
        sink.write_all(&padding[..alignment - encoder.bytes_used()])?;
    }

    log::info!(
        "Encoded {frame_index} frames, average quant scale {:.2}",
        encoder.average_quant_scale()
    );
    Ok(())
}
