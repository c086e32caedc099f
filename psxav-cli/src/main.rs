mod source;

use crate::source::MediaSource;
use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use psxav_core::api::{
    encode_sbs, encode_spu, encode_spu_interleaved, encode_str, encode_xa, SpuConfig, SpuOutput,
    StrConfig,
};
use psxav_core::mdec::BsCodec;
use psxav_core::mux::StrFormat;
use psxav_core::spu::LoopMode;
use psxav_core::xa::{XaFormat, XaSettings, XA_FREQ_DOUBLE, XA_FREQ_SINGLE};
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// XA-ADPCM, 2336-byte sectors
    Xa,
    /// XA-ADPCM, 2352-byte sectors
    Xacd,
    /// Raw SPU-ADPCM mono data
    Spu,
    /// Raw SPU-ADPCM interleaved data
    Spui,
    /// .vag SPU-ADPCM mono
    Vag,
    /// .vag SPU-ADPCM interleaved
    Vagi,
    /// .str video + XA audio, 2336-byte sectors
    Str,
    /// .str video + XA audio, 2352-byte sectors
    Strcd,
    /// .str video + SPU audio (not currently supported)
    Strspu,
    /// .str video only, 2048-byte sectors
    Strv,
    /// .sbs video, fixed-size frames
    Sbs,
}

impl Format {
    fn uses_xa_audio(self) -> bool {
        matches!(self, Self::Xa | Self::Xacd | Self::Str | Self::Strcd)
    }

    fn uses_spu_audio(self) -> bool {
        matches!(self, Self::Spu | Self::Spui | Self::Vag | Self::Vagi)
    }

    fn uses_video(self) -> bool {
        matches!(self, Self::Str | Self::Strcd | Self::Strv | Self::Sbs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Codec {
    /// MDEC BS v2
    V2,
    /// MDEC BS v3
    V3,
    /// MDEC BS v3, expect the decoder to wrap DC coefficients
    V3dc,
}

impl From<Codec> for BsCodec {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::V2 => Self::V2,
            Codec::V3 => Self::V3,
            Codec::V3dc => Self::V3Dc,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "psxav",
    about = "Encodes audio and video into the PlayStation 1's native formats",
    after_help = "Audio input may be any format symphonia can decode; it is mixed down and \
                  resampled to the target rate. Video input is a raw NV21 frame stream matching \
                  the -s dimensions (e.g. produced with ffmpeg -pix_fmt nv21)."
)]
struct Args {
    /// Output type
    #[arg(short = 't', long = "type", value_enum)]
    format: Format,

    /// Suppress all non-error messages
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Audio sample rate (xa/str: 18900 or 37800, default 37800; spu/vag: default 44100)
    #[arg(short = 'f', long)]
    frequency: Option<u32>,

    /// Audio channel count (xa/str: 1 or 2, default 2; spu/vag: must be 1; spui/vagi: default 2)
    #[arg(short = 'c', long)]
    channels: Option<usize>,

    /// Audio bit depth (xa/str: 4 or 8, default 4; SPU formats: must be 4)
    #[arg(short = 'b', long)]
    bit_depth: Option<u32>,

    /// CD-XA file number (applies to both audio and video sectors)
    #[arg(short = 'F', long, default_value_t = 0)]
    xa_file: u8,

    /// CD-XA channel number (0-31)
    #[arg(short = 'C', long, default_value_t = 0)]
    xa_channel: u8,

    /// Channel interleave size for spui/vagi, any multiple of 16 (default 2048)
    #[arg(short = 'i', long)]
    interleave: Option<usize>,

    /// Padding granularity (spu/vag: default 64; spui/vagi: default 2048), or sbs frame size
    /// (default 8192)
    #[arg(short = 'a', long)]
    alignment: Option<usize>,

    /// Loop point override in milliseconds from the start of the sample
    #[arg(short = 'l', long)]
    loop_point: Option<u32>,

    /// Never loop, even if the input carries loop metadata
    #[arg(short = 'n', long)]
    no_loop: bool,

    /// Add a loop marker at the end of the sample data (or of each chunk for spui/vagi)
    #[arg(short = 'L', long = "loop")]
    enable_loop: bool,

    /// Do not emit the leading dummy block that primes the SPU decoder state
    #[arg(short = 'D', long)]
    no_leading_dummy: bool,

    /// BS codec for video formats
    #[arg(short = 'v', long, value_enum, default_value = "v2")]
    video_codec: Codec,

    /// Video size as WxH, 16x16 to 640x512 in 16-pixel increments
    #[arg(short = 's', long, default_value = "320x240")]
    size: String,

    /// Force stretching to the given size without preserving aspect ratio
    #[arg(short = 'I', long)]
    ignore_aspect: bool,

    /// Video frame rate as an integer or num/den fraction, 1-60 (default 15)
    #[arg(short = 'r', long, default_value = "15")]
    frame_rate: String,

    /// CD-ROM speed the stream is meant to be played at (1 or 2)
    #[arg(short = 'x', long, default_value_t = 2)]
    cd_speed: u32,

    /// Tag video sectors with this .str chunk type ID
    #[arg(short = 'T', long, default_value_t = 0x8001)]
    video_id: u16,

    /// Tag SPU-ADPCM sectors with this .str chunk type ID
    #[arg(short = 'A', long, default_value_t = 0x0001)]
    audio_id: u16,

    /// Place the audio sector after the video sectors of each interleave block
    #[arg(short = 'X', long)]
    trailing_audio: bool,

    /// Audio file to mux into a str/strcd stream (the positional input is the video stream)
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Input file
    input: PathBuf,

    /// Output file
    output: PathBuf,
}

/// Fully validated configuration with format-dependent defaults applied.
struct Settings {
    format: Format,
    frequency: u32,
    channels: usize,
    bit_depth: u32,
    interleave: usize,
    alignment: usize,
    loop_override: Option<LoopMode>,
    leading_dummy: bool,
    codec: BsCodec,
    width: usize,
    height: usize,
    fps_num: u32,
    fps_den: u32,
}

fn parse_size(size: &str) -> anyhow::Result<(usize, usize)> {
    let (width, height) = size
        .split_once('x')
        .context("Invalid video size (must be specified as <width>x<height>)")?;
    let width: usize = width.parse().context("Invalid video width")?;
    let height: usize = height.parse().context("Invalid video height")?;

    let width = (width + 15) & !15;
    let height = (height + 15) & !15;

    if !(16..=640).contains(&width) {
        bail!("Invalid video width: {width} (must be in 16-640 range)");
    }
    if !(16..=512).contains(&height) {
        bail!("Invalid video height: {height} (must be in 16-512 range)");
    }

    Ok((width, height))
}

fn parse_frame_rate(frame_rate: &str) -> anyhow::Result<(u32, u32)> {
    let (num, den) = match frame_rate.split_once('/') {
        Some((num, den)) => (
            num.parse().context("Invalid frame rate numerator")?,
            den.parse().context("Invalid frame rate denominator")?,
        ),
        None => (frame_rate.parse().context("Invalid frame rate")?, 1),
    };

    if den == 0 {
        bail!("Invalid frame rate denominator");
    }
    let rounded = num / den;
    if !(1..=60).contains(&rounded) {
        bail!("Invalid frame rate: {num}/{den} (must be in 1-60 range)");
    }

    Ok((num, den))
}

fn validate(args: &Args) -> anyhow::Result<Settings> {
    let format = args.format;

    let frequency = match format {
        _ if format.uses_xa_audio() => {
            let frequency = args.frequency.unwrap_or(XA_FREQ_DOUBLE);
            if frequency != XA_FREQ_SINGLE && frequency != XA_FREQ_DOUBLE {
                bail!(
                    "Invalid XA-ADPCM frequency: {frequency} Hz (must be {XA_FREQ_SINGLE} or \
                     {XA_FREQ_DOUBLE} Hz)"
                );
            }
            frequency
        }
        _ => args.frequency.unwrap_or(44100),
    };

    let channels = match format {
        _ if format.uses_xa_audio() => {
            let channels = args.channels.unwrap_or(2);
            if !(1..=2).contains(&channels) {
                bail!("Invalid XA-ADPCM channel count: {channels} (must be 1 or 2)");
            }
            channels
        }
        Format::Spu | Format::Vag => {
            let channels = args.channels.unwrap_or(1);
            if channels != 1 {
                bail!("Invalid SPU-ADPCM channel count: {channels} (must be 1)");
            }
            channels
        }
        _ => {
            let channels = args.channels.unwrap_or(2);
            if channels < 1 {
                bail!("Invalid channel count: {channels} (must be at least 1)");
            }
            channels
        }
    };

    let bit_depth = args.bit_depth.unwrap_or(4);
    if format.uses_xa_audio() {
        if bit_depth != 4 && bit_depth != 8 {
            bail!("Invalid bit depth: {bit_depth} (must be 4 or 8)");
        }
    } else if format.uses_spu_audio() && bit_depth != 4 {
        bail!("Invalid SPU-ADPCM bit depth: {bit_depth} (must be 4)");
    }

    if format.uses_xa_audio() && (args.interleave.is_some() || args.alignment.is_some()) {
        bail!("Interleave and alignment cannot be specified for this format");
    }
    if format.uses_xa_audio() && (args.enable_loop || args.loop_point.is_some()) {
        bail!("XA-ADPCM does not support loop markers");
    }

    let interleave = match format {
        Format::Spui | Format::Vagi => {
            let interleave = (args.interleave.unwrap_or(2048) + 15) & !15;
            if interleave < 16 {
                bail!("Invalid interleave: {interleave} (must be at least 16)");
            }
            interleave
        }
        _ => {
            if args.interleave.is_some() {
                bail!("Interleave cannot be specified for this format");
            }
            0
        }
    };

    let alignment = match format {
        Format::Spu | Format::Vag => args.alignment.unwrap_or(64),
        Format::Spui | Format::Vagi => args.alignment.unwrap_or(2048),
        Format::Sbs => {
            let alignment = args.alignment.unwrap_or(8192);
            if alignment < 256 {
                bail!("Invalid frame size: {alignment} (must be at least 256)");
            }
            alignment
        }
        _ => 0,
    };
    if format.uses_spu_audio() && alignment < 16 {
        bail!("Invalid alignment: {alignment} (must be at least 16)");
    }

    if args.no_loop && (args.enable_loop || args.loop_point.is_some()) {
        bail!("-n cannot be combined with -L or -l");
    }

    let loop_override = if args.no_loop {
        Some(LoopMode::None)
    } else if let Some(ms) = args.loop_point {
        let sample = (u64::from(ms) * u64::from(frequency) / 1000) as u32;
        Some(LoopMode::Loop(sample))
    } else if args.enable_loop {
        Some(LoopMode::Loop(0))
    } else {
        None
    };

    let (width, height) = parse_size(&args.size)?;
    let (fps_num, fps_den) = parse_frame_rate(&args.frame_rate)?;

    if !(1..=2).contains(&args.cd_speed) {
        bail!("Invalid CD-ROM speed: {} (must be 1 or 2)", args.cd_speed);
    }

    Ok(Settings {
        format,
        frequency,
        channels,
        bit_depth,
        interleave,
        alignment,
        loop_override,
        leading_dummy: !args.no_leading_dummy,
        codec: args.video_codec.into(),
        width,
        height,
        fps_num,
        fps_den,
    })
}

fn xa_settings(args: &Args, settings: &Settings) -> XaSettings {
    let format = match settings.format {
        Format::Xacd => XaFormat::XaCd,
        _ => XaFormat::Xa,
    };

    XaSettings {
        format,
        stereo: settings.channels == 2,
        frequency: settings.frequency,
        bits_per_sample: settings.bit_depth,
        file_number: args.xa_file,
        channel_number: args.xa_channel,
    }
}

fn spu_config(settings: &Settings) -> SpuConfig {
    SpuConfig {
        sample_rate: settings.frequency,
        channels: settings.channels,
        interleave: settings.interleave,
        alignment: settings.alignment,
        loop_override: settings.loop_override,
        leading_dummy: settings.leading_dummy,
    }
}

/// The name stored in a .vag header: the output file name, truncated by the header writer.
fn vag_name(output: &Path) -> &str {
    output.file_name().and_then(OsStr::to_str).unwrap_or("")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet { "error" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let settings = validate(&args)?;

    if settings.format == Format::Strspu {
        bail!("This format is not currently supported");
    }
    if args.ignore_aspect && !settings.format.uses_video() {
        log::warn!("-I has no effect for audio-only formats");
    }

    let frame_size = settings.width * settings.height * 3 / 2;
    let (audio_path, video_path): (Option<&Path>, Option<&Path>) = match settings.format {
        Format::Str | Format::Strcd => (args.audio.as_deref(), Some(args.input.as_path())),
        Format::Strv | Format::Sbs => (None, Some(args.input.as_path())),
        _ => (Some(args.input.as_path()), None),
    };

    let mut source = MediaSource::open(
        audio_path,
        video_path,
        settings.frequency,
        settings.channels,
        frame_size,
    )?;

    let output = File::create(&args.output)
        .with_context(|| format!("Failed to open output file: {}", args.output.display()))?;
    let mut sink = BufWriter::new(output);

    match settings.format {
        Format::Xa | Format::Xacd => {
            log::info!(
                "Audio format: XA-ADPCM, {} Hz {}-bit {}, F={} C={}",
                settings.frequency,
                settings.bit_depth,
                if settings.channels == 2 { "stereo" } else { "mono" },
                args.xa_file,
                args.xa_channel
            );
            encode_xa(&mut source, &mut sink, xa_settings(&args, &settings))?;
        }
        Format::Spu | Format::Vag => {
            log::info!("Audio format: SPU-ADPCM, {} Hz mono", settings.frequency);
            let output_kind =
                if settings.format == Format::Vag { SpuOutput::Vag } else { SpuOutput::Raw };
            encode_spu(
                &mut source,
                &mut sink,
                &spu_config(&settings),
                output_kind,
                vag_name(&args.output),
            )?;
        }
        Format::Spui | Format::Vagi => {
            log::info!(
                "Audio format: SPU-ADPCM, {} Hz {} channels, interleave={}",
                settings.frequency,
                settings.channels,
                settings.interleave
            );
            let output_kind =
                if settings.format == Format::Vagi { SpuOutput::Vag } else { SpuOutput::Raw };
            encode_spu_interleaved(
                &mut source,
                &mut sink,
                &spu_config(&settings),
                output_kind,
                vag_name(&args.output),
            )?;
        }
        Format::Str | Format::Strcd | Format::Strv => {
            log::info!(
                "Video format: BS {:?}, {}x{}, {:.2} fps",
                settings.codec,
                settings.width,
                settings.height,
                f64::from(settings.fps_num) / f64::from(settings.fps_den)
            );

            let str_format = match settings.format {
                Format::Strcd => StrFormat::StrCd,
                Format::Strv => StrFormat::StrV,
                _ => StrFormat::Str,
            };
            let config = StrConfig {
                format: str_format,
                codec: settings.codec,
                width: settings.width,
                height: settings.height,
                fps_num: settings.fps_num,
                fps_den: settings.fps_den,
                cd_speed: args.cd_speed,
                video_id: args.video_id,
                trailing_audio: args.trailing_audio,
                xa: xa_settings(&args, &settings),
            };
            encode_str(&mut source, &mut sink, &config)?;
        }
        Format::Sbs => {
            log::info!(
                "Video format: BS {:?}, {}x{}, {} bytes per frame",
                settings.codec,
                settings.width,
                settings.height,
                settings.alignment
            );
            encode_sbs(
                &mut source,
                &mut sink,
                settings.codec,
                settings.width,
                settings.height,
                settings.alignment,
            )?;
        }
        Format::Strspu => unreachable!("rejected during validation"),
    }

    log::info!("Done.");
    Ok(())
}
