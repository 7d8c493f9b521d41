//! Media file capture source using symphonia.
//!
//! Decodes any format symphonia supports (mp3, flac, wav, ogg, aac) and
//! starts over at end of file, so a file can stand in for a microphone.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info};

use crate::audio::format::{AudioFormat, SampleFormat};
use crate::audio::frame::AudioFrame;
use crate::error::{PipelineError, Result};
use crate::io::source::{DeviceParams, MediaSource};

/// Appends `decoded` to `output` as interleaved normalized `f32`.
fn extract_samples(decoded: &AudioBufferRef, output: &mut Vec<f32>) {
    macro_rules! interleave {
        ($buf:expr, $convert:expr) => {{
            let channels = $buf.spec().channels.count();
            for frame_idx in 0..$buf.frames() {
                for ch in 0..channels {
                    output.push($convert($buf.chan(ch)[frame_idx]));
                }
            }
        }};
    }

    match decoded {
        AudioBufferRef::F32(buf) => interleave!(buf, |s: f32| s),
        AudioBufferRef::F64(buf) => interleave!(buf, |s: f64| s as f32),
        AudioBufferRef::S16(buf) => interleave!(buf, |s: i16| s as f32 / 32768.0),
        AudioBufferRef::S32(buf) => interleave!(buf, |s: i32| (s as f64 / 2147483648.0) as f32),
        AudioBufferRef::U8(buf) => interleave!(buf, |s: u8| (s as f32 - 128.0) / 128.0),
        _ => debug!("Skipping unsupported sample layout"),
    }
}

struct Decoding {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
}

fn open_decoding(path: &Path) -> anyhow::Result<(Decoding, AudioFormat)> {
    let file = File::open(path).context("Failed to open audio file")?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Failed to probe audio format")?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No supported audio track found"))?;
    let track_id = track.id;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(2);

    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create decoder")?;

    Ok((
        Decoding {
            format,
            decoder,
            track_id,
        },
        AudioFormat::new(sample_rate, channels, SampleFormat::F32),
    ))
}

pub struct FileSource {
    path: PathBuf,
    decoding: Decoding,
    format: AudioFormat,
    pending: Vec<f32>,
    pts: u64,
    /// Set once a full pass produced audio; guards against spinning on
    /// files with no decodable packets.
    produced_audio: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let (decoding, format) = open_decoding(path).map_err(|e| {
            PipelineError::ResourceUnavailable(format!("{}: {e:#}", path.display()))
        })?;
        info!("Opened {} as {}", path.display(), format);
        Ok(Self {
            path: path.to_path_buf(),
            decoding,
            format,
            pending: Vec::new(),
            pts: 0,
            produced_audio: false,
        })
    }

    /// Decodes the next packet into `pending`. Returns false at end of file.
    fn decode_next(&mut self) -> anyhow::Result<bool> {
        loop {
            let packet = match self.decoding.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.decoding.track_id {
                continue;
            }
            match self.decoding.decoder.decode(&packet) {
                Ok(decoded) => {
                    extract_samples(&decoded, &mut self.pending);
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => debug!("Skipping corrupt packet: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        let (decoding, _) = open_decoding(&self.path)?;
        self.decoding = decoding;
        debug!("Looping {}", self.path.display());
        Ok(())
    }
}

impl MediaSource for FileSource {
    fn params(&self) -> DeviceParams {
        DeviceParams {
            name: self.path.display().to_string(),
            format: self.format,
            frame_size: self.format.samples_for(std::time::Duration::from_millis(20)),
        }
    }

    fn read(&mut self, samples_per_channel: usize) -> Result<Option<AudioFrame>> {
        let wanted = samples_per_channel * self.format.channels as usize;
        let mut rewound = false;
        while self.pending.len() < wanted {
            let more = self
                .decode_next()
                .map_err(|e| PipelineError::ResourceUnavailable(format!("{e:#}")))?;
            if more {
                self.produced_audio = true;
                continue;
            }
            if rewound || !self.produced_audio {
                break;
            }
            self.rewind()
                .map_err(|e| PipelineError::ResourceUnavailable(format!("{e:#}")))?;
            rewound = true;
        }

        let take = wanted.min(self.pending.len());
        let take = take - take % self.format.channels as usize;
        if take == 0 {
            return Ok(None);
        }
        let samples: Vec<f32> = self.pending.drain(..take).collect();
        let frame = AudioFrame::from_f32(self.format.sample_rate, self.format.channels, samples)?
            .with_pts(self.pts);
        self.pts += frame.samples_per_channel() as u64;
        Ok(Some(frame))
    }
}
