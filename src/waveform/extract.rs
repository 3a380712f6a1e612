//! Decodes audio and picks one peak per fixed time window.

use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use log::{debug, warn};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::{
    config::WaveformConfig,
    domain::waveform::WaveformRecord,
    waveform::decimate::{clamp_unit, simplify},
};

/// Any reason the waveform of a file could not be computed.
///
/// Callers treat this as "continue without waveform".
#[derive(Debug, Error)]
#[error("waveform extraction failed: {reason}")]
pub struct ExtractionFailed {
    pub reason: String,
}

impl ExtractionFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<SymphoniaError> for ExtractionFailed {
    fn from(err: SymphoniaError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<io::Error> for ExtractionFailed {
    fn from(err: io::Error) -> Self {
        Self::new(format!("io error: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPeaks {
    pub peaks: Vec<f32>,
    pub duration_seconds: f64,
    /// Peaks per second.
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct PeakExtractor {
    peaks_per_second: u32,
    simplified_points: usize,
    timeout: Duration,
}

impl PeakExtractor {
    pub fn new(peaks_per_second: u32, simplified_points: usize, timeout: Duration) -> Self {
        Self {
            peaks_per_second: peaks_per_second.max(1),
            simplified_points,
            timeout,
        }
    }

    pub fn from_config(config: &WaveformConfig) -> Self {
        Self::new(
            config.peaks_per_second,
            config.simplified_points,
            Duration::from_secs(config.extraction_timeout_secs),
        )
    }

    /// Extracts peaks and builds the record that gets persisted.
    pub fn analyze(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<(f64, WaveformRecord), ExtractionFailed> {
        let extracted = self.extract(bytes, filename)?;
        let simplified = simplify(&extracted.peaks, self.simplified_points);
        Ok((
            extracted.duration_seconds,
            WaveformRecord {
                full: extracted.peaks,
                simplified,
                sample_rate: extracted.sample_rate,
            },
        ))
    }

    /// Extracts peaks off the calling thread, bounded by the configured timeout.
    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedPeaks, ExtractionFailed> {
        if bytes.is_empty() {
            return Err(ExtractionFailed::new("file is empty"));
        }

        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        let mut input = tempfile::Builder::new()
            .prefix("trackvault-")
            .suffix(&extension.as_ref().map(|e| format!(".{e}")).unwrap_or_default())
            .tempfile()?;
        input.write_all(bytes)?;
        input.flush()?;

        self.extract_file(input, extension)
    }

    /// The worker owns `input`, so the temp file is removed however it exits.
    fn extract_file(
        &self,
        input: NamedTempFile,
        extension: Option<String>,
    ) -> Result<ExtractedPeaks, ExtractionFailed> {
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        let rate = self.peaks_per_second;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("peak-extractor".into())
            .spawn(move || {
                let result = extract_peaks(input.path(), extension.as_deref(), rate, &worker_cancel);
                drop(input);
                let _ = tx.send(result);
            })
            .map_err(|e| ExtractionFailed::new(format!("failed to start extraction worker: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                warn!("waveform extraction timed out after {:?}", self.timeout);
                Err(ExtractionFailed::new("timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ExtractionFailed::new("extraction worker stopped unexpectedly"))
            }
        }
    }
}

/// Running max-abs accumulator; frame `f` lands in window `floor(f * rate / sample_rate)`.
struct PeakWindows {
    rate: u64,
    sample_rate: u64,
    frames: u64,
    peaks: Vec<f32>,
}

impl PeakWindows {
    fn new(rate: u32, sample_rate: u32) -> Self {
        Self {
            rate: rate as u64,
            sample_rate: sample_rate as u64,
            frames: 0,
            peaks: Vec::new(),
        }
    }

    fn push_frame(&mut self, amplitude: f32) {
        let window = (self.frames * self.rate / self.sample_rate) as usize;
        if window >= self.peaks.len() {
            self.peaks.resize(window + 1, 0.0);
        }
        self.peaks[window] = self.peaks[window].max(amplitude);
        self.frames += 1;
    }

    fn finish(mut self) -> Result<ExtractedPeaks, ExtractionFailed> {
        if self.frames == 0 {
            return Err(ExtractionFailed::new("no audio frames decoded"));
        }

        let expected = (self.frames * self.rate).div_ceil(self.sample_rate) as usize;
        self.peaks.resize(expected, 0.0);

        Ok(ExtractedPeaks {
            peaks: self.peaks.into_iter().map(clamp_unit).collect(),
            duration_seconds: self.frames as f64 / self.sample_rate as f64,
            sample_rate: self.rate as u32,
        })
    }
}

/// Decodes the first audio track of `path` and reduces it to `rate` peaks per second.
pub fn extract_peaks(
    path: &Path,
    extension: Option<&str>,
    rate: u32,
    cancel: &AtomicBool,
) -> Result<ExtractedPeaks, ExtractionFailed> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ExtractionFailed::new("no supported audio track"))?;
    let track_id = track.id;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut windows: Option<PeakWindows> = None;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ExtractionFailed::new("cancelled"));
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        if spec.rate == 0 {
            return Err(ExtractionFailed::new("stream reports a zero sample rate"));
        }
        let channels = spec.channels.count().max(1);
        let acc = windows.get_or_insert_with(|| PeakWindows::new(rate, spec.rate));

        let frames = decoded.capacity();
        if sample_buf
            .as_ref()
            .is_none_or(|buf| buf.capacity() < frames * channels)
        {
            sample_buf = Some(SampleBuffer::<f32>::new(frames as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        for frame in buf.samples().chunks(channels) {
            let amplitude = frame.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            acc.push_frame(amplitude);
        }
    }

    windows
        .ok_or_else(|| ExtractionFailed::new("no audio frames decoded"))?
        .finish()
}
