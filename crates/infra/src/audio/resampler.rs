//! Pull-through sample rate and bit depth conversion
//!
//! A [`ResamplingStage`] sits between a channel's fan-out queue and its render
//! pump when negotiation decided the pipeline must convert. Rate conversion
//! uses rubato; bit depth and encoding go through the PCM codec. Same-rate
//! conversions skip rubato entirely.

use super::pcm::{PcmSource, SampleLayout};
use audiomirror_core::{PcmFormat, ResamplerPlan, ResamplerQuality};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, ResamplerConstructionError, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Rubato input chunk length in milliseconds
const CHUNK_MS: u32 = 5;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("unsupported PCM format {0}")]
    UnsupportedFormat(PcmFormat),

    #[error("upstream delivers {actual}, expected {expected}")]
    UpstreamMismatch { expected: PcmFormat, actual: PcmFormat },

    #[error("resampler construction failed: {0}")]
    Construction(#[from] ResamplerConstructionError),
}

/// Rubato resampler chosen by quality level
///
/// rubato's `Resampler` trait is generic over its buffers and cannot be used
/// as a trait object, hence the enum.
enum RateConverter {
    Polynomial(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl RateConverter {
    fn new(ratio: f64, quality: ResamplerQuality, chunk: usize, channels: usize) -> Result<Self, ResampleError> {
        let converter = match quality.level() {
            0 => Self::Polynomial(FastFixedIn::new(ratio, 1.0, PolynomialDegree::Linear, chunk, channels)?),
            1 => Self::Polynomial(FastFixedIn::new(ratio, 1.0, PolynomialDegree::Cubic, chunk, channels)?),
            level => {
                let parameters = match level {
                    2 => SincInterpolationParameters {
                        sinc_len: 64,
                        f_cutoff: 0.91,
                        interpolation: SincInterpolationType::Linear,
                        oversampling_factor: 128,
                        window: WindowFunction::Blackman2,
                    },
                    3 => SincInterpolationParameters {
                        sinc_len: 128,
                        f_cutoff: 0.925,
                        interpolation: SincInterpolationType::Cubic,
                        oversampling_factor: 256,
                        window: WindowFunction::Blackman2,
                    },
                    _ => SincInterpolationParameters {
                        sinc_len: 256,
                        f_cutoff: 0.95,
                        interpolation: SincInterpolationType::Cubic,
                        oversampling_factor: 256,
                        window: WindowFunction::BlackmanHarris2,
                    },
                };
                Self::Sinc(SincFixedIn::new(ratio, 1.0, parameters, chunk, channels)?)
            }
        };
        Ok(converter)
    }

    fn input_frames_next(&self) -> usize {
        match self {
            Self::Polynomial(r) => r.input_frames_next(),
            Self::Sinc(r) => r.input_frames_next(),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Self::Polynomial(r) => r.output_frames_max(),
            Self::Sinc(r) => r.output_frames_max(),
        }
    }

    fn process(&mut self, input: &[Vec<f32>], output: &mut [Vec<f32>]) -> rubato::ResampleResult<(usize, usize)> {
        match self {
            Self::Polynomial(r) => r.process_into_buffer(input, output, None),
            Self::Sinc(r) => r.process_into_buffer(input, output, None),
        }
    }
}

/// Converts an upstream [`PcmSource`] to another format
pub struct ResamplingStage {
    upstream: Box<dyn PcmSource>,
    from: PcmFormat,
    to: PcmFormat,
    decode: SampleLayout,
    encode: SampleLayout,
    converter: Option<RateConverter>,

    /// Raw bytes read from upstream
    raw: Vec<u8>,
    /// Decoded interleaved input awaiting a full rubato chunk
    staged: Vec<f32>,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    interleaved_out: Vec<f32>,

    /// Encoded output not yet handed downstream
    pending: Vec<u8>,
    pending_pos: usize,
}

impl ResamplingStage {
    pub fn new(upstream: Box<dyn PcmSource>, plan: &ResamplerPlan) -> Result<Self, ResampleError> {
        let (from, to) = (plan.from, plan.to);
        if !upstream.format().is_identical(&from) {
            return Err(ResampleError::UpstreamMismatch {
                expected: from,
                actual: upstream.format(),
            });
        }

        let decode = SampleLayout::of(&from).ok_or(ResampleError::UnsupportedFormat(from))?;
        let encode = SampleLayout::of(&to).ok_or(ResampleError::UnsupportedFormat(to))?;
        let channels = usize::from(from.channels);

        let converter = if from.sample_rate == to.sample_rate {
            None
        } else {
            let ratio = f64::from(to.sample_rate) / f64::from(from.sample_rate);
            let chunk = (from.sample_rate * CHUNK_MS / 1000).max(16) as usize;
            Some(RateConverter::new(ratio, plan.quality, chunk, channels)?)
        };

        let (chunk_frames, out_frames) = match &converter {
            Some(c) => (c.input_frames_next(), c.output_frames_max()),
            None => (0, 0),
        };

        debug!(
            from = %from,
            to = %to,
            quality = plan.quality.level(),
            chunk_frames,
            "resampling stage created"
        );

        Ok(Self {
            upstream,
            from,
            to,
            decode,
            encode,
            converter,
            raw: Vec::with_capacity(chunk_frames * from.block_align()),
            staged: Vec::with_capacity(chunk_frames * channels),
            planar_in: vec![Vec::with_capacity(chunk_frames); channels],
            planar_out: vec![vec![0.0; out_frames]; channels],
            interleaved_out: Vec::with_capacity(out_frames * channels),
            pending: Vec::with_capacity(out_frames * to.block_align()),
            pending_pos: 0,
        })
    }

    pub fn input_format(&self) -> PcmFormat {
        self.from
    }

    /// Hand out buffered output; returns bytes copied
    fn drain_pending(&mut self, dst: &mut [u8]) -> usize {
        let align = self.to.block_align();
        let available = self.pending.len() - self.pending_pos;
        let mut count = available.min(dst.len());
        count -= count % align;

        dst[..count].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + count]);
        self.pending_pos += count;
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        count
    }

    /// Produce more output into `pending`; false when upstream is starved
    fn refill(&mut self, wanted_frames: usize) -> bool {
        let channels = usize::from(self.from.channels);
        let in_align = self.from.block_align();

        let Some(converter) = self.converter.as_mut() else {
            // Same rate: transcode only as much as downstream asked for
            self.raw.resize(wanted_frames * in_align, 0);
            let read = self.upstream.read(&mut self.raw);
            if read == 0 {
                return false;
            }
            self.staged.clear();
            self.decode.decode(&self.raw[..read], &mut self.staged);
            self.encode.encode(&self.staged, &mut self.pending);
            self.staged.clear();
            return true;
        };

        let needed = converter.input_frames_next();
        let staged_frames = self.staged.len() / channels;
        if staged_frames < needed {
            self.raw.resize((needed - staged_frames) * in_align, 0);
            let read = self.upstream.read(&mut self.raw);
            self.decode.decode(&self.raw[..read], &mut self.staged);
            if self.staged.len() / channels < needed {
                return false;
            }
        }

        for (ch, plane) in self.planar_in.iter_mut().enumerate() {
            plane.clear();
            plane.extend(self.staged.iter().skip(ch).step_by(channels).take(needed));
        }
        self.staged.clear();

        match converter.process(&self.planar_in, &mut self.planar_out) {
            Ok((_, generated)) => {
                self.interleaved_out.clear();
                for frame in 0..generated {
                    for plane in &self.planar_out {
                        self.interleaved_out.push(plane[frame]);
                    }
                }
                self.encode.encode(&self.interleaved_out, &mut self.pending);
                true
            }
            Err(e) => {
                warn!(error = %e, from = %self.from, to = %self.to, "resampling chunk dropped");
                false
            }
        }
    }
}

impl PcmSource for ResamplingStage {
    fn format(&self) -> PcmFormat {
        self.to
    }

    fn read(&mut self, dst: &mut [u8]) -> usize {
        let align = self.to.block_align();
        let mut written = 0;

        loop {
            written += self.drain_pending(&mut dst[written..]);
            let remaining_frames = (dst.len() - written) / align;
            if remaining_frames == 0 || !self.refill(remaining_frames) {
                return written;
            }
        }
    }
}
