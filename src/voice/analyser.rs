//! Frequency-domain level analysis
//!
//! Produces byte-scaled frequency bins the same way a browser analyser node
//! does: Blackman window, FFT, per-bin smoothing over time, then a linear map
//! from the [`MIN_DB`, `MAX_DB`] range onto 0-255.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Decibel value mapped to bin level 0
pub const MIN_DB: f32 = -100.0;

/// Decibel value mapped to bin level 255
pub const MAX_DB: f32 = -30.0;

/// Time smoothing applied between successive frames
pub const SMOOTHING: f32 = 0.8;

/// Sentinel decibel value for a completely silent frame
pub const SILENCE_DB: f32 = -100.0;

/// Rolling FFT analyser over the most recent `fft_size` samples
pub struct FrequencyAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    history: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for FrequencyAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrequencyAnalyser")
            .field("fft_size", &self.fft_size)
            .finish_non_exhaustive()
    }
}

impl FrequencyAnalyser {
    /// Create an analyser; `fft_size` should be a power of two
    #[must_use]
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Self {
            fft,
            fft_size,
            window: blackman(fft_size),
            history: vec![0.0; fft_size],
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// Number of frequency bins produced per frame
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed newly captured mono samples
    pub fn push_samples(&mut self, samples: &[f32]) {
        if samples.len() >= self.fft_size {
            self.history
                .copy_from_slice(&samples[samples.len() - self.fft_size..]);
            return;
        }
        self.history.drain(..samples.len());
        self.history.extend_from_slice(samples);
    }

    /// Compute byte-scaled frequency bins over the current window
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        for (slot, (sample, w)) in self
            .scratch
            .iter_mut()
            .zip(self.history.iter().zip(&self.window))
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let n = self.fft_size as f32;
        let range = MAX_DB - MIN_DB;

        self.smoothed
            .iter_mut()
            .zip(&self.scratch)
            .map(|(prev, bin)| {
                let magnitude = bin.norm() / n;
                *prev = SMOOTHING.mul_add(*prev, (1.0 - SMOOTHING) * magnitude);
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                let scaled = (255.0 / range) * (db - MIN_DB);
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// Mean bin value, rounded down
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn mean_level(bins: &[u8]) -> u8 {
    if bins.is_empty() {
        return 0;
    }
    let sum: u64 = bins.iter().map(|&b| u64::from(b)).sum();
    (sum / bins.len() as u64) as u8
}

/// Approximate decibel value of a 0-255 mean level
#[must_use]
pub fn level_to_db(mean: f32) -> f32 {
    if mean > 0.0 {
        20.0 * (mean / 255.0).log10()
    } else {
        SILENCE_DB
    }
}

#[allow(clippy::cast_precision_loss)]
fn blackman(n: usize) -> Vec<f32> {
    let alpha = 0.16_f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5_f32;
    let a2 = 0.5 * alpha;
    let len = n as f32;

    (0..n)
        .map(|i| {
            let x = i as f32 / len;
            a2.mul_add(
                (4.0 * std::f32::consts::PI * x).cos(),
                a1.mul_add(-(2.0 * std::f32::consts::PI * x).cos(), a0),
            )
        })
        .collect()
}
