//! Audio analysis helpers for verification
//!
//! The quality matrix (oscillator frequency error, filter cutoff tolerance,
//! crossfade RMS, sequencer drift) needs measurements, not vibes. These
//! helpers back the integration tests and the demo binary; none of this is
//! audio-thread code.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Root-mean-square level
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Absolute peak
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |a, &b| a.max(b.abs()))
}

/// Count sign changes; a steady tone at `f` Hz has `2 f` per second
pub fn zero_crossings(samples: &[f32]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count()
}

/// Estimate the dominant frequency by FFT peak with a Hann window and
/// parabolic interpolation around the peak bin
pub fn dominant_frequency(samples: &[f32], sample_rate: f32) -> f32 {
    let n = samples.len();
    if n < 16 {
        return 0.0;
    }
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<f32>> = samples
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let w = 0.5 - 0.5 * (std::f32::consts::TAU * i as f32 / (n - 1) as f32).cos();
            Complex::new(x * w, 0.0)
        })
        .collect();
    fft.process(&mut buffer);

    let half = n / 2;
    let mags: Vec<f32> = buffer[..half].iter().map(|c| c.norm()).collect();
    let (peak_bin, _) = mags
        .iter()
        .enumerate()
        .skip(1)
        .fold((1, 0.0f32), |(bi, bm), (i, &m)| {
            if m > bm {
                (i, m)
            } else {
                (bi, bm)
            }
        });

    // parabolic refinement between the peak's neighbors
    let refined = if peak_bin > 0 && peak_bin + 1 < half {
        let (a, b, c) = (
            mags[peak_bin - 1].max(1e-12).ln(),
            mags[peak_bin].max(1e-12).ln(),
            mags[peak_bin + 1].max(1e-12).ln(),
        );
        let denom = a - 2.0 * b + c;
        if denom.abs() > 1e-9 {
            peak_bin as f32 + 0.5 * (a - c) / denom
        } else {
            peak_bin as f32
        }
    } else {
        peak_bin as f32
    };
    refined * sample_rate / n as f32
}

/// Total spectral energy inside `[lo, hi)` Hz, as a fraction of the whole
pub fn band_energy_ratio(samples: &[f32], sample_rate: f32, lo: f32, hi: f32) -> f32 {
    let n = samples.len();
    if n < 16 {
        return 0.0;
    }
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<f32>> =
        samples.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut buffer);

    let half = n / 2;
    let hz_per_bin = sample_rate / n as f32;
    let mut band = 0.0;
    let mut total = 0.0;
    for (i, c) in buffer[..half].iter().enumerate() {
        let energy = c.norm_sqr();
        total += energy;
        let f = i as f32 * hz_per_bin;
        if f >= lo && f < hi {
            band += energy;
        }
    }
    if total == 0.0 {
        0.0
    } else {
        band / total
    }
}
