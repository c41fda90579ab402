//! Spectral feature extraction and music/speech/silence classification.
//!
//! Mirrors the windowed-RMS scanning shape of the teacher's silence
//! detector (fixed-size windows, a running classification decision per
//! window) but replaces the single dB threshold with the full feature
//! bundle the resolver cascade needs downstream.

use rustfft::{num_complex::Complex32, FftPlanner};

const FFT_SIZE: usize = 2048;
const HOP_SIZE: usize = 512;
const MEL_BANDS: usize = 128;
const MFCC_COEFFICIENTS: usize = 13;
const CHROMA_BINS: usize = 12;
const SILENCE_RMS_THRESHOLD: f32 = 0.05;

/// The full set of spectral/timbral measurements computed from one chunk of
/// decoded mono audio, everything the resolver's hash fingerprint and the
/// classifier need.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBundle {
    pub mfcc_mean: [f32; MFCC_COEFFICIENTS],
    pub mfcc_variance: [f32; MFCC_COEFFICIENTS],
    pub chroma_mean: [f32; CHROMA_BINS],
    pub spectral_centroid: f32,
    pub spectral_rolloff: f32,
    pub zero_crossing_rate: f32,
    pub rhythm_strength: f32,
    pub harmonic_ratio: f32,
    pub spectral_flux: f32,
    pub rms: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Music,
    Speech,
    Silence,
    Unknown,
}

/// Normalize a mono buffer so its peak absolute sample is 1.0. A silent or
/// empty buffer is returned unchanged rather than dividing by zero.
pub fn normalize_peak(samples: &[f32]) -> Vec<f32> {
    let peak = samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
    if peak <= f32::EPSILON {
        return samples.to_vec();
    }
    samples.iter().map(|&s| s / peak).collect()
}

/// Extract the full feature bundle from a mono, peak-normalized chunk.
///
/// Returns `None` only for a buffer too short to contain a single analysis
/// frame; callers treat that as `Classification::Unknown` with confidence 0,
/// per the "decode/resample errors never halt the pipeline" rule.
pub fn extract(samples: &[f32], sample_rate: u32) -> Option<FeatureBundle> {
    if samples.len() < FFT_SIZE {
        return None;
    }

    let window = hann_window(FFT_SIZE);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);
    let mel_filters = mel_filterbank(MEL_BANDS, FFT_SIZE, sample_rate);

    let mut frame_mfccs: Vec<[f32; MFCC_COEFFICIENTS]> = Vec::new();
    let mut frame_chromas: Vec<[f32; CHROMA_BINS]> = Vec::new();
    let mut centroids = Vec::new();
    let mut rolloffs = Vec::new();
    let mut prev_magnitudes: Option<Vec<f32>> = None;
    let mut flux_sum = 0.0f32;
    let mut flux_count = 0usize;

    let mut start = 0;
    while start + FFT_SIZE <= samples.len() {
        let frame = &samples[start..start + FFT_SIZE];
        let mut buffer: Vec<Complex32> = frame
            .iter()
            .zip(window.iter())
            .map(|(&s, &w)| Complex32::new(s * w, 0.0))
            .collect();
        fft.process(&mut buffer);

        let magnitudes: Vec<f32> = buffer[..FFT_SIZE / 2]
            .iter()
            .map(|c| c.norm())
            .collect();

        let mel_energies = apply_mel_filterbank(&magnitudes, &mel_filters);
        let log_mel: Vec<f32> = mel_energies.iter().map(|&e| (e + 1e-10).ln()).collect();
        frame_mfccs.push(dct_first_n(&log_mel, MFCC_COEFFICIENTS));
        frame_chromas.push(chroma_from_magnitudes(&magnitudes, sample_rate));

        centroids.push(spectral_centroid(&magnitudes, sample_rate));
        rolloffs.push(spectral_rolloff(&magnitudes, sample_rate, 0.85));

        if let Some(prev) = &prev_magnitudes {
            flux_sum += spectral_flux(prev, &magnitudes);
            flux_count += 1;
        }
        prev_magnitudes = Some(magnitudes);

        start += HOP_SIZE;
    }

    if frame_mfccs.is_empty() {
        return None;
    }

    let (mfcc_mean, mfcc_variance) = mean_and_variance_vec(&frame_mfccs);
    let chroma_mean = mean_vec(&frame_chromas);
    let spectral_centroid = mean(&centroids);
    let spectral_rolloff = mean(&rolloffs);
    let zero_crossing_rate = zero_crossing_rate(samples);
    let rms = root_mean_square(samples);
    let spectral_flux = if flux_count > 0 { flux_sum / flux_count as f32 } else { 0.0 };
    let rhythm_strength = rhythm_strength_from_flux_variance(&frame_mfccs);
    let harmonic_ratio = harmonic_ratio_from_chroma(&chroma_mean);

    Some(FeatureBundle {
        mfcc_mean,
        mfcc_variance,
        chroma_mean,
        spectral_centroid,
        spectral_rolloff,
        zero_crossing_rate,
        rhythm_strength,
        harmonic_ratio,
        spectral_flux,
        rms,
    })
}

/// `Silence` if normalized RMS<0.05; `Music` if the weighted rhythm/harmonic/
/// flux score reaches 0.5; `Speech` if MFCC variance dominates chroma energy
/// by a factor of 2; `Unknown` otherwise.
pub fn classify(features: &FeatureBundle) -> (Classification, f32) {
    if features.rms < SILENCE_RMS_THRESHOLD {
        return (Classification::Silence, 1.0 - features.rms / SILENCE_RMS_THRESHOLD);
    }

    let music_score = 0.5 * features.rhythm_strength
        + 0.3 * features.harmonic_ratio
        + 0.2 * features.spectral_flux;
    if music_score >= 0.5 {
        return (Classification::Music, music_score.min(1.0));
    }

    let mfcc_variance_energy: f32 = features.mfcc_variance.iter().sum();
    let chroma_energy: f32 = features.chroma_mean.iter().map(|c| c.abs()).sum();
    if chroma_energy <= f32::EPSILON || mfcc_variance_energy >= 2.0 * chroma_energy {
        return (Classification::Speech, 0.6);
    }

    (Classification::Unknown, 0.0)
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * n as f32 / (size - 1) as f32).cos())
        .collect()
}

/// Triangular mel filterbank, one row of FFT-bin weights per mel band.
fn mel_filterbank(num_bands: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let n_bins = fft_size / 2;
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);
    let mel_points: Vec<f32> = (0..num_bands + 2)
        .map(|i| min_mel + (max_mel - min_mel) * i as f32 / (num_bands + 1) as f32)
        .collect();
    let bin_points: Vec<usize> = mel_points
        .iter()
        .map(|&mel| {
            let hz = mel_to_hz(mel);
            ((hz * fft_size as f32 / sample_rate as f32).floor() as usize).min(n_bins - 1)
        })
        .collect();

    (0..num_bands)
        .map(|band| {
            let mut filter = vec![0.0f32; n_bins];
            let (left, center, right) = (bin_points[band], bin_points[band + 1], bin_points[band + 2]);
            for bin in left..center.max(left + 1) {
                if center > left {
                    filter[bin] = (bin - left) as f32 / (center - left) as f32;
                }
            }
            for bin in center..right.max(center + 1) {
                if bin < n_bins && right > center {
                    filter[bin] = 1.0 - (bin - center) as f32 / (right - center) as f32;
                }
            }
            filter
        })
        .collect()
}

fn apply_mel_filterbank(magnitudes: &[f32], filters: &[Vec<f32>]) -> Vec<f32> {
    filters
        .iter()
        .map(|filter| filter.iter().zip(magnitudes.iter()).map(|(f, m)| f * m).sum())
        .collect()
}

/// Discrete cosine transform (type II), first `n` coefficients only — the
/// standard MFCC derivation from log-mel energies.
fn dct_first_n(log_mel: &[f32], n: usize) -> [f32; MFCC_COEFFICIENTS] {
    let mut out = [0.0f32; MFCC_COEFFICIENTS];
    let bands = log_mel.len() as f32;
    for (k, slot) in out.iter_mut().enumerate().take(n) {
        let mut sum = 0.0f32;
        for (m, &energy) in log_mel.iter().enumerate() {
            sum += energy * (std::f32::consts::PI * k as f32 * (m as f32 + 0.5) / bands).cos();
        }
        *slot = sum;
    }
    out
}

/// Fold FFT bin energy into 12 pitch classes by mapping each bin's dominant
/// frequency to its nearest equal-tempered pitch class relative to A4.
fn chroma_from_magnitudes(magnitudes: &[f32], sample_rate: u32) -> [f32; CHROMA_BINS] {
    let mut chroma = [0.0f32; CHROMA_BINS];
    let bin_hz = sample_rate as f32 / (2 * magnitudes.len()) as f32;
    for (bin, &mag) in magnitudes.iter().enumerate() {
        let freq = bin as f32 * bin_hz;
        if freq < 20.0 {
            continue;
        }
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        let pitch_class = ((midi.round() as i32).rem_euclid(12)) as usize;
        chroma[pitch_class] += mag;
    }
    let total: f32 = chroma.iter().sum();
    if total > f32::EPSILON {
        for c in chroma.iter_mut() {
            *c /= total;
        }
    }
    chroma
}

fn spectral_centroid(magnitudes: &[f32], sample_rate: u32) -> f32 {
    let bin_hz = sample_rate as f32 / (2 * magnitudes.len()) as f32;
    let total: f32 = magnitudes.iter().sum();
    if total <= f32::EPSILON {
        return 0.0;
    }
    let weighted: f32 = magnitudes.iter().enumerate().map(|(i, &m)| i as f32 * bin_hz * m).sum();
    weighted / total
}

fn spectral_rolloff(magnitudes: &[f32], sample_rate: u32, fraction: f32) -> f32 {
    let total: f32 = magnitudes.iter().sum();
    if total <= f32::EPSILON {
        return 0.0;
    }
    let target = total * fraction;
    let bin_hz = sample_rate as f32 / (2 * magnitudes.len()) as f32;
    let mut cumulative = 0.0f32;
    for (i, &m) in magnitudes.iter().enumerate() {
        cumulative += m;
        if cumulative >= target {
            return i as f32 * bin_hz;
        }
    }
    magnitudes.len() as f32 * bin_hz
}

fn spectral_flux(prev: &[f32], curr: &[f32]) -> f32 {
    let sum_sq: f32 = prev
        .iter()
        .zip(curr.iter())
        .map(|(&p, &c)| {
            let diff = c - p;
            if diff > 0.0 {
                diff * diff
            } else {
                0.0
            }
        })
        .sum();
    (sum_sq / prev.len() as f32).sqrt().min(1.0)
}

fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

fn root_mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Frame-to-frame MFCC variance as a proxy for rhythmic regularity: a steady
/// beat produces a periodically-repeating timbre, which shows up as variance
/// concentrated in a few coefficients rather than spread evenly.
fn rhythm_strength_from_flux_variance(frame_mfccs: &[[f32; MFCC_COEFFICIENTS]]) -> f32 {
    if frame_mfccs.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f32> = frame_mfccs
        .windows(2)
        .map(|pair| {
            pair[0]
                .iter()
                .zip(pair[1].iter())
                .map(|(&a, &b)| (a - b).abs())
                .sum::<f32>()
        })
        .collect();
    let mean_diff = mean(&diffs);
    let variance = diffs.iter().map(|&d| (d - mean_diff).powi(2)).sum::<f32>() / diffs.len() as f32;
    (1.0 - (variance / (mean_diff.abs() + 1.0))).clamp(0.0, 1.0)
}

/// A handful of chroma bins carrying most of the energy indicates tonal
/// (harmonic) content; energy spread evenly across all 12 indicates noise or
/// unpitched speech.
fn harmonic_ratio_from_chroma(chroma_mean: &[f32; CHROMA_BINS]) -> f32 {
    let mut sorted = *chroma_mean;
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top3: f32 = sorted[..3].iter().sum();
    top3.clamp(0.0, 1.0)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn mean_vec<const N: usize>(frames: &[[f32; N]]) -> [f32; N] {
    let mut out = [0.0f32; N];
    if frames.is_empty() {
        return out;
    }
    for frame in frames {
        for (o, &v) in out.iter_mut().zip(frame.iter()) {
            *o += v;
        }
    }
    for o in out.iter_mut() {
        *o /= frames.len() as f32;
    }
    out
}

fn mean_and_variance_vec<const N: usize>(frames: &[[f32; N]]) -> ([f32; N], [f32; N]) {
    let mean = mean_vec(frames);
    let mut variance = [0.0f32; N];
    if frames.is_empty() {
        return (mean, variance);
    }
    for frame in frames {
        for i in 0..N {
            variance[i] += (frame[i] - mean[i]).powi(2);
        }
    }
    for v in variance.iter_mut() {
        *v /= frames.len() as f32;
    }
    (mean, variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wave(freq: f32, sample_rate: u32, duration_secs: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * duration_secs) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn normalize_peak_scales_to_unity() {
        let samples = vec![0.1, -0.4, 0.2];
        let normalized = normalize_peak(&samples);
        assert!((normalized[1] - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn normalize_peak_leaves_silence_unchanged() {
        let samples = vec![0.0, 0.0, 0.0];
        assert_eq!(normalize_peak(&samples), samples);
    }

    #[test]
    fn too_short_buffer_yields_no_features() {
        let samples = vec![0.0f32; 100];
        assert!(extract(&samples, 44100).is_none());
    }

    #[test]
    fn silent_buffer_classifies_as_silence() {
        let samples = vec![0.0f32; 44100 * 2];
        let features = extract(&samples, 44100).expect("long enough buffer");
        let (classification, _) = classify(&features);
        assert_eq!(classification, Classification::Silence);
    }

    #[test]
    fn pure_tone_has_low_zero_crossing_rate_relative_to_noise() {
        let tone = sine_wave(440.0, 44100, 1.0);
        let tone_zcr = zero_crossing_rate(&tone);
        assert!(tone_zcr > 0.0 && tone_zcr < 0.1);
    }

    #[test]
    fn spectral_centroid_tracks_tone_frequency() {
        let tone = normalize_peak(&sine_wave(1000.0, 44100, 1.0));
        let features = extract(&tone, 44100).expect("long enough buffer");
        assert!((features.spectral_centroid - 1000.0).abs() < 200.0);
    }

    #[test]
    fn rms_matches_known_sine_amplitude() {
        let tone = sine_wave(440.0, 44100, 1.0);
        let rms = root_mean_square(&tone);
        let expected = 1.0 / std::f32::consts::SQRT_2;
        assert!((rms - expected).abs() < 0.01);
    }
}
