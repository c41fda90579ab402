//! FingerprintCodec: turns a [`FeatureBundle`] into the two fingerprint
//! forms the resolver cascade matches against, and scores similarity between
//! them.

use md5::{Digest, Md5};
use serde::Serialize;

use crate::features::FeatureBundle;
use crate::ffi::chromaprint::ChromaprintContext;

/// Canonical, rounded subset of a [`FeatureBundle`] that feeds the hash
/// fingerprint. Serialized with `serde_json`'s default key ordering (struct
/// field order), which is stable across runs since the struct definition is
/// fixed — "canonical" here means "rounded and struct-ordered," not
/// key-sorted.
#[derive(Serialize)]
struct HashFingerprintInput {
    mfcc_mean: Vec<f32>,
    chroma_mean: Vec<f32>,
    spectral_centroid: f32,
    rhythm_strength: f32,
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

/// MD5 of the canonical JSON encoding of (MFCC means, chroma means, spectral
/// centroid, rhythm strength), each rounded to 3 decimals. Two chunks with
/// near-identical features round to the same bytes and therefore the same
/// hash, which is what makes this an *exact*-match fingerprint despite being
/// derived from continuous features.
pub fn hash_fingerprint(features: &FeatureBundle) -> String {
    let input = HashFingerprintInput {
        mfcc_mean: features.mfcc_mean.iter().map(|&v| round3(v)).collect(),
        chroma_mean: features.chroma_mean.iter().map(|&v| round3(v)).collect(),
        spectral_centroid: round3(features.spectral_centroid),
        rhythm_strength: round3(features.rhythm_strength),
    };
    let canonical = serde_json::to_vec(&input).expect("struct with only primitive fields");
    let mut hasher = Md5::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Chromaprint integer vector from raw PCM, via the vendored `chromaprint`
/// C library. `None` when the library isn't available at process startup —
/// this must degrade gracefully rather than fail the pipeline, so callers
/// treat a missing Chromaprint fingerprint the same as one that didn't match.
pub fn chromaprint_vector(samples: &[f32], sample_rate: u32, num_channels: u8) -> Option<Vec<u32>> {
    let mut ctx = match ChromaprintContext::new() {
        Ok(ctx) => ctx,
        Err(_) => return None,
    };
    ctx.generate_raw_fingerprint(samples, sample_rate, num_channels).ok()
}

/// The base64-compressed Chromaprint string AcoustID expects, as opposed to
/// [`chromaprint_vector`]'s raw integer form used for local similarity.
/// Same degrade-to-`None` contract.
pub fn chromaprint_base64(samples: &[f32], sample_rate: u32, num_channels: u8) -> Option<String> {
    let mut ctx = match ChromaprintContext::new() {
        Ok(ctx) => ctx,
        Err(_) => return None,
    };
    ctx.generate_fingerprint(samples, sample_rate, num_channels).ok()
}

/// Similarity between two feature bundles: `1 - mean(|a_i - b_i| /
/// max(|a_i|, |b_i|, eps))` over every matched scalar/vector axis.
pub fn feature_similarity(a: &FeatureBundle, b: &FeatureBundle) -> f32 {
    const EPS: f32 = 1e-6;
    let mut diffs = Vec::with_capacity(a.mfcc_mean.len() + a.chroma_mean.len() + 3);

    for (x, y) in a.mfcc_mean.iter().zip(b.mfcc_mean.iter()) {
        diffs.push(normalized_abs_diff(*x, *y, EPS));
    }
    for (x, y) in a.chroma_mean.iter().zip(b.chroma_mean.iter()) {
        diffs.push(normalized_abs_diff(*x, *y, EPS));
    }
    diffs.push(normalized_abs_diff(a.spectral_centroid, b.spectral_centroid, EPS));
    diffs.push(normalized_abs_diff(a.spectral_rolloff, b.spectral_rolloff, EPS));
    diffs.push(normalized_abs_diff(a.rhythm_strength, b.rhythm_strength, EPS));

    let mean_diff: f32 = diffs.iter().sum::<f32>() / diffs.len() as f32;
    (1.0 - mean_diff).clamp(0.0, 1.0)
}

fn normalized_abs_diff(a: f32, b: f32, eps: f32) -> f32 {
    let denom = a.abs().max(b.abs()).max(eps);
    (a - b).abs() / denom
}

/// Similarity between two Chromaprint vectors: `1 - hamming_distance /
/// bitlength`, computed bit-by-bit over the 32-bit words the two vectors
/// share (a vector longer than the other is truncated to the shorter one).
pub fn chromaprint_similarity(a: &[u32], b: &[u32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let len = a.len().min(b.len());
    let hamming: u32 = a[..len]
        .iter()
        .zip(b[..len].iter())
        .map(|(&x, &y)| (x ^ y).count_ones())
        .sum();
    let bitlength = (len * 32) as f32;
    1.0 - hamming as f32 / bitlength
}

/// exact hash=1.0, local-similarity>=0.7, chromaprint>=0.85 per the cascade.
pub const LOCAL_SIMILARITY_THRESHOLD: f32 = 0.7;
pub const CHROMAPRINT_SIMILARITY_THRESHOLD: f32 = 0.85;

/// Serialize a [`FeatureBundle`] to little-endian f32 bytes, in struct field
/// order, for storage as a `Feature`-algorithm Fingerprint row. Paired with
/// [`decode_feature_bundle`].
pub fn encode_feature_bundle(bundle: &FeatureBundle) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((bundle.mfcc_mean.len() + bundle.mfcc_variance.len() + bundle.chroma_mean.len() + 5) * 4);
    for v in bundle.mfcc_mean.iter().chain(bundle.mfcc_variance.iter()).chain(bundle.chroma_mean.iter()) {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    for v in [
        bundle.spectral_centroid,
        bundle.spectral_rolloff,
        bundle.zero_crossing_rate,
        bundle.rhythm_strength,
        bundle.harmonic_ratio,
        bundle.spectral_flux,
        bundle.rms,
    ] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`encode_feature_bundle`]. Panics on malformed input — a
/// corrupt `Feature` row is a storage bug, not a reachable runtime state.
pub fn decode_feature_bundle(bytes: &[u8]) -> FeatureBundle {
    let mut floats = bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    let mut next = || floats.next().expect("malformed feature fingerprint");

    let mut mfcc_mean = [0.0f32; 13];
    for slot in mfcc_mean.iter_mut() {
        *slot = next();
    }
    let mut mfcc_variance = [0.0f32; 13];
    for slot in mfcc_variance.iter_mut() {
        *slot = next();
    }
    let mut chroma_mean = [0.0f32; 12];
    for slot in chroma_mean.iter_mut() {
        *slot = next();
    }

    FeatureBundle {
        mfcc_mean,
        mfcc_variance,
        chroma_mean,
        spectral_centroid: next(),
        spectral_rolloff: next(),
        zero_crossing_rate: next(),
        rhythm_strength: next(),
        harmonic_ratio: next(),
        spectral_flux: next(),
        rms: next(),
    }
}
