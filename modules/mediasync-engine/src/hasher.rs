//! Content hashing: exact digests and perceptual fingerprints.
//!
//! Two tiers. The exact digest (SHA-256) answers "are these the same
//! bytes" and is always computable. The perceptual fingerprint (64-bit DCT
//! hash over the luma plane) answers "is this the same picture" across
//! recompression and resizing, and exists only for decoded raster images.
//! Everything here is a pure function of its input.

use sha2::{Digest, Sha256};

use mediasync_common::{ContentDigest, PerceptualHash};

use crate::traits::RasterImage;

/// Side length of the downsampled luma grid the DCT runs over.
const GRID: usize = 32;
/// Side length of the low-frequency block kept from the DCT.
const BLOCK: usize = 8;

/// Exact content digest of a byte stream. Deterministic, collision-resistant.
pub fn digest(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentDigest(format!("{:x}", hasher.finalize()))
}

/// 64-bit DCT perceptual hash.
///
/// The luma plane is area-averaged down to a 32x32 grid, transformed with a
/// 2-D DCT, and the low-frequency 8x8 block is thresholded against its mean
/// (DC term excluded from the mean — it only tracks overall brightness).
/// Recompressed or resized exports of the same picture land on the same or
/// nearly the same bits.
pub fn fingerprint(image: &RasterImage) -> PerceptualHash {
    if image.width == 0 || image.height == 0 {
        return PerceptualHash(0);
    }

    let grid = resample(image);
    let coeffs = dct_2d(&grid);

    let mut block = [0.0f64; BLOCK * BLOCK];
    for v in 0..BLOCK {
        for u in 0..BLOCK {
            block[v * BLOCK + u] = coeffs[v * GRID + u];
        }
    }

    let mean: f64 = block.iter().skip(1).sum::<f64>() / (BLOCK * BLOCK - 1) as f64;

    let mut bits = 0u64;
    for (i, coeff) in block.iter().enumerate() {
        if *coeff > mean {
            bits |= 1 << i;
        }
    }
    PerceptualHash(bits)
}

/// Normalized Hamming distance between two fingerprints, in [0,1].
/// 0 means perceptually identical content; symmetric.
pub fn similarity(a: PerceptualHash, b: PerceptualHash) -> f64 {
    a.similarity(b)
}

/// Area-average the luma plane into a GRID x GRID grid of f64 samples.
fn resample(image: &RasterImage) -> Vec<f64> {
    let (w, h) = (image.width as usize, image.height as usize);
    let mut grid = vec![0.0f64; GRID * GRID];

    for gy in 0..GRID {
        let y0 = gy * h / GRID;
        let y1 = ((gy + 1) * h / GRID).max(y0 + 1).min(h.max(1));
        for gx in 0..GRID {
            let x0 = gx * w / GRID;
            let x1 = ((gx + 1) * w / GRID).max(x0 + 1).min(w.max(1));

            let mut sum = 0.0f64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += f64::from(image.luma_at(x as u32, y as u32));
                }
            }
            grid[gy * GRID + gx] = sum / ((y1 - y0) * (x1 - x0)) as f64;
        }
    }
    grid
}

/// Separable 2-D DCT-II over a GRID x GRID plane: rows, then columns.
fn dct_2d(input: &[f64]) -> Vec<f64> {
    let mut rows = vec![0.0f64; GRID * GRID];
    for y in 0..GRID {
        let transformed = dct_1d(&input[y * GRID..(y + 1) * GRID]);
        rows[y * GRID..(y + 1) * GRID].copy_from_slice(&transformed);
    }

    let mut out = vec![0.0f64; GRID * GRID];
    let mut column = [0.0f64; GRID];
    for x in 0..GRID {
        for y in 0..GRID {
            column[y] = rows[y * GRID + x];
        }
        let transformed = dct_1d(&column);
        for y in 0..GRID {
            out[y * GRID + x] = transformed[y];
        }
    }
    out
}

fn dct_1d(input: &[f64]) -> [f64; GRID] {
    let n = GRID as f64;
    let mut out = [0.0f64; GRID];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0f64;
        for (i, value) in input.iter().enumerate() {
            sum += value * (std::f64::consts::PI / n * (i as f64 + 0.5) * k as f64).cos();
        }
        *slot = sum;
    }
    out
}
