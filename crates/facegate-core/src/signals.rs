//! Heuristic per-face signals computed from the grayscale crop: a liveness
//! score and a coarse expression label.

use crate::frame::{mean_std, Frame};

const SIGNAL_CROP_SIZE: u32 = 160;

/// Liveness score baseline before texture and glare adjustments.
const LIVENESS_BASE: f32 = 50.0;
const GLARE_LEVEL: u8 = 220;

/// Variance of the 4-neighbour Laplacian over the interior pixels.
pub fn laplacian_variance(frame: &Frame) -> f32 {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: usize, y: usize| frame.data[y * w + x] as f64;

    let mut n = 0f64;
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            n += 1.0;
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

/// Liveness score in [0, 100] for a face crop.
///
/// Real skin at capture distance has moderate high-frequency texture. Flat
/// prints and over-smoothed replays score low variance; screen moiré and
/// heavy sharpening score very high variance; glossy photos show glare.
pub fn liveness_score(face: &Frame) -> f32 {
    let crop = face.resize(SIGNAL_CROP_SIZE, SIGNAL_CROP_SIZE);
    let variance = laplacian_variance(&crop);

    let mut score = LIVENESS_BASE;
    if (60.0..=1000.0).contains(&variance) {
        score += 20.0;
    } else if variance < 40.0 {
        score -= 70.0;
    } else if variance > 1400.0 {
        score -= 80.0;
    }

    let glare = crop.data.iter().filter(|&&p| p >= GLARE_LEVEL).count() as f32 / crop.data.len() as f32;
    if glare > 0.10 {
        score -= 100.0;
    } else if glare > 0.03 {
        score -= 20.0;
    }

    score.clamp(0.0, 100.0)
}

/// Coarse expression label for a face crop.
pub fn expression_label(face: &Frame) -> &'static str {
    let crop = face.resize(SIGNAL_CROP_SIZE, SIGNAL_CROP_SIZE);
    let (avg, std) = mean_std(crop.data.iter().copied());
    let variance = std * std;

    let size = SIGNAL_CROP_SIZE as usize;
    let mouth_top = size * 7 / 10;
    let (mouth_avg, _) = mean_std(crop.data[mouth_top * size..].iter().copied());

    if variance > 3000.0 {
        "Expressive"
    } else if avg > 200.0 {
        "Surprised"
    } else if mouth_avg > avg * 1.2 {
        "Happy"
    } else if avg < 70.0 {
        "Serious"
    } else {
        "Neutral"
    }
}
