//! Face alignment to the canonical 112×112 ArcFace layout.
//!
//! The five detected landmarks are fitted to the InsightFace reference
//! positions with a closed-form least-squares similarity transform
//! (scale, rotation, translation), then the frame is warped bilinearly.

use crate::frame::Frame;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }
        if energy < 1e-6 {
            return None;
        }

        let a = dot / energy;
        let b = cross / energy;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    /// Map an output pixel back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (self.a * dy - self.b * dx) / det))
    }
}

fn sample_bilinear(frame: &Frame, x: f32, y: f32) -> f32 {
    let (w, h) = (frame.width as i32, frame.height as i32);
    let at = |px: i32, py: i32| -> f32 {
        if px >= 0 && px < w && py >= 0 && py < h {
            frame.data[py as usize * w as usize + px as usize] as f32
        } else {
            0.0
        }
    };
    let (x0, y0) = (x.floor() as i32, y.floor() as i32);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
///
/// Degenerate landmark sets (all points coincident) produce a black crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Frame {
    let size = ALIGNED_SIZE as usize;
    let mut data = vec![0u8; size * size];

    if let Some(t) = Similarity::fit(landmarks, &REFERENCE_LANDMARKS_112) {
        for oy in 0..size {
            for ox in 0..size {
                if let Some((sx, sy)) = t.invert_point(ox as f32, oy as f32) {
                    data[oy * size + ox] = sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    Frame {
        data,
        width: ALIGNED_SIZE,
        height: ALIGNED_SIZE,
    }
}
