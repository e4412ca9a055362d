// src/preprocessing.rs

use anyhow::Result;

/// Pad value for the letterbox canvas (YOLO convention).
const PAD_VALUE: u8 = 114;

/// Parameters of the letterbox transform, needed to map model-space boxes
/// back into original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Compute the letterbox geometry for fitting (width, height) into a
    /// square target of `input_size`.
    pub fn compute(width: usize, height: usize, input_size: usize) -> Self {
        let scale =
            (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let scaled_w = (width as f32 * scale).round() as usize;
        let scaled_h = (height as f32 * scale).round() as usize;
        Self {
            scale,
            pad_x: (input_size - scaled_w) as f32 / 2.0,
            pad_y: (input_size - scaled_h) as f32 / 2.0,
        }
    }
}

/// Letterbox an RGB image into a normalized CHW tensor for model input.
///
/// Resizes preserving aspect ratio, centers onto a gray square canvas,
/// then converts HWC [0,255] to CHW [0,1].
pub fn letterbox_to_tensor(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    input_size: usize,
) -> Result<(Vec<f32>, Letterbox)> {
    if src.len() < src_w * src_h * 3 {
        anyhow::bail!(
            "frame data too short: {} bytes for {}x{}",
            src.len(),
            src_w,
            src_h
        );
    }

    let lb = Letterbox::compute(src_w, src_h, input_size);
    let scaled_w = (src_w as f32 * lb.scale).round() as usize;
    let scaled_h = (src_h as f32 * lb.scale).round() as usize;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![PAD_VALUE; input_size * input_size * 3];
    let off_x = lb.pad_x as usize;
    let off_y = lb.pad_y as usize;
    for y in 0..scaled_h {
        let src_row = y * scaled_w * 3;
        let dst_row = ((y + off_y) * input_size + off_x) * 3;
        canvas[dst_row..dst_row + scaled_w * 3]
            .copy_from_slice(&resized[src_row..src_row + scaled_w * 3]);
    }

    // HWC -> CHW, [0, 255] -> [0, 1]
    let mut input = vec![0.0f32; 3 * input_size * input_size];
    for c in 0..3 {
        for h in 0..input_size {
            for w in 0..input_size {
                let hwc_idx = (h * input_size + w) * 3 + c;
                let chw_idx = c * input_size * input_size + h * input_size + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    Ok((input, lb))
}

/// Bilinear image resize over interleaved RGB data.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;

            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);

            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }

    dst
}
