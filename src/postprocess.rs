// src/postprocess.rs
//
// Decodes a raw YOLO output tensor into image-space detections: tensor
// layout normalization, confidence filtering, inverse letterbox, clamping,
// and global non-maximum suppression. Pure functions, no I/O.

use crate::preprocessing::Letterbox;
use crate::types::{BoundingBox, Detection};
use anyhow::Result;

/// How the flattened output tensor is laid out after stripping the batch dim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TensorLayout {
    /// [attrs, candidates], the YOLOv8 export convention.
    ClassMajor { candidates: usize },
    /// [candidates, attrs]
    CandidateMajor { candidates: usize, attrs: usize },
}

fn resolve_layout(shape: &[usize], attrs: usize) -> Result<TensorLayout> {
    // Strip a leading batch dimension of 1 if present.
    let dims: Vec<usize> = match shape {
        [1, a, b] => vec![*a, *b],
        [a, b] => vec![*a, *b],
        other => anyhow::bail!("unexpected output tensor rank: {:?}", other),
    };

    if dims[1] == attrs {
        Ok(TensorLayout::CandidateMajor {
            candidates: dims[0],
            attrs,
        })
    } else if dims[0] == attrs {
        Ok(TensorLayout::ClassMajor {
            candidates: dims[1],
        })
    } else {
        anyhow::bail!(
            "output shape {:?} does not match {} attributes (4 + num classes)",
            dims,
            attrs
        )
    }
}

/// Decode a raw detector output into deduplicated image-space detections.
///
/// `shape` is the tensor shape as reported by the runtime, either
/// `[1, 4+nc, N]` (class-major) or `[1, N, 4+nc]` (candidate-major). Boxes
/// arrive in center form in model-input coordinates; the letterbox transform
/// is inverted and both corners clamped to the original image bounds.
/// A tensor with no candidate above `conf_threshold` yields an empty list.
pub fn decode(
    output: &[f32],
    shape: &[usize],
    lb: Letterbox,
    image_w: usize,
    image_h: usize,
    conf_threshold: f32,
    iou_threshold: f32,
    class_names: &[String],
) -> Result<Vec<Detection>> {
    let attrs = 4 + class_names.len();
    let layout = resolve_layout(shape, attrs)?;

    let (candidates, attr_at): (usize, Box<dyn Fn(usize, usize) -> f32>) = match layout {
        TensorLayout::ClassMajor { candidates } => (
            candidates,
            Box::new(move |i, k| output[k * candidates + i]),
        ),
        TensorLayout::CandidateMajor { candidates, attrs } => {
            (candidates, Box::new(move |i, k| output[i * attrs + k]))
        }
    };

    if output.len() < candidates * attrs {
        anyhow::bail!(
            "output tensor truncated: {} values for shape {:?}",
            output.len(),
            shape
        );
    }

    let mut detections = Vec::new();

    for i in 0..candidates {
        let mut max_conf = 0.0f32;
        let mut best_class = 0usize;
        for c in 0..class_names.len() {
            let conf = attr_at(i, 4 + c);
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < conf_threshold {
            continue;
        }

        let cx = attr_at(i, 0);
        let cy = attr_at(i, 1);
        let w = attr_at(i, 2);
        let h = attr_at(i, 3);

        // Center form -> corner form, then invert the letterbox transform.
        let bbox = BoundingBox::new(
            (cx - w / 2.0 - lb.pad_x) / lb.scale,
            (cy - h / 2.0 - lb.pad_y) / lb.scale,
            (cx + w / 2.0 - lb.pad_x) / lb.scale,
            (cy + h / 2.0 - lb.pad_y) / lb.scale,
        )
        .clamped(image_w as f32, image_h as f32);

        detections.push(Detection {
            class_id: best_class,
            class_name: class_name_for(best_class, class_names),
            confidence: max_conf,
            bbox,
        });
    }

    Ok(nms(detections, iou_threshold))
}

fn class_name_for(class_id: usize, class_names: &[String]) -> String {
    class_names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}

/// Greedy non-maximum suppression across all classes. Two boxes of different
/// classes still suppress each other, matching the detector's single-stage
/// multi-class output convention. Pairs at or below the IoU threshold both
/// survive.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| current.bbox.iou(&det.bbox) <= iou_threshold);
        keep.push(current);
    }

    keep
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a class-major [1, 4+nc, N] tensor from (cx, cy, w, h, class_id,
    /// score) rows, mirroring the YOLOv8 export layout.
    pub(crate) fn synthetic_tensor(
        boxes: &[(f32, f32, f32, f32, usize, f32)],
        num_classes: usize,
    ) -> (Vec<f32>, Vec<usize>) {
        let n = boxes.len();
        let attrs = 4 + num_classes;
        let mut out = vec![0.0f32; attrs * n];
        for (i, &(cx, cy, w, h, class_id, score)) in boxes.iter().enumerate() {
            out[i] = cx;
            out[n + i] = cy;
            out[2 * n + i] = w;
            out[3 * n + i] = h;
            out[(4 + class_id) * n + i] = score;
        }
        (out, vec![1, attrs, n])
    }

    fn names() -> Vec<String> {
        crate::types::default_class_names()
    }

    /// Apply the forward letterbox to an image-space corner box, producing
    /// the center-form model-space box the detector would emit.
    fn encode_box(bbox: &BoundingBox, lb: Letterbox) -> (f32, f32, f32, f32) {
        let x1 = bbox.x1 * lb.scale + lb.pad_x;
        let y1 = bbox.y1 * lb.scale + lb.pad_y;
        let x2 = bbox.x2 * lb.scale + lb.pad_x;
        let y2 = bbox.y2 * lb.scale + lb.pad_y;
        ((x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1)
    }

    #[test]
    fn letterbox_round_trip_recovers_original_box() {
        let (image_w, image_h) = (1280usize, 720usize);
        let lb = Letterbox::compute(image_w, image_h, 640);
        let original = BoundingBox::new(100.0, 200.0, 400.0, 600.0);
        let (cx, cy, w, h) = encode_box(&original, lb);

        let (out, shape) = synthetic_tensor(&[(cx, cy, w, h, 1, 0.9)], 8);
        let dets = decode(&out, &shape, lb, image_w, image_h, 0.5, 0.45, &names()).unwrap();

        assert_eq!(dets.len(), 1);
        let got = dets[0].bbox;
        for (a, b) in got.as_xyxy().iter().zip(original.as_xyxy().iter()) {
            assert!((a - b).abs() < 1.0, "expected {:?}, got {:?}", original, got);
        }
        assert_eq!(dets[0].class_name, "hardhat");
    }

    #[test]
    fn empty_tensor_yields_empty_list() {
        let (out, shape) = synthetic_tensor(&[(320.0, 320.0, 50.0, 50.0, 0, 0.2)], 8);
        let lb = Letterbox::compute(640, 640, 640);
        let dets = decode(&out, &shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn candidate_major_layout_decodes_identically() {
        let lb = Letterbox::compute(640, 640, 640);
        let n_classes = 8;
        let attrs = 4 + n_classes;

        let (class_major, cm_shape) =
            synthetic_tensor(&[(100.0, 100.0, 40.0, 40.0, 3, 0.8)], n_classes);

        // Transpose into [1, N, attrs].
        let mut candidate_major = vec![0.0f32; attrs];
        for k in 0..attrs {
            candidate_major[k] = class_major[k];
        }
        let c_shape = vec![1, 1, attrs];

        let a = decode(&class_major, &cm_shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        let b = decode(&candidate_major, &c_shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].bbox, b[0].bbox);
        assert_eq!(a[0].class_name, "safety_vest");
    }

    #[test]
    fn unknown_class_maps_to_placeholder() {
        // Two class names but a tensor scoring the third column high.
        let names = vec!["person".to_string(), "hardhat".to_string()];
        let n = 1;
        let attrs = 4 + 3;
        let mut out = vec![0.0f32; attrs * n];
        out[0] = 50.0;
        out[n] = 50.0;
        out[2 * n] = 20.0;
        out[3 * n] = 20.0;
        out[6 * n] = 0.9; // class id 2, outside the name table
        let shape = vec![1, attrs, n];

        let lb = Letterbox::compute(640, 640, 640);
        let dets = decode(
            &out,
            &shape,
            lb,
            640,
            640,
            0.5,
            0.45,
            &["person".to_string(), "hardhat".to_string(), "x".to_string()],
        )
        .unwrap();
        assert_eq!(dets.len(), 1);

        // Same data against the short table goes through the fallback path.
        let short = decode(&out, &shape, lb, 640, 640, 0.5, 0.45, &names);
        // Shape no longer matches 4 + 2 attributes, so it is rejected rather
        // than misread.
        assert!(short.is_err());
        assert_eq!(class_name_for(5, &names), "class_5");
    }

    #[test]
    fn boxes_clamp_to_image_bounds() {
        let lb = Letterbox::compute(640, 640, 640);
        let (out, shape) = synthetic_tensor(&[(630.0, 630.0, 100.0, 100.0, 0, 0.9)], 8);
        let dets = decode(&out, &shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert!(b.x2 <= 640.0 && b.y2 <= 640.0);
        assert!(b.x1 >= 0.0 && b.y1 >= 0.0);
    }

    #[test]
    fn nms_suppresses_heavy_overlap_keeps_light_overlap() {
        let lb = Letterbox::compute(640, 640, 640);

        // Two nearly identical hardhat boxes: one survivor.
        let (out, shape) = synthetic_tensor(
            &[
                (100.0, 100.0, 60.0, 60.0, 1, 0.9),
                (102.0, 102.0, 60.0, 60.0, 1, 0.85),
            ],
            8,
        );
        let dets = decode(&out, &shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);

        // Two well-separated boxes: both survive.
        let (out, shape) = synthetic_tensor(
            &[
                (100.0, 100.0, 60.0, 60.0, 1, 0.9),
                (400.0, 400.0, 60.0, 60.0, 1, 0.85),
            ],
            8,
        );
        let dets = decode(&out, &shape, lb, 640, 640, 0.5, 0.45, &names()).unwrap();
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn nms_is_global_across_classes() {
        let a = Detection {
            class_id: 1,
            class_name: "hardhat".to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 100.0, 100.0),
        };
        let b = Detection {
            class_id: 3,
            class_name: "safety_vest".to_string(),
            confidence: 0.8,
            bbox: BoundingBox::new(5.0, 5.0, 105.0, 105.0),
        };
        let kept = nms(vec![a, b], 0.45);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_name, "hardhat");
    }

    #[test]
    fn nms_boundary_iou_survives() {
        // IoU of exactly the threshold must not suppress.
        let a = Detection {
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        };
        // Overlap 50x100 over union 150 -> IoU = 1/3.
        let b = Detection {
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 0.8,
            bbox: BoundingBox::new(5.0, 0.0, 15.0, 10.0),
        };
        let iou = a.bbox.iou(&b.bbox);
        let kept = nms(vec![a, b], iou);
        assert_eq!(kept.len(), 2);
    }
}
