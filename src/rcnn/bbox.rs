use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{ensure_eq, Result};

/// Per-stage normalisation weights `(wx, wy, ww, wh)` for regression deltas.
pub type BBoxWeights = [f32; 4];

#[inline]
fn width_height(b: ArrayView1<f32>) -> (f32, f32) {
    (b[2] - b[0] + 1.0, b[3] - b[1] + 1.0)
}

/// Encodes `target` relative to `reference` as `(dx, dy, dw, dh)`.
///
/// The reference box must have a positive width and height.
pub fn encode(reference: ArrayView1<f32>, target: ArrayView1<f32>, weights: &BBoxWeights) -> [f32; 4] {
    let (ex_w, ex_h) = width_height(reference);
    let ex_ctr_x = reference[0] + 0.5 * ex_w;
    let ex_ctr_y = reference[1] + 0.5 * ex_h;

    let (gt_w, gt_h) = width_height(target);
    let gt_ctr_x = target[0] + 0.5 * gt_w;
    let gt_ctr_y = target[1] + 0.5 * gt_h;

    let [wx, wy, ww, wh] = *weights;
    [
        wx * (gt_ctr_x - ex_ctr_x) / ex_w,
        wy * (gt_ctr_y - ex_ctr_y) / ex_h,
        ww * (gt_w / ex_w).ln(),
        wh * (gt_h / ex_h).ln(),
    ]
}

/// Applies `delta` to `reference`; the inverse of [`encode`].
///
/// `dw` and `dh` are not clipped.
pub fn decode(reference: ArrayView1<f32>, delta: ArrayView1<f32>, weights: &BBoxWeights) -> [f32; 4] {
    let (w, h) = width_height(reference);
    let ctr_x = reference[0] + 0.5 * w;
    let ctr_y = reference[1] + 0.5 * h;

    let [wx, wy, ww, wh] = *weights;
    let dx = delta[0] / wx;
    let dy = delta[1] / wy;
    let dw = delta[2] / ww;
    let dh = delta[3] / wh;

    let pred_ctr_x = dx * w + ctr_x;
    let pred_ctr_y = dy * h + ctr_y;
    let pred_w = dw.exp() * w;
    let pred_h = dh.exp() * h;

    [
        pred_ctr_x - 0.5 * pred_w,
        pred_ctr_y - 0.5 * pred_h,
        pred_ctr_x + 0.5 * pred_w - 1.0,
        pred_ctr_y + 0.5 * pred_h - 1.0,
    ]
}

/// Intersection over union of two boxes with inclusive pixel coordinates.
pub fn iou(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let iw = a[2].min(b[2]) - a[0].max(b[0]) + 1.0;
    if iw <= 0.0 {
        return 0.0;
    }
    let ih = a[3].min(b[3]) - a[1].max(b[1]) + 1.0;
    if ih <= 0.0 {
        return 0.0;
    }
    let (aw, ah) = width_height(a);
    let (bw, bh) = width_height(b);
    let inter = iw * ih;
    inter / (aw * ah + bw * bh - inter)
}

/// Row-wise [`encode`]: regression targets mapping `ex_rois` onto `gt_rois`.
pub fn bbox_transform_inv(
    ex_rois: ArrayView2<f32>,
    gt_rois: ArrayView2<f32>,
    weights: &BBoxWeights,
) -> Result<Array2<f32>> {
    ensure_eq("bbox_transform_inv ex_rois columns", 4, ex_rois.ncols())?;
    ensure_eq("bbox_transform_inv gt_rois columns", 4, gt_rois.ncols())?;
    ensure_eq("bbox_transform_inv rows", ex_rois.nrows(), gt_rois.nrows())?;

    let mut targets = Array2::<f32>::zeros((ex_rois.nrows(), 4));
    for (i, (ex, gt)) in ex_rois.outer_iter().zip(gt_rois.outer_iter()).enumerate() {
        let t = encode(ex, gt, weights);
        targets.row_mut(i).assign(&ArrayView1::from(&t[..]));
    }
    Ok(targets)
}

/// Row-wise [`decode`]: boxes predicted by applying `deltas` to `boxes`.
///
/// `deltas` must have exactly 4 columns; callers slice the class they want.
pub fn bbox_transform(
    boxes: ArrayView2<f32>,
    deltas: ArrayView2<f32>,
    weights: &BBoxWeights,
) -> Result<Array2<f32>> {
    ensure_eq("bbox_transform boxes columns", 4, boxes.ncols())?;
    ensure_eq("bbox_transform deltas columns", 4, deltas.ncols())?;
    ensure_eq("bbox_transform rows", boxes.nrows(), deltas.nrows())?;

    let mut pred = Array2::<f32>::zeros((boxes.nrows(), 4));
    for (i, (b, d)) in boxes.outer_iter().zip(deltas.outer_iter()).enumerate() {
        let p = decode(b, d, weights);
        pred.row_mut(i).assign(&ArrayView1::from(&p[..]));
    }
    Ok(pred)
}

/// Pairwise IoU matrix, `boxes.nrows() x query_boxes.nrows()`.
pub fn bbox_overlaps(boxes: ArrayView2<f32>, query_boxes: ArrayView2<f32>) -> Result<Array2<f32>> {
    ensure_eq("bbox_overlaps boxes columns", 4, boxes.ncols())?;
    ensure_eq("bbox_overlaps query_boxes columns", 4, query_boxes.ncols())?;

    let n = boxes.nrows();
    let k = query_boxes.nrows();
    let mut overlaps = Array2::<f32>::zeros((n, k));
    for (k_idx, q) in query_boxes.outer_iter().enumerate() {
        for (n_idx, b) in boxes.outer_iter().enumerate() {
            overlaps[(n_idx, k_idx)] = iou(b, q);
        }
    }
    Ok(overlaps)
}

/// `(x2 - x1 + 1) * (y2 - y1 + 1)` for every row.
pub fn boxes_area(boxes: ArrayView2<f32>) -> Array1<f32> {
    boxes
        .outer_iter()
        .map(|b| {
            let (w, h) = width_height(b);
            w * h
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_encode_decode_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights_set: [BBoxWeights; 3] = [[10.0, 10.0, 5.0, 5.0], [20.0, 20.0, 10.0, 10.0], [1.0, 1.0, 1.0, 1.0]];
        for weights in weights_set.iter() {
            for _ in 0..50 {
                let x1: f32 = rng.gen_range(0.0..400.0);
                let y1: f32 = rng.gen_range(0.0..400.0);
                let reference = array![x1, y1, x1 + rng.gen_range(1.0..200.0), y1 + rng.gen_range(1.0..200.0)];
                let tx1: f32 = rng.gen_range(0.0..400.0);
                let ty1: f32 = rng.gen_range(0.0..400.0);
                let target = array![tx1, ty1, tx1 + rng.gen_range(1.0..200.0), ty1 + rng.gen_range(1.0..200.0)];

                let delta = encode(reference.view(), target.view(), weights);
                let decoded = decode(reference.view(), ArrayView1::from(&delta[..]), weights);
                for j in 0..4 {
                    assert!((decoded[j] - target[j]).abs() < 1e-2, "{:?} vs {:?}", decoded, target);
                }
            }
        }
    }

    #[test]
    fn test_encode_identity_is_zero() {
        let b = array![10.0, 20.0, 49.0, 59.0];
        let delta = encode(b.view(), b.view(), &[10.0, 10.0, 5.0, 5.0]);
        for d in delta.iter() {
            assert!(d.abs() < 1e-6);
        }
    }

    #[test]
    fn test_iou() {
        let a = array![0.0, 0.0, 9.0, 9.0];
        let b = array![5.0, 0.0, 14.0, 9.0];
        let c = array![20.0, 20.0, 30.0, 30.0];

        assert_eq!(iou(a.view(), a.view()), 1.0);
        assert_eq!(iou(a.view(), b.view()), iou(b.view(), a.view()));
        // 5x10 overlap, 100 + 100 - 50 union
        assert!((iou(a.view(), b.view()) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(a.view(), c.view()), 0.0);
    }

    #[test]
    fn test_bbox_overlaps() {
        let boxes = array![[0.0, 0.0, 9.0, 9.0], [100.0, 100.0, 109.0, 109.0]];
        let query = array![[0.0, 0.0, 9.0, 9.0], [5.0, 0.0, 14.0, 9.0], [50.0, 50.0, 60.0, 60.0]];
        let overlaps = bbox_overlaps(boxes.view(), query.view()).unwrap();
        assert_eq!(overlaps.dim(), (2, 3));
        assert_eq!(overlaps[(0, 0)], 1.0);
        assert!((overlaps[(0, 1)] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(overlaps.row(1).sum(), 0.0);
    }

    #[test]
    fn test_bbox_transform_rejects_bad_columns() {
        let boxes = array![[0.0, 0.0, 9.0, 9.0]];
        let deltas = array![[0.0, 0.0, 0.0, 0.0, 0.0]];
        assert!(bbox_transform(boxes.view(), deltas.view(), &[1.0; 4]).is_err());
    }

    #[test]
    fn test_boxes_area() {
        let boxes = array![[0.0, 0.0, 9.0, 4.0], [0.0, 0.0, 0.0, 0.0]];
        assert_eq!(boxes_area(boxes.view()), array![50.0, 1.0]);
    }
}
