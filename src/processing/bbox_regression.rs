use ndarray::{s, Array2, ArrayView1, ArrayView2};

use crate::error::{ensure_eq, CascadeError, Result};
use crate::rcnn::bbox::{bbox_transform_inv, BBoxWeights};

/// compute_targets: regression targets for an image in compact form.
///
/// * `ex_rois` - sampled boxes, k * 4
/// * `gt_rois` - ground-truth box assigned to each sampled box, k * 4
/// * `labels` - class per sampled box, k
/// * `return` - targets[i] = [class, dx, dy, dw, dh], k * 5
///
/// Rows with label 0 still carry their encoded deltas; they are dropped by
/// [`expand_bbox_targets`].
pub fn compute_targets(
    ex_rois: ArrayView2<f32>,
    gt_rois: ArrayView2<f32>,
    labels: ArrayView1<i32>,
    weights: &BBoxWeights,
) -> Result<Array2<f32>> {
    ensure_eq("compute_targets labels", ex_rois.nrows(), labels.len())?;
    let deltas = bbox_transform_inv(ex_rois, gt_rois, weights)?;

    let mut targets = Array2::<f32>::zeros((ex_rois.nrows(), 5));
    targets.column_mut(0).assign(&labels.mapv(|l| l as f32));
    targets.slice_mut(s![.., 1..]).assign(&deltas);
    Ok(targets)
}

/// expand_bbox_targets
/// Expands compact `[class, dx, dy, dw, dh]` rows into the 4-of-4*C layout
/// the network predicts; only the assigned class has non-zero targets.
/// With class-agnostic regression C = 2 and every foreground row lands in
/// slot 1.
///
/// Returns `(bbox_targets, bbox_inside_weights)`, both k * 4C.
pub fn expand_bbox_targets(
    bbox_target_data: ArrayView2<f32>,
    num_classes: usize,
    cls_agnostic: bool,
) -> Result<(Array2<f32>, Array2<f32>)> {
    ensure_eq("expand_bbox_targets columns", 5, bbox_target_data.ncols())?;
    let num_bbox_reg_classes = if cls_agnostic { 2 } else { num_classes };

    let k = bbox_target_data.nrows();
    let mut bbox_targets = Array2::<f32>::zeros((k, 4 * num_bbox_reg_classes));
    let mut bbox_inside_weights = Array2::<f32>::zeros((k, 4 * num_bbox_reg_classes));

    for (index, row) in bbox_target_data.outer_iter().enumerate() {
        let cls = row[0];
        if cls <= 0.0 {
            continue;
        }
        let cls = if cls_agnostic { 1 } else { cls as usize };
        if cls >= num_bbox_reg_classes {
            return Err(CascadeError::LabelOutOfRange {
                label: cls as i32,
                num_classes: num_bbox_reg_classes,
            });
        }
        let start = 4 * cls;
        let end = start + 4;
        bbox_targets.slice_mut(s![index, start..end]).assign(&row.slice(s![1..5]));
        bbox_inside_weights.slice_mut(s![index, start..end]).fill(1.0);
    }

    Ok((bbox_targets, bbox_inside_weights))
}

/// Outside weights normalise the loss over active entries only.
pub fn outside_weights(bbox_inside_weights: ArrayView2<f32>) -> Array2<f32> {
    bbox_inside_weights.mapv(|w| if w > 0.0 { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_compute_targets() {
        let ex = array![[0.0, 0.0, 9.0, 9.0], [10.0, 10.0, 29.0, 29.0]];
        let gt = array![[0.0, 0.0, 9.0, 9.0], [10.0, 10.0, 49.0, 29.0]];
        let labels = array![1, 0];
        let targets = compute_targets(ex.view(), gt.view(), labels.view(), &[1.0, 1.0, 1.0, 1.0]).unwrap();

        assert_eq!(targets.dim(), (2, 5));
        assert_eq!(targets.row(0), array![1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(targets[[1, 0]], 0.0);
        // gt is twice as wide: dx = (30 - 20) / 20, dw = ln 2
        assert!((targets[[1, 1]] - 0.5).abs() < 1e-6);
        assert!((targets[[1, 3]] - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_expand_bbox_targets_per_class() {
        let bbox_targets_data = array![
            [1.0, 0.1, 0.2, 0.3, 0.4],
            [2.0, 0.2, 0.3, 0.4, 0.5],
            [0.0, 0.9, 0.9, 0.9, 0.9],
            [1.0, 0.3, 0.4, 0.5, 0.6]
        ];

        let (targets, inside) = expand_bbox_targets(bbox_targets_data.view(), 3, false).unwrap();
        assert_eq!(targets.dim(), (4, 12));

        for (row, cls) in [(0usize, 1usize), (1, 2), (3, 1)] {
            for col in 0..12 {
                let active = col >= 4 * cls && col < 4 * cls + 4;
                assert_eq!(inside[[row, col]], if active { 1.0 } else { 0.0 });
                if !active {
                    assert_eq!(targets[[row, col]], 0.0);
                }
            }
            assert_eq!(targets.slice(s![row, 4 * cls..4 * cls + 4]), bbox_targets_data.slice(s![row, 1..5]));
        }
        // background rows are all zero
        assert_eq!(targets.row(2).sum(), 0.0);
        assert_eq!(inside.row(2).sum(), 0.0);

        let outside = outside_weights(inside.view());
        assert_eq!(outside, inside);
    }

    #[test]
    fn test_expand_bbox_targets_cls_agnostic() {
        let data = array![[5.0, 0.1, 0.2, 0.3, 0.4], [0.0, 0.0, 0.0, 0.0, 0.0]];
        let (targets, inside) = expand_bbox_targets(data.view(), 81, true).unwrap();
        assert_eq!(targets.dim(), (2, 8));
        assert_eq!(targets.slice(s![0, 4..8]), array![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(inside.slice(s![0, ..4]).sum(), 0.0);
        assert_eq!(inside.slice(s![0, 4..]).sum(), 4.0);
        assert_eq!(inside.row(1).sum(), 0.0);
    }

    #[test]
    fn test_expand_bbox_targets_label_out_of_range() {
        let data = array![[3.0, 0.1, 0.2, 0.3, 0.4]];
        let err = expand_bbox_targets(data.view(), 3, false).unwrap_err();
        assert!(matches!(err, CascadeError::LabelOutOfRange { label: 3, num_classes: 3 }));
    }
}
