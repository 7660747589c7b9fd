use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use tracing::debug;

use crate::error::{ensure_eq, CascadeError, Result};
use crate::rcnn::bbox::{bbox_transform, BBoxWeights};

/// Turns one stage's class-agnostic deltas into the next stage's proposals.
#[derive(Debug, Clone)]
pub struct DecodeBBoxes {
    bbox_reg_weights: BBoxWeights,
    cls_agnostic_bbox_reg: bool,
}

impl DecodeBBoxes {
    pub fn new(bbox_reg_weights: BBoxWeights, cls_agnostic_bbox_reg: bool) -> Self {
        DecodeBBoxes {
            bbox_reg_weights,
            cls_agnostic_bbox_reg,
        }
    }

    /// * `bbox_deltas` - predicted deltas, N * 8; the last 4 columns are used
    /// * `rois` - prior boxes, N * 5 `(batch_idx, x1, y1, x2, y2)`
    /// * `mapped_gt_boxes` - N * 5, present during training only
    ///
    /// Returns `(batch_idx, x1, y1, x2, y2)` rows. When `mapped_gt_boxes` is
    /// given, degenerate boxes and ground-truth rows (overlap 1.0) are dropped.
    pub fn forward(
        &self,
        bbox_deltas: ArrayView2<f32>,
        rois: ArrayView2<f32>,
        mapped_gt_boxes: Option<ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        if !self.cls_agnostic_bbox_reg || bbox_deltas.ncols() != 8 {
            return Err(CascadeError::ClassAgnosticRequired {
                cls_agnostic: self.cls_agnostic_bbox_reg,
                columns: bbox_deltas.ncols(),
            });
        }
        ensure_eq("decode_bboxes rois columns", 5, rois.ncols())?;
        ensure_eq("decode_bboxes rows", rois.nrows(), bbox_deltas.nrows())?;

        let deltas = bbox_deltas.slice(s![.., 4..]);
        let decoded = bbox_transform(rois.slice(s![.., 1..]), deltas, &self.bbox_reg_weights)?;

        let keep: Vec<usize> = match mapped_gt_boxes {
            Some(mapped) => {
                ensure_eq("decode_bboxes mapped_gt_boxes columns", 5, mapped.ncols())?;
                ensure_eq("decode_bboxes mapped_gt_boxes rows", rois.nrows(), mapped.nrows())?;
                filter_boxes(decoded.view(), mapped.column(4))
            }
            None => (0..decoded.nrows()).collect(),
        };

        let mut out = Array2::<f32>::zeros((keep.len(), 5));
        for (row, &i) in keep.iter().enumerate() {
            out[[row, 0]] = rois[[i, 0]];
            out.slice_mut(s![row, 1..]).assign(&decoded.row(i));
        }
        debug!("decode_bboxes: {} priors -> {} proposals", rois.nrows(), out.nrows());
        Ok(out)
    }
}

/// Indices of boxes with positive width and height that are not ground truth.
fn filter_boxes(boxes: ArrayView2<f32>, max_overlap: ArrayView1<f32>) -> Vec<usize> {
    boxes
        .axis_iter(Axis(0))
        .zip(max_overlap.iter())
        .enumerate()
        .filter(|(_, (b, &ov))| {
            let ws = b[2] - b[0] + 1.0;
            let hs = b[3] - b[1] + 1.0;
            ws > 0.0 && hs > 0.0 && ov < 1.0
        })
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const WEIGHTS: BBoxWeights = [10.0, 10.0, 5.0, 5.0];

    #[test]
    fn test_decode_drops_gt_rows() {
        let op = DecodeBBoxes::new(WEIGHTS, true);
        let deltas = Array2::<f32>::zeros((3, 8));
        let rois = array![
            [0.0, 0.0, 0.0, 9.0, 9.0],
            [0.0, 10.0, 10.0, 19.0, 19.0],
            [1.0, 20.0, 20.0, 39.0, 39.0]
        ];
        let mapped = array![
            [0.0, 0.0, 9.0, 9.0, 0.7],
            [10.0, 10.0, 19.0, 19.0, 1.0],
            [20.0, 20.0, 39.0, 39.0, 0.3]
        ];
        let out = op.forward(deltas.view(), rois.view(), Some(mapped.view())).unwrap();
        assert_eq!(out.nrows(), 2);
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[1, 0]], 1.0);
        // zero deltas reproduce the priors
        assert_eq!(out.row(1), rois.row(2));
    }

    #[test]
    fn test_decode_drops_degenerate_boxes() {
        let op = DecodeBBoxes::new([1.0, 1.0, 1.0, 1.0], true);
        // a large negative dw collapses the second box below one pixel
        let mut deltas = Array2::<f32>::zeros((2, 8));
        deltas[[1, 6]] = -50.0;
        let rois = array![[0.0, 0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 0.0, 9.0, 9.0]];
        let mapped = array![[0.0, 0.0, 9.0, 9.0, 0.5], [0.0, 0.0, 9.0, 9.0, 0.5]];
        let out = op.forward(deltas.view(), rois.view(), Some(mapped.view())).unwrap();
        assert_eq!(out.nrows(), 1);
    }

    #[test]
    fn test_decode_inference_keeps_all_rows() {
        let op = DecodeBBoxes::new(WEIGHTS, true);
        let mut deltas = Array2::<f32>::zeros((2, 8));
        // the first four columns are ignored
        deltas[[0, 0]] = 100.0;
        deltas[[0, 4]] = 10.0;
        let rois = array![[0.0, 0.0, 0.0, 9.0, 9.0], [0.0, 5.0, 5.0, 14.0, 14.0]];
        let out = op.forward(deltas.view(), rois.view(), None).unwrap();
        assert_eq!(out.nrows(), 2);
        // dx = 10 / 10 shifts by one width
        assert!((out[[0, 1]] - 10.0).abs() < 1e-5);
        assert!((out[[0, 3]] - 19.0).abs() < 1e-5);
    }

    #[test]
    fn test_decode_requires_cls_agnostic() {
        let rois = array![[0.0, 0.0, 0.0, 9.0, 9.0]];
        let op = DecodeBBoxes::new(WEIGHTS, false);
        let err = op.forward(Array2::<f32>::zeros((1, 8)).view(), rois.view(), None).unwrap_err();
        assert!(matches!(err, CascadeError::ClassAgnosticRequired { .. }));

        let op = DecodeBBoxes::new(WEIGHTS, true);
        let err = op.forward(Array2::<f32>::zeros((1, 12)).view(), rois.view(), None).unwrap_err();
        assert!(matches!(err, CascadeError::ClassAgnosticRequired { columns: 12, .. }));
    }

    #[test]
    fn test_decode_rejects_row_mismatch() {
        let op = DecodeBBoxes::new(WEIGHTS, true);
        let rois = array![[0.0, 0.0, 0.0, 9.0, 9.0]];
        assert!(op.forward(Array2::<f32>::zeros((2, 8)).view(), rois.view(), None).is_err());
    }
}
