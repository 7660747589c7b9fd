use ndarray::{s, ArrayView1, ArrayView2};

use crate::error::{ensure_eq, CascadeError, Result};
use crate::rcnn::bbox::{decode, iou, BBoxWeights};

/// Mean IoU of regressed boxes against their gt, next to the mean IoU the
/// same boxes had before regression.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBoxAccuracy {
    pub avg_iou: f32,
    pub pre_avg_iou: f32,
}

/// Non-differentiable IoU metric over foreground, non-gt boxes.
#[derive(Debug, Clone)]
pub struct BBoxAccuracyOp {
    bbox_reg_weights: BBoxWeights,
    cls_agnostic_bbox_reg: bool,
}

impl BBoxAccuracyOp {
    pub fn new(bbox_reg_weights: BBoxWeights, cls_agnostic_bbox_reg: bool) -> Self {
        BBoxAccuracyOp {
            bbox_reg_weights,
            cls_agnostic_bbox_reg,
        }
    }

    /// * `bbox_deltas` - N * 4C predicted deltas
    /// * `rois` - N * 5 priors
    /// * `labels` - N class ids
    /// * `mapped_gt_boxes` - N * 5 `(gt box, overlap)`
    ///
    /// With no qualifying rows both averages are 0.
    pub fn forward(
        &self,
        bbox_deltas: ArrayView2<f32>,
        rois: ArrayView2<f32>,
        labels: ArrayView1<i32>,
        mapped_gt_boxes: ArrayView2<f32>,
    ) -> Result<BBoxAccuracy> {
        let n = rois.nrows();
        ensure_eq("bbox_accuracy rois columns", 5, rois.ncols())?;
        ensure_eq("bbox_accuracy mapped_gt_boxes columns", 5, mapped_gt_boxes.ncols())?;
        ensure_eq("bbox_accuracy deltas rows", n, bbox_deltas.nrows())?;
        ensure_eq("bbox_accuracy labels", n, labels.len())?;
        ensure_eq("bbox_accuracy mapped_gt_boxes rows", n, mapped_gt_boxes.nrows())?;
        if bbox_deltas.ncols() < 4 || bbox_deltas.ncols() % 4 != 0 {
            return Err(CascadeError::ShapeMismatch {
                context: "bbox_accuracy deltas columns",
                expected: "a positive multiple of 4".to_string(),
                actual: bbox_deltas.ncols().to_string(),
            });
        }

        let mut num_boxes = 0usize;
        let mut iou_sum = 0.0f32;
        let mut pre_iou_sum = 0.0f32;
        for i in 0..n {
            let label = labels[i];
            let overlap = mapped_gt_boxes[[i, 4]];
            if label <= 0 || overlap >= 1.0 {
                continue;
            }
            let cols = if self.cls_agnostic_bbox_reg {
                let c = bbox_deltas.ncols();
                c - 4..c
            } else {
                let start = 4 * label as usize;
                if start + 4 > bbox_deltas.ncols() {
                    return Err(CascadeError::LabelOutOfRange {
                        label,
                        num_classes: bbox_deltas.ncols() / 4,
                    });
                }
                start..start + 4
            };
            let pred = decode(
                rois.slice(s![i, 1..]),
                bbox_deltas.slice(s![i, cols]),
                &self.bbox_reg_weights,
            );
            iou_sum += iou(mapped_gt_boxes.slice(s![i, ..4]), ArrayView1::from(&pred[..]));
            pre_iou_sum += overlap;
            num_boxes += 1;
        }

        if num_boxes == 0 {
            return Ok(BBoxAccuracy::default());
        }
        Ok(BBoxAccuracy {
            avg_iou: iou_sum / num_boxes as f32,
            pre_avg_iou: pre_iou_sum / num_boxes as f32,
        })
    }
}
