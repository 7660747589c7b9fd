use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView2, Axis};
use tracing::debug;

use crate::error::{ensure_eq, CascadeError, Result};
use crate::rcnn::bbox::bbox_overlaps;

/// Per-image record the sampler works from.
///
/// Rows of `boxes` are in original-image pixels; ground-truth rows come
/// first and have `gt_classes > 0`, proposals follow with class 0.
#[derive(Debug, Clone)]
pub struct RoidbEntry {
    pub boxes: Array2<f32>,
    pub gt_classes: Array1<i32>,
    pub max_overlaps: Array1<f32>,
    pub max_classes: Array1<i32>,
    /// Index into the ground-truth rows, `-1` when the box overlaps no gt.
    pub box_to_gt_ind_map: Array1<i32>,
    /// Precomputed compact targets `[class, dx, dy, dw, dh]`, one per box.
    pub bbox_targets: Option<Array2<f32>>,
    /// `(x, y, visibility)` per keypoint, shape `boxes x 3 x K`.
    pub gt_keypoints: Option<Array3<f32>>,
}

impl RoidbEntry {
    /// Entry holding only ground-truth boxes; each gt overlaps itself fully.
    pub fn from_gt(gt_boxes: Array2<f32>, gt_classes: Array1<i32>) -> Result<Self> {
        ensure_eq("roidb gt box columns", 4, gt_boxes.ncols())?;
        ensure_eq("roidb gt classes", gt_boxes.nrows(), gt_classes.len())?;
        let n = gt_boxes.nrows();
        Ok(RoidbEntry {
            boxes: gt_boxes,
            max_overlaps: Array1::ones(n),
            max_classes: gt_classes.clone(),
            gt_classes,
            box_to_gt_ind_map: (0..n as i32).collect(),
            bbox_targets: None,
            gt_keypoints: None,
        })
    }

    pub fn num_boxes(&self) -> usize {
        self.boxes.nrows()
    }

    /// Row indices of the ground-truth boxes.
    pub fn gt_inds(&self) -> Vec<usize> {
        self.gt_classes
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn gt_boxes(&self) -> Array2<f32> {
        self.boxes.select(Axis(0), &self.gt_inds())
    }

    /// Checks that every per-box array agrees with `boxes` on the row count.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_boxes();
        ensure_eq("roidb box columns", 4, self.boxes.ncols())?;
        ensure_eq("roidb gt_classes", n, self.gt_classes.len())?;
        ensure_eq("roidb max_overlaps", n, self.max_overlaps.len())?;
        ensure_eq("roidb max_classes", n, self.max_classes.len())?;
        ensure_eq("roidb box_to_gt_ind_map", n, self.box_to_gt_ind_map.len())?;
        if let Some(targets) = &self.bbox_targets {
            ensure_eq("roidb bbox_targets rows", n, targets.nrows())?;
            ensure_eq("roidb bbox_targets columns", 5, targets.ncols())?;
        }
        if let Some(kps) = &self.gt_keypoints {
            ensure_eq("roidb gt_keypoints rows", n, kps.dim().0)?;
            ensure_eq("roidb gt_keypoints coords", 3, kps.dim().1)?;
        }
        Ok(())
    }

    /// Appends `proposals` (original-image pixels) and labels them by their
    /// best-overlapping ground-truth box.
    pub fn add_proposals(&mut self, proposals: ArrayView2<f32>) -> Result<()> {
        ensure_eq("proposal columns", 4, proposals.ncols())?;
        let num = proposals.nrows();
        let gt_inds = self.gt_inds();

        let mut max_overlaps = Array1::<f32>::zeros(num);
        let mut max_classes = Array1::<i32>::zeros(num);
        let mut box_to_gt = Array1::<i32>::from_elem(num, -1);

        if !gt_inds.is_empty() && num > 0 {
            let gt_boxes = self.boxes.select(Axis(0), &gt_inds);
            let overlaps = bbox_overlaps(proposals, gt_boxes.view())?;
            for (i, row) in overlaps.outer_iter().enumerate() {
                let mut best = 0usize;
                for (j, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = j;
                    }
                }
                if row[best] > 0.0 {
                    max_overlaps[i] = row[best];
                    max_classes[i] = self.gt_classes[gt_inds[best]];
                    box_to_gt[i] = best as i32;
                }
            }
        }

        self.boxes = concatenate(Axis(0), &[self.boxes.view(), proposals.reborrow()])
            .map_err(|e| shape_error("roidb boxes", e))?;
        self.gt_classes = concatenate(Axis(0), &[self.gt_classes.view(), Array1::<i32>::zeros(num).view()])
            .map_err(|e| shape_error("roidb gt_classes", e))?;
        self.max_overlaps = concatenate(Axis(0), &[self.max_overlaps.view(), max_overlaps.view()])
            .map_err(|e| shape_error("roidb max_overlaps", e))?;
        self.max_classes = concatenate(Axis(0), &[self.max_classes.view(), max_classes.view()])
            .map_err(|e| shape_error("roidb max_classes", e))?;
        self.box_to_gt_ind_map = concatenate(Axis(0), &[self.box_to_gt_ind_map.view(), box_to_gt.view()])
            .map_err(|e| shape_error("roidb box_to_gt_ind_map", e))?;
        // Stale once new rows exist.
        self.bbox_targets = None;
        if let Some(kps) = &self.gt_keypoints {
            let (_, c, k) = kps.dim();
            let pad = Array3::<f32>::zeros((num, c, k));
            self.gt_keypoints = Some(
                concatenate(Axis(0), &[kps.view(), pad.view()]).map_err(|e| shape_error("roidb gt_keypoints", e))?,
            );
        }

        debug!(
            "roidb: added {} proposals, {} gt boxes, {} total",
            num,
            gt_inds.len(),
            self.num_boxes()
        );
        Ok(())
    }
}

fn shape_error(context: &'static str, e: ndarray::ShapeError) -> CascadeError {
    CascadeError::ShapeMismatch {
        context,
        expected: "compatible shapes".to_string(),
        actual: e.to_string(),
    }
}

/// Builds a fresh entry per image from the gt rows of `roidb` and the RoIs of
/// that image in `rois` (`batch_idx, x1, y1, x2, y2`, network pixels).
///
/// RoIs are mapped back to original-image pixels with `1 / im_scale`.
pub fn add_proposals(roidb: &[RoidbEntry], rois: ArrayView2<f32>, im_scales: &[f32]) -> Result<Vec<RoidbEntry>> {
    ensure_eq("proposal rois columns", 5, rois.ncols())?;
    ensure_eq("im_scales per image", roidb.len(), im_scales.len())?;

    let mut out = Vec::with_capacity(roidb.len());
    for (im_i, entry) in roidb.iter().enumerate() {
        let inds: Vec<usize> = rois
            .column(0)
            .iter()
            .enumerate()
            .filter(|(_, &b)| b as usize == im_i)
            .map(|(i, _)| i)
            .collect();
        let boxes = rois.select(Axis(0), &inds).slice(s![.., 1..5]).mapv(|v| v / im_scales[im_i]);

        let gt_inds = entry.gt_inds();
        let mut fresh = RoidbEntry::from_gt(entry.boxes.select(Axis(0), &gt_inds), entry.gt_classes.select(Axis(0), &gt_inds))?;
        fresh.gt_keypoints = entry.gt_keypoints.as_ref().map(|kps| kps.select(Axis(0), &gt_inds));
        fresh.add_proposals(boxes.view())?;
        out.push(fresh);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn entry() -> RoidbEntry {
        RoidbEntry::from_gt(array![[0.0, 0.0, 9.0, 9.0], [50.0, 50.0, 69.0, 69.0]], array![1, 3]).unwrap()
    }

    #[test]
    fn test_from_gt() {
        let e = entry();
        assert_eq!(e.gt_inds(), vec![0, 1]);
        assert_eq!(e.max_overlaps, array![1.0, 1.0]);
        assert_eq!(e.box_to_gt_ind_map, array![0, 1]);
        e.validate().unwrap();
    }

    #[test]
    fn test_add_proposals_labels_by_best_gt() {
        let mut e = entry();
        let proposals = array![[5.0, 0.0, 14.0, 9.0], [50.0, 50.0, 69.0, 69.0], [200.0, 200.0, 210.0, 210.0]];
        e.add_proposals(proposals.view()).unwrap();
        e.validate().unwrap();

        assert_eq!(e.num_boxes(), 5);
        assert!((e.max_overlaps[2] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(e.max_classes[2], 1);
        assert_eq!(e.box_to_gt_ind_map[2], 0);
        assert_eq!(e.max_overlaps[3], 1.0);
        assert_eq!(e.max_classes[3], 3);
        assert_eq!(e.box_to_gt_ind_map[3], 1);
        assert_eq!(e.max_overlaps[4], 0.0);
        assert_eq!(e.max_classes[4], 0);
        assert_eq!(e.box_to_gt_ind_map[4], -1);
        assert_eq!(e.gt_inds(), vec![0, 1]);
    }

    #[test]
    fn test_add_proposals_per_image() {
        let roidb = vec![entry(), entry()];
        let rois = array![
            [0.0, 0.0, 0.0, 18.0, 18.0],
            [1.0, 100.0, 100.0, 138.0, 138.0],
            [1.0, 0.0, 0.0, 4.0, 4.0]
        ];
        let out = add_proposals(&roidb, rois.view(), &[2.0, 2.0]).unwrap();
        assert_eq!(out[0].num_boxes(), 3);
        assert_eq!(out[1].num_boxes(), 4);
        // scaled back into original image pixels
        assert_eq!(out[0].boxes.row(2), array![0.0, 0.0, 9.0, 9.0]);
        assert_eq!(out[0].max_overlaps[2], 1.0);
    }
}
