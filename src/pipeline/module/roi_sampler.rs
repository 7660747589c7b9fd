use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use tracing::debug;

use crate::error::{ensure_eq, CascadeError, Result};
use crate::pipeline::cascade_rcnn::config::StageParams;
use crate::processing::bbox_regression::{compute_targets, expand_bbox_targets, outside_weights};
use crate::rcnn::blobs::{stage_suffix, Blob};
use crate::rcnn::roidb::RoidbEntry;

/// Training RoIs of one image for one stage.
///
/// Foreground rows come first. `sampled_boxes` stays in original-image pixels
/// for the auxiliary branches; `rois` and `mapped_gt_boxes` are in network
/// pixels.
#[derive(Debug, Clone)]
pub struct StageSample {
    pub fg_inds: Vec<usize>,
    pub bg_inds: Vec<usize>,
    pub keep_inds: Vec<usize>,
    pub sampled_boxes: Array2<f32>,
    pub labels: Array1<i32>,
    pub rois: Array2<f32>,
    pub bbox_targets: Array2<f32>,
    pub bbox_inside_weights: Array2<f32>,
    pub bbox_outside_weights: Array2<f32>,
    pub mapped_gt_boxes: Array2<f32>,
}

impl StageSample {
    pub fn num_fg(&self) -> usize {
        self.fg_inds.len()
    }

    /// Base blobs named with the stage suffix, e.g. `labels_int32_2`.
    pub fn into_blobs(self, stage: u32) -> Vec<(String, Blob)> {
        let sfx = stage_suffix(stage);
        vec![
            (format!("rois{}", sfx), self.rois.into()),
            (format!("labels_int32{}", sfx), self.labels.into()),
            (format!("bbox_targets{}", sfx), self.bbox_targets.into()),
            (format!("bbox_inside_weights{}", sfx), self.bbox_inside_weights.into()),
            (format!("bbox_outside_weights{}", sfx), self.bbox_outside_weights.into()),
            (format!("mapped_gt_boxes{}", sfx), self.mapped_gt_boxes.into()),
        ]
    }
}

/// Splits boxes into foreground (`overlap >= fg_thresh`) and background
/// (`bg_lo <= overlap < bg_hi`) indices, both ascending.
pub fn partition(max_overlaps: ArrayView1<f32>, params: &StageParams) -> (Vec<usize>, Vec<usize>) {
    let mut fg = Vec::new();
    let mut bg = Vec::new();
    for (i, &ov) in max_overlaps.iter().enumerate() {
        if ov >= params.fg_thresh {
            fg.push(i);
        } else if ov < params.bg_thresh_hi && ov >= params.bg_thresh_lo {
            bg.push(i);
        }
    }
    (fg, bg)
}

/// Samples every qualifying RoI of `entry` for one stage.
///
/// There is no random subsampling: all foreground and all background boxes
/// are kept.
pub fn sample_rois(
    entry: &RoidbEntry,
    im_scale: f32,
    batch_idx: usize,
    params: &StageParams,
    num_classes: usize,
    cls_agnostic_bbox_reg: bool,
) -> Result<StageSample> {
    entry.validate()?;
    let (fg_inds, bg_inds) = partition(entry.max_overlaps.view(), params);
    let num_fg = fg_inds.len();
    let keep_inds: Vec<usize> = fg_inds.iter().chain(bg_inds.iter()).copied().collect();
    let k = keep_inds.len();

    let mut labels = entry.max_classes.select(Axis(0), &keep_inds);
    labels.slice_mut(s![num_fg..]).fill(0);
    let sampled_boxes = entry.boxes.select(Axis(0), &keep_inds);

    // Background rows regress onto themselves; their targets are dropped on
    // expansion anyway.
    let gt_inds = entry.gt_inds();
    let mut assigned_gt = sampled_boxes.clone();
    let mut mapped_gt_boxes = Array2::<f32>::zeros((k, 5));
    for (row, &box_i) in keep_inds.iter().enumerate().take(num_fg) {
        let gt_row = usize::try_from(entry.box_to_gt_ind_map[box_i])
            .ok()
            .and_then(|m| gt_inds.get(m).copied())
            .ok_or(CascadeError::MissingGtAssignment { index: box_i })?;
        let gt_box = entry.boxes.row(gt_row);
        assigned_gt.row_mut(row).assign(&gt_box);
        mapped_gt_boxes.slice_mut(s![row, ..4]).assign(&gt_box.mapv(|v| v * im_scale));
        mapped_gt_boxes[[row, 4]] = entry.max_overlaps[box_i];
    }

    let compact = match &entry.bbox_targets {
        Some(precomputed) => {
            let mut t = precomputed.select(Axis(0), &keep_inds);
            t.slice_mut(s![num_fg.., 0]).fill(0.0);
            t
        }
        None => compute_targets(sampled_boxes.view(), assigned_gt.view(), labels.view(), &params.bbox_reg_weights)?,
    };
    let (bbox_targets, bbox_inside_weights) = expand_bbox_targets(compact.view(), num_classes, cls_agnostic_bbox_reg)?;
    let bbox_outside_weights = outside_weights(bbox_inside_weights.view());

    let mut rois = Array2::<f32>::zeros((k, 5));
    rois.column_mut(0).fill(batch_idx as f32);
    rois.slice_mut(s![.., 1..]).assign(&sampled_boxes.mapv(|v| v * im_scale));

    ensure_eq("sampled labels", k, labels.len())?;
    ensure_eq("sampled targets", k, bbox_targets.nrows())?;
    debug!(
        "image {}: {} candidates -> {} fg, {} bg (fg >= {}, bg in [{}, {}))",
        batch_idx,
        entry.num_boxes(),
        num_fg,
        bg_inds.len(),
        params.fg_thresh,
        params.bg_thresh_lo,
        params.bg_thresh_hi
    );

    Ok(StageSample {
        fg_inds,
        bg_inds,
        keep_inds,
        sampled_boxes,
        labels,
        rois,
        bbox_targets,
        bbox_inside_weights,
        bbox_outside_weights,
        mapped_gt_boxes,
    })
}
