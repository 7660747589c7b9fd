use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::seq::index::sample as sample_indices;
use ndarray_rand::rand::SeedableRng;
use tracing::debug;

use crate::error::{ensure_eq, CascadeError, Result};
use crate::pipeline::cascade_rcnn::config::Config;
use crate::pipeline::module::roi_sampler::StageSample;
use crate::processing::keypoints::{keypoints_to_heatmap_labels, within_box};
use crate::rcnn::bbox::bbox_overlaps;
use crate::rcnn::blobs::{Blob, Blobs};
use crate::rcnn::roidb::RoidbEntry;

/// What a contributor sees of one sampled image.
pub struct ImageSample<'a> {
    pub entry: &'a RoidbEntry,
    pub sample: &'a StageSample,
    pub im_scale: f32,
    pub batch_idx: usize,
    pub fg_thresh: f32,
}

/// An optional branch that attaches its own training blobs to one stage.
pub trait StageBlobContributor {
    fn name(&self) -> &'static str;

    fn attach_stage(&self) -> u32;

    /// RoI blob that is redistributed over pyramid levels with the base RoIs.
    fn roi_blob_name(&self) -> &'static str;

    fn blob_names(&self) -> Vec<String>;

    /// Per-image blobs; they are concatenated across images under the same
    /// names, without a stage suffix.
    fn add_image_blobs(&mut self, image: &ImageSample<'_>) -> Result<Vec<(String, Blob)>>;

    /// Runs once on the assembled minibatch; returning `false` invalidates it.
    fn finalize(&mut self, _blobs: &mut Blobs, valid: bool) -> Result<bool> {
        Ok(valid)
    }
}

/// Produces `R x M*M` binary mask targets for foreground RoIs given in
/// original-image pixels.
pub trait MaskTargetSource {
    fn mask_targets(&self, entry: &RoidbEntry, rois: ArrayView2<f32>, resolution: usize) -> Result<Array2<i32>>;
}

/// Uses the best-overlapping ground-truth box as the object mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct GtBoxMaskSource;

impl MaskTargetSource for GtBoxMaskSource {
    fn mask_targets(&self, entry: &RoidbEntry, rois: ArrayView2<f32>, resolution: usize) -> Result<Array2<i32>> {
        let gt_boxes = entry.gt_boxes();
        let m = resolution;
        let mut masks = Array2::<i32>::zeros((rois.nrows(), m * m));
        if rois.nrows() == 0 {
            return Ok(masks);
        }
        if gt_boxes.nrows() == 0 {
            return Err(CascadeError::NoGroundTruth);
        }
        let overlaps = bbox_overlaps(rois, gt_boxes.view())?;
        for (i, row) in overlaps.outer_iter().enumerate() {
            let mut best = 0usize;
            for (j, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = j;
                }
            }
            let (x1, y1) = (rois[[i, 0]], rois[[i, 1]]);
            let w = (rois[[i, 2]] - x1).max(1.0);
            let h = (rois[[i, 3]] - y1).max(1.0);
            let g = gt_boxes.row(best);
            // gt box in RoI grid units
            let (u1, u2) = ((g[0] - x1) * m as f32 / w, (g[2] - x1) * m as f32 / w);
            let (v1, v2) = ((g[1] - y1) * m as f32 / h, (g[3] - y1) * m as f32 / h);
            for r in 0..m {
                let cy = r as f32 + 0.5;
                for c in 0..m {
                    let cx = c as f32 + 0.5;
                    if cx >= u1 && cx <= u2 && cy >= v1 && cy <= v2 {
                        masks[[i, r * m + c]] = 1;
                    }
                }
            }
        }
        Ok(masks)
    }
}

/// `mask_rois`, `roi_has_mask_int32` and `masks_int32`.
pub struct MaskBlobs {
    at_stage: u32,
    resolution: usize,
    cls_specific_mask: bool,
    num_classes: usize,
    source: Box<dyn MaskTargetSource>,
}

impl MaskBlobs {
    pub fn new(cfg: &Config, source: Box<dyn MaskTargetSource>) -> Self {
        MaskBlobs {
            at_stage: cfg.mrcnn.at_stage,
            resolution: cfg.mrcnn.resolution,
            cls_specific_mask: cfg.mrcnn.cls_specific_mask,
            num_classes: cfg.model.num_classes,
            source,
        }
    }
}

/// Copies each row's mask into its class slot of an `R x C*M*M` array; every
/// other slot stays -1.
fn expand_to_class_specific_mask_targets(masks: &Array2<i32>, labels: &Array1<i32>, num_classes: usize) -> Result<Array2<i32>> {
    ensure_eq("mask targets rows", masks.nrows(), labels.len())?;
    let m2 = masks.ncols();
    let mut out = Array2::<i32>::from_elem((masks.nrows(), m2 * num_classes), -1);
    for (i, &cls) in labels.iter().enumerate() {
        if cls <= 0 {
            continue;
        }
        if cls as usize >= num_classes {
            return Err(CascadeError::LabelOutOfRange { label: cls, num_classes });
        }
        let start = m2 * cls as usize;
        out.slice_mut(s![i, start..start + m2]).assign(&masks.row(i));
    }
    Ok(out)
}

impl StageBlobContributor for MaskBlobs {
    fn name(&self) -> &'static str {
        "mask"
    }

    fn attach_stage(&self) -> u32 {
        self.at_stage
    }

    fn roi_blob_name(&self) -> &'static str {
        "mask_rois"
    }

    fn blob_names(&self) -> Vec<String> {
        ["mask_rois", "roi_has_mask_int32", "masks_int32"].map(String::from).to_vec()
    }

    fn add_image_blobs(&mut self, image: &ImageSample<'_>) -> Result<Vec<(String, Blob)>> {
        let sample = image.sample;
        let m2 = self.resolution * self.resolution;
        let fg: Vec<usize> = (0..sample.labels.len()).filter(|&i| sample.labels[i] > 0).collect();
        let mut roi_has_mask = sample.labels.mapv(|l| i32::from(l > 0));

        let (rois_fg, masks, class_labels) = if !fg.is_empty() {
            let rois_fg = sample.sampled_boxes.select(Axis(0), &fg);
            let masks = self.source.mask_targets(image.entry, rois_fg.view(), self.resolution)?;
            ensure_eq("mask targets rows", fg.len(), masks.nrows())?;
            ensure_eq("mask targets columns", m2, masks.ncols())?;
            (rois_fg, masks, sample.labels.select(Axis(0), &fg))
        } else if sample.labels.is_empty() {
            (Array2::zeros((0, 4)), Array2::zeros((0, m2)), Array1::zeros(0))
        } else {
            // No foreground: one background RoI with an all-ignore mask.
            roi_has_mask[0] = 1;
            (
                sample.sampled_boxes.select(Axis(0), &[0]),
                Array2::from_elem((1, m2), -1),
                Array1::zeros(1),
            )
        };

        let masks = if self.cls_specific_mask {
            expand_to_class_specific_mask_targets(&masks, &class_labels, self.num_classes)?
        } else {
            masks
        };

        let mut mask_rois = Array2::<f32>::zeros((rois_fg.nrows(), 5));
        mask_rois.column_mut(0).fill(image.batch_idx as f32);
        mask_rois.slice_mut(s![.., 1..]).assign(&rois_fg.mapv(|v| v * image.im_scale));
        debug!("image {}: {} mask rois", image.batch_idx, mask_rois.nrows());

        Ok(vec![
            ("mask_rois".to_string(), mask_rois.into()),
            ("roi_has_mask_int32".to_string(), roi_has_mask.into()),
            ("masks_int32".to_string(), masks.into()),
        ])
    }
}

/// `keypoint_rois`, `keypoint_locations_int32`, `keypoint_weights` and the
/// minibatch-level `keypoint_loss_normalizer`.
pub struct KeypointBlobs {
    at_stage: u32,
    heatmap_size: usize,
    num_keypoints: usize,
    min_keypoint_count: usize,
    normalizer_denom: f32,
    rng: StdRng,
}

impl KeypointBlobs {
    pub fn new(cfg: &Config) -> Self {
        let t = &cfg.train;
        KeypointBlobs {
            at_stage: cfg.krcnn.at_stage,
            heatmap_size: cfg.krcnn.heatmap_size,
            num_keypoints: cfg.krcnn.num_keypoints,
            min_keypoint_count: cfg.krcnn.min_keypoint_count_for_valid_minibatch,
            normalizer_denom: t.ims_per_batch as f32
                * t.batch_size_per_im as f32
                * t.fg_fraction
                * cfg.krcnn.num_keypoints as f32,
            rng: StdRng::seed_from_u64(t.rng_seed),
        }
    }
}

impl StageBlobContributor for KeypointBlobs {
    fn name(&self) -> &'static str {
        "keypoint"
    }

    fn attach_stage(&self) -> u32 {
        self.at_stage
    }

    fn roi_blob_name(&self) -> &'static str {
        "keypoint_rois"
    }

    fn blob_names(&self) -> Vec<String> {
        [
            "keypoint_rois",
            "keypoint_locations_int32",
            "keypoint_weights",
            "keypoint_loss_normalizer",
        ]
        .map(String::from)
        .to_vec()
    }

    fn add_image_blobs(&mut self, image: &ImageSample<'_>) -> Result<Vec<(String, Blob)>> {
        let entry = image.entry;
        let gt_keypoints = entry
            .gt_keypoints
            .as_ref()
            .ok_or_else(|| CascadeError::InvalidConfig("keypoints are on but the roidb entry has no gt_keypoints".to_string()))?;
        ensure_eq("gt_keypoints per box", self.num_keypoints, gt_keypoints.dim().2)?;
        let gt_inds = entry.gt_inds();

        // Foreground boxes with an assigned gt instance.
        let mut candidates = Vec::new();
        let mut candidate_gt = Vec::new();
        for i in 0..entry.num_boxes() {
            let gt_row = usize::try_from(entry.box_to_gt_ind_map[i])
                .ok()
                .and_then(|m| gt_inds.get(m).copied());
            if let Some(gt_row) = gt_row {
                if entry.max_overlaps[i] >= image.fg_thresh {
                    candidates.push(i);
                    candidate_gt.push(gt_row);
                }
            }
        }
        let cand_kps = gt_keypoints.select(Axis(0), &candidate_gt);
        let cand_boxes = entry.boxes.select(Axis(0), &candidates);
        let within = within_box(cand_kps.view(), cand_boxes.view())?;

        let mut kp_fg: Vec<usize> = (0..candidates.len())
            .filter(|&c| {
                (0..self.num_keypoints).any(|j| within[[c, j]] && cand_kps[[c, 2, j]] > 0.0)
            })
            .collect();
        let cap = image.sample.num_fg();
        if kp_fg.len() > cap {
            let mut picked: Vec<usize> = sample_indices(&mut self.rng, kp_fg.len(), cap).into_iter().map(|p| kp_fg[p]).collect();
            picked.sort_unstable();
            kp_fg = picked;
        }

        let sampled_rois = cand_boxes.select(Axis(0), &kp_fg);
        let sampled_kps: Array3<f32> = cand_kps.select(Axis(0), &kp_fg);
        let (heats, weights) = keypoints_to_heatmap_labels(sampled_kps.view(), sampled_rois.view(), self.heatmap_size)?;

        let mut keypoint_rois = Array2::<f32>::zeros((sampled_rois.nrows(), 5));
        keypoint_rois.column_mut(0).fill(image.batch_idx as f32);
        keypoint_rois.slice_mut(s![.., 1..]).assign(&sampled_rois.mapv(|v| v * image.im_scale));
        debug!("image {}: {} keypoint rois", image.batch_idx, keypoint_rois.nrows());

        let locations: Array1<i32> = heats.iter().copied().collect();
        let weights: Array1<f32> = weights.iter().map(|&w| w as f32).collect();
        Ok(vec![
            ("keypoint_rois".to_string(), keypoint_rois.into()),
            ("keypoint_locations_int32".to_string(), locations.into()),
            ("keypoint_weights".to_string(), weights.into()),
        ])
    }

    fn finalize(&mut self, blobs: &mut Blobs, valid: bool) -> Result<bool> {
        let (count, num_visible) = match blobs.f32_1d("keypoint_weights") {
            Ok(w) => (w.len(), w.sum()),
            Err(CascadeError::MissingBlob(_)) => (0, 0.0),
            Err(e) => return Err(e),
        };
        let valid = valid && count > 0 && num_visible > self.min_keypoint_count as f32;
        let norm = num_visible / self.normalizer_denom;
        blobs.insert("keypoint_loss_normalizer", Array1::from_elem(1, norm));
        Ok(valid)
    }
}

/// The contributors enabled in `cfg`. Mask targets come from `mask_source`,
/// or from the gt boxes when none is given.
pub fn contributors_from_config(cfg: &Config, mask_source: Option<Box<dyn MaskTargetSource>>) -> Vec<Box<dyn StageBlobContributor>> {
    let mut contributors: Vec<Box<dyn StageBlobContributor>> = Vec::new();
    if cfg.model.mask_on {
        let source = mask_source.unwrap_or_else(|| Box::new(GtBoxMaskSource));
        contributors.push(Box::new(MaskBlobs::new(cfg, source)));
    }
    if cfg.model.keypoints_on {
        contributors.push(Box::new(KeypointBlobs::new(cfg)));
    }
    contributors
}
