use std::collections::BTreeMap;

use anyhow::Context;
use tracing::{debug, enabled, warn, Level};

use crate::error::CascadeError;
use crate::pipeline::cascade_rcnn::config::Config;
use crate::pipeline::module::aux_blobs::{ImageSample, StageBlobContributor};
use crate::pipeline::module::roi_sampler::sample_rois;
use crate::processing::fpn::{add_multilevel_roi_blobs, CanonicalLevelAssigner};
use crate::processing::losses::label_histogram;
use crate::rcnn::blobs::{concat_blobs, stage_suffix, Blob, Blobs};
use crate::rcnn::roidb::{add_proposals, RoidbEntry};

/// Samples every image of the batch for `stage` and writes the concatenated
/// training blobs into `blobs`.
///
/// Returns whether the minibatch is valid; an auxiliary branch attached to
/// this stage may reject it during finalisation.
pub fn add_cascade_rcnn_blobs(
    blobs: &mut Blobs,
    cfg: &Config,
    im_scales: &[f32],
    roidb: &[RoidbEntry],
    stage: u32,
    contributors: &mut [Box<dyn StageBlobContributor>],
) -> anyhow::Result<bool> {
    let params = cfg.stage(stage)?;
    if im_scales.len() != roidb.len() {
        return Err(CascadeError::ShapeMismatch {
            context: "im_scales per image",
            expected: roidb.len().to_string(),
            actual: im_scales.len().to_string(),
        }
        .into());
    }

    let mut per_image: BTreeMap<String, Vec<Blob>> = BTreeMap::new();
    for (im_i, entry) in roidb.iter().enumerate() {
        let sample = sample_rois(
            entry,
            im_scales[im_i],
            im_i,
            &params,
            cfg.model.num_classes,
            cfg.model.cls_agnostic_bbox_reg,
        )
        .with_context(|| format!("sampling stage {} rois for image {}", stage, im_i))?;

        let image = ImageSample {
            entry,
            sample: &sample,
            im_scale: im_scales[im_i],
            batch_idx: im_i,
            fg_thresh: params.fg_thresh,
        };
        for contributor in contributors.iter_mut().filter(|c| c.attach_stage() == stage) {
            let extra = contributor
                .add_image_blobs(&image)
                .with_context(|| format!("adding {} blobs for image {}", contributor.name(), im_i))?;
            for (name, blob) in extra {
                per_image.entry(name).or_default().push(blob);
            }
        }
        for (name, blob) in sample.into_blobs(stage) {
            per_image.entry(name).or_default().push(blob);
        }
    }

    for (name, parts) in per_image {
        let blob = concat_blobs(&name, &parts).with_context(|| format!("concatenating `{}`", name))?;
        blobs.insert(name, blob);
    }

    if cfg.multilevel_rois() {
        let assigner = CanonicalLevelAssigner::new(cfg.fpn.roi_canonical_scale, cfg.fpn.roi_canonical_level);
        let (lo, hi) = (cfg.fpn.roi_min_level, cfg.fpn.roi_max_level);
        let mut names = vec![format!("rois{}", stage_suffix(stage))];
        names.extend(
            contributors
                .iter()
                .filter(|c| c.attach_stage() == stage)
                .map(|c| c.roi_blob_name().to_string()),
        );
        names.retain(|n| blobs.contains(n));
        for name in &names {
            add_multilevel_roi_blobs(blobs, name, &assigner, lo, hi)
                .with_context(|| format!("distributing `{}` over fpn levels", name))?;
        }
    }

    let mut valid = true;
    for contributor in contributors.iter_mut().filter(|c| c.attach_stage() == stage) {
        valid = contributor
            .finalize(blobs, valid)
            .with_context(|| format!("finalizing {} blobs", contributor.name()))?;
    }

    let labels_name = format!("labels_int32{}", stage_suffix(stage));
    if enabled!(Level::DEBUG) {
        if let Ok(labels) = blobs.i32_1d(&labels_name) {
            debug!(
                "stage {}: {} rois over {} images, label histogram {:?}",
                stage,
                labels.len(),
                roidb.len(),
                label_histogram(labels, cfg.model.num_classes).to_vec()
            );
        }
    }
    if !valid {
        warn!("stage {}: minibatch rejected by an auxiliary branch", stage);
    }
    for name in cascade_rcnn_blob_names(cfg, stage, true, contributors) {
        if !blobs.contains(&name) {
            return Err(CascadeError::MissingBlob(name)).with_context(|| format!("assembling stage {} minibatch", stage));
        }
    }
    Ok(valid)
}

/// Names of the blobs the minibatch assembler emits for `stage`, including
/// those of the contributors attached to it.
pub fn cascade_rcnn_blob_names(
    cfg: &Config,
    stage: u32,
    is_training: bool,
    contributors: &[Box<dyn StageBlobContributor>],
) -> Vec<String> {
    let sfx = stage_suffix(stage);
    let mut names = vec![format!("rois{}", sfx)];
    let attached: Vec<&dyn StageBlobContributor> = contributors
        .iter()
        .filter(|c| is_training && c.attach_stage() == stage)
        .map(|c| c.as_ref())
        .collect();

    if is_training {
        for base in ["labels_int32", "bbox_targets", "bbox_inside_weights", "bbox_outside_weights", "mapped_gt_boxes"] {
            names.push(format!("{}{}", base, sfx));
        }
    }
    for c in &attached {
        names.extend(c.blob_names());
    }
    if cfg.multilevel_rois() {
        let mut roi_blobs = vec![format!("rois{}", sfx)];
        roi_blobs.extend(attached.iter().map(|c| c.roi_blob_name().to_string()));
        for prefix in roi_blobs {
            for lvl in cfg.fpn.roi_min_level..=cfg.fpn.roi_max_level {
                names.push(format!("{}_fpn{}", prefix, lvl));
            }
            names.push(format!("{}_idx_restore_int32", prefix));
        }
    }
    names
}

/// Turns `proposals_<stage>` into the stage's RoI blobs.
///
/// In training the proposals are labelled against each image's ground truth
/// and sampled like [`add_cascade_rcnn_blobs`]; at inference they become
/// `rois_<stage>` as they are.
pub fn distribute_cascade_proposals(
    blobs: &mut Blobs,
    cfg: &Config,
    stage: u32,
    is_training: bool,
    roidb: &[RoidbEntry],
    im_scales: &[f32],
    contributors: &mut [Box<dyn StageBlobContributor>],
) -> anyhow::Result<bool> {
    if !cfg.fpn.fpn_on {
        return Err(CascadeError::FpnRequired.into());
    }
    let sfx = stage_suffix(stage);
    let proposals = blobs.f32_2d(&format!("proposals{}", sfx))?.to_owned();

    if is_training {
        let roidb = add_proposals(roidb, proposals.view(), im_scales)
            .with_context(|| format!("labelling stage {} proposals", stage))?;
        return add_cascade_rcnn_blobs(blobs, cfg, im_scales, &roidb, stage, contributors);
    }

    let rois_name = format!("rois{}", sfx);
    debug!("stage {}: {} inference rois", stage, proposals.nrows());
    blobs.insert(rois_name.clone(), proposals);
    if cfg.multilevel_rois() {
        let assigner = CanonicalLevelAssigner::new(cfg.fpn.roi_canonical_scale, cfg.fpn.roi_canonical_level);
        add_multilevel_roi_blobs(blobs, &rois_name, &assigner, cfg.fpn.roi_min_level, cfg.fpn.roi_max_level)?;
    }
    Ok(true)
}
