use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{CascadeError, Result};
use crate::rcnn::bbox::BBoxWeights;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Including background.
    pub num_classes: usize,
    pub cls_agnostic_bbox_reg: bool,
    pub mask_on: bool,
    pub keypoints_on: bool,
    pub num_gpus: usize,
}

impl ModelConfig {
    pub fn new() -> Self {
        ModelConfig {
            num_classes: 81,
            cls_agnostic_bbox_reg: true,
            mask_on: false,
            keypoints_on: false,
            num_gpus: 1,
        }
    }
}

/// Per-stage settings, indexed by `stage - 1`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub num_stages: usize,
    pub fg_threshs: Vec<f32>,
    pub bg_threshs_hi: Vec<f32>,
    pub bg_threshs_lo: Vec<f32>,
    pub bbox_reg_weights: Vec<BBoxWeights>,
    pub stage_weights: Vec<f32>,
    pub scale_loss: bool,
    pub scale_grad: bool,
    /// Last stage run at inference.
    pub test_stage: u32,
    pub test_ensemble: bool,
}

impl CascadeConfig {
    pub fn new() -> Self {
        CascadeConfig {
            num_stages: 3,
            fg_threshs: vec![0.5, 0.6, 0.7],
            bg_threshs_hi: vec![0.5, 0.6, 0.7],
            bg_threshs_lo: vec![0.0, 0.0, 0.0],
            bbox_reg_weights: vec![[10.0, 10.0, 5.0, 5.0], [20.0, 20.0, 10.0, 10.0], [30.0, 30.0, 15.0, 15.0]],
            stage_weights: vec![1.0, 0.5, 0.25],
            scale_loss: true,
            scale_grad: false,
            test_stage: 3,
            test_ensemble: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FpnConfig {
    pub fpn_on: bool,
    pub multilevel_rois: bool,
    pub roi_min_level: u32,
    pub roi_max_level: u32,
    pub roi_canonical_scale: f32,
    pub roi_canonical_level: u32,
}

impl FpnConfig {
    pub fn new() -> Self {
        FpnConfig {
            fpn_on: true,
            multilevel_rois: true,
            roi_min_level: 2,
            roi_max_level: 5,
            roi_canonical_scale: 224.0,
            roi_canonical_level: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RoiXformMethod {
    #[serde(rename = "RoIPoolF")]
    RoiPool,
    #[serde(rename = "RoIAlign")]
    RoiAlign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RoiBoxHead {
    #[serde(rename = "roi_2mlp_head")]
    Mlp2,
    #[serde(rename = "roi_Xconv1fc_gn_head")]
    Xconv1fcGn,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FastRcnnConfig {
    pub roi_box_head: RoiBoxHead,
    pub mlp_head_dim: usize,
    pub conv_head_dim: usize,
    pub num_stacked_convs: usize,
    pub roi_xform_method: RoiXformMethod,
    pub roi_xform_resolution: usize,
    pub roi_xform_sampling_ratio: usize,
}

impl FastRcnnConfig {
    pub fn new() -> Self {
        FastRcnnConfig {
            roi_box_head: RoiBoxHead::Mlp2,
            mlp_head_dim: 1024,
            conv_head_dim: 256,
            num_stacked_convs: 4,
            roi_xform_method: RoiXformMethod::RoiAlign,
            roi_xform_resolution: 7,
            roi_xform_sampling_ratio: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupNormConfig {
    pub num_groups: usize,
    /// Channels per group; takes precedence over `num_groups` when positive.
    pub dim_per_gp: i64,
    pub epsilon: f32,
}

impl GroupNormConfig {
    pub fn new() -> Self {
        GroupNormConfig {
            num_groups: 32,
            dim_per_gp: -1,
            epsilon: 1e-5,
        }
    }

    /// Group count for a layer with `dim` channels.
    pub fn groups_for(&self, dim: usize) -> Result<usize> {
        let groups = if self.dim_per_gp > 0 {
            dim / self.dim_per_gp as usize
        } else {
            self.num_groups
        };
        if groups == 0 || dim % groups != 0 {
            return Err(CascadeError::InvalidConfig(format!(
                "{} channels cannot be split into {} group-norm groups",
                dim, groups
            )));
        }
        Ok(groups)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MrcnnConfig {
    pub at_stage: u32,
    pub resolution: usize,
    pub cls_specific_mask: bool,
}

impl MrcnnConfig {
    pub fn new() -> Self {
        MrcnnConfig {
            at_stage: 1,
            resolution: 28,
            cls_specific_mask: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KrcnnConfig {
    pub at_stage: u32,
    pub heatmap_size: usize,
    pub num_keypoints: usize,
    pub min_keypoint_count_for_valid_minibatch: usize,
}

impl KrcnnConfig {
    pub fn new() -> Self {
        KrcnnConfig {
            at_stage: 1,
            heatmap_size: 56,
            num_keypoints: 17,
            min_keypoint_count_for_valid_minibatch: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub ims_per_batch: usize,
    pub batch_size_per_im: usize,
    pub fg_fraction: f32,
    /// Seed for the keypoint RoI subsampler.
    pub rng_seed: u64,
}

impl TrainConfig {
    pub fn new() -> Self {
        TrainConfig {
            ims_per_batch: 2,
            batch_size_per_im: 512,
            fg_fraction: 0.25,
            rng_seed: 3,
        }
    }
}

/// Thresholds and weights of one cascade stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    pub fg_thresh: f32,
    pub bg_thresh_hi: f32,
    pub bg_thresh_lo: f32,
    pub bbox_reg_weights: BBoxWeights,
    pub stage_weight: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub cascade_rcnn: CascadeConfig,
    pub fpn: FpnConfig,
    pub fast_rcnn: FastRcnnConfig,
    pub group_norm: GroupNormConfig,
    pub mrcnn: MrcnnConfig,
    pub krcnn: KrcnnConfig,
    pub train: TrainConfig,
}

impl Config {
    pub fn new() -> Self {
        Config {
            model: ModelConfig::new(),
            cascade_rcnn: CascadeConfig::new(),
            fpn: FpnConfig::new(),
            fast_rcnn: FastRcnnConfig::new(),
            group_norm: GroupNormConfig::new(),
            mrcnn: MrcnnConfig::new(),
            krcnn: KrcnnConfig::new(),
            train: TrainConfig::new(),
        }
    }

    /// Parses a YAML document; keys it leaves out keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(yaml).context("parsing cascade config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        Self::from_yaml_str(&contents).with_context(|| format!("loading config {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cascade_rcnn;
        let n = c.num_stages;
        if n == 0 {
            return Err(CascadeError::InvalidConfig("num_stages must be at least 1".to_string()));
        }
        for (name, len) in [
            ("fg_threshs", c.fg_threshs.len()),
            ("bg_threshs_hi", c.bg_threshs_hi.len()),
            ("bg_threshs_lo", c.bg_threshs_lo.len()),
            ("bbox_reg_weights", c.bbox_reg_weights.len()),
            ("stage_weights", c.stage_weights.len()),
        ] {
            if len != n {
                return Err(CascadeError::InvalidConfig(format!(
                    "cascade_rcnn.{} has {} entries for {} stages",
                    name, len, n
                )));
            }
        }
        for i in 0..n {
            if c.bg_threshs_lo[i] > c.bg_threshs_hi[i] {
                return Err(CascadeError::InvalidConfig(format!(
                    "stage {} background band [{}, {}) is empty",
                    i + 1,
                    c.bg_threshs_lo[i],
                    c.bg_threshs_hi[i]
                )));
            }
            if c.bbox_reg_weights[i].iter().any(|&w| w <= 0.0) {
                return Err(CascadeError::InvalidConfig(format!("stage {} has non-positive bbox_reg_weights", i + 1)));
            }
        }
        self.check_stage(c.test_stage)?;
        if self.model.num_classes < 2 {
            return Err(CascadeError::InvalidConfig("num_classes must include background and one class".to_string()));
        }
        if self.model.num_gpus == 0 {
            return Err(CascadeError::InvalidConfig("num_gpus must be at least 1".to_string()));
        }
        if self.fpn.roi_min_level > self.fpn.roi_max_level {
            return Err(CascadeError::InvalidConfig(format!(
                "roi_min_level {} above roi_max_level {}",
                self.fpn.roi_min_level, self.fpn.roi_max_level
            )));
        }
        if self.model.mask_on {
            self.check_stage(self.mrcnn.at_stage)?;
        }
        if self.model.keypoints_on {
            self.check_stage(self.krcnn.at_stage)?;
        }
        if !(self.train.fg_fraction > 0.0 && self.train.fg_fraction <= 1.0) {
            return Err(CascadeError::InvalidConfig(format!("fg_fraction {} not in (0, 1]", self.train.fg_fraction)));
        }
        Ok(())
    }

    fn check_stage(&self, stage: u32) -> Result<usize> {
        let num_stages = self.cascade_rcnn.num_stages;
        if stage == 0 || stage as usize > num_stages {
            return Err(CascadeError::InvalidStage { stage, num_stages });
        }
        Ok(stage as usize - 1)
    }

    pub fn stage(&self, stage: u32) -> Result<StageParams> {
        let i = self.check_stage(stage)?;
        let c = &self.cascade_rcnn;
        let lookup = |v: &[f32]| v.get(i).copied();
        match (
            lookup(&c.fg_threshs),
            lookup(&c.bg_threshs_hi),
            lookup(&c.bg_threshs_lo),
            c.bbox_reg_weights.get(i),
            lookup(&c.stage_weights),
        ) {
            (Some(fg_thresh), Some(bg_thresh_hi), Some(bg_thresh_lo), Some(&bbox_reg_weights), Some(stage_weight)) => {
                Ok(StageParams {
                    fg_thresh,
                    bg_thresh_hi,
                    bg_thresh_lo,
                    bbox_reg_weights,
                    stage_weight,
                })
            }
            _ => Err(CascadeError::InvalidStage {
                stage,
                num_stages: c.num_stages,
            }),
        }
    }

    /// Gradient scale on the stage's pooled features, when enabled.
    pub fn grad_scale(&self, stage: u32) -> Result<Option<f32>> {
        let params = self.stage(stage)?;
        Ok(self.cascade_rcnn.scale_grad.then_some(params.stage_weight))
    }

    /// Multiplier applied to the stage's classification and box losses.
    pub fn loss_scale(&self, stage: u32) -> Result<f32> {
        let params = self.stage(stage)?;
        let base = 1.0 / self.model.num_gpus as f32;
        Ok(if self.cascade_rcnn.scale_loss {
            base * params.stage_weight
        } else {
            base
        })
    }

    /// Class slots of the box regressor.
    pub fn num_bbox_reg_classes(&self) -> usize {
        if self.model.cls_agnostic_bbox_reg {
            2
        } else {
            self.model.num_classes
        }
    }

    pub fn multilevel_rois(&self) -> bool {
        self.fpn.fpn_on && self.fpn.multilevel_rois
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

macro_rules! default_from_new {
    ($($t:ty),*) => {
        $(impl Default for $t {
            fn default() -> Self {
                <$t>::new()
            }
        })*
    };
}

default_from_new!(
    ModelConfig,
    CascadeConfig,
    FpnConfig,
    FastRcnnConfig,
    GroupNormConfig,
    MrcnnConfig,
    KrcnnConfig,
    TrainConfig
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::new();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_bbox_reg_classes(), 2);
        assert!(cfg.multilevel_rois());
    }

    #[test]
    fn test_stage_lookup() {
        let cfg = Config::new();
        let s2 = cfg.stage(2).unwrap();
        assert_eq!(s2.fg_thresh, 0.6);
        assert_eq!(s2.bbox_reg_weights, [20.0, 20.0, 10.0, 10.0]);
        assert!(matches!(cfg.stage(0), Err(CascadeError::InvalidStage { stage: 0, .. })));
        assert!(matches!(cfg.stage(4), Err(CascadeError::InvalidStage { stage: 4, num_stages: 3 })));
    }

    #[test]
    fn test_loss_and_grad_scale() {
        let mut cfg = Config::new();
        cfg.model.num_gpus = 2;
        assert_eq!(cfg.loss_scale(3).unwrap(), 0.125);
        assert_eq!(cfg.grad_scale(3).unwrap(), None);

        cfg.cascade_rcnn.scale_loss = false;
        cfg.cascade_rcnn.scale_grad = true;
        assert_eq!(cfg.loss_scale(3).unwrap(), 0.5);
        assert_eq!(cfg.grad_scale(2).unwrap(), Some(0.5));
    }

    #[test]
    fn test_yaml_overrides_subset() {
        let yaml = r#"
model:
  num_classes: 2
  mask_on: true
cascade_rcnn:
  num_stages: 2
  fg_threshs: [0.5, 0.6]
  bg_threshs_hi: [0.5, 0.6]
  bg_threshs_lo: [0.0, 0.1]
  bbox_reg_weights: [[10, 10, 5, 5], [20, 20, 10, 10]]
  stage_weights: [1.0, 0.5]
  test_stage: 2
fast_rcnn:
  roi_box_head: roi_Xconv1fc_gn_head
  roi_xform_method: RoIPoolF
"#;
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.model.num_classes, 2);
        assert!(cfg.model.mask_on);
        assert_eq!(cfg.stage(2).unwrap().bg_thresh_lo, 0.1);
        assert_eq!(cfg.fast_rcnn.roi_xform_method, RoiXformMethod::RoiPool);
        assert_eq!(cfg.fast_rcnn.roi_box_head, RoiBoxHead::Xconv1fcGn);
        // untouched sections keep their defaults
        assert_eq!(cfg.fpn.roi_max_level, 5);
        assert_eq!(cfg.krcnn.num_keypoints, 17);
    }

    #[test]
    fn test_validate_rejects_ragged_stage_arrays() {
        let yaml = "cascade_rcnn:\n  num_stages: 2\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("fg_threshs"));

        let mut cfg = Config::new();
        cfg.cascade_rcnn.test_stage = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_group_norm_groups() {
        let gn = GroupNormConfig::new();
        assert_eq!(gn.groups_for(256).unwrap(), 32);
        let per_gp = GroupNormConfig { dim_per_gp: 16, ..GroupNormConfig::new() };
        assert_eq!(per_gp.groups_for(256).unwrap(), 16);
        assert!(gn.groups_for(48).is_err());
    }
}
