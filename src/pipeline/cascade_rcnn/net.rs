use std::collections::BTreeMap;

use anyhow::Context;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Ix1, Ix2, IxDyn};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use tracing::{debug, warn};

use crate::error::{CascadeError, Result};
use crate::pipeline::cascade_rcnn::config::{Config, RoiXformMethod};
use crate::pipeline::module::aux_blobs::StageBlobContributor;
use crate::pipeline::module::minibatch::distribute_cascade_proposals;
use crate::processing::bbox_accuracy::BBoxAccuracyOp;
use crate::processing::decode_bboxes::DecodeBBoxes;
use crate::processing::losses::{accuracy, ensemble_sum, fully_connected, relu, smooth_l1_loss, softmax, softmax_with_loss};
use crate::rcnn::bbox::BBoxWeights;
use crate::rcnn::blobs::Blobs;
use crate::rcnn::roidb::RoidbEntry;

/// Handle into a [`DetectionNet`]'s parameter arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Zero-mean normal with the given std.
    Gauss(f32),
    Const(f32),
    /// Uniform in `+-sqrt(3 / fan_in)`.
    Xavier,
    /// Normal with std `sqrt(2 / fan_out)`.
    Msra,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub value: ArrayD<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcParams {
    pub weight: ParamId,
    pub bias: ParamId,
}

/// One 3x3 conv (no bias) followed by group norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGnParams {
    pub weight: ParamId,
    pub gn_scale: ParamId,
    pub gn_bias: ParamId,
}

#[derive(Debug, Clone)]
pub struct RoiXform {
    pub features: Vec<String>,
    pub rois: String,
    pub output: String,
    pub method: RoiXformMethod,
    pub resolution: usize,
    pub sampling_ratio: usize,
    pub spatial_scales: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ConvGn {
    pub input: String,
    pub output: String,
    pub params: ConvGnParams,
    pub groups: usize,
    pub epsilon: f32,
}

/// A recorded network op. Blob names are resolved when the net runs.
#[derive(Debug, Clone)]
pub enum Op {
    RoiFeatureTransform(RoiXform),
    /// Identity in the forward pass; scales the gradient by `scale`.
    ScaleGrad {
        blob: String,
        scale: f32,
    },
    Fc {
        input: String,
        output: String,
        params: FcParams,
    },
    Relu {
        blob: String,
    },
    ConvGn(ConvGn),
    Softmax {
        input: String,
        output: String,
    },
    SoftmaxWithLoss {
        scores: String,
        labels: String,
        prob: String,
        loss: String,
        scale: f32,
    },
    SmoothL1Loss {
        pred: String,
        targets: String,
        inside_weights: String,
        outside_weights: String,
        loss: String,
        scale: f32,
    },
    Accuracy {
        prob: String,
        labels: String,
        output: String,
    },
    BBoxAccuracy {
        pred: String,
        rois: String,
        labels: String,
        mapped_gt_boxes: String,
        iou: String,
        iou_pre: String,
        bbox_reg_weights: BBoxWeights,
        cls_agnostic_bbox_reg: bool,
    },
    DecodeBBoxes {
        pred: String,
        rois: String,
        mapped_gt_boxes: Option<String>,
        output: String,
        bbox_reg_weights: BBoxWeights,
        cls_agnostic_bbox_reg: bool,
    },
    DistributeCascadeProposals {
        stage: u32,
    },
    Sum {
        inputs: Vec<String>,
        output: String,
    },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::RoiFeatureTransform(_) => "RoIFeatureTransform",
            Op::ScaleGrad { .. } => "ScaleGrad",
            Op::Fc { .. } => "FC",
            Op::Relu { .. } => "Relu",
            Op::ConvGn(_) => "ConvGN",
            Op::Softmax { .. } => "Softmax",
            Op::SoftmaxWithLoss { .. } => "SoftmaxWithLoss",
            Op::SmoothL1Loss { .. } => "SmoothL1Loss",
            Op::Accuracy { .. } => "Accuracy",
            Op::BBoxAccuracy { .. } => "BBoxAccuracy",
            Op::DecodeBBoxes { .. } => "DecodeBBoxes",
            Op::DistributeCascadeProposals { .. } => "DistributeCascadeProposals",
            Op::Sum { .. } => "Sum",
        }
    }
}

/// Kernels that live outside this crate: RoI pooling and conv + group norm.
pub trait ExternalOps {
    /// Pooled features `N x C x R x R` for the RoIs in `xform.rois`.
    fn roi_feature_transform(&mut self, blobs: &Blobs, xform: &RoiXform) -> Result<ArrayD<f32>>;

    fn conv_gn(
        &mut self,
        input: ArrayViewD<f32>,
        weight: ArrayViewD<f32>,
        gn_scale: ArrayView1<f32>,
        gn_bias: ArrayView1<f32>,
        groups: usize,
        epsilon: f32,
    ) -> Result<ArrayD<f32>>;
}

/// Everything a forward pass needs besides the blobs themselves.
pub struct RunContext<'a> {
    pub cfg: &'a Config,
    pub roidb: &'a [RoidbEntry],
    pub im_scales: &'a [f32],
    pub contributors: Vec<Box<dyn StageBlobContributor>>,
    pub external: Option<&'a mut dyn ExternalOps>,
}

impl<'a> RunContext<'a> {
    pub fn inference(cfg: &'a Config) -> Self {
        RunContext {
            cfg,
            roidb: &[],
            im_scales: &[],
            contributors: Vec::new(),
            external: None,
        }
    }

    pub fn training(
        cfg: &'a Config,
        roidb: &'a [RoidbEntry],
        im_scales: &'a [f32],
        contributors: Vec<Box<dyn StageBlobContributor>>,
    ) -> Self {
        RunContext {
            cfg,
            roidb,
            im_scales,
            contributors,
            external: None,
        }
    }

    pub fn with_external(mut self, external: &'a mut dyn ExternalOps) -> Self {
        self.external = Some(external);
        self
    }
}

/// Network description: parameters, ops in execution order, the per-stage
/// parameter registry and the loss / metric blob names.
#[derive(Debug)]
pub struct DetectionNet {
    train: bool,
    params: Vec<Param>,
    param_names: BTreeMap<String, ParamId>,
    ops: Vec<Op>,
    stage_params: BTreeMap<u32, Vec<ParamId>>,
    losses: Vec<String>,
    metrics: Vec<String>,
    rng: StdRng,
}

impl DetectionNet {
    pub fn new(train: bool, seed: u64) -> Self {
        DetectionNet {
            train,
            params: Vec::new(),
            param_names: BTreeMap::new(),
            ops: Vec::new(),
            stage_params: BTreeMap::new(),
            losses: Vec::new(),
            metrics: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_train(&self) -> bool {
        self.train
    }

    pub fn create_param(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ParamId> {
        if self.param_names.contains_key(name) {
            return Err(CascadeError::DuplicateParam(name.to_string()));
        }
        let value = self.init_value(shape, init)?;
        let id = ParamId(self.params.len());
        self.params.push(Param {
            name: name.to_string(),
            value,
        });
        self.param_names.insert(name.to_string(), id);
        Ok(id)
    }

    fn init_value(&mut self, shape: &[usize], init: Init) -> Result<ArrayD<f32>> {
        let dim = IxDyn(shape);
        let size: usize = shape.iter().product();
        let normal = |std: f32| {
            Normal::new(0.0f32, std).map_err(|e| CascadeError::InvalidConfig(format!("bad init std {}: {}", std, e)))
        };
        let value = match init {
            Init::Const(v) => ArrayD::from_elem(dim, v),
            Init::Gauss(std) => ArrayD::random_using(dim, normal(std)?, &mut self.rng),
            Init::Xavier => {
                let fan_in = size / shape.first().copied().unwrap_or(1).max(1);
                let scale = (3.0 / fan_in.max(1) as f32).sqrt();
                ArrayD::random_using(dim, Uniform::new_inclusive(-scale, scale), &mut self.rng)
            }
            Init::Msra => {
                let fan_out = size / shape.get(1).copied().unwrap_or(1).max(1);
                let std = (2.0 / fan_out.max(1) as f32).sqrt();
                ArrayD::random_using(dim, normal(std)?, &mut self.rng)
            }
        };
        Ok(value)
    }

    pub fn param(&self, id: ParamId) -> Result<&Param> {
        self.params.get(id.0).ok_or(CascadeError::UnknownParam(id.0))
    }

    pub fn param_id(&self, name: &str) -> Option<ParamId> {
        self.param_names.get(name).copied()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    fn param_2d(&self, id: ParamId) -> Result<ArrayView2<f32>> {
        let p = self.param(id)?;
        p.value.view().into_dimensionality::<Ix2>().map_err(|_| CascadeError::BlobType {
            name: p.name.clone(),
            expected: "2-d f32",
        })
    }

    fn param_1d(&self, id: ParamId) -> Result<ArrayView1<f32>> {
        let p = self.param(id)?;
        p.value.view().into_dimensionality::<Ix1>().map_err(|_| CascadeError::BlobType {
            name: p.name.clone(),
            expected: "1-d f32",
        })
    }

    pub fn push_op(&mut self, op: Op) {
        debug!("net: + {}", op.kind());
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Appends `ids` to the stage's parameter group.
    pub fn register_stage_params(&mut self, stage: u32, ids: &[ParamId]) {
        self.stage_params.entry(stage).or_default().extend_from_slice(ids);
    }

    pub fn stage_params(&self, stage: u32) -> &[ParamId] {
        self.stage_params.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn stage_param_names(&self, stage: u32) -> Vec<&str> {
        self.stage_params(stage)
            .iter()
            .filter_map(|id| self.params.get(id.0))
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn add_losses(&mut self, names: &[String]) {
        self.losses.extend_from_slice(names);
    }

    pub fn add_metrics(&mut self, names: &[String]) {
        self.metrics.extend_from_slice(names);
    }

    pub fn losses(&self) -> &[String] {
        &self.losses
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// Allocates `<output>_w` (`dim_out x dim_in`) and `<output>_b`.
    pub fn fc(&mut self, input: &str, output: &str, dim_in: usize, dim_out: usize, weight_init: Init, bias_init: Init) -> Result<FcParams> {
        let weight = self.create_param(&format!("{}_w", output), &[dim_out, dim_in], weight_init)?;
        let bias = self.create_param(&format!("{}_b", output), &[dim_out], bias_init)?;
        let params = FcParams { weight, bias };
        self.fc_shared(input, output, params);
        Ok(params)
    }

    /// FC reusing existing parameters.
    pub fn fc_shared(&mut self, input: &str, output: &str, params: FcParams) {
        self.push_op(Op::Fc {
            input: input.to_string(),
            output: output.to_string(),
            params,
        });
    }

    pub fn relu(&mut self, blob: &str) {
        self.push_op(Op::Relu { blob: blob.to_string() });
    }

    pub fn softmax(&mut self, input: &str, output: &str) {
        self.push_op(Op::Softmax {
            input: input.to_string(),
            output: output.to_string(),
        });
    }

    /// Runs every op in order. Returns `false` as soon as a proposal
    /// distribution marks the minibatch invalid.
    pub fn run(&self, blobs: &mut Blobs, ctx: &mut RunContext<'_>) -> anyhow::Result<bool> {
        for (i, op) in self.ops.iter().enumerate() {
            let valid = self
                .run_op(op, blobs, ctx)
                .with_context(|| format!("running op #{} ({})", i, op.kind()))?;
            if !valid {
                warn!("op #{} ({}) invalidated the minibatch, skipping the remaining ops", i, op.kind());
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run_op(&self, op: &Op, blobs: &mut Blobs, ctx: &mut RunContext<'_>) -> anyhow::Result<bool> {
        match op {
            Op::RoiFeatureTransform(xform) => {
                let external = ctx
                    .external
                    .as_mut()
                    .ok_or_else(|| CascadeError::ExternalOp(op.kind().to_string()))?;
                let feat = external.roi_feature_transform(blobs, xform)?;
                blobs.insert(xform.output.clone(), feat);
            }
            Op::ScaleGrad { .. } => {}
            Op::Fc { input, output, params } => {
                let x = flatten_rows(input, blobs.f32_dyn(input)?)?;
                let y = fully_connected(x.view(), self.param_2d(params.weight)?, self.param_1d(params.bias)?)?;
                blobs.insert(output.clone(), y);
            }
            Op::Relu { blob } => {
                let mut x = blobs.f32_dyn(blob)?.to_owned();
                relu(&mut x);
                blobs.insert(blob.clone(), x);
            }
            Op::ConvGn(conv) => {
                let external = ctx
                    .external
                    .as_mut()
                    .ok_or_else(|| CascadeError::ExternalOp(op.kind().to_string()))?;
                let out = external.conv_gn(
                    blobs.f32_dyn(&conv.input)?,
                    self.param(conv.params.weight)?.value.view(),
                    self.param_1d(conv.params.gn_scale)?,
                    self.param_1d(conv.params.gn_bias)?,
                    conv.groups,
                    conv.epsilon,
                )?;
                blobs.insert(conv.output.clone(), out);
            }
            Op::Softmax { input, output } => {
                let prob = softmax(blobs.f32_2d(input)?);
                blobs.insert(output.clone(), prob);
            }
            Op::SoftmaxWithLoss { scores, labels, prob, loss, scale } => {
                let (p, l) = softmax_with_loss(blobs.f32_2d(scores)?, blobs.i32_1d(labels)?, *scale)?;
                blobs.insert(prob.clone(), p);
                blobs.insert(loss.clone(), Array1::from_elem(1, l));
            }
            Op::SmoothL1Loss { pred, targets, inside_weights, outside_weights, loss, scale } => {
                let l = smooth_l1_loss(
                    blobs.f32_2d(pred)?,
                    blobs.f32_2d(targets)?,
                    blobs.f32_2d(inside_weights)?,
                    blobs.f32_2d(outside_weights)?,
                    1.0,
                    *scale,
                )?;
                blobs.insert(loss.clone(), Array1::from_elem(1, l));
            }
            Op::Accuracy { prob, labels, output } => {
                let acc = accuracy(blobs.f32_2d(prob)?, blobs.i32_1d(labels)?)?;
                blobs.insert(output.clone(), Array1::from_elem(1, acc));
            }
            Op::BBoxAccuracy {
                pred,
                rois,
                labels,
                mapped_gt_boxes,
                iou,
                iou_pre,
                bbox_reg_weights,
                cls_agnostic_bbox_reg,
            } => {
                let acc = BBoxAccuracyOp::new(*bbox_reg_weights, *cls_agnostic_bbox_reg).forward(
                    blobs.f32_2d(pred)?,
                    blobs.f32_2d(rois)?,
                    blobs.i32_1d(labels)?,
                    blobs.f32_2d(mapped_gt_boxes)?,
                )?;
                blobs.insert(iou.clone(), Array1::from_elem(1, acc.avg_iou));
                blobs.insert(iou_pre.clone(), Array1::from_elem(1, acc.pre_avg_iou));
            }
            Op::DecodeBBoxes {
                pred,
                rois,
                mapped_gt_boxes,
                output,
                bbox_reg_weights,
                cls_agnostic_bbox_reg,
            } => {
                let mapped = match mapped_gt_boxes {
                    Some(name) => Some(blobs.f32_2d(name)?),
                    None => None,
                };
                let proposals = DecodeBBoxes::new(*bbox_reg_weights, *cls_agnostic_bbox_reg).forward(
                    blobs.f32_2d(pred)?,
                    blobs.f32_2d(rois)?,
                    mapped,
                )?;
                blobs.insert(output.clone(), proposals);
            }
            Op::DistributeCascadeProposals { stage } => {
                return distribute_cascade_proposals(
                    blobs,
                    ctx.cfg,
                    *stage,
                    self.train,
                    ctx.roidb,
                    ctx.im_scales,
                    &mut ctx.contributors,
                );
            }
            Op::Sum { inputs, output } => {
                let sum = {
                    let views = inputs.iter().map(|name| blobs.f32_2d(name)).collect::<Result<Vec<_>>>()?;
                    ensemble_sum(&views)?
                };
                blobs.insert(output.clone(), sum);
            }
        }
        Ok(true)
    }
}

/// Views `N x ...` as `N x prod(...)`.
fn flatten_rows(name: &str, x: ArrayViewD<f32>) -> Result<Array2<f32>> {
    let n = x.shape().first().copied().unwrap_or(0);
    let rest: usize = x.shape().iter().skip(1).product();
    x.as_standard_layout()
        .into_owned()
        .into_shape((n, rest))
        .map_err(|e| CascadeError::ShapeMismatch {
            context: "fc input",
            expected: format!("`{}` reshaped to ({}, {})", name, n, rest),
            actual: e.to_string(),
        })
}
