//! Box heads, per-stage outputs and losses of the cascade, plus the ops that
//! chain one stage's predictions into the next stage's RoIs.
//!
//! ```text
//! rois_<s> -> RoI transform -> box head -> cls_score_<s> -> loss_cls_<s>
//!                                       \-> bbox_pred_<s> -> loss_bbox_<s>
//!                                                         \-> decode -> proposals_<s+1>
//! ```

use crate::error::{CascadeError, Result};
use crate::pipeline::cascade_rcnn::config::{Config, RoiBoxHead};
use crate::pipeline::cascade_rcnn::net::{ConvGn, ConvGnParams, DetectionNet, FcParams, Init, Op, RoiXform};
use crate::rcnn::blobs::stage_suffix;

#[derive(Debug, Clone, PartialEq)]
pub enum BoxHeadParams {
    Mlp2 { fc6: FcParams, fc7: FcParams },
    Xconv1fcGn { convs: Vec<ConvGnParams>, fc6: FcParams },
}

/// A stage's box head: its output blob, width and parameter handles.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxHead {
    pub output: String,
    pub dim: usize,
    pub params: BoxHeadParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutputs {
    pub cls_prob: String,
    pub bbox_pred: String,
    pub cls_score_params: FcParams,
    pub bbox_pred_params: FcParams,
}

/// Decodes `bbox_pred_<pre>` into `proposals_<stage>` and turns those into
/// the stage's RoIs (labelled and sampled when training).
pub fn add_cascade_proposal_outputs(net: &mut DetectionNet, cfg: &Config, stage: u32, pre_stage: u32) -> Result<()> {
    if !cfg.fpn.fpn_on {
        return Err(CascadeError::FpnRequired);
    }
    let pre = stage_suffix(pre_stage);
    let bbox_reg_weights = cfg.stage(pre_stage)?.bbox_reg_weights;
    cfg.stage(stage)?;
    let mapped_gt_boxes = net.is_train().then(|| format!("mapped_gt_boxes{}", pre));

    net.push_op(Op::DecodeBBoxes {
        pred: format!("bbox_pred{}", pre),
        rois: format!("rois{}", pre),
        mapped_gt_boxes,
        output: format!("proposals{}", stage_suffix(stage)),
        bbox_reg_weights,
        cls_agnostic_bbox_reg: cfg.model.cls_agnostic_bbox_reg,
    });
    net.push_op(Op::DistributeCascadeProposals { stage });
    Ok(())
}

/// `cls_score_<s>` and `bbox_pred_<s>` on top of the box head output.
/// Probabilities are only produced here at inference; training gets them
/// from the loss.
pub fn add_cascade_rcnn_outputs(net: &mut DetectionNet, cfg: &Config, blob_in: &str, dim: usize, stage: u32) -> Result<StageOutputs> {
    let sfx = stage_suffix(stage);
    let cls_score = format!("cls_score{}", sfx);
    let cls_prob = format!("cls_prob{}", sfx);
    let bbox_pred = format!("bbox_pred{}", sfx);

    let cls_score_params = net.fc(blob_in, &cls_score, dim, cfg.model.num_classes, Init::Gauss(0.01), Init::Const(0.0))?;
    if !net.is_train() {
        net.softmax(&cls_score, &cls_prob);
    }
    let bbox_pred_params = net.fc(
        blob_in,
        &bbox_pred,
        dim,
        cfg.num_bbox_reg_classes() * 4,
        Init::Gauss(0.001),
        Init::Const(0.0),
    )?;

    net.register_stage_params(
        stage,
        &[
            cls_score_params.weight,
            cls_score_params.bias,
            bbox_pred_params.weight,
            bbox_pred_params.bias,
        ],
    );
    Ok(StageOutputs {
        cls_prob,
        bbox_pred,
        cls_score_params,
        bbox_pred_params,
    })
}

/// Classification and box losses of a stage, plus its accuracy metrics.
/// Returns the loss blob names.
pub fn add_cascade_rcnn_losses(net: &mut DetectionNet, cfg: &Config, stage: u32) -> Result<Vec<String>> {
    let sfx = stage_suffix(stage);
    let scale = cfg.loss_scale(stage)?;
    let params = cfg.stage(stage)?;
    let labels = format!("labels_int32{}", sfx);
    let loss_cls = format!("loss_cls{}", sfx);
    let loss_bbox = format!("loss_bbox{}", sfx);
    let accuracy_cls = format!("accuracy_cls{}", sfx);

    net.push_op(Op::SoftmaxWithLoss {
        scores: format!("cls_score{}", sfx),
        labels: labels.clone(),
        prob: format!("cls_prob{}", sfx),
        loss: loss_cls.clone(),
        scale,
    });
    net.push_op(Op::SmoothL1Loss {
        pred: format!("bbox_pred{}", sfx),
        targets: format!("bbox_targets{}", sfx),
        inside_weights: format!("bbox_inside_weights{}", sfx),
        outside_weights: format!("bbox_outside_weights{}", sfx),
        loss: loss_bbox.clone(),
        scale,
    });
    net.push_op(Op::Accuracy {
        prob: format!("cls_prob{}", sfx),
        labels: labels.clone(),
        output: accuracy_cls.clone(),
    });
    let losses = vec![loss_cls, loss_bbox];
    net.add_losses(&losses);
    net.add_metrics(&[accuracy_cls]);

    let iou = format!("bbox_iou{}", sfx);
    let iou_pre = format!("bbox_iou{}_pre", sfx);
    net.push_op(Op::BBoxAccuracy {
        pred: format!("bbox_pred{}", sfx),
        rois: format!("rois{}", sfx),
        labels,
        mapped_gt_boxes: format!("mapped_gt_boxes{}", sfx),
        iou: iou.clone(),
        iou_pre: iou_pre.clone(),
        bbox_reg_weights: params.bbox_reg_weights,
        cls_agnostic_bbox_reg: cfg.model.cls_agnostic_bbox_reg,
    });
    net.add_metrics(&[iou, iou_pre]);
    Ok(losses)
}

/// Pools `rois_<s>` into `roi_<s>_feat`, with the optional gradient scale.
fn add_roi_feature_transform(
    net: &mut DetectionNet,
    cfg: &Config,
    blob_in: &[String],
    spatial_scales: &[f32],
    stage: u32,
) -> Result<String> {
    let roi_feat = format!("roi{}_feat", stage_suffix(stage));
    net.push_op(Op::RoiFeatureTransform(RoiXform {
        features: blob_in.to_vec(),
        rois: format!("rois{}", stage_suffix(stage)),
        output: roi_feat.clone(),
        method: cfg.fast_rcnn.roi_xform_method,
        resolution: cfg.fast_rcnn.roi_xform_resolution,
        sampling_ratio: cfg.fast_rcnn.roi_xform_sampling_ratio,
        spatial_scales: spatial_scales.to_vec(),
    }));
    if let Some(scale) = cfg.grad_scale(stage)? {
        net.push_op(Op::ScaleGrad {
            blob: roi_feat.clone(),
            scale,
        });
    }
    Ok(roi_feat)
}

/// Two hidden FC layers with ReLU.
pub fn add_roi_2mlp_head(
    net: &mut DetectionNet,
    cfg: &Config,
    blob_in: &[String],
    dim_in: usize,
    spatial_scales: &[f32],
    stage: u32,
) -> Result<BoxHead> {
    let sfx = stage_suffix(stage);
    let hidden_dim = cfg.fast_rcnn.mlp_head_dim;
    let roi_size = cfg.fast_rcnn.roi_xform_resolution;
    let roi_feat = add_roi_feature_transform(net, cfg, blob_in, spatial_scales, stage)?;

    let fc6_out = format!("fc6{}", sfx);
    let fc7_out = format!("fc7{}", sfx);
    let fc6 = net.fc(&roi_feat, &fc6_out, dim_in * roi_size * roi_size, hidden_dim, Init::Xavier, Init::Const(0.0))?;
    net.relu(&fc6_out);
    let fc7 = net.fc(&fc6_out, &fc7_out, hidden_dim, hidden_dim, Init::Xavier, Init::Const(0.0))?;
    net.relu(&fc7_out);

    net.register_stage_params(stage, &[fc6.weight, fc6.bias, fc7.weight, fc7.bias]);
    Ok(BoxHead {
        output: fc7_out,
        dim: hidden_dim,
        params: BoxHeadParams::Mlp2 { fc6, fc7 },
    })
}

/// Runs the 2-MLP head of `head_stage` and its classifier on the pooled
/// features of `roi_stage`. Returns `cls_prob_<head>_<roi>`.
pub fn add_roi_2mlp_head_shared(
    net: &mut DetectionNet,
    head: &BoxHead,
    cls_score: FcParams,
    head_stage: u32,
    roi_stage: u32,
) -> Result<String> {
    let BoxHeadParams::Mlp2 { fc6, fc7 } = &head.params else {
        return Err(CascadeError::InvalidConfig(format!(
            "stage {} head is not a 2mlp head",
            head_stage
        )));
    };
    let sfx = format!("_{}_{}", head_stage, roi_stage);
    let roi_feat = format!("roi_{}_feat", roi_stage);
    let fc6_out = format!("fc6{}", sfx);
    let fc7_out = format!("fc7{}", sfx);

    net.fc_shared(&roi_feat, &fc6_out, *fc6);
    net.relu(&fc6_out);
    net.fc_shared(&fc6_out, &fc7_out, *fc7);
    net.relu(&fc7_out);
    Ok(add_shared_classifier(net, &fc7_out, cls_score, &sfx))
}

fn add_shared_classifier(net: &mut DetectionNet, blob_in: &str, cls_score: FcParams, sfx: &str) -> String {
    let score = format!("cls_score{}", sfx);
    let prob = format!("cls_prob{}", sfx);
    net.fc_shared(blob_in, &score, cls_score);
    net.softmax(&score, &prob);
    prob
}

/// `num_stacked_convs` x (3x3 conv + group norm + ReLU) followed by one FC.
pub fn add_roi_xconv1fc_gn_head(
    net: &mut DetectionNet,
    cfg: &Config,
    blob_in: &[String],
    dim_in: usize,
    spatial_scales: &[f32],
    stage: u32,
) -> Result<BoxHead> {
    let sfx = stage_suffix(stage);
    let hidden_dim = cfg.fast_rcnn.conv_head_dim;
    let roi_size = cfg.fast_rcnn.roi_xform_resolution;
    let groups = cfg.group_norm.groups_for(hidden_dim)?;
    let mut current = add_roi_feature_transform(net, cfg, blob_in, spatial_scales, stage)?;

    let mut dim_in = dim_in;
    let mut convs = Vec::with_capacity(cfg.fast_rcnn.num_stacked_convs);
    for i in 0..cfg.fast_rcnn.num_stacked_convs {
        let prefix = format!("head_conv{}{}", i + 1, sfx);
        let params = ConvGnParams {
            weight: net.create_param(&format!("{}_w", prefix), &[hidden_dim, dim_in, 3, 3], Init::Msra)?,
            gn_scale: net.create_param(&format!("{}_gn_s", prefix), &[hidden_dim], Init::Const(1.0))?,
            gn_bias: net.create_param(&format!("{}_gn_b", prefix), &[hidden_dim], Init::Const(0.0))?,
        };
        net.push_op(Op::ConvGn(ConvGn {
            input: current,
            output: prefix.clone(),
            params,
            groups,
            epsilon: cfg.group_norm.epsilon,
        }));
        net.relu(&prefix);
        convs.push(params);
        current = prefix;
        dim_in = hidden_dim;
    }

    let fc_dim = cfg.fast_rcnn.mlp_head_dim;
    let fc6_out = format!("fc6{}", sfx);
    let fc6 = net.fc(&current, &fc6_out, dim_in * roi_size * roi_size, fc_dim, Init::Xavier, Init::Const(0.0))?;
    net.relu(&fc6_out);

    // weights first (conv, gn scale per conv, then fc6), then biases
    let mut weights: Vec<_> = convs.iter().flat_map(|c| [c.weight, c.gn_scale]).collect();
    weights.push(fc6.weight);
    let mut biases: Vec<_> = convs.iter().map(|c| c.gn_bias).collect();
    biases.push(fc6.bias);
    net.register_stage_params(stage, &weights);
    net.register_stage_params(stage, &biases);

    Ok(BoxHead {
        output: fc6_out,
        dim: fc_dim,
        params: BoxHeadParams::Xconv1fcGn { convs, fc6 },
    })
}

/// Shared-weight version of [`add_roi_xconv1fc_gn_head`] on the pooled
/// features of `roi_stage`. Returns `cls_prob_<head>_<roi>`.
pub fn add_roi_xconv1fc_gn_head_shared(
    net: &mut DetectionNet,
    cfg: &Config,
    head: &BoxHead,
    cls_score: FcParams,
    head_stage: u32,
    roi_stage: u32,
) -> Result<String> {
    let BoxHeadParams::Xconv1fcGn { convs, fc6 } = &head.params else {
        return Err(CascadeError::InvalidConfig(format!(
            "stage {} head is not an Xconv1fc_gn head",
            head_stage
        )));
    };
    let sfx = format!("_{}_{}", head_stage, roi_stage);
    let groups = cfg.group_norm.groups_for(cfg.fast_rcnn.conv_head_dim)?;
    let mut current = format!("roi_{}_feat", roi_stage);
    for (i, params) in convs.iter().enumerate() {
        let prefix = format!("head_conv{}{}", i + 1, sfx);
        net.push_op(Op::ConvGn(ConvGn {
            input: current,
            output: prefix.clone(),
            params: *params,
            groups,
            epsilon: cfg.group_norm.epsilon,
        }));
        net.relu(&prefix);
        current = prefix;
    }

    let fc6_out = format!("fc6{}", sfx);
    net.fc_shared(&current, &fc6_out, *fc6);
    net.relu(&fc6_out);
    Ok(add_shared_classifier(net, &fc6_out, cls_score, &sfx))
}

/// The box head selected by `fast_rcnn.roi_box_head`.
pub fn add_box_head(
    net: &mut DetectionNet,
    cfg: &Config,
    blob_in: &[String],
    dim_in: usize,
    spatial_scales: &[f32],
    stage: u32,
) -> Result<BoxHead> {
    match cfg.fast_rcnn.roi_box_head {
        RoiBoxHead::Mlp2 => add_roi_2mlp_head(net, cfg, blob_in, dim_in, spatial_scales, stage),
        RoiBoxHead::Xconv1fcGn => add_roi_xconv1fc_gn_head(net, cfg, blob_in, dim_in, spatial_scales, stage),
    }
}

pub fn add_box_head_shared(
    net: &mut DetectionNet,
    cfg: &Config,
    head: &BoxHead,
    cls_score: FcParams,
    head_stage: u32,
    roi_stage: u32,
) -> Result<String> {
    match head.params {
        BoxHeadParams::Mlp2 { .. } => add_roi_2mlp_head_shared(net, head, cls_score, head_stage, roi_stage),
        BoxHeadParams::Xconv1fcGn { .. } => add_roi_xconv1fc_gn_head_shared(net, cfg, head, cls_score, head_stage, roi_stage),
    }
}

/// `cls_prob_<stage>_sum`, the unnormalised sum of `inputs`.
pub fn add_ensemble_output(net: &mut DetectionNet, inputs: &[String], stage: u32) -> String {
    let output = format!("cls_prob_{}_sum", stage);
    net.push_op(Op::Sum {
        inputs: inputs.to_vec(),
        output: output.clone(),
    });
    output
}
