use anyhow::Context;
use tracing::info;

use crate::pipeline::cascade_rcnn::config::Config;
use crate::pipeline::cascade_rcnn::net::DetectionNet;
use crate::pipeline::module::cascade_heads::{
    add_box_head, add_box_head_shared, add_cascade_proposal_outputs, add_cascade_rcnn_losses, add_cascade_rcnn_outputs,
    add_ensemble_output, BoxHead, StageOutputs,
};

/// A built cascade: the net plus the per-stage head handles.
#[derive(Debug)]
pub struct CascadeModel {
    pub net: DetectionNet,
    pub heads: Vec<BoxHead>,
    pub outputs: Vec<StageOutputs>,
    /// Class probabilities of the last built stage (the ensemble sum at
    /// inference when enabled).
    pub cls_prob: String,
    pub bbox_pred: String,
}

/// Builds every stage for training, or stages `1..=test_stage` for
/// inference. `blob_in` are the FPN feature blobs with their
/// `spatial_scales`, each with `dim_in` channels.
pub fn build_cascade_rcnn(
    cfg: &Config,
    train: bool,
    blob_in: &[String],
    dim_in: usize,
    spatial_scales: &[f32],
) -> anyhow::Result<CascadeModel> {
    cfg.validate()?;
    let last_stage = if train {
        cfg.cascade_rcnn.num_stages as u32
    } else {
        cfg.cascade_rcnn.test_stage
    };

    let mut net = DetectionNet::new(train, cfg.train.rng_seed);
    let mut heads = Vec::with_capacity(last_stage as usize);
    let mut outputs = Vec::with_capacity(last_stage as usize);
    for stage in 1..=last_stage {
        if stage > 1 {
            add_cascade_proposal_outputs(&mut net, cfg, stage, stage - 1)
                .with_context(|| format!("building stage {} proposals", stage))?;
        }
        let head = add_box_head(&mut net, cfg, blob_in, dim_in, spatial_scales, stage)
            .with_context(|| format!("building stage {} box head", stage))?;
        let out = add_cascade_rcnn_outputs(&mut net, cfg, &head.output, head.dim, stage)
            .with_context(|| format!("building stage {} outputs", stage))?;
        if train {
            add_cascade_rcnn_losses(&mut net, cfg, stage).with_context(|| format!("building stage {} losses", stage))?;
        }
        heads.push(head);
        outputs.push(out);
    }

    let (mut cls_prob, bbox_pred) = match outputs.last() {
        Some(out) => (out.cls_prob.clone(), out.bbox_pred.clone()),
        None => anyhow::bail!("cascade has no stages"),
    };

    if !train && cfg.cascade_rcnn.test_ensemble && last_stage > 1 {
        let mut probs = vec![cls_prob];
        for (i, (head, out)) in heads.iter().zip(&outputs).take(last_stage as usize - 1).enumerate() {
            let head_stage = i as u32 + 1;
            let prob = add_box_head_shared(&mut net, cfg, head, out.cls_score_params, head_stage, last_stage)
                .with_context(|| format!("sharing stage {} head on stage {} rois", head_stage, last_stage))?;
            probs.push(prob);
        }
        cls_prob = add_ensemble_output(&mut net, &probs, last_stage);
    }

    info!(
        "built cascade r-cnn ({}): {} stages, {} params, {} ops",
        if train { "train" } else { "test" },
        last_stage,
        net.num_params(),
        net.ops().len()
    );
    Ok(CascadeModel {
        net,
        heads,
        outputs,
        cls_prob,
        bbox_pred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CascadeError;
    use crate::pipeline::cascade_rcnn::net::Op;

    fn small_cfg() -> Config {
        let mut cfg = Config::new();
        cfg.model.num_classes = 3;
        cfg.fast_rcnn.mlp_head_dim = 8;
        cfg.fast_rcnn.roi_xform_resolution = 2;
        cfg
    }

    fn features() -> Vec<String> {
        (2..=5).map(|l| format!("fpn_res{}_sum", l)).collect()
    }

    const SCALES: [f32; 4] = [0.25, 0.125, 0.0625, 0.03125];

    #[test]
    fn test_training_net_has_all_stages() {
        let cfg = small_cfg();
        let model = build_cascade_rcnn(&cfg, true, &features(), 4, &SCALES).unwrap();
        let net = &model.net;
        assert_eq!(model.heads.len(), 3);
        assert_eq!(model.cls_prob, "cls_prob_3");
        for s in 1..=3 {
            assert_eq!(net.stage_params(s).len(), 8);
        }
        assert_eq!(net.losses().len(), 6);
        assert_eq!(net.metrics().len(), 9);
        let distributions: Vec<u32> = net
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::DistributeCascadeProposals { stage } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(distributions, vec![2, 3]);
        assert!(!net.ops().iter().any(|op| matches!(op, Op::Sum { .. })));
    }

    #[test]
    fn test_inference_net_ensembles_earlier_heads() {
        let mut cfg = small_cfg();
        cfg.cascade_rcnn.test_stage = 2;
        let model = build_cascade_rcnn(&cfg, false, &features(), 4, &SCALES).unwrap();
        assert_eq!(model.heads.len(), 2);
        assert_eq!(model.cls_prob, "cls_prob_2_sum");
        assert_eq!(model.bbox_pred, "bbox_pred_2");
        assert!(model.net.losses().is_empty());
        match model.net.ops().last() {
            Some(Op::Sum { inputs, .. }) => assert_eq!(inputs, &["cls_prob_2".to_string(), "cls_prob_1_2".to_string()]),
            other => panic!("unexpected last op {:?}", other),
        }
    }

    #[test]
    fn test_inference_without_ensemble() {
        let mut cfg = small_cfg();
        cfg.cascade_rcnn.test_ensemble = false;
        let model = build_cascade_rcnn(&cfg, false, &features(), 4, &SCALES).unwrap();
        assert_eq!(model.cls_prob, "cls_prob_3");
        assert!(!model.net.ops().iter().any(|op| matches!(op, Op::Sum { .. })));
    }

    #[test]
    fn test_multi_stage_needs_fpn() {
        let mut cfg = small_cfg();
        cfg.fpn.fpn_on = false;
        let err = build_cascade_rcnn(&cfg, true, &features(), 4, &SCALES).unwrap_err();
        assert!(matches!(err.downcast_ref::<CascadeError>(), Some(CascadeError::FpnRequired)));
    }
}
