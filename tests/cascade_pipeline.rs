use ndarray::{array, ArrayD, ArrayView1, ArrayViewD, IxDyn};
use ndarray_npy::read_npy;

use rs_cascade_rcnn::pipeline::cascade_rcnn::net::RoiXform;
use rs_cascade_rcnn::pipeline::module::aux_blobs::StageBlobContributor;
use rs_cascade_rcnn::pipeline::module::minibatch::add_cascade_rcnn_blobs;
use rs_cascade_rcnn::{build_cascade_rcnn, Blobs, Config, ExternalOps, Result, RoidbEntry, RunContext};

const CHANNELS: usize = 4;

/// Pools every RoI to zeros, so each head sees its biases only.
#[derive(Default)]
struct ZeroFeatures {
    pooled: Vec<String>,
}

impl ExternalOps for ZeroFeatures {
    fn roi_feature_transform(&mut self, blobs: &Blobs, xform: &RoiXform) -> Result<ArrayD<f32>> {
        let n = blobs.f32_2d(&xform.rois)?.nrows();
        self.pooled.push(xform.rois.clone());
        Ok(ArrayD::zeros(IxDyn(&[n, CHANNELS, xform.resolution, xform.resolution])))
    }

    fn conv_gn(
        &mut self,
        input: ArrayViewD<f32>,
        weight: ArrayViewD<f32>,
        _gn_scale: ArrayView1<f32>,
        _gn_bias: ArrayView1<f32>,
        _groups: usize,
        _epsilon: f32,
    ) -> Result<ArrayD<f32>> {
        let s = input.shape();
        Ok(ArrayD::zeros(IxDyn(&[s[0], weight.shape()[0], s[2], s[3]])))
    }
}

fn config() -> Config {
    let yaml = r#"
model:
  num_classes: 3
fast_rcnn:
  mlp_head_dim: 8
  roi_xform_resolution: 2
train:
  ims_per_batch: 1
"#;
    Config::from_yaml_str(yaml).unwrap()
}

fn features() -> Vec<String> {
    (2..=5).map(|l| format!("fpn_res{}_sum", l)).collect()
}

const SCALES: [f32; 4] = [0.25, 0.125, 0.0625, 0.03125];

fn roidb() -> Vec<RoidbEntry> {
    let mut entry = RoidbEntry::from_gt(array![[10.0, 10.0, 89.0, 69.0]], array![2]).unwrap();
    let proposals = array![
        [12.0, 10.0, 91.0, 69.0],
        [20.0, 15.0, 95.0, 80.0],
        [200.0, 200.0, 260.0, 250.0],
        [40.0, 30.0, 120.0, 90.0]
    ];
    entry.add_proposals(proposals.view()).unwrap();
    vec![entry]
}

#[test]
fn test_training_forward_all_stages() {
    let cfg = config();
    let roidb = roidb();
    let im_scales = [1.0f32];
    let model = build_cascade_rcnn(&cfg, true, &features(), CHANNELS, &SCALES).unwrap();

    let mut blobs = Blobs::new();
    let mut none: Vec<Box<dyn StageBlobContributor>> = Vec::new();
    assert!(add_cascade_rcnn_blobs(&mut blobs, &cfg, &im_scales, &roidb, 1, &mut none).unwrap());

    let mut external = ZeroFeatures::default();
    {
        let mut ctx = RunContext::training(&cfg, &roidb, &im_scales, Vec::new()).with_external(&mut external);
        assert!(model.net.run(&mut blobs, &mut ctx).unwrap());
    }
    assert_eq!(external.pooled, vec!["rois_1", "rois_2", "rois_3"]);

    // zero features and zero-initialised biases give uniform class scores
    let uniform_nll = (cfg.model.num_classes as f32).ln();
    for (stage, weight) in [(1, 1.0f32), (2, 0.5), (3, 0.25)] {
        let loss_cls = blobs.scalar(&format!("loss_cls_{}", stage)).unwrap();
        assert!((loss_cls - uniform_nll * weight).abs() < 1e-4, "stage {} loss_cls {}", stage, loss_cls);
        assert!(blobs.scalar(&format!("loss_bbox_{}", stage)).unwrap().is_finite());
    }
    for name in model.net.metrics() {
        let v = blobs.scalar(name).unwrap();
        assert!((0.0..=1.0).contains(&v), "{} = {}", name, v);
    }

    // zero deltas leave the boxes where they were
    let iou = blobs.scalar("bbox_iou_1").unwrap();
    let iou_pre = blobs.scalar("bbox_iou_1_pre").unwrap();
    assert!(iou > 0.5);
    assert!((iou - iou_pre).abs() < 1e-4);

    let rois_3 = blobs.f32_2d("rois_3").unwrap();
    assert!(rois_3.nrows() > 0);
    assert!(blobs.contains("rois_3_idx_restore_int32"));
    assert_eq!(blobs.i32_1d("labels_int32_3").unwrap().len(), rois_3.nrows());
}

#[test]
fn test_inference_ensemble_and_npy_dump() {
    let cfg = config();
    let model = build_cascade_rcnn(&cfg, false, &features(), CHANNELS, &SCALES).unwrap();
    assert_eq!(model.cls_prob, "cls_prob_3_sum");

    let mut blobs = Blobs::new();
    blobs.insert("rois_1", array![[0.0f32, 10.0, 10.0, 89.0, 69.0], [0.0, 100.0, 40.0, 180.0, 120.0]]);
    let mut external = ZeroFeatures::default();
    {
        let mut ctx = RunContext::inference(&cfg).with_external(&mut external);
        assert!(model.net.run(&mut blobs, &mut ctx).unwrap());
    }

    // three stages' probabilities, each row summing to one
    let summed = blobs.f32_2d(&model.cls_prob).unwrap();
    assert_eq!(summed.dim(), (2, 3));
    for row in summed.rows() {
        assert!((row.sum() - 3.0).abs() < 1e-4);
    }
    assert_eq!(blobs.f32_2d("rois_3").unwrap().nrows(), 2);
    assert_eq!(blobs.f32_2d(&model.bbox_pred).unwrap().dim(), (2, 8));

    let dir = tempfile::tempdir().unwrap();
    blobs.write_npy_dir(dir.path()).unwrap();
    let dumped: ndarray::Array2<f32> = read_npy(dir.path().join("cls_prob_3_sum.npy")).unwrap();
    assert_eq!(dumped, summed);
}

#[test]
fn test_missing_external_kernel_is_reported() {
    let cfg = config();
    let model = build_cascade_rcnn(&cfg, false, &features(), CHANNELS, &SCALES).unwrap();
    let mut blobs = Blobs::new();
    blobs.insert("rois_1", array![[0.0f32, 10.0, 10.0, 89.0, 69.0]]);
    let mut ctx = RunContext::inference(&cfg);
    let err = model.net.run(&mut blobs, &mut ctx).unwrap_err();
    assert!(format!("{:#}", err).contains("RoIFeatureTransform"));
}
