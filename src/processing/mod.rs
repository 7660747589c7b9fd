pub mod bbox_accuracy;
pub mod bbox_regression;
pub mod decode_bboxes;
pub mod fpn;
pub mod keypoints;
pub mod losses;
