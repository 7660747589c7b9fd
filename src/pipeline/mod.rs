pub mod cascade_rcnn;
pub mod module;
