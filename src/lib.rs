pub mod error;
pub mod pipeline;
pub mod processing;
pub mod rcnn;

pub use error::{CascadeError, Result};
pub use pipeline::cascade_rcnn::builder::{build_cascade_rcnn, CascadeModel};
pub use pipeline::cascade_rcnn::config::Config;
pub use pipeline::cascade_rcnn::net::{DetectionNet, ExternalOps, RunContext};
pub use rcnn::blobs::Blobs;
pub use rcnn::roidb::RoidbEntry;
