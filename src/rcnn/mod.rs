pub mod bbox;
pub mod blobs;
pub mod roidb;
