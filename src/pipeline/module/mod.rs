pub mod aux_blobs;
pub mod cascade_heads;
pub mod minibatch;
pub mod roi_sampler;
