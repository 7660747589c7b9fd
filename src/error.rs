use thiserror::Error;

/// Contract and configuration violations raised by the cascade operators.
///
/// None of these are recoverable inside a training step: they point at a
/// mis-wired network or a bad config and the run should stop.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("cascade box decoding requires class-agnostic bbox regression with 8 delta columns, got {columns} columns (cls_agnostic_bbox_reg = {cls_agnostic})")]
    ClassAgnosticRequired { cls_agnostic: bool, columns: usize },

    #[error("cascade proposal distribution is only supported with an FPN backbone")]
    FpnRequired,

    #[error("stage {stage} is out of range, config defines {num_stages} stages")]
    InvalidStage { stage: u32, num_stages: usize },

    #[error("blob `{0}` not found")]
    MissingBlob(String),

    #[error("blob `{name}` has the wrong type: expected {expected}")]
    BlobType { name: String, expected: &'static str },

    #[error("foreground box {index} has no ground-truth assignment")]
    MissingGtAssignment { index: usize },

    #[error("pyramid level {level} outside [{min_level}, {max_level}]")]
    LevelOutOfRange { level: u32, min_level: u32, max_level: u32 },

    #[error("roidb entry has no ground-truth boxes")]
    NoGroundTruth,

    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: i32, num_classes: usize },

    #[error("parameter #{0} is not allocated in this net")]
    UnknownParam(usize),

    #[error("parameter `{0}` already exists")]
    DuplicateParam(String),

    #[error("op `{0}` needs an external kernel and none was provided")]
    ExternalOp(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = CascadeError> = std::result::Result<T, E>;

/// Fails with [`CascadeError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn ensure_eq(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CascadeError::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
