use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Dimension};

use crate::error::{ensure_eq, CascadeError, Result};

/// Row-wise softmax with the row max subtracted first.
pub fn softmax(scores: ArrayView2<f32>) -> Array2<f32> {
    let mut prob = scores.to_owned();
    for mut row in prob.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    prob
}

/// Softmax followed by mean negative log-likelihood of `labels`, times `scale`.
///
/// Returns `(prob, loss)`; the loss of an empty batch is 0.
pub fn softmax_with_loss(scores: ArrayView2<f32>, labels: ArrayView1<i32>, scale: f32) -> Result<(Array2<f32>, f32)> {
    ensure_eq("softmax_with_loss labels", scores.nrows(), labels.len())?;
    let num_classes = scores.ncols();
    let prob = softmax(scores);
    if prob.nrows() == 0 {
        return Ok((prob, 0.0));
    }

    let mut nll = 0.0f32;
    for (row, &label) in prob.axis_iter(Axis(0)).zip(labels.iter()) {
        if label < 0 || label as usize >= num_classes {
            return Err(CascadeError::LabelOutOfRange { label, num_classes });
        }
        nll -= row[label as usize].max(f32::MIN_POSITIVE).ln();
    }
    let loss = nll / prob.nrows() as f32 * scale;
    Ok((prob, loss))
}

/// Smooth-L1 over `inside * (pred - target)`, weighted by `outside`, summed
/// and divided by the number of rows, times `scale`.
pub fn smooth_l1_loss(
    pred: ArrayView2<f32>,
    target: ArrayView2<f32>,
    inside: ArrayView2<f32>,
    outside: ArrayView2<f32>,
    beta: f32,
    scale: f32,
) -> Result<f32> {
    for (context, other) in [
        ("smooth_l1 targets", target.dim()),
        ("smooth_l1 inside weights", inside.dim()),
        ("smooth_l1 outside weights", outside.dim()),
    ] {
        if other != pred.dim() {
            return Err(CascadeError::ShapeMismatch {
                context,
                expected: format!("{:?}", pred.dim()),
                actual: format!("{:?}", other),
            });
        }
    }
    if pred.nrows() == 0 {
        return Ok(0.0);
    }

    let mut sum = 0.0f32;
    for (((&p, &t), &wi), &wo) in pred.iter().zip(target.iter()).zip(inside.iter()).zip(outside.iter()) {
        let val = wi * (p - t);
        let abs = val.abs();
        let l = if abs < beta { 0.5 * val * val / beta } else { abs - 0.5 * beta };
        sum += wo * l;
    }
    Ok(sum / pred.nrows() as f32 * scale)
}

/// Fraction of rows whose arg-max class equals the label.
pub fn accuracy(prob: ArrayView2<f32>, labels: ArrayView1<i32>) -> Result<f32> {
    ensure_eq("accuracy labels", prob.nrows(), labels.len())?;
    if prob.nrows() == 0 {
        return Ok(0.0);
    }
    let correct = prob
        .axis_iter(Axis(0))
        .zip(labels.iter())
        .filter(|(row, &label)| argmax(row.view()) as i32 == label)
        .count();
    Ok(correct as f32 / prob.nrows() as f32)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Elementwise sum of class-probability tensors; no renormalisation.
pub fn ensemble_sum(inputs: &[ArrayView2<f32>]) -> Result<Array2<f32>> {
    let first = inputs.first().ok_or_else(|| CascadeError::ShapeMismatch {
        context: "ensemble_sum inputs",
        expected: "at least one input".to_string(),
        actual: "none".to_string(),
    })?;
    let mut out = first.to_owned();
    for other in &inputs[1..] {
        if other.dim() != out.dim() {
            return Err(CascadeError::ShapeMismatch {
                context: "ensemble_sum inputs",
                expected: format!("{:?}", out.dim()),
                actual: format!("{:?}", other.dim()),
            });
        }
        out += other;
    }
    Ok(out)
}

/// `x * w^T + b` with `w` laid out `dim_out x dim_in`.
pub fn fully_connected(x: ArrayView2<f32>, weight: ArrayView2<f32>, bias: ArrayView1<f32>) -> Result<Array2<f32>> {
    ensure_eq("fc input dim", weight.ncols(), x.ncols())?;
    ensure_eq("fc bias dim", weight.nrows(), bias.len())?;
    Ok(x.dot(&weight.t()) + &bias)
}

pub fn relu<D: Dimension>(x: &mut Array<f32, D>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Per-class count of sampled labels, handy for logging class balance.
pub fn label_histogram(labels: ArrayView1<i32>, num_classes: usize) -> Array1<usize> {
    let mut hist = Array1::<usize>::zeros(num_classes);
    for &l in labels.iter() {
        if l >= 0 && (l as usize) < num_classes {
            hist[l as usize] += 1;
        }
    }
    hist
}
