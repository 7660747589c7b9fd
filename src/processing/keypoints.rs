use ndarray::{Array2, ArrayView2, ArrayView3};

use crate::error::{ensure_eq, Result};

/// `within[i, k]` is true when keypoint `k` of row `i` lies inside `boxes[i]`
/// (edges included). `keypoints` is `N x 3 x K` with `(x, y, visibility)`.
pub fn within_box(keypoints: ArrayView3<f32>, boxes: ArrayView2<f32>) -> Result<Array2<bool>> {
    let (n, _, k) = keypoints.dim();
    ensure_eq("within_box boxes", n, boxes.nrows())?;
    ensure_eq("within_box box columns", 4, boxes.ncols())?;
    Ok(Array2::from_shape_fn((n, k), |(i, j)| {
        let x = keypoints[[i, 0, j]];
        let y = keypoints[[i, 1, j]];
        x >= boxes[[i, 0]] && x <= boxes[[i, 2]] && y >= boxes[[i, 1]] && y <= boxes[[i, 3]]
    }))
}

/// Encodes keypoints as linear indices into a `heatmap_size x heatmap_size`
/// grid laid over each RoI.
///
/// Returns `(locations, weights)`, both `N x K`. A keypoint outside its RoI
/// or not visible gets location 0 and weight 0. Keypoints sitting exactly on
/// the right or bottom edge map to the last cell.
pub fn keypoints_to_heatmap_labels(
    keypoints: ArrayView3<f32>,
    rois: ArrayView2<f32>,
    heatmap_size: usize,
) -> Result<(Array2<i32>, Array2<i32>)> {
    let (n, c, k) = keypoints.dim();
    ensure_eq("heatmap keypoint coords", 3, c)?;
    ensure_eq("heatmap rois", n, rois.nrows())?;
    ensure_eq("heatmap roi columns", 4, rois.ncols())?;

    let m = heatmap_size as f32;
    let mut locations = Array2::<i32>::zeros((n, k));
    let mut weights = Array2::<i32>::zeros((n, k));
    for i in 0..n {
        let (x1, y1, x2, y2) = (rois[[i, 0]], rois[[i, 1]], rois[[i, 2]], rois[[i, 3]]);
        let scale_x = m / (x2 - x1);
        let scale_y = m / (y2 - y1);
        for j in 0..k {
            let kx = keypoints[[i, 0, j]];
            let ky = keypoints[[i, 1, j]];
            let x = if kx == x2 { m - 1.0 } else { ((kx - x1) * scale_x).floor() };
            let y = if ky == y2 { m - 1.0 } else { ((ky - y1) * scale_y).floor() };

            let in_grid = x >= 0.0 && y >= 0.0 && x < m && y < m;
            let visible = keypoints[[i, 2, j]] > 0.0;
            if in_grid && visible {
                locations[[i, j]] = (y * m + x) as i32;
                weights[[i, j]] = 1;
            }
        }
    }
    Ok((locations, weights))
}
