use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use crate::error::{ensure_eq, CascadeError, Result};
use crate::rcnn::bbox::boxes_area;
use crate::rcnn::blobs::Blobs;

/// Assigns every box to a pyramid level in `[min_level, max_level]`.
pub trait LevelAssigner {
    fn assign(&self, boxes: ArrayView2<f32>, min_level: u32, max_level: u32) -> Result<Array1<u32>>;
}

/// The FPN heuristic: a box of side `canonical_scale` lands on
/// `canonical_level`, one level per octave from there. Degenerate boxes
/// (negative or non-finite area) go to `min_level`.
#[derive(Debug, Clone)]
pub struct CanonicalLevelAssigner {
    pub canonical_scale: f32,
    pub canonical_level: u32,
}

impl CanonicalLevelAssigner {
    pub fn new(canonical_scale: f32, canonical_level: u32) -> Self {
        CanonicalLevelAssigner {
            canonical_scale,
            canonical_level,
        }
    }
}

impl LevelAssigner for CanonicalLevelAssigner {
    fn assign(&self, boxes: ArrayView2<f32>, min_level: u32, max_level: u32) -> Result<Array1<u32>> {
        ensure_eq("level assignment box columns", 4, boxes.ncols())?;
        let s0 = self.canonical_scale;
        let lvl0 = self.canonical_level as f32;
        Ok(boxes_area(boxes).mapv(|area| {
            let lvl = (lvl0 + (area.sqrt() / s0 + 1e-6).log2()).floor();
            if lvl.is_finite() {
                lvl.clamp(min_level as f32, max_level as f32) as u32
            } else {
                min_level
            }
        }))
    }
}

/// Per-level RoI subsets plus the index that restores the original order.
#[derive(Debug, Clone)]
pub struct MultilevelRois {
    pub levels: Vec<(u32, Array2<f32>)>,
    /// `stacked[idx_restore[i]] == rois[i]` where `stacked` concatenates the
    /// levels in ascending order.
    pub idx_restore: Array1<i32>,
}

/// Splits `rois` by `target_lvls`, keeping the within-level order. Every
/// level must lie in `[min_level, max_level]`.
pub fn distribute_rois(rois: ArrayView2<f32>, target_lvls: &Array1<u32>, min_level: u32, max_level: u32) -> Result<MultilevelRois> {
    ensure_eq("distribute_rois levels", rois.nrows(), target_lvls.len())?;
    if let Some(&level) = target_lvls.iter().find(|&&l| l < min_level || l > max_level) {
        return Err(CascadeError::LevelOutOfRange {
            level,
            min_level,
            max_level,
        });
    }

    let mut order: Vec<usize> = Vec::with_capacity(rois.nrows());
    let mut levels = Vec::new();
    for lvl in min_level..=max_level {
        let idx_lvl: Vec<usize> = target_lvls
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == lvl)
            .map(|(i, _)| i)
            .collect();
        levels.push((lvl, rois.select(Axis(0), &idx_lvl)));
        order.extend(idx_lvl);
    }
    ensure_eq("distribute_rois stacked rows", rois.nrows(), order.len())?;

    // argsort of the stacking order
    let mut idx_restore = Array1::<i32>::zeros(order.len());
    for (stacked_pos, &orig) in order.iter().enumerate() {
        idx_restore[orig] = stacked_pos as i32;
    }
    Ok(MultilevelRois { levels, idx_restore })
}

/// Adds `<name>_fpn<lvl>` and `<name>_idx_restore_int32` for the RoI blob
/// `name` (`batch_idx, x1, y1, x2, y2`).
pub fn add_multilevel_roi_blobs(
    blobs: &mut Blobs,
    name: &str,
    assigner: &dyn LevelAssigner,
    min_level: u32,
    max_level: u32,
) -> Result<()> {
    let rois = blobs.f32_2d(name)?.to_owned();
    ensure_eq("multilevel rois columns", 5, rois.ncols())?;
    let target_lvls = assigner.assign(rois.slice(s![.., 1..5]), min_level, max_level)?;
    let distributed = distribute_rois(rois.view(), &target_lvls, min_level, max_level)?;
    for (lvl, lvl_rois) in distributed.levels {
        blobs.insert(format!("{}_fpn{}", name, lvl), lvl_rois);
    }
    blobs.insert(format!("{}_idx_restore_int32", name), distributed.idx_restore);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, concatenate};

    #[test]
    fn test_canonical_levels() {
        let assigner = CanonicalLevelAssigner::new(224.0, 4);
        let boxes = array![
            [0.0, 0.0, 223.0, 223.0],
            [0.0, 0.0, 111.0, 111.0],
            [0.0, 0.0, 447.0, 447.0],
            [0.0, 0.0, 9.0, 9.0],
            [0.0, 0.0, 4000.0, 4000.0]
        ];
        let lvls = assigner.assign(boxes.view(), 2, 5).unwrap();
        assert_eq!(lvls, array![4, 3, 5, 2, 5]);
    }

    #[test]
    fn test_restore_index_round_trips() {
        let rois = array![
            [0.0, 0.0, 0.0, 9.0, 9.0],
            [0.0, 0.0, 0.0, 500.0, 500.0],
            [1.0, 0.0, 0.0, 223.0, 223.0],
            [1.0, 5.0, 5.0, 14.0, 14.0]
        ];
        let lvls = array![2u32, 5, 4, 2];
        let out = distribute_rois(rois.view(), &lvls, 2, 5).unwrap();
        assert_eq!(out.levels.len(), 4);
        assert_eq!(out.levels[0].1.nrows(), 2);
        assert_eq!(out.levels[1].1.nrows(), 0);

        let views: Vec<_> = out.levels.iter().map(|(_, r)| r.view()).collect();
        let stacked = concatenate(Axis(0), &views).unwrap();
        let restore: Vec<usize> = out.idx_restore.iter().map(|&i| i as usize).collect();
        assert_eq!(stacked.select(Axis(0), &restore), rois);
    }

    #[test]
    fn test_add_multilevel_roi_blobs() {
        let mut blobs = Blobs::new();
        blobs.insert("rois_2", array![[0.0f32, 0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 0.0, 223.0, 223.0]]);
        let assigner = CanonicalLevelAssigner::new(224.0, 4);
        add_multilevel_roi_blobs(&mut blobs, "rois_2", &assigner, 2, 5).unwrap();
        assert_eq!(blobs.f32_2d("rois_2_fpn2").unwrap().nrows(), 1);
        assert_eq!(blobs.f32_2d("rois_2_fpn4").unwrap().nrows(), 1);
        assert_eq!(blobs.f32_2d("rois_2_fpn5").unwrap().nrows(), 0);
        assert_eq!(blobs.i32_1d("rois_2_idx_restore_int32").unwrap().to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_negative_width_box_goes_to_min_level() {
        let assigner = CanonicalLevelAssigner::new(224.0, 4);
        let boxes = array![[10.0, 0.0, 5.0, 9.0], [0.0, 0.0, 9.0, 9.0], [0.0, 0.0, f32::NAN, 9.0]];
        assert_eq!(assigner.assign(boxes.view(), 2, 5).unwrap(), array![2, 2, 2]);

        let mut blobs = Blobs::new();
        blobs.insert("rois_3", array![[0.0f32, 10.0, 0.0, 5.0, 9.0], [0.0, 0.0, 0.0, 9.0, 9.0]]);
        add_multilevel_roi_blobs(&mut blobs, "rois_3", &assigner, 2, 5).unwrap();
        assert_eq!(blobs.f32_2d("rois_3_fpn2").unwrap().nrows(), 2);
        assert_eq!(blobs.i32_1d("rois_3_idx_restore_int32").unwrap().to_vec(), vec![0, 1]);
    }

    struct FixedLevel(u32);

    impl LevelAssigner for FixedLevel {
        fn assign(&self, boxes: ArrayView2<f32>, _min_level: u32, _max_level: u32) -> Result<Array1<u32>> {
            Ok(Array1::from_elem(boxes.nrows(), self.0))
        }
    }

    #[test]
    fn test_out_of_range_level_rejected() {
        let mut blobs = Blobs::new();
        blobs.insert("rois_2", array![[0.0f32, 0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 0.0, 223.0, 223.0]]);
        let err = add_multilevel_roi_blobs(&mut blobs, "rois_2", &FixedLevel(6), 2, 5).unwrap_err();
        assert!(matches!(err, CascadeError::LevelOutOfRange { level: 6, min_level: 2, max_level: 5 }));
        assert!(!blobs.contains("rois_2_idx_restore_int32"));

        let lvls = array![1u32, 3];
        let rois = array![[0.0f32, 0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 0.0, 99.0, 99.0]];
        assert!(distribute_rois(rois.view(), &lvls, 2, 5).is_err());
    }
}
