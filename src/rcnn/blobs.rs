use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use ndarray::{concatenate, Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, Ix1, Ix2};
use ndarray_npy::write_npy;

use crate::error::{CascadeError, Result};

/// A named tensor exchanged between ops.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
}

impl Blob {
    pub fn shape(&self) -> &[usize] {
        match self {
            Blob::F32(a) => a.shape(),
            Blob::I32(a) => a.shape(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }
}

impl From<Array2<f32>> for Blob {
    fn from(a: Array2<f32>) -> Self {
        Blob::F32(a.into_dyn())
    }
}

impl From<Array1<f32>> for Blob {
    fn from(a: Array1<f32>) -> Self {
        Blob::F32(a.into_dyn())
    }
}

impl From<ArrayD<f32>> for Blob {
    fn from(a: ArrayD<f32>) -> Self {
        Blob::F32(a)
    }
}

impl From<Array2<i32>> for Blob {
    fn from(a: Array2<i32>) -> Self {
        Blob::I32(a.into_dyn())
    }
}

impl From<Array1<i32>> for Blob {
    fn from(a: Array1<i32>) -> Self {
        Blob::I32(a.into_dyn())
    }
}

/// Name -> blob workspace for one minibatch.
#[derive(Debug, Clone, Default)]
pub struct Blobs {
    inner: BTreeMap<String, Blob>,
}

impl Blobs {
    pub fn new() -> Self {
        Blobs::default()
    }

    pub fn insert<B: Into<Blob>>(&mut self, name: impl Into<String>, blob: B) {
        self.inner.insert(name.into(), blob.into());
    }

    pub fn get(&self, name: &str) -> Result<&Blob> {
        self.inner.get(name).ok_or_else(|| CascadeError::MissingBlob(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn f32_2d(&self, name: &str) -> Result<ArrayView2<f32>> {
        match self.get(name)? {
            Blob::F32(a) => a.view().into_dimensionality::<Ix2>().map_err(|_| CascadeError::BlobType {
                name: name.to_string(),
                expected: "2-d f32",
            }),
            Blob::I32(_) => Err(CascadeError::BlobType { name: name.to_string(), expected: "2-d f32" }),
        }
    }

    pub fn f32_dyn(&self, name: &str) -> Result<ArrayViewD<f32>> {
        match self.get(name)? {
            Blob::F32(a) => Ok(a.view()),
            Blob::I32(_) => Err(CascadeError::BlobType { name: name.to_string(), expected: "f32" }),
        }
    }

    pub fn f32_1d(&self, name: &str) -> Result<ArrayView1<f32>> {
        match self.get(name)? {
            Blob::F32(a) => a.view().into_dimensionality::<Ix1>().map_err(|_| CascadeError::BlobType {
                name: name.to_string(),
                expected: "1-d f32",
            }),
            Blob::I32(_) => Err(CascadeError::BlobType { name: name.to_string(), expected: "1-d f32" }),
        }
    }

    pub fn i32_1d(&self, name: &str) -> Result<ArrayView1<i32>> {
        match self.get(name)? {
            Blob::I32(a) => a.view().into_dimensionality::<Ix1>().map_err(|_| CascadeError::BlobType {
                name: name.to_string(),
                expected: "1-d i32",
            }),
            Blob::F32(_) => Err(CascadeError::BlobType { name: name.to_string(), expected: "1-d i32" }),
        }
    }

    /// Scalar metric or loss stored as a one-element f32 blob.
    pub fn scalar(&self, name: &str) -> Result<f32> {
        match self.get(name)? {
            Blob::F32(a) if a.len() == 1 => Ok(a.iter().copied().next().unwrap_or(0.0)),
            _ => Err(CascadeError::BlobType { name: name.to_string(), expected: "f32 scalar" }),
        }
    }

    /// Writes every blob as `<dir>/<name>.npy`.
    pub fn write_npy_dir(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating blob dump dir {:?}", dir))?;
        for (name, blob) in &self.inner {
            let path = dir.join(format!("{}.npy", name));
            let written = match blob {
                Blob::F32(a) => write_npy(&path, a),
                Blob::I32(a) => write_npy(&path, a),
            };
            written.with_context(|| format!("writing blob `{}` to {:?}", name, path))?;
        }
        Ok(())
    }
}

/// Concatenates per-image blobs along the first axis, in image order.
pub fn concat_blobs(name: &str, parts: &[Blob]) -> Result<Blob> {
    let mismatch = || CascadeError::BlobType { name: name.to_string(), expected: "same dtype and trailing shape" };
    match parts.first() {
        None => Err(CascadeError::MissingBlob(name.to_string())),
        Some(Blob::F32(_)) => {
            let views = parts
                .iter()
                .map(|p| match p {
                    Blob::F32(a) => Ok(a.view()),
                    Blob::I32(_) => Err(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Blob::F32(concatenate(Axis(0), &views).map_err(|_| mismatch())?))
        }
        Some(Blob::I32(_)) => {
            let views = parts
                .iter()
                .map(|p| match p {
                    Blob::I32(a) => Ok(a.view()),
                    Blob::F32(_) => Err(mismatch()),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Blob::I32(concatenate(Axis(0), &views).map_err(|_| mismatch())?))
        }
    }
}

pub fn stage_suffix(stage: u32) -> String {
    format!("_{}", stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_concat_blobs_keeps_image_order() {
        let a: Blob = array![[0.0f32, 1.0], [0.0, 2.0]].into();
        let b: Blob = Array2::<f32>::zeros((0, 2)).into();
        let c: Blob = array![[1.0f32, 3.0]].into();
        let out = concat_blobs("x", &[a, b, c]).unwrap();
        let Blob::F32(out) = out else { panic!("dtype changed") };
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out[[2, 1]], 3.0);
    }

    #[test]
    fn test_concat_blobs_rejects_mixed_dtypes() {
        let a: Blob = array![1.0f32].into();
        let b: Blob = array![1i32].into();
        assert!(concat_blobs("x", &[a, b]).is_err());
    }

    #[test]
    fn test_typed_getters() {
        let mut blobs = Blobs::new();
        blobs.insert("labels", array![1i32, 0]);
        blobs.insert("loss", array![0.5f32]);
        assert_eq!(blobs.i32_1d("labels").unwrap().len(), 2);
        assert!(blobs.f32_2d("labels").is_err());
        assert_eq!(blobs.scalar("loss").unwrap(), 0.5);
        assert!(matches!(blobs.get("missing"), Err(CascadeError::MissingBlob(_))));
    }

    #[test]
    fn test_write_npy_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut blobs = Blobs::new();
        blobs.insert("rois_1", array![[0.0f32, 1.0, 2.0, 3.0, 4.0]]);
        blobs.insert("labels_int32_1", array![2i32]);
        blobs.write_npy_dir(dir.path()).unwrap();
        assert!(dir.path().join("rois_1.npy").exists());
        assert!(dir.path().join("labels_int32_1.npy").exists());
    }
}
