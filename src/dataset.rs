//! Labeled image sets and the stratified train/validation split.

use std::path::{Path, PathBuf};

use embedding::{EmbeddingBatch, EmbeddingError, ImageExtractor, Label, list_images};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::PipelineError;

/// Image paths per class, each list in file-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabeledImages {
    pub genuine: Vec<PathBuf>,
    pub counterfeit: Vec<PathBuf>,
}

/// Disjoint train and validation parts of one [`LabeledImages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: LabeledImages,
    pub validation: LabeledImages,
}

impl LabeledImages {
    /// List both class directories.
    ///
    /// The genuine directory must hold at least one image. An empty
    /// counterfeit directory is allowed; thresholds then fall back to the
    /// training-score statistics.
    pub fn discover(
        genuine_dir: impl AsRef<Path>,
        counterfeit_dir: impl AsRef<Path>,
    ) -> Result<Self, PipelineError> {
        let genuine_dir = genuine_dir.as_ref();
        let genuine = list_images(genuine_dir)?;
        if genuine.is_empty() {
            return Err(EmbeddingError::NoImages(genuine_dir.to_path_buf()).into());
        }
        let counterfeit = list_images(counterfeit_dir.as_ref())?;
        if counterfeit.is_empty() {
            warn!(
                dir = %counterfeit_dir.as_ref().display(),
                "no counterfeit images; thresholds will not be calibrated"
            );
        }
        info!(
            genuine = genuine.len(),
            counterfeit = counterfeit.len(),
            "dataset discovered"
        );
        Ok(Self {
            genuine,
            counterfeit,
        })
    }

    pub fn len(&self) -> usize {
        self.genuine.len() + self.counterfeit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genuine.is_empty() && self.counterfeit.is_empty()
    }

    /// `(path, label)` pairs, genuine first.
    pub fn entries(&self) -> impl Iterator<Item = (&Path, Label)> + '_ {
        self.genuine
            .iter()
            .map(|p| (p.as_path(), Label::Genuine))
            .chain(self.counterfeit.iter().map(|p| (p.as_path(), Label::Counterfeit)))
    }

    /// Split each class on its own so both parts keep the class proportions.
    ///
    /// A class of `n ≥ 2` images contributes `round(n · val_fraction)`
    /// images to validation, clamped to `1..=n-1`; a single image always
    /// stays in training. The same seed always yields the same split.
    pub fn split(&self, val_fraction: f64, seed: u64) -> Result<DatasetSplit, PipelineError> {
        if !(val_fraction > 0.0 && val_fraction < 1.0) {
            return Err(PipelineError::Dataset(format!(
                "val_fraction must lie in (0, 1), got {val_fraction}"
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (genuine_train, genuine_val) = split_class(&self.genuine, val_fraction, &mut rng);
        let (counterfeit_train, counterfeit_val) =
            split_class(&self.counterfeit, val_fraction, &mut rng);
        Ok(DatasetSplit {
            train: Self {
                genuine: genuine_train,
                counterfeit: counterfeit_train,
            },
            validation: Self {
                genuine: genuine_val,
                counterfeit: counterfeit_val,
            },
        })
    }

    /// Embed both classes and attach their labels.
    ///
    /// Images that fail to decode are skipped. A class whose images all fail
    /// is an error.
    pub fn embed(&self, extractor: &ImageExtractor) -> Result<EmbeddingBatch, PipelineError> {
        let mut parts = Vec::with_capacity(2);
        for (paths, label) in [
            (&self.genuine, Label::Genuine),
            (&self.counterfeit, Label::Counterfeit),
        ] {
            if paths.is_empty() {
                continue;
            }
            parts.push(extractor.extract_paths(paths)?.labeled(label));
        }
        if parts.is_empty() {
            return Err(PipelineError::Dataset("no images to embed".to_string()));
        }
        Ok(EmbeddingBatch::concat(parts)?)
    }
}

fn split_class(
    paths: &[PathBuf],
    val_fraction: f64,
    rng: &mut ChaCha8Rng,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let n = paths.len();
    if n < 2 {
        return (paths.to_vec(), Vec::new());
    }
    let n_val = ((n as f64 * val_fraction).round() as usize).clamp(1, n - 1);

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let (val_idx, train_idx) = order.split_at_mut(n_val);
    val_idx.sort_unstable();
    train_idx.sort_unstable();

    let pick = |idx: &[usize]| idx.iter().map(|&i| paths[i].clone()).collect::<Vec<_>>();
    (pick(train_idx), pick(val_idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(genuine: usize, counterfeit: usize) -> LabeledImages {
        LabeledImages {
            genuine: (0..genuine).map(|i| PathBuf::from(format!("real/{i:03}.jpg"))).collect(),
            counterfeit: (0..counterfeit)
                .map(|i| PathBuf::from(format!("fake/{i:03}.jpg")))
                .collect(),
        }
    }

    #[test]
    fn split_keeps_class_proportions() {
        let split = images(100, 40).split(0.2, 42).unwrap();
        assert_eq!(split.validation.genuine.len(), 20);
        assert_eq!(split.validation.counterfeit.len(), 8);
        assert_eq!(split.train.genuine.len(), 80);
        assert_eq!(split.train.counterfeit.len(), 32);
    }

    #[test]
    fn split_parts_are_disjoint_and_complete() {
        let all = images(17, 9);
        let split = all.split(0.25, 7).unwrap();
        let mut genuine: Vec<_> = split
            .train
            .genuine
            .iter()
            .chain(&split.validation.genuine)
            .cloned()
            .collect();
        genuine.sort();
        assert_eq!(genuine, all.genuine);
        assert!(split.train.genuine.iter().all(|p| !split.validation.genuine.contains(p)));
    }

    #[test]
    fn split_is_deterministic_per_seed() {
        let all = images(30, 30);
        assert_eq!(all.split(0.2, 42).unwrap(), all.split(0.2, 42).unwrap());
        assert_ne!(
            all.split(0.2, 42).unwrap().validation,
            all.split(0.2, 43).unwrap().validation
        );
    }

    #[test]
    fn tiny_classes() {
        let split = images(1, 2).split(0.2, 42).unwrap();
        assert_eq!(split.train.genuine.len(), 1);
        assert!(split.validation.genuine.is_empty());
        // round(0.4) = 0 is lifted to one held-out image.
        assert_eq!(split.validation.counterfeit.len(), 1);
        assert_eq!(split.train.counterfeit.len(), 1);
    }

    #[test]
    fn bad_fraction_is_rejected() {
        for fraction in [0.0, 1.0, -0.5, f64::NAN] {
            assert!(matches!(
                images(10, 10).split(fraction, 42),
                Err(PipelineError::Dataset(_))
            ));
        }
    }

    #[test]
    fn entries_list_genuine_first() {
        let all = images(2, 1);
        let labels: Vec<Label> = all.entries().map(|(_, l)| l).collect();
        assert_eq!(labels, vec![Label::Genuine, Label::Genuine, Label::Counterfeit]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = LabeledImages::discover(dir.path().join("real"), dir.path().join("fake")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Embedding(EmbeddingError::DirectoryNotFound(_))
        ));
    }
}
