use serde::{Deserialize, Serialize};

use crate::EmbeddingError;

/// Ground-truth class of a training image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Genuine = 0,
    Counterfeit = 1,
}

impl Label {
    pub fn is_counterfeit(self) -> bool {
        matches!(self, Label::Counterfeit)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Name written to label tables.
    pub fn table_name(self) -> &'static str {
        match self {
            Label::Genuine => "real",
            Label::Counterfeit => "fake",
        }
    }
}

/// Embeddings produced by one extractor run, with parallel filenames and
/// optional labels. All present sequences share length and index order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingBatch {
    embeddings: Vec<Vec<f32>>,
    filenames: Vec<String>,
    labels: Option<Vec<Label>>,
    extractor_version: String,
}

impl EmbeddingBatch {
    pub fn new(
        embeddings: Vec<Vec<f32>>,
        filenames: Vec<String>,
        extractor_version: impl Into<String>,
    ) -> Result<Self, EmbeddingError> {
        if embeddings.len() != filenames.len() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "{} embeddings but {} filenames",
                embeddings.len(),
                filenames.len()
            )));
        }
        if let Some(first) = embeddings.first() {
            if embeddings.iter().any(|e| e.len() != first.len()) {
                return Err(EmbeddingError::InvalidConfig(
                    "embeddings have inconsistent dimensionality".into(),
                ));
            }
        }
        Ok(Self {
            embeddings,
            filenames,
            labels: None,
            extractor_version: extractor_version.into(),
        })
    }

    /// Attach one label per embedding.
    pub fn with_labels(mut self, labels: Vec<Label>) -> Result<Self, EmbeddingError> {
        if labels.len() != self.embeddings.len() {
            return Err(EmbeddingError::InvalidConfig(format!(
                "{} labels for {} embeddings",
                labels.len(),
                self.embeddings.len()
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Label every embedding with the same class.
    pub fn labeled(mut self, label: Label) -> Self {
        self.labels = Some(vec![label; self.embeddings.len()]);
        self
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Embedding dimensionality, 0 for an empty batch.
    pub fn dim(&self) -> usize {
        self.embeddings.first().map_or(0, Vec::len)
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    pub fn labels(&self) -> Option<&[Label]> {
        self.labels.as_deref()
    }

    pub fn extractor_version(&self) -> &str {
        &self.extractor_version
    }

    pub fn into_parts(self) -> (Vec<Vec<f32>>, Vec<String>) {
        (self.embeddings, self.filenames)
    }

    /// Sub-batch at the given positions, in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            embeddings: indices.iter().map(|&i| self.embeddings[i].clone()).collect(),
            filenames: indices.iter().map(|&i| self.filenames[i].clone()).collect(),
            labels: self
                .labels
                .as_ref()
                .map(|labels| indices.iter().map(|&i| labels[i]).collect()),
            extractor_version: self.extractor_version.clone(),
        }
    }

    /// Concatenate batches produced by the same extractor.
    pub fn concat(batches: Vec<Self>) -> Result<Self, EmbeddingError> {
        let mut iter = batches.into_iter();
        let Some(mut out) = iter.next() else {
            return Err(EmbeddingError::InvalidConfig(
                "cannot concatenate zero batches".into(),
            ));
        };
        for batch in iter {
            if batch.extractor_version != out.extractor_version {
                return Err(EmbeddingError::InvalidConfig(format!(
                    "extractor versions differ: {} vs {}",
                    out.extractor_version, batch.extractor_version
                )));
            }
            if !out.is_empty() && !batch.is_empty() && batch.dim() != out.dim() {
                return Err(EmbeddingError::InvalidConfig(
                    "embeddings have inconsistent dimensionality".into(),
                ));
            }
            out.labels = match (out.labels.take(), batch.labels) {
                (Some(mut a), Some(b)) => {
                    a.extend(b);
                    Some(a)
                }
                (None, None) => None,
                _ => {
                    return Err(EmbeddingError::InvalidConfig(
                        "cannot mix labeled and unlabeled batches".into(),
                    ))
                }
            };
            out.embeddings.extend(batch.embeddings);
            out.filenames.extend(batch.filenames);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize, version: &str) -> EmbeddingBatch {
        let embeddings = (0..n).map(|i| vec![i as f32, 1.0]).collect();
        let filenames = (0..n).map(|i| format!("img_{i}.png")).collect();
        EmbeddingBatch::new(embeddings, filenames, version).unwrap()
    }

    #[test]
    fn new_rejects_length_mismatch() {
        let err = EmbeddingBatch::new(vec![vec![1.0]], vec![], "v1");
        assert!(err.is_err());
    }

    #[test]
    fn new_rejects_ragged_embeddings() {
        let err = EmbeddingBatch::new(
            vec![vec![1.0, 2.0], vec![1.0]],
            vec!["a".into(), "b".into()],
            "v1",
        );
        assert!(err.is_err());
    }

    #[test]
    fn labels_must_match_length() {
        assert!(batch(3, "v1").with_labels(vec![Label::Genuine]).is_err());
        let labeled = batch(2, "v1")
            .with_labels(vec![Label::Genuine, Label::Counterfeit])
            .unwrap();
        assert_eq!(
            labeled.labels(),
            Some(&[Label::Genuine, Label::Counterfeit][..])
        );
    }

    #[test]
    fn select_keeps_index_correspondence() {
        let b = batch(4, "v1").labeled(Label::Counterfeit);
        let sub = b.select(&[3, 1]);
        assert_eq!(sub.filenames(), &["img_3.png", "img_1.png"]);
        assert_eq!(sub.embeddings()[0][0], 3.0);
        assert_eq!(sub.labels().unwrap().len(), 2);
    }

    #[test]
    fn concat_merges_labeled_batches() {
        let a = batch(2, "v1").labeled(Label::Genuine);
        let b = batch(3, "v1").labeled(Label::Counterfeit);
        let merged = EmbeddingBatch::concat(vec![a, b]).unwrap();
        assert_eq!(merged.len(), 5);
        let labels = merged.labels().unwrap();
        assert_eq!(labels.iter().filter(|l| l.is_counterfeit()).count(), 3);
    }

    #[test]
    fn concat_rejects_mixed_versions() {
        let a = batch(1, "v1");
        let b = batch(1, "v2");
        assert!(EmbeddingBatch::concat(vec![a, b]).is_err());
    }

    #[test]
    fn label_encoding() {
        assert_eq!(Label::Genuine.as_u8(), 0);
        assert_eq!(Label::Counterfeit.as_u8(), 1);
        assert_eq!(Label::Counterfeit.table_name(), "fake");
    }
}
