//! Centroid-distance anomaly model.
//!
//! Fits K centroids with k-means++ seeding and Lloyd iterations; the anomaly
//! score of an embedding is the Euclidean distance to its nearest centroid.

use embedding::Label;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibrate::calibrate;
use crate::detector::{AnomalyModel, FitSummary, ThresholdSource, ValidationSet};
use crate::metrics::{silhouette_score, EvaluationReport};
use crate::stats::{check_finite, check_matrix, mean_std, squared_euclidean};
use crate::{persist, AnomalyError, ClusterConfig, DetectorMethod};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ClusterState {
    centroids: Vec<Vec<f32>>,
    threshold: f32,
    inertia: f64,
    iterations: usize,
}

/// K-means distance detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KMeansDetector {
    config: ClusterConfig,
    state: Option<ClusterState>,
    extractor_version: Option<String>,
}

struct Clustering {
    centroids: Vec<Vec<f32>>,
    inertia: f64,
    iterations: usize,
}

impl KMeansDetector {
    pub fn new(config: ClusterConfig) -> Result<Self, AnomalyError> {
        config.validate()?;
        Ok(Self {
            config,
            state: None,
            extractor_version: None,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn centroids(&self) -> Option<&[Vec<f32>]> {
        self.state.as_ref().map(|s| s.centroids.as_slice())
    }

    /// Sum of squared distances to the nearest centroid on the training set.
    pub fn inertia(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.inertia)
    }

    /// Index of the nearest centroid for each embedding.
    pub fn assign(&self, x: &[Vec<f32>]) -> Result<Vec<usize>, AnomalyError> {
        let state = self.fitted()?;
        check_matrix(x, Some(state.centroids[0].len()))?;
        Ok(x.iter().map(|p| nearest(&state.centroids, p).0).collect())
    }

    pub(crate) fn from_blob(bytes: &[u8]) -> Result<Self, AnomalyError> {
        let model: Self = persist::decode(DetectorMethod::Kmeans, bytes)?;
        model.config.validate()?;
        if let Some(state) = &model.state {
            let dim = state.centroids.first().map_or(0, Vec::len);
            if state.centroids.len() != model.config.n_clusters
                || dim == 0
                || state.centroids.iter().any(|c| c.len() != dim)
            {
                return Err(AnomalyError::Persistence(
                    "stored centroids are inconsistent with the stored config".into(),
                ));
            }
        }
        Ok(model)
    }

    fn fitted(&self) -> Result<&ClusterState, AnomalyError> {
        self.state.as_ref().ok_or(AnomalyError::NotFitted)
    }
}

impl AnomalyModel for KMeansDetector {
    fn method(&self) -> DetectorMethod {
        DetectorMethod::Kmeans
    }

    fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    fn threshold(&self) -> Option<f32> {
        self.state.as_ref().map(|s| s.threshold)
    }

    fn scores(&self, x: &[Vec<f32>]) -> Result<Vec<f32>, AnomalyError> {
        let state = self.fitted()?;
        check_matrix(x, Some(state.centroids[0].len()))?;
        Ok(distances(&state.centroids, x))
    }

    fn fit(
        &mut self,
        x: &[Vec<f32>],
        validation: Option<ValidationSet<'_>>,
    ) -> Result<FitSummary, AnomalyError> {
        self.config.validate()?;
        let dim = check_matrix(x, None)?;
        check_finite(x)?;
        let k = self.config.n_clusters;
        if x.len() < k {
            return Err(AnomalyError::Config(format!(
                "k-means with {k} clusters needs at least {k} training embeddings, got {}",
                x.len()
            )));
        }
        if let Some(v) = &validation {
            check_matrix(v.embeddings, Some(dim))?;
            check_finite(v.embeddings)?;
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut best: Option<Clustering> = None;
        for run in 0..self.config.n_init {
            let candidate = lloyd(x, k, &self.config, &mut rng);
            debug!(
                run,
                inertia = candidate.inertia,
                iterations = candidate.iterations,
                "k-means run"
            );
            if best.as_ref().map_or(true, |b| candidate.inertia < b.inertia) {
                best = Some(candidate);
            }
        }
        let best = best.ok_or_else(|| AnomalyError::Config("n_init must be positive".into()))?;

        if validation.as_ref().is_some_and(|v| !v.has_both_classes()) {
            warn!("validation labels hold a single class; using the sigma threshold");
        }
        let (threshold, source) = match &validation {
            Some(v) if v.has_both_classes() => (
                calibrate(&distances(&best.centroids, v.embeddings), v.labels)?,
                ThresholdSource::Validation,
            ),
            _ => {
                let (mean, std) = mean_std(&distances(&best.centroids, x));
                (mean + self.config.sigma_multiplier * std, ThresholdSource::Sigma)
            }
        };

        info!(
            clusters = k,
            samples = x.len(),
            inertia = best.inertia,
            iterations = best.iterations,
            threshold,
            source = source.as_str(),
            "k-means detector fitted"
        );

        let summary = FitSummary {
            method: DetectorMethod::Kmeans,
            samples: x.len(),
            threshold,
            threshold_source: source,
            iterations: best.iterations,
            final_loss: None,
        };
        self.state = Some(ClusterState {
            centroids: best.centroids,
            threshold,
            inertia: best.inertia,
            iterations: best.iterations,
        });
        Ok(summary)
    }

    fn evaluate(
        &self,
        x: &[Vec<f32>],
        labels: Option<&[Label]>,
    ) -> Result<EvaluationReport, AnomalyError> {
        let state = self.fitted()?;
        let scores = self.scores(x)?;
        let assignment = self.assign(x)?;
        let silhouette = silhouette_score(x, &assignment);
        EvaluationReport::build(DetectorMethod::Kmeans, state.threshold, &scores, labels, silhouette)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, AnomalyError> {
        self.fitted()?;
        persist::encode(DetectorMethod::Kmeans, self.extractor_version.as_deref(), self)
    }

    fn extractor_version(&self) -> Option<&str> {
        self.extractor_version.as_deref()
    }

    fn set_extractor_version(&mut self, version: Option<String>) {
        self.extractor_version = version;
    }
}

/// Nearest centroid index and squared distance; ties go to the lower index.
fn nearest(centroids: &[Vec<f32>], p: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_euclidean(p, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn distances(centroids: &[Vec<f32>], x: &[Vec<f32>]) -> Vec<f32> {
    x.iter().map(|p| nearest(centroids, p).1.sqrt()).collect()
}

/// k-means++: each new centroid is drawn with probability proportional to
/// its squared distance from the centroids chosen so far.
fn kmeans_plus_plus(x: &[Vec<f32>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f32>> {
    let n = x.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(x[rng.gen_range(0..n)].clone());
    let mut nearest_sq: Vec<f64> = x
        .iter()
        .map(|p| f64::from(squared_euclidean(p, &centroids[0])))
        .collect();

    while centroids.len() < k {
        let total: f64 = nearest_sq.iter().sum();
        let idx = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in nearest_sq.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            // Every point coincides with a centroid.
            rng.gen_range(0..n)
        };
        let centroid = x[idx].clone();
        for (d, p) in nearest_sq.iter_mut().zip(x) {
            *d = d.min(f64::from(squared_euclidean(p, &centroid)));
        }
        centroids.push(centroid);
    }
    centroids
}

fn lloyd(x: &[Vec<f32>], k: usize, cfg: &ClusterConfig, rng: &mut ChaCha8Rng) -> Clustering {
    let n = x.len();
    let dim = x[0].len();
    let mut centroids = kmeans_plus_plus(x, k, rng);
    let mut iterations = 0;

    for iter in 1..=cfg.max_iter {
        iterations = iter;
        let mut sums = vec![vec![0.0f64; dim]; k];
        let mut counts = vec![0usize; k];
        let mut point_dist = Vec::with_capacity(n);
        for p in x {
            let (c, d) = nearest(&centroids, p);
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(p) {
                *s += f64::from(*v);
            }
            point_dist.push(d);
        }

        let mut next: Vec<Vec<f32>> = sums
            .iter()
            .zip(&counts)
            .zip(&centroids)
            .map(|((sum, &count), old)| {
                if count == 0 {
                    old.clone()
                } else {
                    sum.iter().map(|s| (s / count as f64) as f32).collect()
                }
            })
            .collect();

        // Empty clusters take over the points worst served by their centroid.
        let empties: Vec<usize> = (0..k).filter(|c| counts[*c] == 0).collect();
        if !empties.is_empty() {
            let mut by_distance: Vec<usize> = (0..n).collect();
            by_distance.sort_by(|a, b| point_dist[*b].total_cmp(&point_dist[*a]));
            for (c, i) in empties.iter().zip(by_distance) {
                next[*c] = x[i].clone();
            }
        }

        let shift: f32 = centroids
            .iter()
            .zip(&next)
            .map(|(a, b)| squared_euclidean(a, b))
            .sum();
        centroids = next;
        if shift <= cfg.tolerance {
            break;
        }
    }

    let inertia = x
        .iter()
        .map(|p| f64::from(nearest(&centroids, p).1))
        .sum();
    Clustering {
        centroids,
        inertia,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<Vec<f32>> {
        let mut x = Vec::new();
        for (cx, cy) in [(0.0f32, 0.0f32), (10.0, 0.0), (0.0, 10.0)] {
            for i in 0..10 {
                let jitter = (i as f32 - 4.5) * 0.05;
                x.push(vec![cx + jitter, cy - jitter]);
            }
        }
        x
    }

    #[test]
    fn finds_three_blobs() {
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        let summary = model.fit(&blobs(), None).unwrap();
        assert_eq!(summary.threshold_source, ThresholdSource::Sigma);

        let mut centroids = model.centroids().unwrap().to_vec();
        centroids.sort_by(|a, b| (a[0] + 2.0 * a[1]).total_cmp(&(b[0] + 2.0 * b[1])));
        assert!(centroids[0][0].abs() < 0.5 && centroids[0][1].abs() < 0.5);
        assert!((centroids[1][0] - 10.0).abs() < 0.5);
        assert!((centroids[2][1] - 10.0).abs() < 0.5);

        let far = model.predict(&[vec![50.0, 50.0]]).unwrap();
        assert_eq!(far, vec![true]);
    }

    fn grid(n: usize, offset: f32) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| vec![(i % 10) as f32 * 0.1 + offset, (i / 10) as f32 * 0.1 + offset])
            .collect()
    }

    #[test]
    fn genuine_only_validation_falls_back_to_sigma() {
        let train = grid(80, 0.0);
        let val = grid(20, 0.03);
        let labels = vec![Label::Genuine; val.len()];

        let mut sigma = KMeansDetector::new(ClusterConfig::default()).unwrap();
        sigma.fit(&train, None).unwrap();

        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        let validation = ValidationSet::new(&val, &labels).unwrap();
        let summary = model.fit(&train, Some(validation)).unwrap();
        assert_eq!(summary.threshold_source, ThresholdSource::Sigma);
        assert_eq!(model.threshold(), sigma.threshold());

        // mean + 2σ flags at most a fifth of the fitted data.
        let flagged = model.predict(&train).unwrap().into_iter().filter(|f| *f).count();
        assert!(flagged <= train.len() / 5, "{flagged} of {} flagged", train.len());
    }

    #[test]
    fn both_classes_calibrate_on_validation() {
        let train = blobs();
        let val: Vec<Vec<f32>> = vec![
            vec![0.1, 0.1],
            vec![10.0, 0.2],
            vec![40.0, 40.0],
            vec![-30.0, 25.0],
        ];
        let labels = [Label::Genuine, Label::Genuine, Label::Counterfeit, Label::Counterfeit];
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        let summary = model
            .fit(&train, Some(ValidationSet::new(&val, &labels).unwrap()))
            .unwrap();
        assert_eq!(summary.threshold_source, ThresholdSource::Validation);
        assert_eq!(model.predict(&val).unwrap(), vec![false, false, true, true]);
    }

    #[test]
    fn fewer_samples_than_clusters_is_config_error() {
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        let err = model.fit(&[vec![0.0], vec![1.0]], None).unwrap_err();
        assert!(matches!(err, AnomalyError::Config(_)));
        assert!(!model.is_fitted());
    }

    #[test]
    fn ragged_or_empty_input_is_invalid() {
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        assert!(matches!(model.fit(&[], None), Err(AnomalyError::InvalidInput(_))));
        let ragged = vec![vec![0.0, 1.0], vec![1.0], vec![2.0, 2.0]];
        assert!(matches!(model.fit(&ragged, None), Err(AnomalyError::InvalidInput(_))));
    }

    #[test]
    fn unfitted_model_refuses_to_score() {
        let model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        assert!(matches!(model.scores(&[vec![0.0]]), Err(AnomalyError::NotFitted)));
        assert!(matches!(model.predict(&[vec![0.0]]), Err(AnomalyError::NotFitted)));
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let mut a = KMeansDetector::new(ClusterConfig::default()).unwrap();
        let mut b = KMeansDetector::new(ClusterConfig::default()).unwrap();
        a.fit(&blobs(), None).unwrap();
        b.fit(&blobs(), None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_points_leave_no_cluster_empty() {
        let x = vec![vec![1.0, 1.0]; 5];
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        model.fit(&x, None).unwrap();
        assert_eq!(model.centroids().unwrap().len(), 3);
        assert_eq!(model.threshold(), Some(0.0));
        assert_eq!(model.predict(&x).unwrap(), vec![false; 5]);
    }

    #[test]
    fn evaluate_reports_silhouette() {
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        model.fit(&blobs(), None).unwrap();
        let report = model.evaluate(&blobs(), None).unwrap();
        assert!(report.silhouette.unwrap() > 0.8);
        assert_eq!(report.histogram.total(), 30);
        assert!(report.classification.is_none());
    }

    #[test]
    fn dimension_mismatch_at_predict_time() {
        let mut model = KMeansDetector::new(ClusterConfig::default()).unwrap();
        model.fit(&blobs(), None).unwrap();
        assert!(matches!(
            model.scores(&[vec![1.0, 2.0, 3.0]]),
            Err(AnomalyError::InvalidInput(_))
        ));
    }
}
