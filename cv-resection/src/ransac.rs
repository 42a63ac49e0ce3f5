use log::*;
use rand::{seq::index::sample, RngCore};
use sample_consensus::{Consensus, Estimator, Model};

/// Classic random sample consensus with an adaptive iteration count.
///
/// Minimal samples are drawn until either `max_iterations` is reached or, given the best inlier
/// ratio found so far, the probability of having missed a better all-inlier sample drops below
/// `1 - confidence`. The model with the most inliers wins. Among models with the same number of
/// inliers, the one with the lowest total inlier residual wins.
#[derive(Clone, Debug)]
pub struct Ransac<R> {
    /// Largest residual for a datum to count as an inlier.
    pub threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
    rng: R,
}

impl<R> Ransac<R>
where
    R: RngCore,
{
    pub fn new(threshold: f64, rng: R) -> Self {
        Self {
            threshold,
            max_iterations: 4096,
            confidence: 0.999,
            rng,
        }
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn confidence(self, confidence: f64) -> Self {
        Self { confidence, ..self }
    }

    /// Scores a model, returning its inliers and their total residual.
    pub fn inliers<M, Data>(&self, model: &M, data: &[Data]) -> (Vec<usize>, f64)
    where
        M: Model<Data>,
    {
        let mut total = 0.0;
        let inliers = data
            .iter()
            .enumerate()
            .filter_map(|(ix, datum)| {
                let residual = model.residual(datum);
                (residual.is_finite() && residual <= self.threshold).then(|| {
                    total += residual;
                    ix
                })
            })
            .collect();
        (inliers, total)
    }
}

/// The number of samples needed to draw one all-inlier sample of size `sample_size` with
/// probability `confidence`, when a fraction `inlier_ratio` of the data are inliers.
pub fn required_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> f64 {
    let all_inliers = inlier_ratio.powi(sample_size as i32);
    if all_inliers >= 1.0 {
        return 0.0;
    }
    let miss = (1.0 - all_inliers).ln();
    if miss >= 0.0 {
        return f64::INFINITY;
    }
    ((1.0 - confidence).ln() / miss).ceil()
}

impl<E, R, Data> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    R: RngCore,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        if data.len() < E::MIN_SAMPLES {
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>, f64)> = None;
        let mut bound = self.max_iterations as f64;
        let mut iteration = 0;
        while (iteration as f64) < bound {
            iteration += 1;
            let samples: Vec<Data> = sample(&mut self.rng, data.len(), E::MIN_SAMPLES)
                .iter()
                .map(|ix| data[ix].clone())
                .collect();
            let models = estimator.estimate(samples.iter().cloned());
            for model in models {
                let (inliers, total) = self.inliers(&model, &data);
                if inliers.len() < E::MIN_SAMPLES {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((_, best_inliers, best_total)) => {
                        inliers.len() > best_inliers.len()
                            || (inliers.len() == best_inliers.len() && total < *best_total)
                    }
                };
                if better {
                    let ratio = inliers.len() as f64 / data.len() as f64;
                    bound = required_iterations(ratio, E::MIN_SAMPLES, self.confidence)
                        .min(self.max_iterations as f64);
                    best = Some((model, inliers, total));
                }
            }
        }
        if let Some((_, inliers, _)) = &best {
            debug!(
                "consensus kept {} of {} samples after {} iterations",
                inliers.len(),
                data.len(),
                iteration
            );
        }
        best.map(|(model, inliers, _)| (model, inliers))
    }
}
