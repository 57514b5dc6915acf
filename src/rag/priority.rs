//! Edge scoring for priority-driven merging.

use super::Rag;
use crate::Label;

/// A two-class model scoring an edge feature vector.
pub trait Classifier {
    /// Probability of the "merge" class, when the model can produce one.
    fn predict_proba(&self, features: &[f64]) -> Option<f64>;

    /// Fallback score when class probabilities are unavailable.
    fn predict(&self, features: &[f64]) -> f64;
}

/// Feature extraction for a graph edge.
pub trait EdgeFeatures {
    /// Feature vector describing the edge `(u, v)` of `rag`.
    fn features(&self, rag: &Rag, u: Label, v: Label) -> Vec<f64>;
}

/// Edge scoring used to order merge candidates; lower merges first.
pub enum MergePriority {
    /// Mean probability over the edge's boundary cells.
    BoundaryMean,

    /// Boundary mean plus `alpha` standard errors of that mean.
    BoundaryMeanPlusSem {
        /// Weight of the standard-error term. Negative values favor edges
        /// whose boundary probabilities are noisy; the classical choice is -6.
        alpha: f64,
    },

    /// Score from a trained model over extracted edge features.
    Classifier {
        /// Feature extraction for the scored edge.
        extractor: Box<dyn EdgeFeatures>,
        /// Model consuming the extracted features.
        model: Box<dyn Classifier>,
    },

    /// Delegate to `base` when the ladder condition holds, otherwise return
    /// [`Rag::never_merge_priority`] so the merge is forbidden but the queue
    /// ordering stays finite.
    Ladder {
        /// Scoring applied when the ladder condition holds.
        base: Box<MergePriority>,
        /// Extent size below which a node counts as small.
        threshold: usize,
        /// 1 requires a small endpoint off the volume boundary; 2 requires
        /// exactly one endpoint to be small; 3 additionally requires more
        /// than two boundary cells.
        strictness: u8,
    },

    /// User-supplied scoring function.
    Custom(fn(&Rag, Label, Label) -> f64),
}

impl Default for MergePriority {
    fn default() -> MergePriority {
        MergePriority::BoundaryMean
    }
}

impl MergePriority {
    /// Score the edge `(u, v)` of `rag`.
    pub fn evaluate(&self, rag: &Rag, u: Label, v: Label) -> f64 {
        match self {
            MergePriority::BoundaryMean => boundary_mean(rag, u, v),
            MergePriority::BoundaryMeanPlusSem { alpha } => {
                boundary_mean_plus_sem(rag, u, v, *alpha)
            }
            MergePriority::Classifier { extractor, model } => {
                let features = extractor.features(rag, u, v);
                model.predict_proba(&features).unwrap_or_else(|| model.predict(&features))
            }
            MergePriority::Ladder { base, threshold, strictness } => {
                if ladder_condition(rag, u, v, *threshold, *strictness) {
                    base.evaluate(rag, u, v)
                } else {
                    rag.never_merge_priority()
                }
            }
            MergePriority::Custom(function) => function(rag, u, v),
        }
    }
}

fn boundary_values(rag: &Rag, u: Label, v: Label) -> Vec<f64> {
    let probs = rag.probabilities_flat();
    let edge = rag.graph.edge_weight(u, v).expect("scored edges must exist");
    edge.boundary.iter().map(|&idx| probs[idx]).collect()
}

/// Arithmetic mean of the probabilities over the boundary of edge `(u, v)`.
pub fn boundary_mean(rag: &Rag, u: Label, v: Label) -> f64 {
    let values = boundary_values(rag, u, v);
    values.iter().sum::<f64>() / values.len() as f64
}

/// Boundary mean plus `alpha` standard errors of the mean, computed with the
/// sample variance over the boundary probabilities.
pub fn boundary_mean_plus_sem(rag: &Rag, u: Label, v: Label, alpha: f64) -> f64 {
    let values = boundary_values(rag, u, v);
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
    mean + alpha * (variance / n).sqrt()
}

fn ladder_condition(rag: &Rag, u: Label, v: Label, threshold: usize, strictness: u8) -> bool {
    let s1 = rag.node_size(u);
    let s2 = rag.node_size(v);
    let mut condition = (s1 < threshold && !rag.at_volume_boundary(u))
        || (s2 < threshold && !rag.at_volume_boundary(v));
    if strictness >= 2 {
        condition &= (s1 < threshold) != (s2 < threshold);
    }
    if strictness >= 3 {
        condition &= rag.graph.edge_weight(u, v).map_or(0, |edge| edge.boundary.len()) > 2;
    }
    condition
}

/// Boundary mean gated by a ladder with the given `threshold` and
/// `strictness`; see [`MergePriority::Ladder`].
pub fn boundary_mean_ladder(
    rag: &Rag,
    u: Label,
    v: Label,
    threshold: usize,
    strictness: u8,
) -> f64 {
    let ladder = MergePriority::Ladder {
        base: Box::new(MergePriority::BoundaryMean),
        threshold,
        strictness,
    };
    ladder.evaluate(rag, u, v)
}
