#![warn(missing_docs, trivial_casts, trivial_numeric_casts, unused_qualifications)]

//! The `ndarray-segment` crate provides a watershed transform and priority-driven
//! agglomerative segmentation for `ArrayBase`, the *n*-dimensional array data
//! structure provided by [`ndarray`].
//!
//! A scalar volume is first partitioned into labeled basins by [`watershed`],
//! then refined by building a region adjacency graph ([`Rag`]) over the basins
//! and merging adjacent regions in ascending priority order until a threshold
//! is reached. Two segmentations of the same volume can be compared through a
//! region union graph ([`Rug`]).

use thiserror::Error;

mod merge_queue;
mod neighbors;
mod pad;
mod rag;
mod rug;
mod watershed;

pub use merge_queue::{MergeQueue, QueueEntry, QueueHandle};
pub use neighbors::{
    build_levels_dict, build_neighbors_array, diamond_se, neighbor_idxs, neighbor_steps,
    structuring_offsets,
};
pub use pad::{pad, strip_padding};
pub use rag::{
    boundary_mean, boundary_mean_ladder, boundary_mean_plus_sem, Classifier, EdgeFeatures,
    MergePriority, Merges, Rag, RagOptions,
};
pub use rug::{best_possible_segmentation, Rug};
pub use watershed::watershed;

/// Basin identifier stored in a labeled volume. Label 0 marks a dam, a cell
/// sitting between two or more basins.
pub type Label = u32;

/// Errors reported when comparing segmentations.
#[derive(Debug, Error)]
pub enum Error {
    /// The two compared volumes have different shapes.
    #[error("volume shapes don't match: {left:?} {right:?}")]
    ShapeMismatch {
        /// Shape of the first volume.
        left: Vec<usize>,
        /// Shape of the second volume.
        right: Vec<usize>,
    },
}
