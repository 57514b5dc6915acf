//! Watershed transform of n-dimensional scalar volumes.

use std::collections::VecDeque;

use log::debug;
use ndarray::{Array, ArrayBase, Data, Dimension};
use ndarray_stats::QuantileExt;
use num_traits::PrimInt;

use crate::{
    build_levels_dict, build_neighbors_array, diamond_se, pad, strip_padding, structuring_offsets,
    Label,
};

/// Marker written where flooding basins collide; rewritten to 0 on return.
const DAM: Label = Label::MAX;

/// Watershed transform of an n-dimensional scalar volume.
///
/// Floods the level-sets of `data` in ascending order. Cells reached from a
/// single existing basin join it; cells reached from several basins at once
/// become dams; still-unlabeled cells of a level seed new basins, one per
/// face-connected component. The result has the shape of `data`, with each
/// basin carrying a distinct label in `1..` and dams carrying 0.
///
/// The maximum intensity plus one must be representable in the scalar type;
/// it pads the volume so that flooding terminates at the border.
///
/// * `data` - Scalar volume to transform.
pub fn watershed<S, A, D>(data: &ArrayBase<S, D>) -> Array<Label, D>
where
    S: Data<Elem = A>,
    A: PrimInt,
    D: Dimension,
{
    let &max = match data.max() {
        Ok(max) => max,
        Err(_) => return Array::zeros(data.raw_dim()),
    };
    assert!(
        max < A::max_value(),
        "the maximum intensity plus one must be representable in the scalar type"
    );

    let volume = pad(data, &[max + A::one()]);
    let mut labels = Array::<Label, D>::zeros(volume.raw_dim());

    let neighbors = build_neighbors_array(volume.shape());
    let levels = build_levels_dict(&volume);
    let seed_offsets = structuring_offsets(&diamond_se(3, volume.ndim()), volume.shape());
    let sentinel = *levels.keys().next_back().unwrap();

    {
        let flat = volume.as_slice().unwrap();
        let ws = labels.as_slice_mut().unwrap();
        let mut current_label = 0;
        let mut adjacent: Vec<Label> = vec![];
        for (&level, idxs) in &levels {
            if level == sentinel {
                break;
            }
            debug!("flooding {} cells", idxs.len());

            // Extend the basins already touching this level, breadth-first.
            let mut fifo: VecDeque<usize> = idxs
                .iter()
                .copied()
                .filter(|&i| neighbors.row(i).iter().any(|&n| ws[n] != 0))
                .collect();
            while let Some(idx) = fifo.pop_front() {
                adjacent.clear();
                adjacent.extend(
                    neighbors.row(idx).iter().map(|&n| ws[n]).filter(|&l| l != 0 && l != DAM),
                );
                adjacent.sort_unstable();
                adjacent.dedup();
                if adjacent.len() > 1 {
                    ws[idx] = DAM;
                } else if adjacent.len() == 1 && ws[idx] == 0 {
                    ws[idx] = adjacent[0];
                    for &n in neighbors.row(idx) {
                        // Higher levels wait for their own pass.
                        if ws[n] == 0 && flat[n] == level {
                            fifo.push_back(n);
                        }
                    }
                }
            }

            // Seed a new basin for every remaining component of this level.
            for &start in idxs {
                if ws[start] != 0 {
                    continue;
                }
                current_label += 1;
                ws[start] = current_label;
                let mut stack = vec![start];
                while let Some(cell) = stack.pop() {
                    for &offset in &seed_offsets {
                        let n = (cell as isize + offset) as usize;
                        if ws[n] == 0 && flat[n] == level {
                            ws[n] = current_label;
                            stack.push(n);
                        }
                    }
                }
            }
        }

        for label in ws.iter_mut() {
            if *label == DAM {
                *label = 0;
            }
        }
    }
    strip_padding(&labels, 1)
}
