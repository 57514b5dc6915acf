//! Flat-index neighborhoods, level grouping and structuring elements.
//!
//! All indices are row-major ("C order") flat offsets into the volume. The
//! algorithms in this crate run on padded volumes so that every real cell's
//! face-neighbors stay in bounds; neighbor entries computed for border cells
//! wrap around and must not be dereferenced.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayBase, ArrayD, Data, Dimension};

fn flat_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1] as isize;
    }
    strides
}

/// Signed flat-index offsets of the 2·N face-neighbors of a cell in a volume
/// of the given shape: the positive strides of every axis, then the negative.
pub fn neighbor_steps(shape: &[usize]) -> Vec<isize> {
    let mut steps = flat_strides(shape);
    let negative: Vec<isize> = steps.iter().map(|&s| -s).collect();
    steps.extend(negative);
    steps
}

/// Table of the face-neighbor flat indices of every cell of a volume.
///
/// Row `i` holds `i ± step` for every axis stride, reduced modulo the volume
/// length. Rows of border cells wrap around and are junk; only dereference
/// rows of interior cells (padding of thickness 1 along every axis guarantees
/// this for every real cell).
pub fn build_neighbors_array(shape: &[usize]) -> Array2<usize> {
    let len = shape.iter().product::<usize>();
    let steps = neighbor_steps(shape);
    let mut table = Array2::zeros((len, steps.len()));
    for i in 0..len {
        for (j, &step) in steps.iter().enumerate() {
            table[[i, j]] = (i as isize + step).rem_euclid(len as isize) as usize;
        }
    }
    table
}

/// Fill `out` with the face-neighbor flat indices of `idx`, like one row of
/// [`build_neighbors_array`] but without the table. `len` is the volume length.
pub fn neighbor_idxs(steps: &[isize], len: usize, idx: usize, out: &mut Vec<usize>) {
    out.clear();
    out.extend(steps.iter().map(|&step| (idx as isize + step).rem_euclid(len as isize) as usize));
}

/// Group the cells of `data` by scalar level.
///
/// Returns a mapping from each distinct level to the ascending flat indices
/// holding it; iterating the map visits levels in ascending order.
pub fn build_levels_dict<S, A, D>(data: &ArrayBase<S, D>) -> BTreeMap<A, Vec<usize>>
where
    S: Data<Elem = A>,
    A: Ord + Copy,
    D: Dimension,
{
    let mut levels = BTreeMap::new();
    for (i, &value) in data.iter().enumerate() {
        levels.entry(value).or_insert_with(Vec::new).push(i);
    }
    levels
}

/// An n-dimensional diamond structuring element.
///
/// True at every cell whose Manhattan distance from the center is strictly
/// less than `size / 2 + 1`. `diamond_se(3, n)` is the face-connectivity
/// element in `n` dimensions.
pub fn diamond_se(size: usize, ndim: usize) -> ArrayD<bool> {
    let reach = (size / 2) as isize + 1;
    let center = (size / 2) as isize;
    ArrayD::from_shape_fn(vec![size; ndim], |idx| {
        let distance: isize = idx.slice().iter().map(|&i| (i as isize - center).abs()).sum();
        distance < reach
    })
}

/// Flat-index offsets of a structuring element's true cells, relative to its
/// center, for a volume of the given shape. The center itself is excluded.
pub fn structuring_offsets<S, D>(se: &ArrayBase<S, D>, shape: &[usize]) -> Vec<isize>
where
    S: Data<Elem = bool>,
    D: Dimension,
{
    assert_eq!(
        se.ndim(),
        shape.len(),
        "the structuring element and the volume must have the same dimensionality"
    );
    let strides = flat_strides(shape);
    let center: Vec<isize> = se.shape().iter().map(|&s| (s / 2) as isize).collect();
    let mut offsets = vec![];
    for (idx, &hit) in se.view().into_dyn().indexed_iter() {
        if !hit {
            continue;
        }
        let offset = idx
            .slice()
            .iter()
            .zip(&center)
            .zip(&strides)
            .map(|((&i, &c), &stride)| (i as isize - c) * stride)
            .sum();
        if offset != 0 {
            offsets.push(offset);
        }
    }
    offsets
}
