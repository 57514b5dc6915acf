//! Constant padding and stripping of n-dimensional volumes.

use ndarray::{Array, ArrayBase, ArrayView, Axis, Data, Dimension, Slice};

/// Pad `data` with one constant border layer per value in `values`.
///
/// The first value produces the innermost layer, the last the outermost, so
/// the output grows by `2 * values.len()` along every axis. The border values
/// must be representable in the element type; growing the element type is the
/// caller's responsibility.
///
/// * `data` - Volume to pad.
/// * `values` - Border value of each layer, innermost first. Must not be empty.
pub fn pad<S, A, D>(data: &ArrayBase<S, D>, values: &[A]) -> Array<A, D>
where
    S: Data<Elem = A>,
    A: Copy,
    D: Dimension,
{
    assert!(!values.is_empty(), "`values` must hold at least one border value");

    let mut padded = pad_layer(data.view(), values[0]);
    for &value in &values[1..] {
        padded = pad_layer(padded.view(), value);
    }
    padded
}

fn pad_layer<A: Copy, D: Dimension>(data: ArrayView<A, D>, value: A) -> Array<A, D> {
    let mut new_dim = data.raw_dim();
    for d in 0..data.ndim() {
        new_dim[d] += 2;
    }
    let mut padded = Array::from_elem(new_dim.clone(), value);
    let mut interior = padded.view_mut();
    for d in 0..data.ndim() {
        interior.slice_axis_inplace(Axis(d), Slice::from(1..new_dim[d] - 1));
    }
    interior.assign(&data);
    padded
}

/// Strip `skin` cells from every face of `data`, undoing [`pad`].
///
/// * `data` - Padded volume.
/// * `skin` - Number of layers to remove on each side of every axis.
pub fn strip_padding<S, A, D>(data: &ArrayBase<S, D>, skin: usize) -> Array<A, D>
where
    S: Data<Elem = A>,
    A: Clone,
    D: Dimension,
{
    let mut view = data.view();
    for d in 0..data.ndim() {
        let len = data.len_of(Axis(d));
        assert!(len >= 2 * skin, "axis {} is too short to strip {} cells per side", d, skin);
        view.slice_axis_inplace(Axis(d), Slice::from(skin..len - skin));
    }
    view.to_owned()
}
