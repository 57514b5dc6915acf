//! Region union graph: overlap statistics between two segmentations.

use ndarray::{Array1, Array2, ArrayBase, ArrayD, Data, Dimension};
use rustc_hash::FxHashSet;

use crate::{Error, Label, Rag};

/// Overlap table between two label volumes of identical shape.
///
/// `overlap(i, j)` counts the cells labeled `i` in the first volume and `j`
/// in the second. Row 0 and column 0 (the undecided label) are zeroed after
/// counting and `overlap(0, 0)` is set to 1 so that normalization never
/// divides by zero.
#[derive(Clone, Debug)]
pub struct Rug {
    overlaps: Array2<f64>,
    sizes1: Array1<f64>,
    sizes2: Array1<f64>,
}

impl Rug {
    /// Count the pairwise label overlaps between `s1` and `s2`.
    ///
    /// Fails with [`Error::ShapeMismatch`] when the shapes differ; no partial
    /// graph is retained.
    pub fn new<S1, S2, D>(s1: &ArrayBase<S1, D>, s2: &ArrayBase<S2, D>) -> Result<Rug, Error>
    where
        S1: Data<Elem = Label>,
        S2: Data<Elem = Label>,
        D: Dimension,
    {
        if s1.shape() != s2.shape() {
            return Err(Error::ShapeMismatch {
                left: s1.shape().to_vec(),
                right: s2.shape().to_vec(),
            });
        }
        let n1 = s1.iter().max().map_or(0, |&max| max as usize) + 1;
        let n2 = s2.iter().max().map_or(0, |&max| max as usize) + 1;
        let mut overlaps = Array2::zeros((n1, n2));
        let mut sizes1 = Array1::zeros(n1);
        let mut sizes2 = Array1::zeros(n2);
        for (&a, &b) in s1.iter().zip(s2.iter()) {
            overlaps[[a as usize, b as usize]] += 1.0;
            sizes1[a as usize] += 1.0;
            sizes2[b as usize] += 1.0;
        }
        overlaps.row_mut(0).fill(0.0);
        overlaps.column_mut(0).fill(0.0);
        overlaps[[0, 0]] = 1.0;
        Ok(Rug { overlaps, sizes1, sizes2 })
    }

    /// Raw overlap count between label `i` of the first volume and label `j`
    /// of the second.
    pub fn overlap(&self, i: Label, j: Label) -> f64 {
        self.overlaps[[i as usize, j as usize]]
    }

    /// Fraction of label `i`'s cells (first volume) overlapping label `j`
    /// (second volume).
    pub fn fraction(&self, i: Label, j: Label) -> f64 {
        self.overlaps[[i as usize, j as usize]] / self.sizes1[i as usize]
    }

    /// Fraction of label `j`'s cells (second volume) overlapping label `i`
    /// (first volume).
    pub fn fraction_transposed(&self, j: Label, i: Label) -> f64 {
        self.overlaps[[i as usize, j as usize]] / self.sizes2[j as usize]
    }

    /// Row `i` of the overlap table, normalized by label `i`'s size.
    pub fn row(&self, i: Label) -> Array1<f64> {
        &self.overlaps.row(i as usize) / self.sizes1[i as usize]
    }

    /// Number of rows and columns of the overlap table.
    pub fn dim(&self) -> (usize, usize) {
        self.overlaps.dim()
    }
}

/// Best achievable segmentation of the superpixels in `ws` against the
/// ground truth `gt`, keeping the superpixel boundaries fixed.
///
/// Every superpixel overlapping a single ground-truth body more than any
/// other is assigned to that body; superpixels tied between several bodies
/// are left alone. The superpixels of each body are then merged along a
/// depth-first preorder of their adjacency.
pub fn best_possible_segmentation<S1, S2, D>(
    ws: &ArrayBase<S1, D>,
    gt: &ArrayBase<S2, D>,
) -> Result<ArrayD<Label>, Error>
where
    S1: Data<Elem = Label>,
    S2: Data<Elem = Label>,
    D: Dimension,
{
    let mut ws = Rag::new(ws);
    let gt = Rag::new(gt);
    let rug = Rug::new(&ws.get_segmentation(), &gt.get_segmentation())?;

    let (n1, n2) = rug.dim();
    let mut assigned: Vec<Vec<Label>> = vec![vec![]; n2];
    for i in 0..n1 {
        let mut max = f64::NEG_INFINITY;
        let mut ties = vec![];
        for j in 0..n2 {
            let overlap = rug.overlap(i as Label, j as Label);
            if overlap > max {
                max = overlap;
                ties.clear();
            }
            if overlap == max {
                ties.push(j);
            }
        }
        // Superpixels tied between bodies would need to be split; skip them.
        if let [j] = ties[..] {
            assigned[j].push(i as Label);
        }
    }

    for body in assigned.iter().skip(1) {
        let members: Vec<Label> =
            body.iter().copied().filter(|&sp| ws.contains_node(sp)).collect();
        if members.len() < 2 {
            continue;
        }
        let order = preorder(&ws, &members);
        let (&source, rest) = order.split_first().unwrap();
        for &sp in rest {
            ws.merge_nodes(source, sp);
        }
    }
    Ok(ws.get_segmentation())
}

/// Depth-first preorder over the subgraph induced by `members`, covering
/// every connected component.
fn preorder(rag: &Rag, members: &[Label]) -> Vec<Label> {
    let in_members: FxHashSet<Label> = members.iter().copied().collect();
    let mut visited = FxHashSet::default();
    let mut order = Vec::with_capacity(members.len());
    for &start in members {
        if visited.contains(&start) {
            continue;
        }
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            order.push(node);
            for neighbor in rag.neighbors(node) {
                if in_members.contains(&neighbor) && !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }
    }
    order
}
