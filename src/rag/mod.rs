//! Region adjacency graph for segmentation of n-dimensional volumes.

mod priority;

use std::collections::BTreeMap;
use std::mem;

use log::{debug, info};
use ndarray::{Array, Array2, ArrayBase, ArrayD, Data, Dimension};
use ndarray_stats::QuantileExt;
use petgraph::graphmap::UnGraphMap;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::merge_queue::{MergeQueue, QueueHandle};
use crate::{build_neighbors_array, neighbor_idxs, neighbor_steps, pad, strip_padding, Label};

pub use priority::{
    boundary_mean, boundary_mean_ladder, boundary_mean_plus_sem, Classifier, EdgeFeatures,
    MergePriority,
};

/// Probability written on the padded border; no real edge can beat it, so an
/// edge touching the volume boundary never wins a merge.
const BOUNDARY_PROBABILITY: f64 = 1e100;

/// Per-node attributes: constituent cells and running probability moments.
#[derive(Clone, Debug, Default)]
struct NodeData {
    extent: FxHashSet<usize>,
    sump: f64,
    sump2: f64,
}

/// Per-edge attributes: separating dam cells and the current queue entry.
#[derive(Debug, Default)]
pub(crate) struct Edge {
    pub(crate) boundary: FxHashSet<usize>,
    qlink: Option<QueueHandle>,
}

/// Face-neighbor lookup, precomputed or recomputed on the fly.
enum Neighbors {
    Table(Array2<usize>),
    Lean { steps: Vec<isize>, len: usize },
}

impl Neighbors {
    fn of(&self, idx: usize, out: &mut Vec<usize>) {
        match self {
            Neighbors::Table(table) => {
                out.clear();
                out.extend(table.row(idx).iter().copied());
            }
            Neighbors::Lean { steps, len } => neighbor_idxs(steps, *len, idx, out),
        }
    }
}

/// Construction switches for [`Rag`].
pub struct RagOptions {
    /// Edge scoring used when (re)building the merge queue.
    pub merge_priority: MergePriority,
    /// Emit info-level progress messages during the long construction phases.
    pub show_progress: bool,
    /// Skip the neighbor table and recompute neighborhoods on the fly,
    /// trading lookup time for memory.
    pub lowmem: bool,
}

impl Default for RagOptions {
    fn default() -> RagOptions {
        RagOptions {
            merge_priority: MergePriority::BoundaryMean,
            show_progress: false,
            lowmem: false,
        }
    }
}

/// Region adjacency graph built from a labeled volume.
///
/// The labeled volume is assumed to have dams of label 0 between basins. Each
/// basin is a node; an edge joins two nodes when one or more dam cells touch
/// both basins. A reserved label (the maximum basin label plus one) is written
/// on the padded border and appears as a distinguished node whose edges mark
/// the basins touching the volume boundary.
///
/// The graph owns a working copy of the labeled volume and rewrites it as
/// nodes merge; [`get_segmentation`](Rag::get_segmentation) returns it with
/// the padding stripped.
pub struct Rag {
    watershed: ArrayD<Label>,
    segmentation: ArrayD<Label>,
    probabilities: ArrayD<f64>,
    pub(crate) graph: UnGraphMap<Label, Edge>,
    nodes: FxHashMap<Label, NodeData>,
    merge_queue: MergeQueue,
    merge_priority: MergePriority,
    neighbors: Neighbors,
    boundary_label: Label,
    show_progress: bool,
}

impl Rag {
    /// Build a graph from a labeled volume, with an all-zero probability map
    /// and default options.
    pub fn new<S, D>(watershed: &ArrayBase<S, D>) -> Rag
    where
        S: Data<Elem = Label>,
        D: Dimension,
    {
        Rag::with_options(watershed, Option::<&Array<f64, D>>::None, RagOptions::default())
    }

    /// Build a graph from a labeled volume and a probability map of the same
    /// shape, with default options.
    pub fn with_probabilities<S, Sp, D>(
        watershed: &ArrayBase<S, D>,
        probabilities: &ArrayBase<Sp, D>,
    ) -> Rag
    where
        S: Data<Elem = Label>,
        Sp: Data<Elem = f64>,
        D: Dimension,
    {
        Rag::with_options(watershed, Some(probabilities), RagOptions::default())
    }

    /// Build a graph from a labeled volume, an optional probability map and
    /// explicit options.
    pub fn with_options<S, Sp, D>(
        watershed: &ArrayBase<S, D>,
        probabilities: Option<&ArrayBase<Sp, D>>,
        options: RagOptions,
    ) -> Rag
    where
        S: Data<Elem = Label>,
        Sp: Data<Elem = f64>,
        D: Dimension,
    {
        let &max = watershed.max().expect("the watershed volume must not be empty");
        assert!(max < Label::MAX, "the maximum label plus one must be representable");
        let boundary_label = max + 1;

        let padded = pad(watershed, &[0, boundary_label]).into_dyn();
        let probabilities = match probabilities {
            Some(probabilities) => {
                assert_eq!(
                    probabilities.shape(),
                    watershed.shape(),
                    "the watershed and probability volumes must have the same shape"
                );
                pad(probabilities, &[BOUNDARY_PROBABILITY, 0.0]).into_dyn()
            }
            None => ArrayD::zeros(padded.raw_dim()),
        };
        let neighbors = if options.lowmem {
            Neighbors::Lean { steps: neighbor_steps(padded.shape()), len: padded.len() }
        } else {
            Neighbors::Table(build_neighbors_array(padded.shape()))
        };

        let mut rag = Rag {
            segmentation: padded.clone(),
            watershed: padded,
            probabilities,
            graph: UnGraphMap::new(),
            nodes: FxHashMap::default(),
            merge_queue: MergeQueue::null(),
            merge_priority: options.merge_priority,
            neighbors,
            boundary_label,
            show_progress: options.show_progress,
        };
        rag.build_graph_from_watershed();
        rag
    }

    fn build_graph_from_watershed(&mut self) {
        let flat = self.watershed.as_slice().unwrap();
        let probs = self.probabilities.as_slice().unwrap();
        let mut scratch = vec![];
        let mut adjacent: Vec<Label> = vec![];

        if self.show_progress {
            info!("building edges");
        }
        for (idx, &label) in flat.iter().enumerate() {
            if label != 0 {
                continue;
            }
            self.neighbors.of(idx, &mut scratch);
            adjacent.clear();
            adjacent.extend(scratch.iter().map(|&n| flat[n]).filter(|&l| l != 0));
            adjacent.sort_unstable();
            adjacent.dedup();
            // Dam cells touching fewer than two basins separate nothing.
            for (i, &u) in adjacent.iter().enumerate() {
                for &v in &adjacent[i + 1..] {
                    match self.graph.edge_weight_mut(u, v) {
                        Some(edge) => {
                            edge.boundary.insert(idx);
                        }
                        None => {
                            let mut edge = Edge::default();
                            edge.boundary.insert(idx);
                            self.graph.add_edge(u, v, edge);
                        }
                    }
                }
            }
        }

        if self.show_progress {
            info!("building nodes");
        }
        for (idx, &label) in flat.iter().enumerate() {
            if label == 0 {
                continue;
            }
            let node = self.nodes.entry(label).or_default();
            node.extent.insert(idx);
            let p = probs[idx];
            node.sump += p;
            node.sump2 += p * p;
            self.graph.add_node(label);
        }
    }

    /// Build a fresh queue entry for every edge and make it the active queue.
    pub fn rebuild_merge_queue(&mut self) {
        if self.show_progress {
            info!("building merge queue over {} edges", self.graph.edge_count());
        }
        let pairs: Vec<(Label, Label)> = self.graph.all_edges().map(|(u, v, _)| (u, v)).collect();
        let mut queue = MergeQueue::new();
        for (u, v) in pairs {
            let priority = self.merge_priority.evaluate(self, u, v);
            let qlink = queue.push(priority, u, v);
            self.graph.edge_weight_mut(u, v).unwrap().qlink = qlink;
        }
        self.merge_queue = queue;
    }

    /// Merge node pairs in ascending priority order until the cheapest
    /// candidate reaches `threshold`, returning the merged pairs in order.
    ///
    /// Builds the merge queue first if none is active. The customary
    /// threshold for [`MergePriority::BoundaryMean`] over 0-255 probability
    /// maps is 128.
    pub fn agglomerate(&mut self, threshold: f64) -> Vec<(Label, Label)> {
        self.merges(threshold).collect()
    }

    /// Iterator form of [`agglomerate`](Rag::agglomerate): every step pops
    /// the cheapest valid candidate below `threshold`, merges it and yields
    /// the `(kept, absorbed)` pair.
    pub fn merges(&mut self, threshold: f64) -> Merges<'_> {
        if self.merge_queue.is_empty() {
            self.rebuild_merge_queue();
        }
        Merges { rag: self, threshold }
    }

    /// Merge every node smaller than `threshold` into a neighbor, in
    /// ascending priority order, skipping nodes on the volume boundary.
    ///
    /// Temporarily wraps the current priority function in a
    /// [`MergePriority::Ladder`] with the given `threshold` and `strictness`,
    /// rebuilds the queue and agglomerates until only forbidden merges
    /// remain. Returns the merged pairs in order.
    pub fn agglomerate_ladder(&mut self, threshold: usize, strictness: u8) -> Vec<(Label, Label)> {
        let base = mem::replace(&mut self.merge_priority, MergePriority::BoundaryMean);
        self.merge_priority = MergePriority::Ladder { base: Box::new(base), threshold, strictness };
        self.rebuild_merge_queue();
        let merged = self.agglomerate(BOUNDARY_PROBABILITY / 10.0);
        if let MergePriority::Ladder { base, .. } =
            mem::replace(&mut self.merge_priority, MergePriority::BoundaryMean)
        {
            self.merge_priority = *base;
        }
        merged
    }

    /// Merge `n2` into `n1`, updating the necessary edges.
    ///
    /// `n2`'s edges move to `n1` (their queue entries are refreshed), its
    /// extent and probability moments are absorbed, and the working
    /// segmentation is relabeled. Dam cells that separated only `n1` from
    /// `n2` become interior to `n1`; the rest move to the edges between `n1`
    /// and the remaining neighboring bodies. `n2` is removed from the graph.
    pub fn merge_nodes(&mut self, n1: Label, n2: Label) {
        debug!("merging node {} into {}", n2, n1);
        let new_neighbors: Vec<Label> = self.graph.neighbors(n2).filter(|&m| m != n1).collect();
        let mut transferred = Vec::with_capacity(new_neighbors.len());
        for &m in &new_neighbors {
            let Edge { boundary, qlink } = self.graph.remove_edge(n2, m).unwrap();
            match self.graph.edge_weight_mut(n1, m) {
                Some(edge) => edge.boundary.extend(boundary),
                None => {
                    self.graph.add_edge(n1, m, Edge { boundary, qlink: None });
                }
            }
            transferred.push((m, qlink));
        }
        // Refresh only once every edge has moved, so priorities see the
        // final neighborhood of n1.
        for (m, qlink) in transferred {
            if let Some(qlink) = qlink {
                self.merge_queue.invalidate(qlink);
                self.update_merge_queue(n1, m);
            }
        }

        let absorbed = self.nodes.remove(&n2).unwrap();
        {
            let node = self.nodes.get_mut(&n1).unwrap();
            node.sump += absorbed.sump;
            node.sump2 += absorbed.sump2;
            let seg = self.segmentation.as_slice_mut().unwrap();
            for &idx in &absorbed.extent {
                seg[idx] = n1;
            }
            node.extent.extend(absorbed.extent);
        }

        if let Some(Edge { boundary, qlink }) = self.graph.remove_edge(n1, n2) {
            if let Some(qlink) = qlink {
                self.merge_queue.invalidate(qlink);
            }
            let mut boundary: Vec<usize> = boundary.into_iter().collect();
            boundary.sort_unstable();

            // Partition before relabeling anything: cells whose whole
            // neighborhood lies inside the merged body become interior.
            let mut scratch = vec![];
            let mut interior = vec![];
            let mut still_dam = vec![];
            {
                let seg = self.segmentation.as_slice().unwrap();
                for &b in &boundary {
                    self.neighbors.of(b, &mut scratch);
                    if scratch.iter().all(|&n| {
                        let l = seg[n];
                        l == 0 || l == n1 || l == n2
                    }) {
                        interior.push(b);
                    } else {
                        still_dam.push(b);
                    }
                }
            }
            {
                let node = self.nodes.get_mut(&n1).unwrap();
                let probs = self.probabilities.as_slice().unwrap();
                let seg = self.segmentation.as_slice_mut().unwrap();
                for &b in &interior {
                    node.extent.insert(b);
                    let p = probs[b];
                    node.sump += p;
                    node.sump2 += p * p;
                    seg[b] = n1;
                }
            }

            // The rest still separate n1 from some other body; collect them
            // onto the corresponding edges.
            let mut edits: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
            {
                let seg = self.segmentation.as_slice().unwrap();
                let mut labels: Vec<Label> = vec![];
                for &b in &still_dam {
                    self.neighbors.of(b, &mut scratch);
                    labels.clear();
                    labels.extend(scratch.iter().map(|&n| seg[n]).filter(|&l| l != 0 && l != n1));
                    labels.sort_unstable();
                    labels.dedup();
                    for &l in &labels {
                        edits.entry(l).or_default().push(b);
                    }
                }
            }
            for (&m, cells) in &edits {
                match self.graph.edge_weight_mut(n1, m) {
                    Some(edge) => edge.boundary.extend(cells.iter().copied()),
                    None => {
                        let mut edge = Edge::default();
                        edge.boundary.extend(cells.iter().copied());
                        self.graph.add_edge(n1, m, edge);
                    }
                }
                self.update_merge_queue(n1, m);
            }
            for &m in &new_neighbors {
                // The edit loop above already refreshed these.
                if !edits.contains_key(&m) {
                    self.update_merge_queue(n1, m);
                }
            }
        }
        self.graph.remove_node(n2);
    }

    /// Replace the queue entry for edge `(u, v)` with a freshly scored one.
    fn update_merge_queue(&mut self, u: Label, v: Label) {
        let qlink = self.graph.edge_weight(u, v).and_then(|edge| edge.qlink);
        if let Some(qlink) = qlink {
            self.merge_queue.invalidate(qlink);
        }
        if !self.merge_queue.is_null() {
            let priority = self.merge_priority.evaluate(self, u, v);
            let qlink = self.merge_queue.push(priority, u, v);
            if let Some(edge) = self.graph.edge_weight_mut(u, v) {
                edge.qlink = qlink;
            }
        }
    }

    /// The current segmentation with the sentinel padding stripped.
    pub fn get_segmentation(&self) -> ArrayD<Label> {
        strip_padding(&self.segmentation, 2)
    }

    /// Recompute the segmentation from scratch by scattering every node's
    /// extent to its label. Equals
    /// [`get_segmentation`](Rag::get_segmentation) whenever no merge is in
    /// flight; useful as a cross-check.
    pub fn build_volume(&self) -> ArrayD<Label> {
        let mut volume = ArrayD::zeros(self.watershed.raw_dim());
        {
            let flat = volume.as_slice_mut().unwrap();
            for (&label, node) in &self.nodes {
                for &idx in &node.extent {
                    flat[idx] = label;
                }
            }
        }
        strip_padding(&volume, 2)
    }

    /// True when node `n` touches the volume boundary.
    pub fn at_volume_boundary(&self, n: Label) -> bool {
        self.graph.contains_edge(n, self.boundary_label)
    }

    /// The reserved label of the volume boundary node.
    pub fn boundary_label(&self) -> Label {
        self.boundary_label
    }

    /// Finite priority larger than any real edge score; the ladder parks
    /// forbidden merges here so the queue keeps a stable ordering.
    pub fn never_merge_priority(&self) -> f64 {
        f64::MAX / self.segmentation.len() as f64
    }

    /// Labels of all current nodes, including the volume boundary node.
    pub fn nodes(&self) -> impl Iterator<Item = Label> + '_ {
        self.graph.nodes()
    }

    /// Number of nodes, counting the volume boundary node.
    pub fn num_nodes(&self) -> usize {
        self.graph.node_count()
    }

    /// True when `n` is a current node of the graph.
    pub fn contains_node(&self, n: Label) -> bool {
        self.nodes.contains_key(&n)
    }

    /// Number of cells in node `n`'s extent; 0 for unknown nodes.
    pub fn node_size(&self, n: Label) -> usize {
        self.nodes.get(&n).map_or(0, |node| node.extent.len())
    }

    /// Sorted flat indices (into the padded volume) of node `n`'s cells.
    pub fn node_extent(&self, n: Label) -> Vec<usize> {
        let mut extent: Vec<usize> =
            self.nodes.get(&n).map_or(vec![], |node| node.extent.iter().copied().collect());
        extent.sort_unstable();
        extent
    }

    /// Sum and sum of squares of the probabilities over node `n`'s extent.
    pub fn node_moments(&self, n: Label) -> Option<(f64, f64)> {
        self.nodes.get(&n).map(|node| (node.sump, node.sump2))
    }

    /// Sorted labels of the nodes sharing an edge with `n`.
    pub fn neighbors(&self, n: Label) -> Vec<Label> {
        let mut neighbors: Vec<Label> = self.graph.neighbors(n).collect();
        neighbors.sort_unstable();
        neighbors
    }

    /// True when an edge joins `u` and `v`.
    pub fn has_edge(&self, u: Label, v: Label) -> bool {
        self.graph.contains_edge(u, v)
    }

    /// Sorted flat indices of the dam cells separating `u` and `v`, if the
    /// edge exists.
    pub fn edge_boundary(&self, u: Label, v: Label) -> Option<Vec<usize>> {
        self.graph.edge_weight(u, v).map(|edge| {
            let mut boundary: Vec<usize> = edge.boundary.iter().copied().collect();
            boundary.sort_unstable();
            boundary
        })
    }

    pub(crate) fn probabilities_flat(&self) -> &[f64] {
        self.probabilities.as_slice().unwrap()
    }
}

/// Iterator over merge events; see [`Rag::merges`].
pub struct Merges<'a> {
    rag: &'a mut Rag,
    threshold: f64,
}

impl<'a> Iterator for Merges<'a> {
    type Item = (Label, Label);

    fn next(&mut self) -> Option<(Label, Label)> {
        loop {
            let entry = self.rag.merge_queue.peek()?;
            if !entry.valid {
                self.rag.merge_queue.pop();
                continue;
            }
            if entry.priority >= self.threshold {
                return None;
            }
            self.rag.merge_queue.pop();
            let (n1, n2) = entry.nodes;
            self.rag.merge_nodes(n1, n2);
            return Some((n1, n2));
        }
    }
}
