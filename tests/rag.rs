use approx::assert_relative_eq;
use ndarray::{arr2, Array2, ArrayD, Ix2};

use ndarray_segment::{
    boundary_mean, boundary_mean_ladder, boundary_mean_plus_sem, build_neighbors_array, pad,
    watershed, Classifier, EdgeFeatures, Label, MergePriority, Rag, RagOptions,
};

fn ridge_volume() -> Array2<u8> {
    arr2(&[[0, 2, 0], [0, 2, 0], [0, 2, 0]])
}

fn probability_grid() -> Array2<f64> {
    arr2(&[[1., 2., 3.], [4., 5., 6.], [7., 8., 9.]])
}

/// A border basin (label 1) enclosing two stacked interior basins (2 and 3),
/// all separated by dams. Basin 2 holds `rows2 * w` cells, basin 3
/// `rows3 * w`; only basin 1 touches the volume boundary.
fn nested_volume(w: usize, rows2: usize, rows3: usize) -> Array2<Label> {
    let nrows = rows2 + rows3 + 5;
    let ncols = w + 4;
    let mut volume = Array2::ones((nrows, ncols));
    for r in 1..nrows - 1 {
        volume[[r, 1]] = 0;
        volume[[r, ncols - 2]] = 0;
    }
    for c in 1..ncols - 1 {
        volume[[1, c]] = 0;
        volume[[rows2 + 2, c]] = 0;
        volume[[rows2 + rows3 + 3, c]] = 0;
    }
    for r in 2..2 + rows2 {
        for c in 2..2 + w {
            volume[[r, c]] = 2;
        }
    }
    for r in rows2 + 3..rows2 + 3 + rows3 {
        for c in 2..2 + w {
            volume[[r, c]] = 3;
        }
    }
    volume
}

fn unravel(shape: &[usize], mut idx: usize) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for d in (0..shape.len()).rev() {
        coords[d] = idx % shape[d];
        idx /= shape[d];
    }
    coords
}

fn in_padding(shape: &[usize], idx: usize) -> bool {
    unravel(shape, idx).iter().zip(shape).any(|(&c, &d)| c < 2 || c >= d - 2)
}

/// Check the graph against its own segmentation: extents partition the
/// non-zero cells, boundary cells are dams touching both endpoints, and
/// boundary-node edges match cells adjacent to the padding.
fn check_invariants(rag: &Rag) {
    let seg = rag.get_segmentation();
    assert_eq!(rag.build_volume(), seg);

    let padded: ArrayD<Label> = pad(&seg, &[0, rag.boundary_label()]);
    let table = build_neighbors_array(padded.shape());
    let flat = padded.as_slice().unwrap();

    let mut labels: Vec<Label> = rag.nodes().collect();
    labels.sort_unstable();

    let total: usize = labels.iter().map(|&n| rag.node_size(n)).sum();
    let nonzero = flat.iter().filter(|&&l| l != 0).count();
    assert_eq!(total, nonzero);

    for &u in &labels {
        for v in rag.neighbors(u) {
            if v < u {
                continue;
            }
            let boundary = rag.edge_boundary(u, v).unwrap();
            assert!(!boundary.is_empty());
            for &b in &boundary {
                assert_eq!(flat[b], 0);
                let adjacent: Vec<Label> = table.row(b).iter().map(|&n| flat[n]).collect();
                assert!(adjacent.contains(&u), "edge ({}, {}) cell {}", u, v, b);
                assert!(adjacent.contains(&v), "edge ({}, {}) cell {}", u, v, b);
            }
        }
    }

    let shape = padded.shape().to_vec();
    for &n in &labels {
        if n == rag.boundary_label() {
            continue;
        }
        let touches = rag
            .node_extent(n)
            .iter()
            .any(|&i| table.row(i).iter().any(|&j| in_padding(&shape, j)));
        assert_eq!(rag.at_volume_boundary(n), touches, "node {}", n);
    }
}

#[test] // Results verified manually.
fn test_construction_two_basins() {
    let ws = watershed(&ridge_volume());
    let rag = Rag::new(&ws);

    assert_eq!(rag.boundary_label(), 3);
    let mut nodes: Vec<Label> = rag.nodes().collect();
    nodes.sort_unstable();
    assert_eq!(nodes, vec![1, 2, 3]);
    assert_eq!(rag.node_size(1), 3);
    assert_eq!(rag.node_size(2), 3);
    assert!(rag.has_edge(1, 2));
    assert!(!rag.has_edge(1, 1));
    assert!(rag.at_volume_boundary(1));
    assert!(rag.at_volume_boundary(2));
    assert_eq!(rag.edge_boundary(1, 2).unwrap().len(), 3);
    check_invariants(&rag);
}

#[test]
fn test_node_moments() {
    let ws = watershed(&ridge_volume());
    let rag = Rag::with_probabilities(&ws, &probability_grid());
    assert_relative_eq!(rag.node_moments(1).unwrap().0, 12.0);
    assert_relative_eq!(rag.node_moments(1).unwrap().1, 66.0);
    assert_relative_eq!(rag.node_moments(2).unwrap().0, 18.0);
    assert_relative_eq!(rag.node_moments(2).unwrap().1, 126.0);
}

#[test]
fn test_merge_absorbs_extent_moments_and_dams() {
    let ws = watershed(&ridge_volume());
    let mut rag = Rag::with_probabilities(&ws, &probability_grid());
    rag.merge_nodes(1, 2);

    // The separating dam cells become interior to the merged node.
    assert_eq!(rag.node_size(1), 9);
    let (sump, sump2) = rag.node_moments(1).unwrap();
    assert_relative_eq!(sump, 45.0);
    assert_relative_eq!(sump2, 285.0);
    assert!(rag.get_segmentation().iter().all(|&l| l == 1));
    check_invariants(&rag);
}

#[test]
fn test_merge_matches_fresh_construction() {
    let ws = watershed(&ridge_volume());
    let mut rag = Rag::new(&ws);
    rag.merge_nodes(1, 2);
    let seg = rag.get_segmentation();

    let fresh = Rag::new(&seg);
    assert_eq!(fresh.get_segmentation(), seg);
    assert_eq!(fresh.num_nodes(), rag.num_nodes());
    assert_eq!(fresh.node_size(1), rag.node_size(1));
    assert_eq!(fresh.neighbors(1), vec![fresh.boundary_label()]);
    assert_eq!(rag.neighbors(1), vec![rag.boundary_label()]);
}

#[test] // Results verified manually.
fn test_trivial_agglomeration() {
    let ws = watershed(&ridge_volume());
    let probabilities = ridge_volume().mapv(f64::from);
    let mut rag = Rag::with_probabilities(&ws, &probabilities);

    // The only real edge has boundary mean 2; both boundary edges carry the
    // border sentinel and never merge.
    let merged = rag.agglomerate(3.0);
    assert_eq!(merged, vec![(1, 2)]);
    assert_eq!(rag.num_nodes(), 2);
    assert!(rag.get_segmentation().iter().all(|&l| l == 1));
    check_invariants(&rag);
}

#[test]
fn test_merges_iterator() {
    let ws = watershed(&ridge_volume());
    let probabilities = ridge_volume().mapv(f64::from);
    let mut rag = Rag::with_probabilities(&ws, &probabilities);

    let mut merges = rag.merges(3.0);
    assert_eq!(merges.next(), Some((1, 2)));
    assert_eq!(merges.next(), None);
}

#[test]
fn test_agglomeration_respects_threshold() {
    let ws = watershed(&ridge_volume());
    let probabilities = ridge_volume().mapv(f64::from);
    let mut rag = Rag::with_probabilities(&ws, &probabilities);

    // Boundary mean is 2; a threshold of 2 is not strictly above it.
    assert!(rag.agglomerate(2.0).is_empty());
    assert_eq!(rag.num_nodes(), 3);
}

#[test]
fn test_boundary_mean_functions() {
    let ws = watershed(&ridge_volume());
    let rag = Rag::with_probabilities(&ws, &probability_grid());
    assert_relative_eq!(boundary_mean(&rag, 1, 2), 5.0);
    // Boundary values are {2, 5, 8}: sample variance 9 over 3 cells.
    assert_relative_eq!(boundary_mean_plus_sem(&rag, 1, 2, 1.0), 5.0 + 3f64.sqrt());
    assert_relative_eq!(boundary_mean_plus_sem(&rag, 1, 2, 0.0), 5.0);
}

#[test] // Results verified manually.
fn test_ladder_rejects_large_basins() {
    let volume = nested_volume(10, 10, 10);
    let mut rag = Rag::new(&volume);
    assert!(!rag.at_volume_boundary(2));
    assert!(!rag.at_volume_boundary(3));
    assert_eq!(rag.node_size(2), 100);
    assert_eq!(rag.node_size(3), 100);

    assert_eq!(boundary_mean_ladder(&rag, 2, 3, 50, 1), rag.never_merge_priority());
    let merged = rag.agglomerate_ladder(50, 1);
    assert!(merged.is_empty());
    assert_eq!(rag.num_nodes(), 4);
    check_invariants(&rag);
}

#[test] // Results verified manually.
fn test_ladder_accepts_small_basin() {
    let volume = nested_volume(5, 1, 40);
    let mut rag = Rag::new(&volume);
    assert_eq!(rag.node_size(2), 5);
    assert_eq!(rag.node_size(3), 200);

    assert_relative_eq!(boundary_mean_ladder(&rag, 2, 3, 50, 1), 0.0);
    let merged = rag.agglomerate_ladder(50, 1);
    // The small basin merges once; every later candidate joins two large
    // bodies and is forbidden.
    assert_eq!(merged.len(), 1);
    let (kept, absorbed) = merged[0];
    assert!(kept == 2 || absorbed == 2);
    let seg = rag.get_segmentation().into_dimensionality::<Ix2>().unwrap();
    assert_ne!(seg[[2, 2]], 2);
    assert_eq!(seg[[4, 2]], 3);
    check_invariants(&rag);
}

#[test]
fn test_ladder_strictness_two_requires_exactly_one_small() {
    // All three basins are below the threshold, so strictness 2 forbids
    // every merge while strictness 1 does not.
    let mut rag = Rag::new(&nested_volume(5, 1, 4));
    assert!(rag.agglomerate_ladder(50, 2).is_empty());

    let mut rag = Rag::new(&nested_volume(5, 1, 4));
    assert!(!rag.agglomerate_ladder(50, 1).is_empty());
}

#[test]
fn test_ladder_strictness_three_requires_wide_boundary() {
    // Basins 2 and 3 share only two boundary cells, basins 1 and 2 four.
    let volume = nested_volume(2, 1, 30);
    let mut rag = Rag::new(&volume);
    assert_eq!(rag.edge_boundary(2, 3).unwrap().len(), 2);
    assert_eq!(rag.edge_boundary(1, 2).unwrap().len(), 4);

    let merged = rag.agglomerate_ladder(50, 3);
    assert_eq!(merged, vec![(1, 2)]);
    let seg = rag.get_segmentation().into_dimensionality::<Ix2>().unwrap();
    assert_eq!(seg[[5, 2]], 3);
    check_invariants(&rag);
}

#[test]
fn test_lowmem_matches_table_lookup() {
    let volume = nested_volume(4, 2, 3);
    let rag = Rag::new(&volume);
    let lean = Rag::with_options(
        &volume,
        Option::<&Array2<f64>>::None,
        RagOptions { lowmem: true, ..RagOptions::default() },
    );
    assert_eq!(lean.get_segmentation(), rag.get_segmentation());
    assert_eq!(lean.num_nodes(), rag.num_nodes());
    assert_eq!(lean.edge_boundary(1, 2), rag.edge_boundary(1, 2));
    assert_eq!(lean.edge_boundary(2, 3), rag.edge_boundary(2, 3));
    check_invariants(&lean);
}

#[test]
fn test_custom_priority_function() {
    fn high(_: &Rag, _: Label, _: Label) -> f64 {
        1000.0
    }
    let ws = watershed(&ridge_volume());
    let mut rag = Rag::with_options(
        &ws,
        Option::<&Array2<f64>>::None,
        RagOptions { merge_priority: MergePriority::Custom(high), ..RagOptions::default() },
    );
    assert!(rag.agglomerate(128.0).is_empty());
    assert_eq!(rag.num_nodes(), 3);
}

struct MeanFeature;

impl EdgeFeatures for MeanFeature {
    fn features(&self, rag: &Rag, u: Label, v: Label) -> Vec<f64> {
        vec![boundary_mean(rag, u, v)]
    }
}

struct Proba(f64);

impl Classifier for Proba {
    fn predict_proba(&self, _features: &[f64]) -> Option<f64> {
        Some(self.0)
    }

    fn predict(&self, _features: &[f64]) -> f64 {
        unreachable!()
    }
}

struct ScoreOnly;

impl Classifier for ScoreOnly {
    fn predict_proba(&self, _features: &[f64]) -> Option<f64> {
        None
    }

    fn predict(&self, features: &[f64]) -> f64 {
        features[0] / 2.0
    }
}

#[test]
fn test_classifier_priority() {
    let ws = watershed(&ridge_volume());
    let rag = Rag::with_probabilities(&ws, &probability_grid());

    let priority = MergePriority::Classifier {
        extractor: Box::new(MeanFeature),
        model: Box::new(Proba(0.75)),
    };
    assert_relative_eq!(priority.evaluate(&rag, 1, 2), 0.75);

    // Without class probabilities, the plain prediction is used.
    let priority = MergePriority::Classifier {
        extractor: Box::new(MeanFeature),
        model: Box::new(ScoreOnly),
    };
    assert_relative_eq!(priority.evaluate(&rag, 1, 2), 2.5);
}
