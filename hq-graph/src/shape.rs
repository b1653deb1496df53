use std::cmp::max;

use ndarray::{ArrayD, IxDyn, Zip};

/// The shape both operands broadcast to, following the usual trailing-axis rules.
/// Returns `None` if the shapes are incompatible.
pub fn broadcast_shape(left: &[usize], right: &[usize]) -> Option<Vec<usize>> {
    let rank = max(left.len(), right.len());

    let dim = |shape: &[usize], i: usize| -> usize {
        // missing leading axes act as size 1
        let offset = rank - shape.len();
        if i < offset {
            1
        } else {
            shape[i - offset]
        }
    };

    (0..rank)
        .map(|i| match (dim(left, i), dim(right, i)) {
            (l, r) if l == r => Some(l),
            (1, r) => Some(r),
            (l, 1) => Some(l),
            _ => None,
        })
        .collect()
}

/// Elementwise `f(left, right)` after broadcasting both operands to their common shape.
pub fn broadcast_zip(left: &ArrayD<f32>, right: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> Option<ArrayD<f32>> {
    let shape = IxDyn(&broadcast_shape(left.shape(), right.shape())?);

    let left = left.broadcast(shape.clone())?;
    let right = right.broadcast(shape)?;

    Some(Zip::from(&left).and(&right).map_collect(|&l, &r| f(l, r)))
}
