use crate::{
    common::{Tensor, Weights},
    coordinator::error::AggregationError,
};

/// Strategy used to combine the updates of a round into new global
/// weights.
///
/// The updates are `(weights, aggregation weight)` pairs. The
/// resulting weights must have the same layers and shapes as every
/// update.
pub trait Aggregator {
    fn aggregate(&mut self, updates: Vec<(Weights, u64)>) -> Result<Weights, AggregationError>;
}

impl<A: Aggregator + ?Sized> Aggregator for Box<A> {
    fn aggregate(&mut self, updates: Vec<(Weights, u64)>) -> Result<Weights, AggregationError> {
        (**self).aggregate(updates)
    }
}

/// Check that there is at least one update and that all the updates
/// have the same layers.
fn check_shapes(updates: &[(Weights, u64)]) -> Result<(), AggregationError> {
    let (reference, _) = updates.first().ok_or(AggregationError::NoUpdates)?;
    for (weights, _) in updates.iter().skip(1) {
        if weights.len() != reference.len() {
            return Err(AggregationError::LayerCountMismatch {
                expected: reference.len(),
                actual: weights.len(),
            });
        }
        for (layer, (expected, actual)) in reference.iter().zip(weights.iter()).enumerate() {
            if expected.shape() != actual.shape() {
                return Err(AggregationError::ShapeMismatch {
                    layer,
                    expected: expected.shape().to_vec(),
                    actual: actual.shape().to_vec(),
                });
            }
        }
    }
    Ok(())
}

fn zeros_like(weights: &[Tensor]) -> Weights {
    weights
        .iter()
        .map(|tensor| Tensor::zeros(tensor.raw_dim()))
        .collect()
}

/// Federated averaging: each layer of the result is the average of
/// the corresponding layers of the updates, weighted by their
/// aggregation weights.
#[derive(Debug, Default)]
pub struct FederatedAveraging;

impl Aggregator for FederatedAveraging {
    fn aggregate(&mut self, updates: Vec<(Weights, u64)>) -> Result<Weights, AggregationError> {
        check_shapes(&updates)?;

        let total_weight: u128 = updates.iter().map(|(_, weight)| *weight as u128).sum();
        if total_weight == 0 {
            return Err(AggregationError::ZeroTotalWeight);
        }

        let mut average = zeros_like(&updates[0].0);
        for (weights, weight) in updates.iter() {
            let share = (*weight as f64 / total_weight as f64) as f32;
            for (acc, layer) in average.iter_mut().zip(weights.iter()) {
                acc.scaled_add(share, layer);
            }
        }
        Ok(average)
    }
}

/// Return the weights of the only update of the round. Fails if there
/// is not exactly one update.
#[derive(Debug, Default)]
pub struct IdentityAggregator;

impl Aggregator for IdentityAggregator {
    fn aggregate(&mut self, mut updates: Vec<(Weights, u64)>) -> Result<Weights, AggregationError> {
        if updates.len() != 1 {
            return Err(AggregationError::UnexpectedUpdateCount {
                expected: 1,
                actual: updates.len(),
            });
        }
        // UNWRAP_SAFE: there is exactly one update
        let (weights, _) = updates.pop().unwrap();
        Ok(weights)
    }
}

/// Sum the updates layer by layer, ignoring their aggregation weights.
#[derive(Debug, Default)]
pub struct ModelSumAggregator;

impl Aggregator for ModelSumAggregator {
    fn aggregate(&mut self, updates: Vec<(Weights, u64)>) -> Result<Weights, AggregationError> {
        check_shapes(&updates)?;
        let mut sum = zeros_like(&updates[0].0);
        for (weights, _) in updates.iter() {
            for (acc, layer) in sum.iter_mut().zip(weights.iter()) {
                *acc += layer;
            }
        }
        Ok(sum)
    }
}
