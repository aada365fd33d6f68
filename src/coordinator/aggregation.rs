//! Federated averaging of the uploaded client models.

use ndarray::ArrayD;

use crate::model::{ModelError, Weights};

/// Averages client models, weighted by their number of train samples.
///
/// # Errors
/// Fails if there is no model, if the models disagree on their layout or if the weights sum up to
/// zero.
pub fn federated_average(models: &[(&Weights, usize)]) -> Result<Weights, ModelError> {
    let (first, _) = models.first().ok_or(ModelError::NothingToAggregate)?;
    let total_weight = models.iter().map(|(_, weight)| *weight).sum::<usize>();
    if total_weight == 0 {
        return Err(ModelError::ZeroTotalWeight);
    }

    let mut layers: Vec<ArrayD<f32>> = first
        .layers()
        .iter()
        .map(|layer| ArrayD::zeros(layer.raw_dim()))
        .collect();
    for (model, weight) in models {
        if model.len() != layers.len() {
            return Err(ModelError::LayerCount {
                expected: layers.len(),
                actual: model.len(),
            });
        }
        let share = *weight as f32 / total_weight as f32;
        for (index, (sum, layer)) in layers.iter_mut().zip(model.layers()).enumerate() {
            if sum.shape() != layer.shape() {
                return Err(ModelError::LayerShape {
                    index,
                    expected: sum.shape().to_vec(),
                    actual: layer.shape().to_vec(),
                });
            }
            sum.scaled_add(share, layer);
        }
    }
    Ok(layers.into())
}
