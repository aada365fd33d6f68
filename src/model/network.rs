//! A fully connected network with one sigmoid hidden layer and a softmax output.
//!
//! The same network serves as the global classifier trained by the clients and as the frozen
//! encoder whose cross-entropy loss surface drives the gradient-inversion reconstruction. The
//! parameter order is `[w1, b1, w2, b2]`, so the second-to-last layer of a [`GradientSnapshot`]
//! is the gradient of the output weights.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    data::Label,
    model::{GradientSnapshot, Layer, ModelError, Weights},
};

/// The number of layer tensors of a [`Perceptron`].
pub const LAYER_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The dimensions of a [`Perceptron`].
pub struct NetworkShape {
    /// The length of a flattened input.
    pub input: usize,
    /// The width of the hidden layer.
    pub hidden: usize,
    /// The number of classes.
    pub classes: usize,
}

impl NetworkShape {
    /// Gets the expected shapes of the layer tensors, in parameter order.
    pub fn layer_shapes(&self) -> [Vec<usize>; LAYER_COUNT] {
        [
            vec![self.hidden, self.input],
            vec![self.hidden],
            vec![self.classes, self.hidden],
            vec![self.classes],
        ]
    }
}

/// The soft targets of a distillation term.
pub struct Distillation<'a> {
    /// The target class probabilities, one row per sample.
    pub targets: ArrayView2<'a, f32>,
    /// The weight of the distillation term.
    pub weight: f32,
    /// The softmax temperature applied to the logits.
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
/// A one-hidden-layer perceptron.
///
/// Gradients are returned in the same struct, since they share the parameter layout.
pub struct Perceptron {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl Perceptron {
    /// Creates a network with all parameters set to zero.
    pub fn zeros(shape: NetworkShape) -> Self {
        Self {
            w1: Array2::zeros((shape.hidden, shape.input)),
            b1: Array1::zeros(shape.hidden),
            w2: Array2::zeros((shape.classes, shape.hidden)),
            b2: Array1::zeros(shape.classes),
        }
    }

    /// Creates a network with parameters drawn uniformly from `±1/sqrt(fan_in)`.
    pub fn init<R: Rng>(shape: NetworkShape, rng: &mut R) -> Self {
        let bound_in = 1. / (shape.input.max(1) as f32).sqrt();
        let bound_hidden = 1. / (shape.hidden.max(1) as f32).sqrt();
        let w1 = Array2::from_shape_fn((shape.hidden, shape.input), |_| {
            rng.gen_range(-bound_in..=bound_in)
        });
        let b1 = Array1::from_shape_fn(shape.hidden, |_| rng.gen_range(-bound_in..=bound_in));
        let w2 = Array2::from_shape_fn((shape.classes, shape.hidden), |_| {
            rng.gen_range(-bound_hidden..=bound_hidden)
        });
        let b2 = Array1::from_shape_fn(shape.classes, |_| {
            rng.gen_range(-bound_hidden..=bound_hidden)
        });
        Self { w1, b1, w2, b2 }
    }

    /// Creates the deterministically initialized network for the given seed.
    ///
    /// Every party calling this with the same shape and seed obtains the same network, which is
    /// how clients and coordinator agree on the frozen encoder.
    pub fn weights_init(shape: NetworkShape, seed: u64) -> Self {
        Self::init(shape, &mut ChaCha8Rng::seed_from_u64(seed))
    }

    /// Creates a network from a snapshot of its parameters.
    ///
    /// # Errors
    /// Fails if the number or the shapes of the layers don't match the given network shape.
    pub fn from_weights(shape: NetworkShape, weights: &Weights) -> Result<Self, ModelError> {
        let (w1, b1, w2, b2) = typed_layers(shape, weights.layers())?;
        Ok(Self { w1, b1, w2, b2 })
    }

    /// Takes a snapshot of the parameters.
    pub fn to_weights(&self) -> Weights {
        self.clone().into_layers().into()
    }

    /// Gets the dimensions of this network.
    pub fn shape(&self) -> NetworkShape {
        NetworkShape {
            input: self.w1.ncols(),
            hidden: self.w1.nrows(),
            classes: self.w2.nrows(),
        }
    }

    fn into_layers(self) -> Vec<Layer> {
        vec![
            self.w1.into_dyn(),
            self.b1.into_dyn(),
            self.w2.into_dyn(),
            self.b2.into_dyn(),
        ]
    }

    fn hidden(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut a = x.dot(&self.w1.t());
        a += &self.b1;
        a.mapv_inplace(sigmoid);
        a
    }

    fn logits(&self, h: &Array2<f32>) -> Array2<f32> {
        let mut z = h.dot(&self.w2.t());
        z += &self.b2;
        z
    }

    /// Computes the logits of a batch of flattened inputs, one row per sample.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        self.logits(&self.hidden(x))
    }

    /// Computes the class probabilities of a batch at the given softmax temperature.
    pub fn probabilities(&self, x: ArrayView2<f32>, temperature: f32) -> Array2<f32> {
        let mut z = self.forward(x);
        z.mapv_inplace(|v| v / temperature);
        softmax_rows(&mut z);
        z
    }

    /// Predicts the top-1 class of every sample of a batch.
    pub fn predict(&self, x: ArrayView2<f32>) -> Vec<Label> {
        self.forward(x).rows().into_iter().map(argmax).collect()
    }

    /// Computes the mean cross-entropy loss of a batch and its gradients.
    ///
    /// With a [`Distillation`], the weighted soft cross-entropy toward the target probabilities
    /// is added to the loss.
    pub fn batch_gradient(
        &self,
        x: ArrayView2<f32>,
        labels: &[Label],
        distillation: Option<Distillation<'_>>,
    ) -> (f32, Perceptron) {
        let n = x.nrows().max(1) as f32;
        let h = self.hidden(x);
        let z = self.logits(&h);
        let mut p = z.clone();
        softmax_rows(&mut p);

        let mut loss = 0.;
        let mut dz = p.clone();
        for (i, &label) in labels.iter().enumerate() {
            loss -= p[[i, label]].max(f32::MIN_POSITIVE).ln();
            dz[[i, label]] -= 1.;
        }
        if let Some(Distillation {
            targets,
            weight,
            temperature,
        }) = distillation
        {
            let mut soft = z.mapv(|v| v / temperature);
            softmax_rows(&mut soft);
            for (s, t) in soft.iter().zip(targets.iter()) {
                loss -= weight * t * s.max(f32::MIN_POSITIVE).ln();
            }
            let residual = &soft - &targets;
            dz.zip_mut_with(&residual, |d, r| *d += weight * r / temperature);
        }
        loss /= n;
        dz /= n;

        let w2 = dz.t().dot(&h);
        let b2 = dz.sum_axis(Axis(0));
        let mut dh = dz.dot(&self.w2);
        dh.zip_mut_with(&h, |d, &v| *d *= v * (1. - v));
        let w1 = dh.t().dot(&x);
        let b1 = dh.sum_axis(Axis(0));

        (loss, Perceptron { w1, b1, w2, b2 })
    }

    /// Takes a gradient descent step.
    pub fn apply_gradients(&mut self, grads: &Perceptron, learning_rate: f32) {
        self.w1.scaled_add(-learning_rate, &grads.w1);
        self.b1.scaled_add(-learning_rate, &grads.b1);
        self.w2.scaled_add(-learning_rate, &grads.w2);
        self.b2.scaled_add(-learning_rate, &grads.b2);
    }

    /// Computes the cross-entropy gradient of a single sample.
    pub fn sample_gradient(&self, x: ArrayView1<f32>, label: Label) -> GradientSnapshot {
        let (_, grads) = self.batch_gradient(x.insert_axis(Axis(0)), &[label], None);
        grads.into_layers().into()
    }

    /// Computes the squared L2 distance between the cross-entropy gradient induced by the
    /// candidate input `x` with the given label and the target gradient, together with the
    /// derivative of that distance with respect to `x`.
    ///
    /// The network parameters are constant here, only the input is a free variable.
    pub fn gradient_residual(
        &self,
        x: ArrayView1<f32>,
        label: Label,
        target: &GradientTarget,
    ) -> (f32, Array1<f32>) {
        // forward pass
        let a = self.w1.dot(&x) + &self.b1;
        let h = a.mapv(sigmoid);
        let s = h.mapv(|v| v * (1. - v));
        let z = self.w2.dot(&h) + &self.b2;
        let p = softmax(&z);
        let mut e = p.clone();
        e[label] -= 1.;
        let v = self.w2.t().dot(&e);
        let delta = &v * &s;

        // induced parameter gradients minus the target
        let r_w2 = outer(&e, h.view()) - &target.w2;
        let r_b2 = &e - &target.b2;
        let r_w1 = outer(&delta, x) - &target.w1;
        let r_b1 = &delta - &target.b1;
        let loss = squared_norm(r_w1.iter())
            + squared_norm(r_b1.iter())
            + squared_norm(r_w2.iter())
            + squared_norm(r_b2.iter());

        // reverse pass through the gradient computation
        let g_w1 = r_w1 * 2.;
        let g_b1 = r_b1 * 2.;
        let g_w2 = r_w2 * 2.;
        let g_b2 = r_b2 * 2.;

        let delta_bar = g_w1.dot(&x) + &g_b1;
        let mut x_bar = g_w1.t().dot(&delta);
        let v_bar = &delta_bar * &s;
        let s_bar = &delta_bar * &v;
        let e_bar = self.w2.dot(&v_bar) + g_w2.dot(&h) + &g_b2;
        let mut h_bar = g_w2.t().dot(&e) + &s_bar * &h.mapv(|v| 1. - 2. * v);
        let pe = p.dot(&e_bar);
        let z_bar = &p * &e_bar.mapv(|g| g - pe);
        h_bar += &self.w2.t().dot(&z_bar);
        let a_bar = &h_bar * &s;
        x_bar += &self.w1.t().dot(&a_bar);

        (loss, x_bar)
    }
}

/// A [`GradientSnapshot`] checked against a [`NetworkShape`], ready to be matched by
/// [`Perceptron::gradient_residual`].
#[derive(Debug, Clone)]
pub struct GradientTarget {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl GradientTarget {
    /// Checks the snapshot layout and converts it.
    ///
    /// # Errors
    /// Fails if the number or the shapes of the layers don't match the given network shape.
    pub fn new(shape: NetworkShape, snapshot: &GradientSnapshot) -> Result<Self, ModelError> {
        let (w1, b1, w2, b2) = typed_layers(shape, snapshot.layers())?;
        Ok(Self { w1, b1, w2, b2 })
    }
}

fn typed_layers(
    shape: NetworkShape,
    layers: &[Layer],
) -> Result<(Array2<f32>, Array1<f32>, Array2<f32>, Array1<f32>), ModelError> {
    if layers.len() != LAYER_COUNT {
        return Err(ModelError::LayerCount {
            expected: LAYER_COUNT,
            actual: layers.len(),
        });
    }
    for (index, (layer, expected)) in layers.iter().zip(shape.layer_shapes()).enumerate() {
        if layer.shape() != expected.as_slice() {
            return Err(ModelError::LayerShape {
                index,
                expected,
                actual: layer.shape().to_vec(),
            });
        }
    }
    let shape_error = |index: usize| {
        let expected = shape.layer_shapes()[index].clone();
        move |_| ModelError::LayerShape {
            index,
            actual: expected.clone(),
            expected,
        }
    };
    Ok((
        layers[0].clone().into_dimensionality::<Ix2>().map_err(shape_error(0))?,
        layers[1].clone().into_dimensionality::<Ix1>().map_err(shape_error(1))?,
        layers[2].clone().into_dimensionality::<Ix2>().map_err(shape_error(2))?,
        layers[3].clone().into_dimensionality::<Ix1>().map_err(shape_error(3))?,
    ))
}

fn sigmoid(v: f32) -> f32 {
    1. / (1. + (-v).exp())
}

fn outer(a: &Array1<f32>, b: ArrayView1<f32>) -> Array2<f32> {
    a.view().insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

fn squared_norm<'a>(values: impl Iterator<Item = &'a f32>) -> f32 {
    values.map(|v| v * v).sum()
}

/// Computes the softmax of a vector.
pub fn softmax(z: &Array1<f32>) -> Array1<f32> {
    let max = z.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let exp = z.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Applies the softmax to every row in place.
pub fn softmax_rows(z: &mut Array2<f32>) {
    for mut row in z.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

/// Gets the index of the first largest value.
pub fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}

/// Gets the index of the first smallest value.
pub fn argmin(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::INFINITY), |(best, min), (i, &v)| {
            if v < min {
                (i, v)
            } else {
                (best, min)
            }
        })
        .0
}
