use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::TrainError;
use crate::mnist_loader::{MnistData, Split};
use crate::trainer::{PretrainStep, TestStep, TrainStep, ValidateStep};
use crate::Float;

/*  Sizing Notation:
   k - size of current layer (input activations)
   j - size of next layer    (output activations)
   m - size of mini-batch
   Activations hold one sample per row: (m, k).
*/

// keeps ln() finite in the reconstruction cross-entropy
const EPSILON: Float = 1e-7;

/// Stacked denoising autoencoder: sigmoid hidden layers, each paired with a
/// tied-weight denoising autoencoder for pretraining, topped by a softmax
/// logistic regression layer for fine-tuning.
#[derive(Debug, Clone)]
pub struct Sda {
    n_outs: usize,
    weights: Vec<Array2<Float>>,        // (k, j), shared by the sigmoid layer and its autoencoder
    biases: Vec<Array1<Float>>,         // (j), hidden bias of both
    visible_biases: Vec<Array1<Float>>, // (k), autoencoder reconstruction bias
    output_weights: Array2<Float>,      // (j, n_outs)
    output_bias: Array1<Float>,         // (n_outs)
    rng: StdRng,
}

impl Sda {
    pub fn new(seed: u64, n_ins: usize, hidden_layers_sizes: &[usize], n_outs: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut layer_dims = Vec::with_capacity(hidden_layers_sizes.len() + 1);
        layer_dims.push(n_ins);
        layer_dims.extend_from_slice(hidden_layers_sizes);

        let weights: Vec<Array2<Float>> = layer_dims
            .windows(2)
            .map(|dims| {
                let (k, j) = (dims[0], dims[1]);
                let bound = 4. * (6. / (k + j) as Float).sqrt();
                Array2::from_shape_fn((k, j), |_| rng.gen_range(-bound..bound))
            })
            .collect();
        let biases = hidden_layers_sizes.iter().map(|&j| Array1::zeros(j)).collect();
        let visible_biases = layer_dims[..hidden_layers_sizes.len()]
            .iter()
            .map(|&k| Array1::zeros(k))
            .collect();

        let n_top = layer_dims[layer_dims.len() - 1];
        Sda {
            n_outs,
            weights,
            biases,
            visible_biases,
            output_weights: Array2::zeros((n_top, n_outs)),
            output_bias: Array1::zeros(n_outs),
            rng,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.weights.len()
    }

    /// `x` pushed through the sigmoid layers below `layer`.
    fn propagate(&self, x: ArrayView2<Float>, layer: usize) -> Array2<Float> {
        let mut activation = x.to_owned();
        for (w, b) in self.weights.iter().zip(&self.biases).take(layer) {
            activation = sigmoid(activation.dot(w) + b);
        }
        activation
    }

    /// One denoising step on `layer`. The input is corrupted by zeroing each
    /// entry with probability `corruption`; the returned cost is the mean
    /// reconstruction cross-entropy before the update.
    pub fn pretrain(
        &mut self,
        layer: usize,
        input: ArrayView2<Float>,
        corruption: Float,
        learning_rate: Float,
    ) -> Float {
        let x = self.propagate(input, layer); // (m, k)
        let m = x.nrows() as Float;

        let keep = f64::from((1. - corruption).clamp(0., 1.));
        let rng = &mut self.rng;
        let tilde_x = x.mapv(|v| if rng.gen_bool(keep) { v } else { 0. });

        let w = &self.weights[layer];
        let y = sigmoid(tilde_x.dot(w) + &self.biases[layer]); // (m, j)
        let z = sigmoid(y.dot(&w.t()) + &self.visible_biases[layer]); // (m, k)
        let cost = cross_entropy(&x, &z) / m;

        let delta_z = (&z - &x) / m; // (m, k)
        let delta_y = delta_z.dot(w) * &sigmoid_prime(&y); // (m, j)
        let nabla_w = tilde_x.t().dot(&delta_y) + delta_z.t().dot(&y); // (k, j)
        let nabla_b = delta_y.sum_axis(Axis(0));
        let nabla_b_prime = delta_z.sum_axis(Axis(0));

        self.weights[layer].scaled_add(-learning_rate, &nabla_w);
        self.biases[layer].scaled_add(-learning_rate, &nabla_b);
        self.visible_biases[layer].scaled_add(-learning_rate, &nabla_b_prime);
        cost
    }

    /// Activations of every layer (input first) and the class probabilities.
    fn feedforward(&self, x: ArrayView2<Float>) -> (Vec<Array2<Float>>, Array2<Float>) {
        let mut activations = vec![x.to_owned()];
        for (w, b) in self.weights.iter().zip(&self.biases) {
            let z = activations[activations.len() - 1].dot(w) + b;
            activations.push(sigmoid(z));
        }
        let logits =
            activations[activations.len() - 1].dot(&self.output_weights) + &self.output_bias;
        (activations, softmax(logits))
    }

    fn class_indices(&self, y: ArrayView1<i32>) -> Result<Vec<usize>, TrainError> {
        y.iter()
            .map(|&label| {
                usize::try_from(label)
                    .ok()
                    .filter(|&class| class < self.n_outs)
                    .ok_or(TrainError::LabelOutOfRange {
                        label,
                        n_outs: self.n_outs,
                    })
            })
            .collect()
    }

    /// One supervised backpropagation step through the whole network; returns
    /// the mean negative log-likelihood before the update.
    pub fn finetune(
        &mut self,
        x: ArrayView2<Float>,
        y: ArrayView1<i32>,
        learning_rate: Float,
    ) -> Result<Float, TrainError> {
        let classes = self.class_indices(y)?;
        let (activations, probs) = self.feedforward(x);
        let cost = negative_log_likelihood(&probs, &classes);
        let m = classes.len() as Float;

        let mut delta = probs; // (m, n_outs)
        for (i, &class) in classes.iter().enumerate() {
            delta[[i, class]] -= 1.;
        }
        delta /= m;

        let hidden = &activations[activations.len() - 1];
        let nabla_output_w = hidden.t().dot(&delta);
        let nabla_output_b = delta.sum_axis(Axis(0));
        let mut delta = delta.dot(&self.output_weights.t()) * &sigmoid_prime(hidden); // (m, j)
        self.output_weights.scaled_add(-learning_rate, &nabla_output_w);
        self.output_bias.scaled_add(-learning_rate, &nabla_output_b);

        for layer in (0..self.n_layers()).rev() {
            let input = &activations[layer];
            let nabla_w = input.t().dot(&delta);
            let nabla_b = delta.sum_axis(Axis(0));
            if layer > 0 {
                delta = delta.dot(&self.weights[layer].t()) * &sigmoid_prime(input);
            }
            self.weights[layer].scaled_add(-learning_rate, &nabla_w);
            self.biases[layer].scaled_add(-learning_rate, &nabla_b);
        }
        Ok(cost)
    }

    /// Fraction of rows whose most probable class differs from the label.
    pub fn errors(&self, x: ArrayView2<Float>, y: ArrayView1<i32>) -> Result<Float, TrainError> {
        let classes = self.class_indices(y)?;
        let (_, probs) = self.feedforward(x);
        let wrong = probs
            .outer_iter()
            .zip(&classes)
            .filter(|(row, class)| argmax(row) != **class)
            .count();
        Ok(wrong as Float / classes.len() as Float)
    }
}

fn sigmoid(z: Array2<Float>) -> Array2<Float> {
    z.mapv_into(|v| 1. / (1. + (-v).exp()))
}

/// Derivative of the sigmoid expressed through its output.
fn sigmoid_prime(activation: &Array2<Float>) -> Array2<Float> {
    activation.mapv(|a| a * (1. - a))
}

fn softmax(mut logits: Array2<Float>) -> Array2<Float> {
    for mut row in logits.outer_iter_mut() {
        let max = row.fold(Float::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    logits
}

fn cross_entropy(x: &Array2<Float>, z: &Array2<Float>) -> Float {
    x.iter()
        .zip(z.iter())
        .map(|(&x, &z)| {
            let z = z.clamp(EPSILON, 1. - EPSILON);
            -(x * z.ln() + (1. - x) * (1. - z).ln())
        })
        .sum()
}

// MIN_POSITIVE keeps an underflowed probability finite without masking NaN
fn negative_log_likelihood(probs: &Array2<Float>, classes: &[usize]) -> Float {
    let total: Float = classes
        .iter()
        .enumerate()
        .map(|(i, &class)| (probs[[i, class]] + Float::MIN_POSITIVE).ln())
        .sum();
    -total / classes.len() as Float
}

fn argmax(row: &ArrayView1<Float>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, Float::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value {
                (i, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

/// Binds a model to the dataset so each step is addressed by minibatch index
/// alone. Pretraining and fine-tuning read the training split; validation
/// and test steps return the misclassification rate of their split.
pub struct SdaSteps<'a> {
    sda: &'a mut Sda,
    data: &'a MnistData,
    batch_size: usize,
    finetune_lr: Float,
}

impl<'a> SdaSteps<'a> {
    pub fn new(
        sda: &'a mut Sda,
        data: &'a MnistData,
        batch_size: usize,
        finetune_lr: Float,
    ) -> Self {
        SdaSteps {
            sda,
            data,
            batch_size,
            finetune_lr,
        }
    }
}

fn minibatch(
    split: &Split,
    index: usize,
    batch_size: usize,
) -> Result<(ArrayView2<'_, Float>, ArrayView1<'_, i32>), TrainError> {
    split.minibatch(index, batch_size).ok_or(TrainError::NoSuchBatch {
        index,
        n_batches: split.n_batches(batch_size),
    })
}

fn checked(cost: Float, phase: &'static str, index: usize) -> Result<f64, TrainError> {
    let cost = f64::from(cost);
    if cost.is_finite() {
        Ok(cost)
    } else {
        Err(TrainError::Diverged { phase, index, cost })
    }
}

impl PretrainStep for SdaSteps<'_> {
    fn n_layers(&self) -> usize {
        self.sda.n_layers()
    }

    fn pretrain_step(
        &mut self,
        layer: usize,
        index: usize,
        corruption: f64,
        lr: f64,
    ) -> Result<f64, TrainError> {
        let n_layers = self.sda.n_layers();
        if layer >= n_layers {
            return Err(TrainError::NoSuchLayer { layer, n_layers });
        }
        let (x, _) = minibatch(&self.data.train, index, self.batch_size)?;
        let cost = self.sda.pretrain(layer, x, corruption as Float, lr as Float);
        checked(cost, "pre-training", index)
    }
}

impl TrainStep for SdaSteps<'_> {
    fn train_step(&mut self, index: usize) -> Result<f64, TrainError> {
        let (x, y) = minibatch(&self.data.train, index, self.batch_size)?;
        let cost = self.sda.finetune(x, y, self.finetune_lr)?;
        checked(cost, "fine-tuning", index)
    }
}

impl ValidateStep for SdaSteps<'_> {
    fn validate_step(&self, index: usize) -> Result<f64, TrainError> {
        let (x, y) = minibatch(&self.data.valid, index, self.batch_size)?;
        checked(self.sda.errors(x, y)?, "validation", index)
    }
}

impl TestStep for SdaSteps<'_> {
    fn test_step(&self, index: usize) -> Result<f64, TrainError> {
        let (x, y) = minibatch(&self.data.test, index, self.batch_size)?;
        checked(self.sda.errors(x, y)?, "test", index)
    }
}
