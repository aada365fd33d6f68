//! A limited-memory BFGS optimizer without line search.
//!
//! Every call of [`Lbfgs::step`] runs up to `max_iter` quasi-Newton iterations with a fixed step
//! size. The curvature history and the last search direction persist across calls, so repeated
//! calls continue a single optimization.

use std::collections::VecDeque;

use ndarray::Array1;

use crate::settings::ReconstructionSettings;

/// The smallest curvature `y·s` of a pair kept in the history.
const MIN_CURVATURE: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
/// Parameters of the optimizer.
pub struct LbfgsParams {
    pub learning_rate: f32,
    pub max_iter: usize,
    pub max_eval: usize,
    pub history_size: usize,
    pub tolerance_grad: f32,
    pub tolerance_change: f32,
}

impl From<&ReconstructionSettings> for LbfgsParams {
    fn from(settings: &ReconstructionSettings) -> Self {
        Self {
            learning_rate: settings.learning_rate,
            max_iter: settings.max_iter,
            max_eval: settings.max_iter * 5 / 4,
            history_size: settings.history_size,
            tolerance_grad: settings.tolerance_grad,
            tolerance_change: settings.tolerance_change,
        }
    }
}

#[derive(Debug, Clone)]
/// The optimizer state of one free variable.
pub struct Lbfgs {
    params: LbfgsParams,
    direction: Option<Array1<f32>>,
    step_size: f32,
    old_dirs: VecDeque<Array1<f32>>,
    old_steps: VecDeque<Array1<f32>>,
    rho: VecDeque<f32>,
    h_diag: f32,
    prev_grad: Option<Array1<f32>>,
    prev_loss: f32,
    n_iter: usize,
    func_evals: usize,
}

impl Lbfgs {
    pub fn new(params: LbfgsParams) -> Self {
        Self {
            params,
            direction: None,
            step_size: params.learning_rate,
            old_dirs: VecDeque::with_capacity(params.history_size),
            old_steps: VecDeque::with_capacity(params.history_size),
            rho: VecDeque::with_capacity(params.history_size),
            h_diag: 1.,
            prev_grad: None,
            prev_loss: 0.,
            n_iter: 0,
            func_evals: 0,
        }
    }

    /// Gets the total number of objective evaluations.
    pub fn func_evals(&self) -> usize {
        self.func_evals
    }

    /// Runs one optimizer step on `x`.
    ///
    /// `objective` computes the loss at a point and its gradient. Returns the loss at the point
    /// the step started from.
    pub fn step<F>(&mut self, x: &mut Array1<f32>, mut objective: F) -> f32
    where
        F: FnMut(&Array1<f32>) -> (f32, Array1<f32>),
    {
        let LbfgsParams {
            learning_rate,
            max_iter,
            max_eval,
            history_size,
            tolerance_grad,
            tolerance_change,
        } = self.params;

        let (orig_loss, mut grad) = objective(x);
        let mut loss = orig_loss;
        let mut current_evals = 1;
        self.func_evals += 1;

        if max_abs(&grad) <= tolerance_grad {
            return orig_loss;
        }

        let mut n_iter = 0;
        while n_iter < max_iter {
            n_iter += 1;
            self.n_iter += 1;

            let direction = match (self.n_iter, &self.direction, &self.prev_grad) {
                (1, _, _) | (_, None, _) | (_, _, None) => {
                    self.old_dirs.clear();
                    self.old_steps.clear();
                    self.rho.clear();
                    self.h_diag = 1.;
                    -&grad
                }
                (_, Some(direction), Some(prev_grad)) => {
                    let y = &grad - prev_grad;
                    let s = direction * self.step_size;
                    let ys = y.dot(&s);
                    if ys > MIN_CURVATURE {
                        if self.old_dirs.len() == history_size {
                            self.old_dirs.pop_front();
                            self.old_steps.pop_front();
                            self.rho.pop_front();
                        }
                        self.h_diag = ys / y.dot(&y);
                        self.old_dirs.push_back(y);
                        self.old_steps.push_back(s);
                        self.rho.push_back(1. / ys);
                    }
                    self.two_loop(&grad)
                }
            };

            self.prev_grad = Some(grad.clone());
            self.prev_loss = loss;

            self.step_size = if self.n_iter == 1 {
                (1. / l1_norm(&grad)).min(1.) * learning_rate
            } else {
                learning_rate
            };

            let gtd = grad.dot(&direction);
            if gtd > -tolerance_change {
                self.direction = Some(direction);
                break;
            }

            x.scaled_add(self.step_size, &direction);
            let mut evals = 0;
            if n_iter != max_iter {
                let (next_loss, next_grad) = objective(x);
                loss = next_loss;
                grad = next_grad;
                evals = 1;
            }
            current_evals += evals;
            self.func_evals += evals;

            let step_change = max_abs(&direction) * self.step_size;
            self.direction = Some(direction);

            if n_iter == max_iter
                || current_evals >= max_eval
                || max_abs(&grad) <= tolerance_grad
                || step_change <= tolerance_change
                || (loss - self.prev_loss).abs() < tolerance_change
            {
                break;
            }
        }

        orig_loss
    }

    /// Applies the inverse Hessian approximation to the negative gradient.
    fn two_loop(&self, grad: &Array1<f32>) -> Array1<f32> {
        let count = self.old_dirs.len();
        let mut alpha = vec![0.; count];
        let mut q = -grad;
        for i in (0..count).rev() {
            alpha[i] = self.old_steps[i].dot(&q) * self.rho[i];
            q.scaled_add(-alpha[i], &self.old_dirs[i]);
        }
        let mut r = q * self.h_diag;
        for i in 0..count {
            let beta = self.old_dirs[i].dot(&r) * self.rho[i];
            r.scaled_add(alpha[i] - beta, &self.old_steps[i]);
        }
        r
    }
}

fn max_abs(values: &Array1<f32>) -> f32 {
    values.fold(0., |max, v| max.max(v.abs()))
}

fn l1_norm(values: &Array1<f32>) -> f32 {
    values.fold(0., |sum, v| sum + v.abs())
}
