use rand::Rng;
use rand_distr::{Distribution, Normal};

pub type Act = usize;

#[derive(Clone, Debug)]
pub struct Param {
    pub data: Vec<f64>,
    pub grad: Vec<f64>,
    pub rows: usize,
    pub cols: usize,
}

impl Param {
    pub fn normal<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize, std: f64) -> Self {
        let n = rows * cols;
        // A non-finite or negative std is a programming error, fall back to zeros.
        let data = match Normal::new(0.0, std) {
            Ok(dist) => (0..n).map(|_| dist.sample(rng)).collect(),
            Err(_) => vec![0.0; n],
        };
        Self {
            data,
            grad: vec![0.0; n],
            rows,
            cols,
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        let n = rows * cols;
        Self {
            data: vec![0.0; n],
            grad: vec![0.0; n],
            rows,
            cols,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

#[derive(Clone, Debug)]
enum Op {
    EmbeddingBag {
        param: usize,
        rows: Vec<usize>,
        out: Act,
    },
    MatVec {
        param: usize,
        x: Act,
        out: Act,
    },
    BiasAdd {
        param: usize,
        x: Act,
        out: Act,
    },
    Scale {
        x: Act,
        factor: f64,
        out: Act,
    },
    Relu {
        x: Act,
        out: Act,
    },
    LayerNorm {
        x: Act,
        out: Act,
        inv_std: f64,
    },
    CrossEntropy {
        logits: Act,
        out: Act,
        target: usize,
        probs: Vec<f64>,
    },
}

/// Reverse-mode tape over flat `f64` vectors.
///
/// Parameters live for the lifetime of the tape; activations and recorded ops
/// are dropped by [`Tape::clear`] after every sample. Parameter gradients
/// accumulate across samples until [`Tape::zero_grad`].
#[derive(Debug, Default)]
pub struct Tape {
    params: Vec<Param>,
    act_data: Vec<Vec<f64>>,
    act_grad: Vec<Vec<f64>>,
    ops: Vec<Op>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(&mut self, p: Param) -> usize {
        let idx = self.params.len();
        self.params.push(p);
        idx
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    pub fn clear(&mut self) {
        self.act_data.clear();
        self.act_grad.clear();
        self.ops.clear();
    }

    pub fn zero_grad(&mut self) {
        for p in &mut self.params {
            p.zero_grad();
        }
    }

    fn alloc(&mut self, size: usize) -> Act {
        let idx = self.act_data.len();
        self.act_data.push(vec![0.0; size]);
        self.act_grad.push(vec![0.0; size]);
        idx
    }

    pub fn constant(&mut self, values: Vec<f64>) -> Act {
        let out = self.alloc(values.len());
        self.act_data[out] = values;
        out
    }

    pub fn value(&self, act: Act) -> &[f64] {
        &self.act_data[act]
    }

    pub fn scalar(&self, act: Act) -> f64 {
        self.act_data[act][0]
    }

    pub fn grad(&self, act: Act) -> &[f64] {
        &self.act_grad[act]
    }

    /// Mean of the selected rows of an embedding table. An empty row set
    /// yields the zero vector.
    pub fn embedding_bag(&mut self, param: usize, rows: &[usize]) -> Act {
        let cols = self.params[param].cols;
        let table_rows = self.params[param].rows;
        let out = self.alloc(cols);
        if !rows.is_empty() {
            let inv = 1.0 / rows.len() as f64;
            for &row in rows {
                assert!(
                    row < table_rows,
                    "row {row} out of bounds for embedding rows {table_rows}"
                );
                let start = row * cols;
                for c in 0..cols {
                    self.act_data[out][c] += self.params[param].data[start + c] * inv;
                }
            }
        }
        self.ops.push(Op::EmbeddingBag {
            param,
            rows: rows.to_vec(),
            out,
        });
        out
    }

    pub fn matvec(&mut self, param: usize, x: Act) -> Act {
        let rows = self.params[param].rows;
        let cols = self.params[param].cols;
        assert_eq!(
            self.act_data[x].len(),
            cols,
            "matvec input width mismatch: {} != {}",
            self.act_data[x].len(),
            cols
        );
        let out = self.alloc(rows);
        for r in 0..rows {
            let row_start = r * cols;
            let mut sum = 0.0;
            for c in 0..cols {
                sum += self.params[param].data[row_start + c] * self.act_data[x][c];
            }
            self.act_data[out][r] = sum;
        }
        self.ops.push(Op::MatVec { param, x, out });
        out
    }

    pub fn bias_add(&mut self, param: usize, x: Act) -> Act {
        let n = self.act_data[x].len();
        assert_eq!(self.params[param].len(), n, "bias width mismatch");
        let out = self.alloc(n);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i] + self.params[param].data[i];
        }
        self.ops.push(Op::BiasAdd { param, x, out });
        out
    }

    pub fn scale(&mut self, x: Act, factor: f64) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i] * factor;
        }
        self.ops.push(Op::Scale { x, factor, out });
        out
    }

    pub fn relu(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i].max(0.0);
        }
        self.ops.push(Op::Relu { x, out });
        out
    }

    pub fn layer_norm(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        assert!(n > 0, "layer_norm requires non-empty input");
        let out = self.alloc(n);
        let (normed, inv_std) = layer_norm(&self.act_data[x]);
        self.act_data[out] = normed;
        self.ops.push(Op::LayerNorm { x, out, inv_std });
        out
    }

    /// Negative log-likelihood of `target` under `softmax(logits)`.
    pub fn cross_entropy(&mut self, logits: Act, target: usize) -> Act {
        let n = self.act_data[logits].len();
        assert!(target < n, "target {target} out of range for {n} logits");
        let probs = softmax(&self.act_data[logits]);
        let out = self.alloc(1);
        self.act_data[out][0] = -(probs[target].max(1e-12)).ln();
        self.ops.push(Op::CrossEntropy {
            logits,
            out,
            target,
            probs,
        });
        out
    }

    pub fn backward(&mut self, loss: Act) {
        assert_eq!(self.act_data[loss].len(), 1, "loss must be scalar");
        self.act_grad[loss][0] = 1.0;

        let ops = std::mem::take(&mut self.ops);
        for op in ops.into_iter().rev() {
            match op {
                Op::EmbeddingBag { param, rows, out } => {
                    if rows.is_empty() {
                        continue;
                    }
                    let cols = self.params[param].cols;
                    let inv = 1.0 / rows.len() as f64;
                    for row in rows {
                        let start = row * cols;
                        for c in 0..cols {
                            self.params[param].grad[start + c] += self.act_grad[out][c] * inv;
                        }
                    }
                }
                Op::MatVec { param, x, out } => {
                    let rows = self.params[param].rows;
                    let cols = self.params[param].cols;
                    for r in 0..rows {
                        let go = self.act_grad[out][r];
                        let row_start = r * cols;
                        for c in 0..cols {
                            self.params[param].grad[row_start + c] += go * self.act_data[x][c];
                            self.act_grad[x][c] += go * self.params[param].data[row_start + c];
                        }
                    }
                }
                Op::BiasAdd { param, x, out } => {
                    for i in 0..self.act_data[out].len() {
                        let g = self.act_grad[out][i];
                        self.params[param].grad[i] += g;
                        self.act_grad[x][i] += g;
                    }
                }
                Op::Scale { x, factor, out } => {
                    for i in 0..self.act_data[out].len() {
                        self.act_grad[x][i] += self.act_grad[out][i] * factor;
                    }
                }
                Op::Relu { x, out } => {
                    for i in 0..self.act_data[out].len() {
                        if self.act_data[x][i] > 0.0 {
                            self.act_grad[x][i] += self.act_grad[out][i];
                        }
                    }
                }
                Op::LayerNorm { x, out, inv_std } => {
                    let n = self.act_data[out].len() as f64;
                    let y = self.act_data[out].clone();
                    let gy = self.act_grad[out].clone();
                    let sum_gy: f64 = gy.iter().sum();
                    let sum_gy_y: f64 = gy.iter().zip(&y).map(|(g, yi)| g * yi).sum();
                    for j in 0..y.len() {
                        let centered = gy[j] - (sum_gy / n) - y[j] * (sum_gy_y / n);
                        self.act_grad[x][j] += inv_std * centered;
                    }
                }
                Op::CrossEntropy {
                    logits,
                    out,
                    target,
                    probs,
                } => {
                    let upstream = self.act_grad[out][0];
                    for (i, p) in probs.iter().enumerate() {
                        let indicator = if i == target { 1.0 } else { 0.0 };
                        self.act_grad[logits][i] += upstream * (p - indicator);
                    }
                }
            }
        }
    }
}

/// Normalises to zero mean and unit variance, returning the inverse std used.
pub fn layer_norm(values: &[f64]) -> (Vec<f64>, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let inv_std = 1.0 / (variance + 1e-5).sqrt();
    let normed = values.iter().map(|v| (*v - mean) * inv_std).collect();
    (normed, inv_std)
}

pub fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut exps = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for value in values {
        let e = (*value - max).exp();
        exps.push(e);
        sum += e;
    }
    for value in &mut exps {
        *value /= sum;
    }
    exps
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn approx_eq(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{} != {} (tol {})", a, b, tol);
    }

    #[test]
    fn embedding_bag_averages_rows() {
        let mut tape = Tape::new();
        let mut table = Param::zeros(3, 2);
        table.data = vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let p = tape.add_param(table);
        let pooled = tape.embedding_bag(p, &[0, 1]);
        assert_eq!(tape.value(pooled), &[4.0, 6.0]);

        let logits = tape.scale(pooled, 0.0);
        let loss = tape.cross_entropy(logits, 0);
        tape.backward(loss);

        // Scale by zero blocks everything upstream.
        assert!(tape.params()[p].grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn embedding_bag_routes_gradient_to_selected_rows_only() {
        let mut tape = Tape::new();
        let p = tape.add_param(Param::zeros(3, 2));
        let pooled = tape.embedding_bag(p, &[0, 2]);
        let loss = tape.cross_entropy(pooled, 0);
        tape.backward(loss);

        // d loss / d logits = softmax([0, 0]) - onehot(0) = [-0.5, 0.5]
        let grad = &tape.params()[p].grad;
        approx_eq(grad[0], -0.25, 1e-9);
        approx_eq(grad[1], 0.25, 1e-9);
        approx_eq(grad[2], 0.0, 1e-12);
        approx_eq(grad[3], 0.0, 1e-12);
        approx_eq(grad[4], -0.25, 1e-9);
        approx_eq(grad[5], 0.25, 1e-9);
    }

    #[test]
    fn empty_embedding_bag_is_zero() {
        let mut tape = Tape::new();
        let mut rng = StdRng::seed_from_u64(1);
        let p = tape.add_param(Param::normal(&mut rng, 4, 3, 1.0));
        let pooled = tape.embedding_bag(p, &[]);
        assert_eq!(tape.value(pooled), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn matvec_backprop_updates_weight_grads() {
        let mut tape = Tape::new();
        let mut rng = StdRng::seed_from_u64(7);
        let p = tape.add_param(Param::normal(&mut rng, 1, 2, 0.1));
        let x = tape.constant(vec![1.0, 3.0]);
        let y = tape.matvec(p, x);
        tape.backward(y);

        let grad = tape.params()[p].grad.clone();
        approx_eq(grad[0], 1.0, 1e-8);
        approx_eq(grad[1], 3.0, 1e-8);
    }

    #[test]
    fn bias_add_passes_gradient_through() {
        let mut tape = Tape::new();
        let b = tape.add_param(Param::zeros(1, 2));
        let x = tape.constant(vec![1.0, -1.0]);
        let y = tape.bias_add(b, x);
        let loss = tape.cross_entropy(y, 1);
        tape.backward(loss);

        let probs = softmax(&[1.0, -1.0]);
        approx_eq(tape.params()[b].grad[0], probs[0], 1e-9);
        approx_eq(tape.params()[b].grad[1], probs[1] - 1.0, 1e-9);
        approx_eq(tape.grad(x)[0], probs[0], 1e-9);
    }

    #[test]
    fn relu_blocks_negative_inputs() {
        let mut tape = Tape::new();
        let x = tape.constant(vec![-2.0, 3.0]);
        let y = tape.relu(x);
        assert_eq!(tape.value(y), &[0.0, 3.0]);
        let loss = tape.cross_entropy(y, 0);
        tape.backward(loss);
        assert_eq!(tape.grad(x)[0], 0.0);
        assert!(tape.grad(x)[1] > 0.0);
    }

    #[test]
    fn cross_entropy_matches_reference() {
        let mut tape = Tape::new();
        let logits = tape.constant(vec![2.0, 0.5]);
        let loss = tape.cross_entropy(logits, 1);
        let probs = softmax(&[2.0, 0.5]);
        approx_eq(tape.scalar(loss), -probs[1].ln(), 1e-12);

        tape.backward(loss);
        let grad = tape.grad(logits);
        assert!(grad[0] > 0.0);
        assert!(grad[1] < 0.0);
        approx_eq(grad[0] + grad[1], 0.0, 1e-12);
    }

    #[test]
    fn layer_norm_produces_zero_mean_unit_variance() {
        let mut tape = Tape::new();
        let x = tape.constant(vec![1.0, 3.0, 5.0, 7.0]);
        let y = tape.layer_norm(x);
        let values = tape.value(y);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / values.len() as f64;
        assert!(mean.abs() < 1e-8);
        assert!((variance - 1.0).abs() < 1e-3);
    }

    #[test]
    fn gradients_accumulate_until_zeroed() {
        let mut tape = Tape::new();
        let b = tape.add_param(Param::zeros(1, 2));
        for _ in 0..2 {
            tape.clear();
            let x = tape.constant(vec![0.0, 0.0]);
            let y = tape.bias_add(b, x);
            let loss = tape.cross_entropy(y, 0);
            tape.backward(loss);
        }
        approx_eq(tape.params()[b].grad[0], -1.0, 1e-9);

        tape.zero_grad();
        assert!(tape.params()[b].grad.iter().all(|g| *g == 0.0));
    }
}
