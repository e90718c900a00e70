//! The closed layer family (affine, rectified linear, leaky rectified linear, logistic) and
//! their ordered composition into a [`Sequential`] model.

use std::sync::Arc;

use fabric_pool::WorkerPool;
use fabric_tensor::{add_bias_broadcast, binary_map, logistic, reduce_sum_rows, unary_map, Tensor, TensorError};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("backward called before a matching forward")]
    NoCache,
    #[error("affine layer requires a rank-2 input")]
    RankMismatch,
}

/// Shared capability set every member of the closed layer family implements.
///
/// Modeled as a trait over a closed enum rather than open inheritance: the set of concrete
/// layers is fixed by this specification (affine, relu, leaky relu, logistic), so there is no
/// need for dynamic dispatch beyond picking among four known shapes.
pub trait LayerOps {
    /// Sets (or clears) the non-owning pool handle this layer dispatches kernels on. The pool
    /// is borrowed, never owned: callers must keep it alive for as long as the layer is used.
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>);
    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError>;
    fn backward(&mut self, grad: &Tensor, lr: f32) -> Result<Tensor, LayerError>;
}

/// A fully-connected layer: `Y = X . W + b`.
#[derive(Debug, Clone)]
pub struct Affine {
    w: Tensor,
    b: Tensor,
    cache_x: Option<Tensor>,
    pool: Option<Arc<WorkerPool>>,
}

impl Affine {
    /// `input -> output` weights drawn uniformly from `[-0.05, 0.05]` using `seed`; biases
    /// start at zero.
    pub fn new(input: usize, output: usize, seed: u64) -> Result<Self, TensorError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..input * output)
            .map(|_| rng.gen_range(-0.05..0.05))
            .collect();
        Ok(Self {
            w: Tensor::from_vec(&[input, output], weights)?,
            b: Tensor::new(&[output])?,
            cache_x: None,
            pool: None,
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.w
    }

    pub fn bias(&self) -> &Tensor {
        &self.b
    }
}

impl LayerOps for Affine {
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        self.pool = pool;
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        if x.rank() != 2 {
            return Err(LayerError::RankMismatch);
        }
        let pool = self.pool.as_deref();
        let mut y = x.dot(&self.w, pool)?;
        if y.rank() == 2 && self.b.rank() == 1 {
            add_bias_broadcast(&mut y, &self.b, pool)?;
        } else {
            y = y.add(&self.b)?;
        }
        self.cache_x = Some(x.clone());
        Ok(y)
    }

    fn backward(&mut self, grad: &Tensor, lr: f32) -> Result<Tensor, LayerError> {
        let x = self.cache_x.as_ref().ok_or(LayerError::NoCache)?;
        let pool = self.pool.as_deref();

        let w_t = self.w.transpose()?;
        let dx = grad.dot(&w_t, pool)?;

        let x_t = x.transpose()?;
        let dw = x_t.dot(grad, pool)?;

        let db = if grad.rank() == 2 {
            let mut acc = Tensor::new(&[grad.shape()[1]])?;
            reduce_sum_rows(grad, &mut acc, pool)?;
            acc
        } else {
            grad.clone()
        };

        self.w = self.w.sub(&dw.scale(lr))?;
        self.b = self.b.sub(&db.scale(lr))?;
        Ok(dx)
    }
}

/// `y = max(0, x)`.
#[derive(Debug, Clone, Default)]
pub struct Relu {
    cache_x: Option<Tensor>,
    pool: Option<Arc<WorkerPool>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LayerOps for Relu {
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        self.pool = pool;
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        let pool = self.pool.as_deref();
        let mut y = Tensor::new(x.shape())?;
        unary_map(&mut y, x, x.length(), pool, |v| v.max(0.0));
        self.cache_x = Some(x.clone());
        Ok(y)
    }

    fn backward(&mut self, grad: &Tensor, _lr: f32) -> Result<Tensor, LayerError> {
        let x = self.cache_x.as_ref().ok_or(LayerError::NoCache)?;
        if x.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch.into());
        }
        let pool = self.pool.as_deref();
        let mut dx = Tensor::new(grad.shape())?;
        binary_map(&mut dx, grad, x, grad.length(), pool, |dy, xv| if xv > 0.0 { dy } else { 0.0 });
        Ok(dx)
    }
}

/// `y = x > 0 ? x : alpha * x`.
#[derive(Debug, Clone)]
pub struct LeakyRelu {
    alpha: f32,
    cache_x: Option<Tensor>,
    pool: Option<Arc<WorkerPool>>,
}

impl LeakyRelu {
    pub const DEFAULT_ALPHA: f32 = 0.01;

    pub fn new(alpha: f32) -> Self {
        Self {
            alpha,
            cache_x: None,
            pool: None,
        }
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA)
    }
}

impl LayerOps for LeakyRelu {
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        self.pool = pool;
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        let pool = self.pool.as_deref();
        let alpha = self.alpha;
        let mut y = Tensor::new(x.shape())?;
        unary_map(&mut y, x, x.length(), pool, move |v| if v > 0.0 { v } else { alpha * v });
        self.cache_x = Some(x.clone());
        Ok(y)
    }

    fn backward(&mut self, grad: &Tensor, _lr: f32) -> Result<Tensor, LayerError> {
        let x = self.cache_x.as_ref().ok_or(LayerError::NoCache)?;
        if x.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch.into());
        }
        let pool = self.pool.as_deref();
        let alpha = self.alpha;
        let mut dx = Tensor::new(grad.shape())?;
        binary_map(&mut dx, grad, x, grad.length(), pool, move |dy, xv| {
            if xv > 0.0 {
                dy
            } else {
                alpha * dy
            }
        });
        Ok(dx)
    }
}

/// `y = 1 / (1 + exp(-x))`.
#[derive(Debug, Clone, Default)]
pub struct Logistic {
    cache_s: Option<Tensor>,
    pool: Option<Arc<WorkerPool>>,
}

impl Logistic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LayerOps for Logistic {
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        self.pool = pool;
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        let pool = self.pool.as_deref();
        let mut y = Tensor::new(x.shape())?;
        unary_map(&mut y, x, x.length(), pool, logistic);
        self.cache_s = Some(y.clone());
        Ok(y)
    }

    fn backward(&mut self, grad: &Tensor, _lr: f32) -> Result<Tensor, LayerError> {
        let s = self.cache_s.as_ref().ok_or(LayerError::NoCache)?;
        if s.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch.into());
        }
        let pool = self.pool.as_deref();
        let mut dx = Tensor::new(grad.shape())?;
        binary_map(&mut dx, grad, s, grad.length(), pool, |dy, sv| dy * sv * (1.0 - sv));
        Ok(dx)
    }
}

/// The closed set of layer kinds this system supports.
#[derive(Debug, Clone)]
pub enum Layer {
    Affine(Affine),
    Relu(Relu),
    LeakyRelu(LeakyRelu),
    Logistic(Logistic),
}

impl LayerOps for Layer {
    fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        match self {
            Layer::Affine(l) => l.set_pool(pool),
            Layer::Relu(l) => l.set_pool(pool),
            Layer::LeakyRelu(l) => l.set_pool(pool),
            Layer::Logistic(l) => l.set_pool(pool),
        }
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        match self {
            Layer::Affine(l) => l.forward(x),
            Layer::Relu(l) => l.forward(x),
            Layer::LeakyRelu(l) => l.forward(x),
            Layer::Logistic(l) => l.forward(x),
        }
    }

    fn backward(&mut self, grad: &Tensor, lr: f32) -> Result<Tensor, LayerError> {
        match self {
            Layer::Affine(l) => l.backward(grad, lr),
            Layer::Relu(l) => l.backward(grad, lr),
            Layer::LeakyRelu(l) => l.backward(grad, lr),
            Layer::Logistic(l) => l.backward(grad, lr),
        }
    }
}

/// An ordered, exclusively-owned stack of layers. Forward threads input through layers in
/// insertion order; backward walks the same layers in reverse.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
    pool: Option<Arc<WorkerPool>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pool shared by every layer already in, and subsequently added to, this
    /// sequence.
    pub fn set_pool(&mut self, pool: Option<Arc<WorkerPool>>) {
        self.pool = pool.clone();
        for layer in &mut self.layers {
            layer.set_pool(pool.clone());
        }
    }

    pub fn add(&mut self, mut layer: Layer) {
        layer.set_pool(self.pool.clone());
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor, LayerError> {
        let mut current = x.clone();
        for layer in &mut self.layers {
            current = layer.forward(&current)?;
        }
        Ok(current)
    }

    pub fn backward(&mut self, grad: &Tensor, lr: f32) -> Result<Tensor, LayerError> {
        let mut current = grad.clone();
        for layer in self.layers.iter_mut().rev() {
            current = layer.backward(&current, lr)?;
        }
        Ok(current)
    }
}
