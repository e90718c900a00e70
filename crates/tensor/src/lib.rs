//! Rank-N strided float32 tensor with value semantics and the pool-aware kernels built on it.

mod kernels;

use fabric_pool::WorkerPool;

pub use kernels::{add_bias_broadcast, binary_map, logistic, reduce_sum_rows, unary_map};

pub const MAX_RANK: usize = 8;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("invalid rank {0}: must be within 1..={MAX_RANK}")]
    InvalidRank(usize),
    #[error("invalid shape: dimension {index} has size {size}, must be >= 1")]
    InvalidDimension { index: usize, size: usize },
    #[error("coordinate out of range")]
    CoordinateOutOfRange,
    #[error("dimension mismatch")]
    DimensionMismatch,
    #[error("shape mismatch")]
    ShapeMismatch,
    #[error("dot product not implemented for these dimensions")]
    UnsupportedDotRank,
}

/// An owned, exclusively-held buffer of `product(shape)` elements with row-major strides.
///
/// Cloning a `Tensor` duplicates its storage; there is no aliasing between distinct `Tensor`
/// values. A tensor's storage is released when the tensor is dropped, same as any other owned
/// Rust value — no manual lifetime bookkeeping is needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    data: Vec<f32>,
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn validate_shape(shape: &[usize]) -> Result<(), TensorError> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(TensorError::InvalidRank(shape.len()));
    }
    for (index, &size) in shape.iter().enumerate() {
        if size == 0 {
            return Err(TensorError::InvalidDimension { index, size });
        }
    }
    Ok(())
}

impl Tensor {
    /// A zero-initialized tensor of the given shape.
    pub fn new(shape: &[usize]) -> Result<Self, TensorError> {
        validate_shape(shape)?;
        let len = shape.iter().product();
        Ok(Self {
            strides: row_major_strides(shape),
            shape: shape.to_vec(),
            data: vec![0.0; len],
        })
    }

    /// A tensor built from an explicit, row-major flattened buffer.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
        validate_shape(shape)?;
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::ShapeMismatch);
        }
        Ok(Self {
            strides: row_major_strides(shape),
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn index_of(&self, coord: &[usize]) -> Result<usize, TensorError> {
        if coord.len() != self.shape.len() {
            return Err(TensorError::CoordinateOutOfRange);
        }
        let mut idx = 0usize;
        for (i, &c) in coord.iter().enumerate() {
            if c >= self.shape[i] {
                return Err(TensorError::CoordinateOutOfRange);
            }
            idx += c * self.strides[i];
        }
        Ok(idx)
    }

    pub fn get(&self, coord: &[usize]) -> Result<f32, TensorError> {
        self.index_of(coord).map(|i| self.data[i])
    }

    pub fn set(&mut self, coord: &[usize], value: f32) -> Result<(), TensorError> {
        let i = self.index_of(coord)?;
        self.data[i] = value;
        Ok(())
    }

    fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch);
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Tensor {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            data,
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_map(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_map(other, |a, b| a * b)
    }

    pub fn scale(&self, c: f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            data: self.data.iter().map(|&a| a * c).collect(),
        }
    }

    /// Rank-2 transpose: allocates a new `[shape[1], shape[0]]` tensor and copies element by
    /// element, honoring both tensors' own strides rather than assuming contiguity.
    pub fn transpose(&self) -> Result<Tensor, TensorError> {
        if self.rank() != 2 {
            return Err(TensorError::DimensionMismatch);
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut out = Tensor::new(&[cols, rows])?;
        for i in 0..rows {
            for j in 0..cols {
                let value = self.data[i * self.strides[0] + j * self.strides[1]];
                out.data[j * out.strides[0] + i * out.strides[1]] = value;
            }
        }
        Ok(out)
    }

    /// Matrix/vector dot product. Dispatches on rank; see module docs for the supported forms.
    pub fn dot(&self, other: &Tensor, pool: Option<&WorkerPool>) -> Result<Tensor, TensorError> {
        match (self.rank(), other.rank()) {
            (1, 1) => self.dot_vec(other, pool),
            (2, 2) => self.dot_mat(other, pool),
            _ => Err(TensorError::UnsupportedDotRank),
        }
    }

    fn dot_vec(&self, other: &Tensor, pool: Option<&WorkerPool>) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::DimensionMismatch);
        }
        let n = self.length() as i64;
        let tasks = match pool {
            Some(p) => p.size() * 4,
            None => 1,
        };

        let a = &self.data;
        let b = &other.data;
        let partials = std::sync::Mutex::new(vec![0f32; tasks]);
        let compute = |slot: usize| {
            let lo = (n * slot as i64) / tasks as i64;
            let hi = (n * (slot as i64 + 1)) / tasks as i64;
            let mut sum = 0f32;
            for i in lo..hi {
                sum += a[i as usize] * b[i as usize];
            }
            partials.lock().unwrap()[slot] = sum;
        };

        match pool {
            Some(p) => p.scope(|scope| {
                for slot in 0..tasks {
                    let compute = &compute;
                    scope.spawn(move || compute(slot));
                }
            }),
            None => compute(0),
        };

        let total: f32 = partials.into_inner().unwrap().iter().sum();
        Tensor::from_vec(&[1], vec![total])
    }

    fn dot_mat(&self, other: &Tensor, pool: Option<&WorkerPool>) -> Result<Tensor, TensorError> {
        if self.shape[1] != other.shape[0] {
            return Err(TensorError::DimensionMismatch);
        }
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let mut result = Tensor::new(&[m, n])?;

        let a_strides = self.strides.clone();
        let b_strides = other.strides.clone();
        let a = &self.data;
        let b = &other.data;
        let out_ptr = SendPtr(result.data.as_mut_ptr());

        let compute_rows = move |lo: i64, hi: i64| {
            let out_ptr = &out_ptr;
            for i in (lo as usize)..(hi as usize) {
                for j in 0..n {
                    let mut acc = 0f32;
                    for kk in 0..k {
                        acc += a[i * a_strides[0] + kk * a_strides[1]]
                            * b[kk * b_strides[0] + j * b_strides[1]];
                    }
                    // SAFETY: each row `i` is assigned to exactly one task by `parallel_for`,
                    // so writes through `out_ptr` across tasks never touch the same element.
                    unsafe {
                        *out_ptr.0.add(i * n + j) = acc;
                    }
                }
            }
        };

        fabric_pool::parallel_for(pool, 0, m as i64, compute_rows, None, 8192);
        Ok(result)
    }
}

struct SendPtr(*mut f32);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn length_matches_shape_product() {
        let t = Tensor::new(&[2, 3, 4]).unwrap();
        assert_eq!(t.length(), 24);
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..4 {
                    assert!(t.index_of(&[i, j, k]).unwrap() < t.length());
                }
            }
        }
    }

    #[test]
    fn out_of_range_coordinate_is_rejected() {
        let t = Tensor::new(&[2, 2]).unwrap();
        assert_eq!(t.get(&[2, 0]), Err(TensorError::CoordinateOutOfRange));
        assert_eq!(t.get(&[0, 0, 0]), Err(TensorError::CoordinateOutOfRange));
    }

    #[test]
    fn arithmetic_identities_hold() {
        let a = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(&[2, 2], vec![5.0, 6.0, 7.0, 8.0]).unwrap();

        let recovered = a.add(&b).unwrap().sub(&b).unwrap();
        for (x, y) in recovered.as_slice().iter().zip(a.as_slice()) {
            assert!((x - y).abs() < 1e-6);
        }

        assert_eq!(a.add(&b).unwrap(), b.add(&a).unwrap());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let a = Tensor::new(&[2, 2]).unwrap();
        let b = Tensor::new(&[3, 3]).unwrap();
        assert_eq!(a.add(&b), Err(TensorError::ShapeMismatch));
    }

    #[test]
    fn matmul_shape_and_identity() {
        let pool = WorkerPool::new(3);
        let a = Tensor::from_vec(&[2, 3], (1..=6).map(|x| x as f32).collect()).unwrap();
        let b = Tensor::from_vec(&[3, 2], (1..=6).map(|x| x as f32).collect()).unwrap();
        let result = a.dot(&b, Some(&pool)).unwrap();
        assert_eq!(result.shape(), &[2, 2]);

        let identity = Tensor::from_vec(&[3, 3], {
            let mut v = vec![0.0; 9];
            for i in 0..3 {
                v[i * 3 + i] = 1.0;
            }
            v
        })
        .unwrap();
        let x = Tensor::from_vec(&[3, 2], (1..=6).map(|x| x as f32).collect()).unwrap();
        let identity_product = identity.dot(&x, Some(&pool)).unwrap();
        assert_eq!(identity_product, x);
    }

    #[test]
    fn dot_rejects_unsupported_ranks() {
        let a = Tensor::new(&[2, 2, 2]).unwrap();
        let b = Tensor::new(&[2, 2, 2]).unwrap();
        assert_eq!(a.dot(&b, None), Err(TensorError::UnsupportedDotRank));
    }

    #[test]
    fn parallel_dot_matches_serial_within_tolerance() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let n = 1_000_003;
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let a = Tensor::from_vec(&[n], data.clone()).unwrap();
        let b = Tensor::from_vec(&[n], data).unwrap();

        let serial = a.dot(&b, None).unwrap();
        let pool = WorkerPool::new(4);
        let parallel = a.dot(&b, Some(&pool)).unwrap();

        let expected = serial.get(&[0]).unwrap();
        let actual = parallel.get(&[0]).unwrap();
        let relative = ((expected - actual) / expected.max(1.0)).abs();
        assert!(relative < 1e-3, "expected {expected}, got {actual}");
    }

    #[test]
    fn transpose_swaps_shape_and_values() {
        let t = Tensor::from_vec(&[2, 3], (1..=6).map(|x| x as f32).collect()).unwrap();
        let tt = t.transpose().unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(t.get(&[i, j]).unwrap(), tt.get(&[j, i]).unwrap());
            }
        }
    }
}
