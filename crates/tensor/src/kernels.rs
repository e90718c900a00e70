//! Pool-aware element-wise and row-oriented kernels shared by the [`crate::Tensor`] operator
//! methods and the layer forward/backward formulas.

use fabric_pool::{parallel_for, WorkerPool};

use crate::{Tensor, TensorError};

/// `1 / (1 + exp(-a))`, computed so as not to overflow for large negative `a`.
pub fn logistic(a: f32) -> f32 {
    if a >= 0.0 {
        1.0 / (1.0 + (-a).exp())
    } else {
        let e = a.exp();
        e / (1.0 + e)
    }
}

struct SendPtr(*mut f32);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// `dst[i] = f(src[i])` for `i` in `[0, n)`. `dst` and `src` may be the same tensor.
pub fn unary_map(dst: &mut Tensor, src: &Tensor, n: usize, pool: Option<&WorkerPool>, f: impl Fn(f32) -> f32 + Sync) {
    let src_ptr = SendPtr(src.as_slice().as_ptr() as *mut f32);
    let dst_ptr = SendPtr(dst.as_mut_slice().as_mut_ptr());
    let body = move |lo: i64, hi: i64| {
        let (src_ptr, dst_ptr) = (&src_ptr, &dst_ptr);
        for i in (lo as usize)..(hi as usize) {
            // SAFETY: disjoint ranges per task; dst/src aliasing is read-before-write per index.
            unsafe {
                let v = *src_ptr.0.add(i);
                *dst_ptr.0.add(i) = f(v);
            }
        }
    };
    parallel_for(pool, 0, n as i64, body, None, 8192);
}

/// `dst[i] = f(a[i], b[i])` for `i` in `[0, n)`.
pub fn binary_map(
    dst: &mut Tensor,
    a: &Tensor,
    b: &Tensor,
    n: usize,
    pool: Option<&WorkerPool>,
    f: impl Fn(f32, f32) -> f32 + Sync,
) {
    let a_ptr = SendPtr(a.as_slice().as_ptr() as *mut f32);
    let b_ptr = SendPtr(b.as_slice().as_ptr() as *mut f32);
    let dst_ptr = SendPtr(dst.as_mut_slice().as_mut_ptr());
    let body = move |lo: i64, hi: i64| {
        let (a_ptr, b_ptr, dst_ptr) = (&a_ptr, &b_ptr, &dst_ptr);
        for i in (lo as usize)..(hi as usize) {
            unsafe {
                let av = *a_ptr.0.add(i);
                let bv = *b_ptr.0.add(i);
                *dst_ptr.0.add(i) = f(av, bv);
            }
        }
    };
    parallel_for(pool, 0, n as i64, body, None, 8192);
}

/// `y[i, j] += b[j]` for a rank-2 `y` and rank-1 `b`, parallel over rows of `y`.
pub fn add_bias_broadcast(y: &mut Tensor, bias: &Tensor, pool: Option<&WorkerPool>) -> Result<(), TensorError> {
    if y.rank() != 2 || bias.rank() != 1 || y.shape()[1] != bias.shape()[0] {
        return Err(TensorError::ShapeMismatch);
    }
    let (rows, cols) = (y.shape()[0], y.shape()[1]);
    let bias_ptr = SendPtr(bias.as_slice().as_ptr() as *mut f32);
    let y_ptr = SendPtr(y.as_mut_slice().as_mut_ptr());
    let body = move |lo: i64, hi: i64| {
        let (bias_ptr, y_ptr) = (&bias_ptr, &y_ptr);
        for i in (lo as usize)..(hi as usize) {
            for j in 0..cols {
                unsafe {
                    let b = *bias_ptr.0.add(j);
                    let cell = y_ptr.0.add(i * cols + j);
                    *cell += b;
                }
            }
        }
    };
    parallel_for(pool, 0, rows as i64, body, None, 8192);
    Ok(())
}

/// `out[j] = sum_i x[i, j]`, accumulating onto whatever `out` already holds.
///
/// Parallelized by giving every task its own length-`cols` accumulator over a disjoint row
/// partition, then summing the per-task accumulators serially.
pub fn reduce_sum_rows(x: &Tensor, out: &mut Tensor, pool: Option<&WorkerPool>) -> Result<(), TensorError> {
    if x.rank() != 2 || out.rank() != 1 || x.shape()[1] != out.shape()[0] {
        return Err(TensorError::ShapeMismatch);
    }
    let (rows, cols) = (x.shape()[0], x.shape()[1]);
    let tasks = match pool {
        Some(p) => p.size() * 4,
        None => 1,
    };
    let tasks = tasks.clamp(1, rows.max(1));

    let x_data = x.as_slice();
    let partials = std::sync::Mutex::new(vec![vec![0f32; cols]; tasks]);
    let compute = |slot: usize| {
        let lo = (rows * slot) / tasks;
        let hi = (rows * (slot + 1)) / tasks;
        let mut acc = vec![0f32; cols];
        for i in lo..hi {
            for j in 0..cols {
                acc[j] += x_data[i * cols + j];
            }
        }
        partials.lock().unwrap()[slot] = acc;
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

    let merged = partials.into_inner().unwrap();
    let out_slice = out.as_mut_slice();
    for acc in merged {
        for (o, a) in out_slice.iter_mut().zip(acc.iter()) {
            *o += a;
        }
    }
    Ok(())
}
