//! Batched forward and backward passes for the sequence model's layers.
//! Activations are `(batch, time, channels)`.

use ndarray::{s, Array, Array1, Array2, Array3, Axis, Dimension, Zip};
use rand::{rngs::StdRng, Rng};

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// Zero the gradient wherever the ReLU output was not positive.
pub(crate) fn relu_backward<D: Dimension>(grad: &mut Array<f64, D>, activated: &Array<f64, D>) {
    Zip::from(grad).and(activated).for_each(|g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

/// Glorot-uniform initialisation.
pub(crate) fn glorot(rows: usize, cols: usize, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array2<f64> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

/// `(batch * time, channels)` view of a 3-D activation, copied.
pub(crate) fn fold_time(a: &Array3<f64>) -> Array2<f64> {
    let (_, t, c) = a.dim();
    Array2::from_shape_fn((a.len() / c.max(1), c), |(r, ch)| a[[r / t, r % t, ch]])
}

pub(crate) fn unfold_time(a: &Array2<f64>, batch: usize) -> Array3<f64> {
    let t = a.nrows() / batch.max(1);
    Array3::from_shape_fn((batch, t, a.ncols()), |(b, ti, ch)| a[[b * t + ti, ch]])
}

/// Rows are output positions, columns are `kernel * in_channels` taps.
pub(crate) fn im2col(x: &Array3<f64>, kernel: usize) -> Array2<f64> {
    let (batch, t, c) = x.dim();
    let out_t = t + 1 - kernel;
    Array2::from_shape_fn((batch * out_t, kernel * c), |(r, col)| {
        x[[r / out_t, r % out_t + col / c, col % c]]
    })
}

pub(crate) fn col2im(dcols: &Array2<f64>, (batch, t, c): (usize, usize, usize), kernel: usize) -> Array3<f64> {
    let out_t = t + 1 - kernel;
    let mut dx = Array3::zeros((batch, t, c));
    for ((r, col), &v) in dcols.indexed_iter() {
        dx[[r / out_t, r % out_t + col / c, col % c]] += v;
    }
    dx
}

/// Valid (unpadded) 1-D convolution, stride 1. `w` is `(kernel * in, out)`.
/// Returns the im2col matrix for the backward pass and the pre-activation.
pub(crate) fn conv1d(x: &Array3<f64>, w: &Array2<f64>, b: &Array1<f64>, kernel: usize) -> (Array2<f64>, Array3<f64>) {
    let cols = im2col(x, kernel);
    let out = cols.dot(w) + b;
    let out = unfold_time(&out, x.dim().0);
    (cols, out)
}

/// Returns `(dw, db, dcols)`.
pub(crate) fn conv1d_backward(
    cols: &Array2<f64>,
    dout: &Array3<f64>,
    w: &Array2<f64>,
) -> (Array2<f64>, Array1<f64>, Array2<f64>) {
    let d = fold_time(dout);
    let dw = cols.t().dot(&d);
    let db = d.sum_axis(Axis(0));
    let dcols = d.dot(&w.t());
    (dw, db, dcols)
}

/// Non-overlapping max pool along time; trailing steps that do not fill a
/// window are dropped. Also returns the winning time index per output.
pub(crate) fn max_pool(x: &Array3<f64>, pool: usize) -> (Array3<f64>, Array3<usize>) {
    let (batch, t, c) = x.dim();
    let out_t = t / pool;
    let mut out = Array3::zeros((batch, out_t, c));
    let mut idx = Array3::zeros((batch, out_t, c));
    for b in 0..batch {
        for ti in 0..out_t {
            for ch in 0..c {
                let start = ti * pool;
                let mut best = start;
                for s in start + 1..start + pool {
                    if x[[b, s, ch]] > x[[b, best, ch]] {
                        best = s;
                    }
                }
                out[[b, ti, ch]] = x[[b, best, ch]];
                idx[[b, ti, ch]] = best;
            }
        }
    }
    (out, idx)
}

pub(crate) fn max_pool_backward(dout: &Array3<f64>, idx: &Array3<usize>, in_t: usize) -> Array3<f64> {
    let (batch, _, c) = dout.dim();
    let mut dx = Array3::zeros((batch, in_t, c));
    for ((b, ti, ch), &g) in dout.indexed_iter() {
        dx[[b, idx[[b, ti, ch]], ch]] += g;
    }
    dx
}

/// Inverted dropout: kept units are scaled by `1 / (1 - rate)` so inference
/// needs no rescaling. Returns the mask, `None` when nothing is dropped.
pub(crate) fn dropout<D: Dimension>(
    x: Array<f64, D>,
    rate: f64,
    training: bool,
    rng: &mut StdRng,
) -> (Array<f64, D>, Option<Array<f64, D>>) {
    if !training || rate <= 0.0 {
        return (x, None);
    }
    let keep = 1.0 / (1.0 - rate);
    let mask = Array::from_shape_fn(x.raw_dim(), |_| {
        if rng.gen::<f64>() < rate {
            0.0
        } else {
            keep
        }
    });
    (x * &mask, Some(mask))
}

pub(crate) fn dropout_backward<D: Dimension>(grad: Array<f64, D>, mask: &Option<Array<f64, D>>) -> Array<f64, D> {
    match mask {
        Some(mask) => grad * mask,
        None => grad,
    }
}

/// Cached activations of one LSTM time step.
#[derive(Debug, Clone)]
pub(crate) struct LstmStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    c: Array2<f64>,
}

/// Gate blocks in `wx`, `wh` and `b` are ordered input, forget, cell, output.
/// Returns the final hidden state and the per-step cache.
pub(crate) fn lstm_forward(
    seq: &Array3<f64>,
    wx: &Array2<f64>,
    wh: &Array2<f64>,
    b: &Array1<f64>,
) -> (Array2<f64>, Vec<LstmStep>) {
    let (batch, steps, _) = seq.dim();
    let units = wh.nrows();
    let mut h = Array2::<f64>::zeros((batch, units));
    let mut c = Array2::<f64>::zeros((batch, units));
    let mut cache = Vec::with_capacity(steps);
    for t in 0..steps {
        let x = seq.index_axis(Axis(1), t).to_owned();
        let z = x.dot(wx) + h.dot(wh) + b;
        let gate = |k: usize, act: fn(f64) -> f64| z.slice(s![.., k * units..(k + 1) * units]).mapv(act);
        let i = gate(0, sigmoid);
        let f = gate(1, sigmoid);
        let g = gate(2, f64::tanh);
        let o = gate(3, sigmoid);
        let c_next = &f * &c + &i * &g;
        let h_next = &o * &c_next.mapv(f64::tanh);
        cache.push(LstmStep {
            x,
            h_prev: h,
            c_prev: c,
            i,
            f,
            g,
            o,
            c: c_next.clone(),
        });
        h = h_next;
        c = c_next;
    }
    (h, cache)
}

pub(crate) struct LstmGrads {
    pub dseq: Array3<f64>,
    pub dwx: Array2<f64>,
    pub dwh: Array2<f64>,
    pub db: Array1<f64>,
}

/// Backpropagation through time from a gradient on the final hidden state.
pub(crate) fn lstm_backward(
    cache: &[LstmStep],
    dh_last: &Array2<f64>,
    wx: &Array2<f64>,
    wh: &Array2<f64>,
) -> LstmGrads {
    let (batch, units) = dh_last.dim();
    let mut grads = LstmGrads {
        dseq: Array3::zeros((batch, cache.len(), wx.nrows())),
        dwx: Array2::zeros(wx.raw_dim()),
        dwh: Array2::zeros(wh.raw_dim()),
        db: Array1::zeros(4 * units),
    };
    let mut dh = dh_last.clone();
    let mut dc = Array2::<f64>::zeros((batch, units));
    for (t, step) in cache.iter().enumerate().rev() {
        let tanh_c = step.c.mapv(f64::tanh);
        let d_o = &dh * &tanh_c;
        dc = dc + &dh * &step.o * &tanh_c.mapv(|v| 1.0 - v * v);
        let d_i = &dc * &step.g;
        let d_g = &dc * &step.i;
        let d_f = &dc * &step.c_prev;

        let mut dz = Array2::<f64>::zeros((batch, 4 * units));
        dz.slice_mut(s![.., 0..units])
            .assign(&(d_i * step.i.mapv(|v| v * (1.0 - v))));
        dz.slice_mut(s![.., units..2 * units])
            .assign(&(d_f * step.f.mapv(|v| v * (1.0 - v))));
        dz.slice_mut(s![.., 2 * units..3 * units])
            .assign(&(d_g * step.g.mapv(|v| 1.0 - v * v)));
        dz.slice_mut(s![.., 3 * units..])
            .assign(&(d_o * step.o.mapv(|v| v * (1.0 - v))));

        grads.dwx += &step.x.t().dot(&dz);
        grads.dwh += &step.h_prev.t().dot(&dz);
        grads.db += &dz.sum_axis(Axis(0));
        grads
            .dseq
            .index_axis_mut(Axis(1), t)
            .assign(&dz.dot(&wx.t()));
        dh = dz.dot(&wh.t());
        dc = &dc * &step.f;
    }
    grads
}
