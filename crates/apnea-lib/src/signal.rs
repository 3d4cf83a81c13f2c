use crate::error::{ApneaError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Basic typed time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }
}

/// Point events on a timeline (e.g., R-peaks indices)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Events {
    pub indices: Vec<usize>,
}

impl Events {
    pub fn from_indices(indices: Vec<usize>) -> Self {
        Self { indices }
    }
}

/// RR intervals (seconds), optionally anchored to the time of the beat that
/// closes each interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RRSeries {
    pub rr: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<f64>,
}

impl RRSeries {
    pub fn from_intervals(rr: Vec<f64>) -> Self {
        let mut acc = 0.0;
        let times = rr
            .iter()
            .map(|interval| {
                acc += interval;
                acc
            })
            .collect();
        Self { rr, times }
    }

    pub fn from_events(events: &Events, fs: f64) -> Self {
        let mut rr = Vec::new();
        let mut times = Vec::new();
        for w in events.indices.windows(2) {
            let dt = (w[1] as f64 - w[0] as f64) / fs;
            rr.push(dt);
            times.push(w[1] as f64 / fs);
        }
        Self { rr, times }
    }

    pub fn len(&self) -> usize {
        self.rr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rr.is_empty()
    }

    /// Intervals whose closing beat falls in `[start, end)` seconds.
    pub fn window(&self, start: f64, end: f64) -> RRSeries {
        let mut rr = Vec::new();
        let mut times = Vec::new();
        for (&interval, &t) in self.rr.iter().zip(&self.times) {
            if t >= start && t < end {
                rr.push(interval);
                times.push(t);
            }
        }
        RRSeries { rr, times }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMethod {
    Zscore,
    Minmax,
    Robust,
}

impl NormalizeMethod {
    const TABLE: [(&'static str, NormalizeMethod); 3] = [
        ("zscore", NormalizeMethod::Zscore),
        ("minmax", NormalizeMethod::Minmax),
        ("robust", NormalizeMethod::Robust),
    ];

    pub fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, m)| *m == self)
            .map(|(name, _)| *name)
            .unwrap_or("zscore")
    }
}

impl FromStr for NormalizeMethod {
    type Err = ApneaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::TABLE
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, m)| *m)
            .ok_or_else(|| ApneaError::UnknownMethod {
                kind: "normalization method",
                name: s.to_string(),
                expected: Self::TABLE.map(|(n, _)| n).join(", "),
            })
    }
}

impl fmt::Display for NormalizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalize a signal. A constant input divides by zero and comes back as NaN
/// for `Zscore` and `Minmax`; callers that care must check.
pub fn normalize(signal: &[f64], method: NormalizeMethod) -> Vec<f64> {
    match method {
        NormalizeMethod::Zscore => {
            let m = mean(signal);
            let sd = std_dev(signal, m);
            signal.iter().map(|x| (x - m) / sd).collect()
        }
        NormalizeMethod::Minmax => {
            let min = signal.iter().copied().fold(f64::INFINITY, f64::min);
            let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            signal.iter().map(|x| (x - min) / (max - min)).collect()
        }
        NormalizeMethod::Robust => {
            let med = median(signal);
            let deviations: Vec<f64> = signal.iter().map(|x| (x - med).abs()).collect();
            let mad = median(&deviations);
            signal.iter().map(|x| (x - med) / mad).collect()
        }
    }
}

/// Split a signal into windows of `window_size` samples advancing by
/// `window_size - overlap`. Trailing samples that do not fill a window are
/// dropped; a signal shorter than one window yields zero rows.
pub fn segment(signal: &[f64], window_size: usize, overlap: usize) -> Result<Array2<f64>> {
    if window_size == 0 {
        return Err(ApneaError::InvalidArgument(
            "window_size must be positive".into(),
        ));
    }
    if overlap >= window_size {
        return Err(ApneaError::InvalidArgument(format!(
            "overlap {overlap} must be smaller than window_size {window_size}"
        )));
    }
    let step = window_size - overlap;
    let n_windows = if signal.len() < window_size {
        0
    } else {
        (signal.len() - window_size) / step + 1
    };
    Ok(Array2::from_shape_fn((n_windows, window_size), |(i, j)| {
        signal[i * step + j]
    }))
}

/// Signal-to-noise ratio in dB.
pub fn snr(signal: &[f64], noise: &[f64]) -> f64 {
    let signal_power = mean_square(signal);
    let noise_power = mean_square(noise);
    if noise_power == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (signal_power / noise_power).log10()
}

/// Single-pole high-pass followed by single-pole low-pass.
pub fn bandpass(data: &[f64], fs: f64, low: f64, high: f64) -> Vec<f64> {
    if data.is_empty() {
        return Vec::new();
    }
    let hp = if low > 0.0 {
        single_pole_highpass(data, fs, low)
    } else {
        data.to_vec()
    };
    if high <= 0.0 || high >= fs * 0.5 {
        hp
    } else {
        single_pole_lowpass(&hp, fs, high)
    }
}

/// Second-order IIR notch (Q = 30). Frequencies at or above Nyquist leave the
/// signal untouched.
pub fn notch(data: &[f64], fs: f64, freq: f64) -> Vec<f64> {
    const Q: f64 = 30.0;
    if data.is_empty() || freq <= 0.0 || freq >= fs * 0.5 {
        return data.to_vec();
    }
    let w0 = 2.0 * PI * freq / fs;
    let alpha = w0.sin() / (2.0 * Q);
    let cos_w0 = w0.cos();
    let a0 = 1.0 + alpha;
    let (b0, b1, b2) = (1.0 / a0, -2.0 * cos_w0 / a0, 1.0 / a0);
    let (a1, a2) = (-2.0 * cos_w0 / a0, (1.0 - alpha) / a0);

    let mut out = Vec::with_capacity(data.len());
    let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
    for &x in data {
        let y = b0 * x + b1 * x1 + b2 * x2 - a1 * y1 - a2 * y2;
        x2 = x1;
        x1 = x;
        y2 = y1;
        y1 = y;
        out.push(y);
    }
    out
}

fn single_pole_highpass(data: &[f64], fs: f64, cutoff: f64) -> Vec<f64> {
    let dt = 1.0 / fs;
    let rc = 1.0 / (2.0 * PI * cutoff.max(0.01));
    let alpha = rc / (rc + dt);
    let mut out = Vec::with_capacity(data.len());
    let mut prev_y = 0.0;
    let mut prev_x = data[0];
    for &x in data {
        let y = alpha * (prev_y + x - prev_x);
        out.push(y);
        prev_y = y;
        prev_x = x;
    }
    out
}

fn single_pole_lowpass(data: &[f64], fs: f64, cutoff: f64) -> Vec<f64> {
    let dt = 1.0 / fs;
    let rc = 1.0 / (2.0 * PI * cutoff.max(0.01));
    let alpha = dt / (rc + dt);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = data[0];
    for &x in data {
        prev += alpha * (x - prev);
        out.push(prev);
    }
    out
}

pub(crate) fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population standard deviation.
pub(crate) fn std_dev(data: &[f64], mean: f64) -> f64 {
    (data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / data.len() as f64).sqrt()
}

fn mean_square(data: &[f64]) -> f64 {
    data.iter().map(|x| x * x).sum::<f64>() / data.len() as f64
}

fn median(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn zscore_has_zero_mean_unit_std() {
        let out = normalize(&[1.0, 2.0, 3.0, 4.0, 5.0], NormalizeMethod::Zscore);
        let m = mean(&out);
        assert!(m.abs() < 1e-10);
        assert!((std_dev(&out, m) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn zscore_of_constant_signal_is_nan() {
        let out = normalize(&[5.0; 4], NormalizeMethod::Zscore);
        assert!(out.iter().all(|x| x.is_nan()));
    }

    #[test]
    fn minmax_spans_unit_interval() {
        let out = normalize(&[3.0, -1.0, 7.0, 2.0], NormalizeMethod::Minmax);
        let min = out.iter().copied().fold(f64::INFINITY, f64::min);
        let max = out.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(min, 0.0);
        assert_eq!(max, 1.0);
    }

    #[test]
    fn robust_is_finite_for_spread_signal() {
        let out = normalize(&[1.0, 2.0, 3.0, 4.0, 5.0], NormalizeMethod::Robust);
        assert_eq!(out, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = "invalid".parse::<NormalizeMethod>().unwrap_err();
        assert!(matches!(err, ApneaError::UnknownMethod { .. }));
        assert_eq!("robust".parse::<NormalizeMethod>().unwrap(), NormalizeMethod::Robust);
    }

    #[test]
    fn segment_without_overlap() {
        let s = ramp(100);
        let seg = segment(&s, 10, 0).unwrap();
        assert_eq!(seg.dim(), (10, 10));
        assert_eq!(seg.row(0).to_vec(), ramp(10));
    }

    #[test]
    fn segment_with_overlap_shares_samples() {
        let s = ramp(100);
        let seg = segment(&s, 10, 5).unwrap();
        assert_eq!(seg.ncols(), 10);
        assert_eq!(seg.nrows(), 19);
        for i in 0..seg.nrows() - 1 {
            for k in 0..5 {
                assert_eq!(seg[[i, 5 + k]], seg[[i + 1, k]]);
            }
        }
    }

    #[test]
    fn segment_exact_fit_and_short_signal() {
        assert_eq!(segment(&ramp(10), 10, 0).unwrap().dim(), (1, 10));
        assert_eq!(segment(&ramp(5), 10, 0).unwrap().nrows(), 0);
    }

    #[test]
    fn segment_rejects_non_advancing_step() {
        assert!(matches!(
            segment(&ramp(20), 10, 10),
            Err(ApneaError::InvalidArgument(_))
        ));
        assert!(segment(&ramp(20), 0, 0).is_err());
    }

    #[test]
    fn snr_with_silent_noise_is_infinite() {
        assert_eq!(snr(&[1.0, -1.0], &[0.0, 0.0]), f64::INFINITY);
        let db = snr(&[2.0, 2.0], &[1.0, 1.0]);
        assert!((db - 10.0 * 4f64.log10()).abs() < 1e-12);
    }

    #[test]
    fn notch_attenuates_target_tone() {
        let fs = 500.0;
        let tone: Vec<f64> = (0..5000)
            .map(|i| (2.0 * PI * 60.0 * i as f64 / fs).sin())
            .collect();
        let filtered = notch(&tone, fs, 60.0);
        let tail = &filtered[2500..];
        let peak = tail.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
        assert!(peak < 0.1, "residual amplitude {peak}");
        assert_eq!(notch(&tone, 100.0, 60.0), tone);
    }

    #[test]
    fn rr_window_selects_by_closing_beat() {
        let rr = RRSeries::from_intervals(vec![1.0, 1.0, 1.0, 1.0]);
        let w = rr.window(1.5, 3.5);
        assert_eq!(w.times, vec![2.0, 3.0]);
        let events = Events::from_indices(vec![0, 100, 250]);
        let from_events = RRSeries::from_events(&events, 100.0);
        assert_eq!(from_events.rr, vec![1.0, 1.5]);
        assert_eq!(from_events.times, vec![1.0, 2.5]);
    }
}
