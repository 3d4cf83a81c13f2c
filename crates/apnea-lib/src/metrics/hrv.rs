use crate::signal::RRSeries;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HRVTime {
    pub n: usize,
    pub avnn: f64,
    pub sdnn: f64,
    pub rmssd: f64,
    pub pnn50: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HRVPsd {
    pub lf: f64,
    pub hf: f64,
    pub vlf: f64,
    pub lf_hf: f64,
    pub total_power: f64,
}

/// The fixed feature vector of one segment, in CSV column order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvFeatures {
    pub mean_rr: f64,
    pub std_rr: f64,
    pub rmssd: f64,
    pub sdnn: f64,
    pub pnn50: f64,
    pub lfhf_ratio: f64,
    pub total_power: f64,
}

impl HrvFeatures {
    pub const NAMES: [&'static str; 7] = [
        "mean_rr",
        "std_rr",
        "rmssd",
        "sdnn",
        "pnn50",
        "lfhf_ratio",
        "total_power",
    ];

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.mean_rr,
            self.std_rr,
            self.rmssd,
            self.sdnn,
            self.pnn50,
            self.lfhf_ratio,
            self.total_power,
        ]
    }
}

/// One labelled segment of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRow {
    pub filename: String,
    pub features: HrvFeatures,
    pub label: u8,
}

pub fn hrv_time(rr: &RRSeries) -> HRVTime {
    let n = rr.rr.len();
    let avnn = if n > 0 {
        rr.rr.iter().sum::<f64>() / n as f64
    } else {
        0.0
    };
    let sdnn = if n > 1 {
        (rr.rr.iter().map(|x| (x - avnn).powi(2)).sum::<f64>() / (n as f64 - 1.0)).sqrt()
    } else {
        0.0
    };
    let rmssd = if n > 1 {
        let diffs = rr.rr.windows(2).map(|w| (w[1] - w[0]).powi(2));
        (diffs.sum::<f64>() / (n as f64 - 1.0)).sqrt()
    } else {
        0.0
    };
    let pnn50 = if n > 1 {
        let count = rr
            .rr
            .windows(2)
            .filter(|w| (w[1] - w[0]).abs() > 0.050)
            .count();
        (count as f64) / (n as f64 - 1.0)
    } else {
        0.0
    };

    HRVTime {
        n,
        avnn,
        sdnn,
        rmssd,
        pnn50,
    }
}

pub fn hrv_psd(rr: &RRSeries, fs_interp: f64) -> HRVPsd {
    let (freqs, powers) = welch_psd(rr, fs_interp);
    let total_power: f64 = powers.iter().sum();
    let lf = integrate_band(&freqs, &powers, (0.04, 0.15));
    let hf = integrate_band(&freqs, &powers, (0.15, 0.4));
    let vlf = integrate_band(&freqs, &powers, (0.003, 0.04));
    let lf_hf = if hf > 0.0 { lf / hf } else { 0.0 };
    HRVPsd {
        lf,
        hf,
        vlf,
        lf_hf,
        total_power,
    }
}

/// Time and frequency statistics of one RR segment.
pub fn hrv_features(rr: &RRSeries, fs_interp: f64) -> HrvFeatures {
    let time = hrv_time(rr);
    let psd = hrv_psd(rr, fs_interp);
    let std_rr = if time.n > 0 {
        (rr.rr.iter().map(|x| (x - time.avnn).powi(2)).sum::<f64>() / time.n as f64).sqrt()
    } else {
        0.0
    };
    HrvFeatures {
        mean_rr: time.avnn,
        std_rr,
        rmssd: time.rmssd,
        sdnn: time.sdnn,
        pnn50: time.pnn50,
        lfhf_ratio: psd.lf_hf,
        total_power: psd.total_power,
    }
}

fn integrate_band(freqs: &[f64], powers: &[f64], band: (f64, f64)) -> f64 {
    freqs
        .iter()
        .zip(powers)
        .filter(|(f, _)| **f >= band.0 && **f < band.1)
        .map(|(_, p)| *p)
        .sum()
}

fn welch_psd(rr: &RRSeries, fs_interp: f64) -> (Vec<f64>, Vec<f64>) {
    let signal = interpolate_rr(&rr.rr, fs_interp);
    let n = signal.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let window = ((fs_interp * 30.0).max(4.0).min(n as f64)) as usize;
    let step = (window / 2).max(1);
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(window);
    let window_func = hann(window);
    let scale = 1.0 / window as f64;
    let freqs: Vec<f64> = (0..window / 2 + 1)
        .map(|k| k as f64 * fs_interp / window as f64)
        .collect();
    let mut powers = vec![0.0; freqs.len()];
    let mut spectrum = r2c.make_output_vec();
    let mut pos = 0;
    let mut segments = 0;
    while pos + window <= n {
        let mut frame: Vec<f64> = signal[pos..pos + window]
            .iter()
            .zip(&window_func)
            .map(|(x, w)| x * w)
            .collect();
        if r2c.process(&mut frame, &mut spectrum).is_err() {
            break;
        }
        for (k, val) in spectrum.iter().enumerate() {
            let one_sided = if k == 0 || (window % 2 == 0 && k == window / 2) {
                1.0
            } else {
                2.0
            };
            powers[k] += one_sided * val.norm_sqr() * scale;
        }
        segments += 1;
        pos += step;
    }
    if segments > 0 {
        for p in powers.iter_mut() {
            *p /= segments as f64;
        }
    }
    (freqs, powers)
}

// Instantaneous heart rate (bpm) resampled on a uniform grid.
fn interpolate_rr(rr: &[f64], fs: f64) -> Vec<f64> {
    let mut times = Vec::with_capacity(rr.len());
    let mut acc = 0.0;
    for interval in rr {
        acc += interval;
        times.push(acc);
    }
    let Some(&duration) = times.last() else {
        return Vec::new();
    };
    let n = (duration * fs).ceil().max(0.0) as usize;
    let mut signal = Vec::with_capacity(n);
    let mut idx = 0;
    for i in 0..n {
        let t = i as f64 / fs;
        while idx + 1 < times.len() && times[idx] < t {
            idx += 1;
        }
        let delta = rr[idx];
        signal.push(if delta == 0.0 { 60.0 } else { 60.0 / delta });
    }
    signal
}

fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size as f64)).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rr_series() -> RRSeries {
        RRSeries::from_intervals(vec![
            0.82, 0.78, 0.80, 0.79, 0.83, 0.77, 0.84, 0.88, 0.86, 0.81, 0.79, 0.82, 0.85, 0.78,
            0.80, 0.79, 0.83, 0.84, 0.82, 0.81,
        ])
    }

    fn assert_close(actual: f64, expected: f64, rel_tol: f64) {
        let tol = expected.abs().max(1.0) * rel_tol;
        let diff = (actual - expected).abs();
        assert!(
            diff <= tol,
            "expected {expected}, got {actual} (diff {diff} > tol {tol})"
        );
    }

    #[test]
    fn time_domain_on_alternating_series() {
        let rr = RRSeries::from_intervals(vec![0.5, 0.7, 0.5, 0.7]);
        let t = hrv_time(&rr);
        assert_eq!(t.n, 4);
        assert_close(t.avnn, 0.6, 1e-12);
        assert_close(t.rmssd, 0.2, 1e-12);
        assert_close(t.pnn50, 1.0, 1e-12);
    }

    #[test]
    fn welch_psd_regression_snapshot() {
        let psd = hrv_psd(&rr_series(), 4.0);
        assert_close(psd.lf, 43426.124124153386, 1e-6);
        assert_close(psd.hf, 112.27098917234595, 1e-6);
        assert_close(psd.total_power, 131892.82018205707, 1e-6);
    }

    #[test]
    fn features_follow_column_order() {
        let rr = rr_series();
        let f = hrv_features(&rr, 4.0);
        let t = hrv_time(&rr);
        assert_eq!(f.to_vec().len(), HrvFeatures::NAMES.len());
        assert_eq!(f.mean_rr, t.avnn);
        assert_eq!(f.sdnn, t.sdnn);
        // population std is slightly smaller than the sample std
        assert!(f.std_rr < f.sdnn);
        assert!(f.lfhf_ratio > 0.0);
    }

    #[test]
    fn empty_series_gives_zero_features() {
        let f = hrv_features(&RRSeries::default(), 4.0);
        assert_eq!(f.to_vec(), vec![0.0; 7]);
    }
}
