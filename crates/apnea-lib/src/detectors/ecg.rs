use crate::{
    config::SignalConfig,
    signal::{bandpass, notch, Events, RRSeries, TimeSeries},
};

/// Pan–Tompkins style R-peak detector, used to derive RR intervals for
/// records that ship without a beat annotation file.
#[derive(Debug, Clone, Copy)]
pub struct QrsDetector {
    /// Conditioning band applied to the raw ECG (Hz).
    pub conditioning: (f64, f64),
    /// Mains frequency removed before detection (Hz).
    pub notch_hz: f64,
    /// QRS enhancement band (Hz).
    pub qrs_band: (f64, f64),
    /// Moving window integration length (seconds).
    pub integration_window_s: f64,
    /// Refractory period (seconds).
    pub min_rr_s: f64,
    /// Scale between noise and signal envelopes for the adaptive threshold.
    pub threshold_scale: f64,
    /// How far back to search (seconds) for the precise R-peak after a detection.
    pub search_back_s: f64,
}

impl QrsDetector {
    pub fn new(cfg: &SignalConfig) -> Self {
        Self {
            conditioning: (cfg.bandpass_low_hz, cfg.bandpass_high_hz),
            notch_hz: cfg.notch_hz,
            qrs_band: (5.0, 15.0),
            integration_window_s: 0.150,
            min_rr_s: cfg.min_rr_s.max(0.15),
            threshold_scale: 0.6,
            search_back_s: 0.150,
        }
    }

    pub fn detect(&self, ts: &TimeSeries) -> Events {
        if ts.is_empty() {
            return Events::from_indices(Vec::new());
        }
        let fs = ts.fs.max(1.0);
        let conditioned = notch(
            &bandpass(&ts.data, fs, self.conditioning.0, self.conditioning.1),
            fs,
            self.notch_hz,
        );
        let enhanced = bandpass(&conditioned, fs, self.qrs_band.0, self.qrs_band.1);
        let energy: Vec<f64> = enhanced
            .windows(2)
            .map(|w| (w[1] - w[0]).powi(2))
            .collect();
        let win = ((self.integration_window_s * fs).round() as usize).max(1);
        let envelope = moving_average(&energy, win);

        let peaks = self.pick_peaks(&enhanced, &envelope, fs);
        if peaks.len() < 2 {
            return Events::from_indices(self.local_maxima(&conditioned, fs));
        }
        Events::from_indices(peaks)
    }

    /// Detect beats and convert them to an RR series in seconds.
    pub fn rr_series(&self, ts: &TimeSeries) -> RRSeries {
        RRSeries::from_events(&self.detect(ts), ts.fs)
    }

    fn pick_peaks(&self, enhanced: &[f64], envelope: &[f64], fs: f64) -> Vec<usize> {
        if envelope.is_empty() {
            return Vec::new();
        }
        let refractory = ((self.min_rr_s * fs).round() as usize).max(1);
        let search = ((self.search_back_s * fs).round() as usize).max(1);

        let init = envelope.len().min((fs as usize).max(1));
        let avg = envelope[..init].iter().sum::<f64>() / init as f64;
        let mut signal_level = avg;
        let mut noise_level = avg * 0.5;
        let mut threshold = noise_level + self.threshold_scale * (signal_level - noise_level);
        let mut last_detection: Option<usize> = None;
        let mut peaks = Vec::new();

        for (i, &sample) in envelope.iter().enumerate() {
            let refractory_ok = last_detection.map_or(true, |last| i - last >= refractory);
            if sample >= threshold && refractory_ok {
                let start = i.saturating_sub(search);
                let end = i.min(enhanced.len() - 1);
                let idx = (start..=end)
                    .max_by(|&a, &b| enhanced[a].total_cmp(&enhanced[b]))
                    .unwrap_or(i);
                peaks.push(idx);
                last_detection = Some(i);
                signal_level = 0.125 * sample + 0.875 * signal_level;
            } else {
                noise_level = 0.125 * sample + 0.875 * noise_level;
            }
            threshold =
                noise_level + self.threshold_scale * (signal_level - noise_level).max(0.0);
        }

        peaks.sort_unstable();
        peaks.dedup();
        peaks
    }

    // Local maxima above a 150 ms moving average, spaced by the refractory period.
    fn local_maxima(&self, data: &[f64], fs: f64) -> Vec<usize> {
        if data.len() < 3 {
            return Vec::new();
        }
        let min_gap = ((self.min_rr_s * fs) as usize).max(1);
        let trend = moving_average(data, ((0.150 * fs) as usize).max(1));
        let detrended: Vec<f64> = data.iter().zip(&trend).map(|(x, t)| x - t).collect();

        let mut peaks: Vec<usize> = Vec::new();
        for i in 1..detrended.len() - 1 {
            let y = detrended[i];
            let is_peak = y > 0.0 && y > detrended[i - 1] && y > detrended[i + 1];
            if is_peak && peaks.last().map_or(true, |&last| i - last >= min_gap) {
                peaks.push(i);
            }
        }
        peaks
    }
}

fn moving_average(data: &[f64], win: usize) -> Vec<f64> {
    if win <= 1 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut acc = 0.0;
    for (i, &sample) in data.iter().enumerate() {
        acc += sample;
        if i >= win {
            acc -= data[i - win];
        }
        out.push(acc / win as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn synthetic_ecg(fs: f64, rr: &[f64]) -> TimeSeries {
        let mut beats = Vec::with_capacity(rr.len() + 1);
        let mut t = 0.5;
        beats.push(t);
        for &interval in rr {
            t += interval;
            beats.push(t);
        }
        let duration = beats.last().copied().unwrap_or(1.0) + 1.0;
        let samples = (duration * fs) as usize;
        let data = (0..samples)
            .map(|i| {
                let time = i as f64 / fs;
                let baseline = 0.05 * (2.0 * PI * time).sin();
                let qrs: f64 = beats
                    .iter()
                    .map(|&bt| 1.2 * (-0.5 * ((time - bt) / 0.02).powi(2)).exp())
                    .sum();
                baseline + qrs
            })
            .collect();
        TimeSeries { fs, data }
    }

    #[test]
    fn recovers_regular_rhythm() {
        let fs = 250.0;
        let rr = [0.82, 0.78, 0.8, 0.79, 0.81, 0.77, 0.84, 0.88];
        let ts = synthetic_ecg(fs, &rr);
        let detector = QrsDetector::new(&SignalConfig {
            min_rr_s: 0.3,
            ..SignalConfig::default()
        });
        let events = detector.detect(&ts);
        let found = events.indices.len() as i64;
        assert!(
            (found - (rr.len() as i64 + 1)).abs() <= 1,
            "expected about {} beats, found {found}",
            rr.len() + 1
        );
        let series = detector.rr_series(&ts);
        assert_eq!(series.len(), events.indices.len() - 1);
        assert_eq!(series.times.len(), series.len());
    }

    #[test]
    fn empty_signal_yields_no_beats() {
        let detector = QrsDetector::new(&SignalConfig::default());
        let ts = TimeSeries {
            fs: 100.0,
            data: Vec::new(),
        };
        assert!(detector.detect(&ts).indices.is_empty());
    }
}
