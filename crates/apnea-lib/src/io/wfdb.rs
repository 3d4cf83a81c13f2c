use crate::{
    config::{DatasetConfig, PipelineConfig, SignalConfig},
    dataset::SequenceSource,
    detectors::ecg::QrsDetector,
    signal::{Events, RRSeries, TimeSeries},
};
use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One signal of a record, in physical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub units: String,
    pub data: Vec<f64>,
}

/// A loaded WFDB record. Channels keep header order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub fs: f64,
    pub channels: Vec<Channel>,
}

impl Record {
    /// First channel whose name mentions ECG, else the first channel.
    pub fn ecg(&self) -> Option<TimeSeries> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.name.to_ascii_uppercase().contains("ECG"))
            .or_else(|| self.channels.first())?;
        Some(TimeSeries {
            fs: self.fs,
            data: channel.data.clone(),
        })
    }

    pub fn sig_len(&self) -> usize {
        self.channels.iter().map(|c| c.data.len()).max().unwrap_or(0)
    }
}

/// Header descriptions made unique: a repeated description gets the lead
/// index appended.
fn unique_channel_names(descriptions: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    descriptions
        .iter()
        .enumerate()
        .map(|(lead, desc)| {
            if seen.insert(desc.clone()) {
                desc.clone()
            } else {
                let renamed = format!("{desc}_{lead}");
                seen.insert(renamed.clone());
                renamed
            }
        })
        .collect()
}

/// Annotation stream as parallel sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotations {
    pub samples: Vec<usize>,
    pub symbols: Vec<String>,
    pub aux: Vec<String>,
}

impl Annotations {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.samples
            .iter()
            .copied()
            .zip(self.symbols.iter().map(String::as_str))
    }

    pub fn beats(&self) -> Events {
        Events::from_indices(
            self.iter()
                .filter(|(_, sym)| is_beat_symbol(sym))
                .map(|(sample, _)| sample)
                .collect(),
        )
    }
}

/// Header-level metadata for a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordInfo {
    pub record_name: String,
    pub n_sig: usize,
    pub sig_len: usize,
    pub fs: f64,
    pub sig_name: Vec<String>,
    pub units: Vec<String>,
    pub duration_min: f64,
}

/// Simple WFDB annotation entry.
#[derive(Debug, Clone)]
pub struct WfdbAnnotation {
    pub sample: usize,
    pub code: u8,
    pub aux: Option<String>,
}

impl WfdbAnnotation {
    pub fn symbol(&self) -> &'static str {
        code_symbol(self.code)
    }
}

#[derive(Debug, Clone)]
struct SignalSpec {
    description: String,
    units: String,
}

#[derive(Debug, Clone)]
struct Header {
    n_sig: usize,
    fs: f64,
    sig_len: usize,
    signals: Vec<SignalSpec>,
}

/// Parse the text of a `.hea` file. Only the fields needed for record
/// metadata are interpreted.
fn parse_header(text: &str, default_fs: f64) -> Result<Header> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));
    let record_line = lines.next().context("header has no record line")?;
    let fields: Vec<&str> = record_line.split_whitespace().collect();
    if fields.len() < 2 {
        bail!("record line too short: {record_line}");
    }
    let n_sig: usize = fields[1]
        .parse()
        .with_context(|| format!("bad signal count '{}'", fields[1]))?;
    let fs = match fields.get(2) {
        Some(raw) => {
            let freq = raw.split(['/', '(']).next().unwrap_or(raw);
            freq.parse::<f64>()
                .with_context(|| format!("bad sampling frequency '{raw}'"))?
        }
        None => default_fs,
    };
    let sig_len = match fields.get(3) {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("bad signal length '{raw}'"))?,
        None => 0,
    };

    let mut signals = Vec::with_capacity(n_sig);
    for (idx, line) in lines.take(n_sig).enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let units = parts
            .get(2)
            .and_then(|gain| gain.split_once('/'))
            .map(|(_, units)| units.to_string())
            .unwrap_or_else(|| "mV".to_string());
        let description = if parts.len() > 8 {
            parts[8..].join(" ")
        } else {
            format!("sig{idx}")
        };
        signals.push(SignalSpec { description, units });
    }
    if signals.len() != n_sig {
        bail!(
            "header declares {} signals but describes {}",
            n_sig,
            signals.len()
        );
    }
    Ok(Header {
        n_sig,
        fs,
        sig_len,
        signals,
    })
}

/// Decode all leads through `wfdb_rust`. The crate reports malformed input by
/// panicking, so the call is isolated and turned into an error.
fn read_leads(header_path: &Path) -> Result<(f64, Vec<Vec<f64>>)> {
    let path = header_path.to_path_buf();
    let (header, signals) = std::panic::catch_unwind(move || wfdb_rust::parse_wfdb(&path))
        .map_err(|_| anyhow::anyhow!("failed to decode {}", header_path.display()))?;
    let fs = header
        .record
        .sampling_frequency
        .map(|f| f as f64)
        .unwrap_or(250.0);
    let mut leads = Vec::with_capacity(signals.len());
    for (lead, raw) in signals.iter().enumerate() {
        let spec = header
            .signal_specs
            .get(lead)
            .with_context(|| format!("no signal spec for lead {lead}"))?;
        let gain = spec.adc_gain.unwrap_or(1.0) as f64;
        let baseline = spec.baseline.or(spec.adc_zero).unwrap_or(0) as f64;
        leads.push(
            raw.iter()
                .map(|&sample| (sample as f64 - baseline) / gain)
                .collect(),
        );
    }
    Ok((fs, leads))
}

/// Parse MIT annotation binary stream into samples & codes.
pub fn parse_wfdb_annotations(buf: &[u8]) -> Vec<WfdbAnnotation> {
    let mut out: Vec<WfdbAnnotation> = Vec::new();
    let mut idx = 0;
    let mut sample: usize = 0;
    while idx + 2 <= buf.len() {
        let word = u16::from_le_bytes([buf[idx], buf[idx + 1]]);
        idx += 2;
        let code = (word >> 10) as u8;
        let diff = (word & 0x03FF) as usize;
        if code == 0 && diff == 0 {
            break;
        }
        match code {
            // SKIP: 32-bit interval stored high word first
            59 => {
                if idx + 4 > buf.len() {
                    break;
                }
                let high = u16::from_le_bytes([buf[idx], buf[idx + 1]]) as u32;
                let low = u16::from_le_bytes([buf[idx + 2], buf[idx + 3]]) as u32;
                idx += 4;
                sample = sample.wrapping_add(((high << 16) | low) as usize);
            }
            // NUM/SUB/CHN carry a value in the diff field, not a time step
            60..=62 => {}
            // AUX: `diff` bytes of text attached to the previous annotation
            63 => {
                let end = (idx + diff).min(buf.len());
                let text = String::from_utf8_lossy(&buf[idx..end])
                    .trim_end_matches('\0')
                    .to_string();
                if let Some(last) = out.last_mut() {
                    last.aux = Some(text);
                }
                idx = end;
                if diff % 2 != 0 && idx < buf.len() {
                    idx += 1;
                }
            }
            _ => {
                sample = sample.wrapping_add(diff);
                out.push(WfdbAnnotation {
                    sample,
                    code,
                    aux: None,
                });
            }
        }
    }
    out
}

/// Read a WFDB annotation file into the decoupled representation.
pub fn read_annotations(path: &Path) -> Result<Annotations> {
    let buf = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut ann = Annotations::default();
    for entry in parse_wfdb_annotations(&buf) {
        ann.samples.push(entry.sample);
        ann.symbols.push(entry.symbol().to_string());
        ann.aux.push(entry.aux.unwrap_or_default());
    }
    Ok(ann)
}

const CODE_SYMBOLS: [&str; 42] = [
    " ", "N", "L", "R", "a", "V", "F", "J", "A", "S", "E", "j", "/", "Q", "~", " ", "|", " ",
    "s", "T", "*", "D", "\"", "=", "p", "B", "^", "t", "+", "u", "?", "!", "[", "]", "e", "n",
    "@", "x", "f", "(", ")", "r",
];

fn code_symbol(code: u8) -> &'static str {
    CODE_SYMBOLS.get(code as usize).copied().unwrap_or(" ")
}

fn is_beat_symbol(symbol: &str) -> bool {
    matches!(
        symbol,
        "N" | "L" | "R" | "B" | "a" | "J" | "A" | "S" | "V" | "r" | "F" | "e" | "j" | "n" | "E"
            | "/" | "f" | "Q"
    )
}

/// Loader over a directory of `{record}.hea/.dat/.apn` files.
#[derive(Debug, Clone)]
pub struct WfdbLoader {
    data_dir: PathBuf,
    signal: SignalConfig,
    dataset: DatasetConfig,
}

impl WfdbLoader {
    pub fn new(data_dir: impl Into<PathBuf>, cfg: &PipelineConfig) -> Self {
        let data_dir = data_dir.into();
        if !data_dir.exists() {
            warn!("data directory {} does not exist", data_dir.display());
        }
        Self {
            data_dir,
            signal: cfg.signal.clone(),
            dataset: cfg.dataset.clone(),
        }
    }

    fn path(&self, name: &str, ext: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.{ext}"))
    }

    /// Record names discovered from `.hea` files, sorted.
    pub fn list_records(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list {}: {err}", self.data_dir.display());
                return Vec::new();
            }
        };
        let names: BTreeSet<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("hea"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        info!("found {} records", names.len());
        names.into_iter().collect()
    }

    fn header(&self, name: &str) -> Result<Header> {
        let path = self.path(name, "hea");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        parse_header(&text, self.signal.sampling_rate)
    }

    /// Metadata from the header alone; `None` (logged) when it cannot be read.
    pub fn get_record_info(&self, name: &str) -> Option<RecordInfo> {
        match self.header(name) {
            Ok(header) => Some(RecordInfo {
                record_name: name.to_string(),
                n_sig: header.n_sig,
                sig_len: header.sig_len,
                fs: header.fs,
                sig_name: header.signals.iter().map(|s| s.description.clone()).collect(),
                units: header.signals.iter().map(|s| s.units.clone()).collect(),
                duration_min: if header.fs > 0.0 {
                    header.sig_len as f64 / header.fs / 60.0
                } else {
                    0.0
                },
            }),
            Err(err) => {
                error!("error reading header for {name}: {err:#}");
                None
            }
        }
    }

    fn try_load_record(&self, name: &str) -> Result<Record> {
        let header = self.header(name)?;
        let (fs, leads) = read_leads(&self.path(name, "hea"))?;
        if leads.len() != header.n_sig {
            bail!(
                "header declares {} signals, decoder returned {}",
                header.n_sig,
                leads.len()
            );
        }
        let descriptions: Vec<String> =
            header.signals.iter().map(|s| s.description.clone()).collect();
        let channels = unique_channel_names(&descriptions)
            .into_iter()
            .zip(header.signals)
            .zip(leads)
            .map(|((name, spec), data)| Channel {
                name,
                units: spec.units,
                data,
            })
            .collect();
        Ok(Record {
            name: name.to_string(),
            fs,
            channels,
        })
    }

    /// Load a record and its apnea annotations. Missing annotations are a
    /// warning; any other failure is logged and yields `None`.
    pub fn load_record(&self, name: &str) -> Option<(Record, Option<Annotations>)> {
        let record = match self.try_load_record(name) {
            Ok(record) => record,
            Err(err) => {
                error!("error loading record {name}: {err:#}");
                return None;
            }
        };
        info!("loaded record {name}: {} samples", record.sig_len());
        let annotations = self.load_annotations(name, &self.dataset.apnea_annotator);
        Some((record, annotations))
    }

    /// Read `{name}.{annotator}`; `None` when absent (warned) or unreadable (logged).
    pub fn load_annotations(&self, name: &str, annotator: &str) -> Option<Annotations> {
        let path = self.path(name, annotator);
        if !path.exists() {
            warn!("no {annotator} annotations found for {name}");
            return None;
        }
        match read_annotations(&path) {
            Ok(ann) => {
                info!("loaded {} {annotator} annotations for {name}", ann.len());
                Some(ann)
            }
            Err(err) => {
                error!("error reading annotations for {name}: {err:#}");
                None
            }
        }
    }

    /// RR series from the first available beat annotation file, falling back
    /// to R-peak detection on the ECG channel.
    pub fn load_rr(&self, name: &str) -> Option<RRSeries> {
        for annotator in &self.dataset.beat_annotators {
            if !self.path(name, annotator).exists() {
                continue;
            }
            let fs = self.get_record_info(name)?.fs;
            let beats = self.load_annotations(name, annotator)?.beats();
            return Some(RRSeries::from_events(&beats, fs));
        }
        let (record, _) = self.load_record(name)?;
        let ecg = record.ecg()?;
        info!("no beat annotations for {name}, detecting R-peaks");
        Some(QrsDetector::new(&self.signal).rr_series(&ecg))
    }
}

impl SequenceSource for WfdbLoader {
    fn list_records(&self) -> Vec<String> {
        WfdbLoader::list_records(self)
    }

    fn load_sequence(&self, name: &str) -> Option<Vec<f64>> {
        self.load_rr(name).map(|rr| rr.rr)
    }
}

/// Channel matrix (samples x channels, in header order) and the sampling
/// rate. Shorter channels are padded with NaN.
pub fn extract_signals(record: &Record) -> (Array2<f64>, f64) {
    let columns = &record.channels;
    let signals = Array2::from_shape_fn((record.sig_len(), columns.len()), |(i, j)| {
        columns[j].data.get(i).copied().unwrap_or(f64::NAN)
    });
    (signals, record.fs)
}

/// Annotation sample indices and their symbols.
pub fn extract_annotations(annotations: &Annotations) -> (&[usize], &[String]) {
    (&annotations.samples, &annotations.symbols)
}

/// Dataset-level overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total_records: usize,
    pub record_names: Vec<String>,
    pub records_info: Vec<RecordInfo>,
}

/// Summarise a directory, reading headers of the first `sample` records.
/// Unreadable headers are skipped.
pub fn load_dataset_summary(loader: &WfdbLoader, sample: usize) -> DatasetSummary {
    let records = loader.list_records();
    let records_info = records
        .iter()
        .take(sample)
        .filter_map(|name| loader.get_record_info(name))
        .collect();
    DatasetSummary {
        total_records: records.len(),
        record_names: records,
        records_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann_word(code: u16, diff: u16) -> [u8; 2] {
        ((code << 10) | diff).to_le_bytes()
    }

    #[test]
    fn parses_simple_annotation_stream() {
        let mut bytes = vec![];
        bytes.extend(ann_word(1, 5));
        bytes.extend(ann_word(8, 10));
        // SKIP 5000 samples
        bytes.extend(ann_word(59, 0));
        bytes.extend(0x0000u16.to_le_bytes());
        bytes.extend(0x1388u16.to_le_bytes());
        bytes.extend(ann_word(1, 0));
        bytes.extend(0u16.to_le_bytes());

        let annotations = parse_wfdb_annotations(&bytes);
        assert_eq!(annotations.len(), 3);
        assert_eq!(annotations[0].sample, 5);
        assert_eq!(annotations[1].sample, 15);
        assert_eq!(annotations[1].symbol(), "A");
        assert_eq!(annotations[2].sample, 5015);
    }

    #[test]
    fn aux_and_sub_do_not_advance_time() {
        let mut bytes = vec![];
        bytes.extend(ann_word(1, 100));
        bytes.extend(ann_word(61, 3));
        bytes.extend(ann_word(63, 3));
        bytes.extend(b"(AF\0");
        bytes.extend(ann_word(1, 100));
        bytes.extend(0u16.to_le_bytes());

        let annotations = parse_wfdb_annotations(&bytes);
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].aux.as_deref(), Some("(AF"));
        assert_eq!(annotations[1].sample, 200);
    }

    #[test]
    fn parses_header_metadata() {
        let text = "# comment\na01 2 100 2957000\na01.dat 16 200/mV 12 0 -22 7637 0 ECG\n\
                    a01.dat 16 1(0)/% 12 0 97 0 0 SpO2\n";
        let header = parse_header(text, 250.0).unwrap();
        assert_eq!(header.n_sig, 2);
        assert_eq!(header.fs, 100.0);
        assert_eq!(header.sig_len, 2957000);
        assert_eq!(header.signals[0].description, "ECG");
        assert_eq!(header.signals[1].units, "%");
    }

    #[test]
    fn header_with_missing_signal_lines_is_rejected() {
        assert!(parse_header("x 2 100 10\nx.dat 16 200 12 0 0 0 0 ECG\n", 100.0).is_err());
    }

    #[test]
    fn lists_sorted_unique_records() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b02.hea", "a01.hea", "a01.dat", "c03.apn", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let loader = WfdbLoader::new(dir.path(), &PipelineConfig::default());
        assert_eq!(loader.list_records(), vec!["a01", "b02"]);
    }

    #[test]
    fn record_info_from_header_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a01.hea"),
            "a01 1 100 6000\na01.dat 16 200/mV 12 0 0 0 0 ECG\n",
        )
        .unwrap();
        let loader = WfdbLoader::new(dir.path(), &PipelineConfig::default());
        let info = loader.get_record_info("a01").unwrap();
        assert_eq!(info.n_sig, 1);
        assert_eq!(info.sig_name, vec!["ECG"]);
        assert_eq!(info.units, vec!["mV"]);
        assert!((info.duration_min - 1.0).abs() < 1e-12);

        let summary = load_dataset_summary(&loader, 5);
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.records_info.len(), 1);
    }

    #[test]
    fn missing_files_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = WfdbLoader::new(dir.path(), &PipelineConfig::default());
        assert!(loader.get_record_info("ghost").is_none());
        assert!(loader.load_record("ghost").is_none());
        assert!(loader.load_annotations("ghost", "apn").is_none());
        assert!(WfdbLoader::new(dir.path().join("nope"), &PipelineConfig::default())
            .list_records()
            .is_empty());
    }

    #[test]
    fn rr_from_beat_annotations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a01.hea"),
            "a01 1 100 1000\na01.dat 16 200/mV 12 0 0 0 0 ECG\n",
        )
        .unwrap();
        let mut qrs = vec![];
        qrs.extend(ann_word(1, 50));
        qrs.extend(ann_word(1, 80));
        qrs.extend(ann_word(1, 100));
        qrs.extend(0u16.to_le_bytes());
        fs::write(dir.path().join("a01.qrs"), qrs).unwrap();

        let loader = WfdbLoader::new(dir.path(), &PipelineConfig::default());
        let rr = loader.load_rr("a01").unwrap();
        assert_eq!(rr.rr, vec![0.8, 1.0]);
        assert_eq!(loader.load_sequence("a01").unwrap().len(), 2);
    }

    #[test]
    fn accessors_expose_matrix_and_annotation_columns() {
        let record = Record {
            name: "x".into(),
            fs: 100.0,
            channels: vec![
                Channel {
                    name: "Resp".into(),
                    units: "mV".into(),
                    data: vec![4.0, 5.0],
                },
                Channel {
                    name: "ECG".into(),
                    units: "mV".into(),
                    data: vec![1.0, 2.0, 3.0],
                },
            ],
        };
        let (signals, fs) = extract_signals(&record);
        assert_eq!(fs, 100.0);
        assert_eq!(signals.dim(), (3, 2));
        // header order, not alphabetical
        assert_eq!(signals[[1, 1]], 2.0);
        assert!(signals[[2, 0]].is_nan());
        assert_eq!(record.ecg().unwrap().data, vec![1.0, 2.0, 3.0]);

        let ann = Annotations {
            samples: vec![0, 6000],
            symbols: vec!["N".into(), "A".into()],
            aux: vec![String::new(), String::new()],
        };
        let (samples, symbols) = extract_annotations(&ann);
        assert_eq!(samples, &[0, 6000]);
        assert_eq!(symbols[1], "A");
    }

    #[test]
    fn duplicate_channel_names_get_lead_suffix() {
        let names = unique_channel_names(&[
            "ECG".to_string(),
            "Resp".to_string(),
            "ECG".to_string(),
        ]);
        assert_eq!(names, vec!["ECG", "Resp", "ECG_2"]);
    }

    #[test]
    fn ecg_falls_back_to_first_header_channel() {
        let record = Record {
            name: "x".into(),
            fs: 100.0,
            channels: vec![
                Channel {
                    name: "Resp".into(),
                    units: "mV".into(),
                    data: vec![1.0],
                },
                Channel {
                    name: "Abdo".into(),
                    units: "mV".into(),
                    data: vec![2.0],
                },
            ],
        };
        assert_eq!(record.ecg().unwrap().data, vec![1.0]);
    }
}
