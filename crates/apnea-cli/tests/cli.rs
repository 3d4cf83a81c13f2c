use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use std::{error::Error, fs, path::Path, path::PathBuf};

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .expect("crates dir")
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

fn sample_path(relative: &str) -> String {
    workspace_root()
        .join(relative)
        .to_string_lossy()
        .to_string()
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

// Minimal level 5 MAT writer: one double column vector per file.
fn element(ty: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(ty.to_le_bytes());
    out.extend((data.len() as u32).to_le_bytes());
    out.extend(data);
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

fn mat_vector(name: &str, data: &[f64]) -> Vec<u8> {
    let mut flags = Vec::new();
    flags.extend(6u32.to_le_bytes());
    flags.extend(0u32.to_le_bytes());
    let dims: Vec<u8> = [data.len() as i32, 1]
        .iter()
        .flat_map(|d| d.to_le_bytes())
        .collect();
    let values: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut body = Vec::new();
    body.extend(element(6, &flags));
    body.extend(element(5, &dims));
    body.extend(element(1, name.as_bytes()));
    body.extend(element(9, &values));

    let mut buf = vec![b' '; 128];
    let text = b"MATLAB 5.0 MAT-file, cli fixture";
    buf[..text.len()].copy_from_slice(text);
    buf[124..126].copy_from_slice(&0x0100u16.to_le_bytes());
    buf[126..128].copy_from_slice(b"IM");
    buf.extend(element(14, &body));
    buf
}

fn write_mat_dataset(root: &Path, samples: usize) -> Result<(), Box<dyn Error>> {
    let rr_dir = root.join("RR");
    fs::create_dir_all(&rr_dir)?;
    for (i, name) in ["A01", "A02", "A03", "A04", "C01", "C02", "C03", "C04"]
        .iter()
        .enumerate()
    {
        let apnea = name.starts_with('A');
        let rr: Vec<f64> = (0..samples)
            .map(|j| {
                let swing = if apnea { 0.12 * (j as f64 * 0.9).sin() } else { 0.01 };
                0.85 + swing + 0.002 * i as f64
            })
            .collect();
        fs::write(rr_dir.join(format!("{name}.mat")), mat_vector("rr", &rr))?;
    }
    Ok(())
}

#[test]
fn train_rf_reports_every_fold() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("models").join("rf.json");
    let config = dir.path().join("config.toml");
    fs::write(&config, "[forest]\nn_estimators = 20\n")?;

    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args([
        "train",
        "--model-type",
        "rf",
        "--data-path",
        &sample_path("test_data/features_small.csv"),
        "--output-path",
        path_str(&model_path),
        "--config",
        path_str(&config),
    ]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: Value = serde_json::from_slice(&output)?;

    assert_eq!(summary["model_type"], "rf");
    assert_eq!(summary["n_rows"], 60);
    assert_eq!(summary["folds"].as_array().map(Vec::len), Some(5));
    assert_eq!(
        summary["feature_names"],
        serde_json::json!(["mean_rr", "sdnn", "rmssd", "lf_hf"])
    );
    assert!(summary["mean_accuracy"].as_f64().unwrap_or(0.0) > 0.9);
    assert!(model_path.exists());
    Ok(())
}

#[test]
fn train_cnn_lstm_on_mat_layout() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    write_mat_dataset(dir.path(), 40)?;
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        "[cnn_lstm]\nconv1_filters = 4\nconv2_filters = 4\nlstm_units = 4\ndense_units = 4\nbatch_size = 8\n",
    )?;
    let model_path = dir.path().join("cnn_lstm.json");

    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args([
        "train",
        "--model-type",
        "cnn_lstm",
        "--data-path",
        path_str(dir.path()),
        "--output-path",
        path_str(&model_path),
        "--config",
        path_str(&config),
        "--segment-seconds",
        "20",
        "--epochs",
        "2",
    ]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: Value = serde_json::from_slice(&output)?;

    assert_eq!(summary["model_type"], "cnn-lstm");
    assert_eq!(summary["segment_len"], 20);
    let test_records = summary["test_records"].as_array().map(Vec::len).unwrap_or(0);
    assert_eq!(summary["test_segments"], 2 * test_records as u64);
    let accuracy = summary["test_accuracy"].as_f64().unwrap_or(-1.0);
    assert!((0.0..=1.0).contains(&accuracy));
    assert!(model_path.exists());
    Ok(())
}

#[test]
fn extract_features_from_mat_layout() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    write_mat_dataset(dir.path(), 150)?;
    let out = dir.path().join("features.csv");

    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args([
        "extract-features",
        "--data-dir",
        path_str(dir.path()),
        "--output",
        path_str(&out),
        "--format",
        "mat",
    ]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let result: Value = serde_json::from_slice(&output)?;
    let rows = result["rows"].as_u64().unwrap_or(0);
    assert!(rows >= 8);

    let text = fs::read_to_string(&out)?;
    let header = text.lines().next().unwrap_or_default();
    assert!(header.starts_with("filename,"));
    assert!(header.ends_with(",label"));
    assert_eq!(text.lines().count() as u64, rows + 1);
    Ok(())
}

#[test]
fn summary_lists_wfdb_records() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    for name in ["a01", "b01", "c01"] {
        fs::write(
            dir.path().join(format!("{name}.hea")),
            format!("{name} 1 100 6000\n{name}.dat 16 200/mV 12 0 0 0 0 ECG\n"),
        )?;
    }

    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args(["summary", "--data-dir", path_str(dir.path()), "--sample", "2"]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: Value = serde_json::from_slice(&output)?;

    assert_eq!(summary["total_records"], 3);
    assert_eq!(summary["record_names"], serde_json::json!(["a01", "b01", "c01"]));
    assert_eq!(summary["records_info"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn unknown_model_type_is_rejected() {
    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args([
        "train",
        "--model-type",
        "svm",
        "--data-path",
        "features.csv",
        "--output-path",
        "model.json",
    ]);
    cmd.assert().failure();
}

#[test]
fn missing_feature_file_fails() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = cargo_bin_cmd!("apnea");
    cmd.args([
        "train",
        "--data-path",
        path_str(&dir.path().join("absent.csv")),
        "--output-path",
        path_str(&dir.path().join("rf.json")),
    ]);
    cmd.assert().failure();
    assert!(!dir.path().join("rf.json").exists());
    Ok(())
}
