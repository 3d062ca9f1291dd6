//! Integration tests for checkpoint selection and averaging.

use std::collections::HashMap;
use std::path::PathBuf;

use asr_core::{average_checkpoints, save_checkpoint, select_checkpoints, AsrError, SelectOptions};
use candle_core::{DType, Device, Tensor};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rustasr-ckpt-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_ckpt(dir: &PathBuf, tag: &str, value: f32) {
    let device = Device::Cpu;
    let mut map = HashMap::new();
    map.insert(
        "encoder.w".to_string(),
        Tensor::full(value, (2, 3), &device).unwrap(),
    );
    map.insert(
        "encoder.b".to_string(),
        Tensor::full(value * 2.0, 3, &device).unwrap(),
    );
    save_checkpoint(&map, dir.join(format!("{tag}.safetensors"))).unwrap();
}

fn write_epoch_json(dir: &PathBuf, epoch: u64, tag: &str, loss: f64) {
    let json = format!(r#"{{"epoch": {epoch}, "tag": "{tag}", "result_dict": {{"loss": {loss}}}}}"#);
    std::fs::write(dir.join(format!("epoch_{epoch}.json")), json).unwrap();
}

#[test]
fn test_average_latest_checkpoints() {
    let dir = scratch_dir("latest");
    write_ckpt(&dir, "init", 100.0);
    write_ckpt(&dir, "epoch_1", 1.0);
    write_ckpt(&dir, "epoch_2", 3.0);

    let opts = SelectOptions::new(&dir, 2);
    let paths = select_checkpoints(&opts).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| !p.ends_with("init.safetensors")));

    let avg = average_checkpoints(&paths, 2, &Device::Cpu).unwrap();
    let w: Vec<Vec<f32>> = avg["encoder.w"].to_vec2().unwrap();
    assert!(w.iter().flatten().all(|&v| (v - 2.0).abs() < 1e-6));
    let b: Vec<f32> = avg["encoder.b"].to_vec1().unwrap();
    assert!(b.iter().all(|&v| (v - 4.0).abs() < 1e-6));
    assert_eq!(avg["encoder.w"].dtype(), DType::F32);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_val_best_picks_lowest_loss_in_range() {
    let dir = scratch_dir("val-best");
    write_ckpt(&dir, "epoch_1", 1.0);
    write_ckpt(&dir, "epoch_2", 2.0);
    write_ckpt(&dir, "epoch_3", 10.0);
    write_ckpt(&dir, "epoch_4", 4.0);
    write_epoch_json(&dir, 1, "epoch_1", 0.9);
    write_epoch_json(&dir, 2, "epoch_2", 0.5);
    write_epoch_json(&dir, 3, "epoch_3", 0.1);
    write_epoch_json(&dir, 4, "epoch_4", 0.4);

    let opts = SelectOptions {
        val_best: true,
        max_epoch: 4,
        min_epoch: 2,
        ..SelectOptions::new(&dir, 2)
    };
    let paths = select_checkpoints(&opts).unwrap();
    assert_eq!(
        paths,
        vec![dir.join("epoch_3.safetensors"), dir.join("epoch_4.safetensors")]
    );

    let avg = average_checkpoints(&paths, 2, &Device::Cpu).unwrap();
    let w: Vec<Vec<f32>> = avg["encoder.w"].to_vec2().unwrap();
    assert!((w[0][0] - 7.0).abs() < 1e-6);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_count_mismatch_is_an_error() {
    let dir = scratch_dir("mismatch");
    write_ckpt(&dir, "epoch_1", 1.0);

    let opts = SelectOptions::new(&dir, 5);
    let paths = select_checkpoints(&opts).unwrap();
    let err = average_checkpoints(&paths, 5, &Device::Cpu).unwrap_err();
    assert!(matches!(err, AsrError::Checkpoint(_)));

    std::fs::remove_dir_all(&dir).ok();
}
