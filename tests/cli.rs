mod common;

use std::fs;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use rstest::*;
use opencv::prelude::*;
use vqpress::utils::{self, ImageFormat};

use common::*;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[fixture]
fn dataset() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.png"), encoded_image(64, 48, ImageFormat::Png, 1)).unwrap();
    fs::write(dir.path().join("b.jpg"), encoded_image(2400, 1200, ImageFormat::Jpeg, 2)).unwrap();
    fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();
    dir
}

#[rstest]
fn compress_directory_without_codec(dataset: TempDir) -> Result<()> {
    let conf_dir = TempDir::new()?;

    cargo_run!("vqpress", "-c", conf_dir.path(), "compress", "--no-codec", dataset.path())
        .success()
        .stdout(predicate::str::contains("[OK]").count(2))
        .stdout(predicate::str::contains("fallback"));

    assert!(dataset.path().join("a_png_compressed.jpg").exists());
    assert!(dataset.path().join("b_compressed.jpg").exists());
    assert!(!dataset.path().join("notes_compressed.jpg").exists());

    // 再次运行时跳过已有的输出文件
    cargo_run!("vqpress", "-c", conf_dir.path(), "compress", "--no-codec", dataset.path())
        .success()
        .stdout(predicate::str::contains("[OK]").count(2));
    Ok(())
}

#[rstest]
fn compress_json_into_output_dir(dataset: TempDir) -> Result<()> {
    let conf_dir = TempDir::new()?;
    let out = TempDir::new()?;

    let assert = cargo_run!(
        "vqpress",
        "-c",
        conf_dir.path(),
        "compress",
        "-f",
        "webp",
        "-o",
        out.path(),
        "--output-format",
        "json",
        dataset.path().join("b.jpg")
    )
    .success();

    let reports: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout)?;
    let report = &reports[0];
    assert_eq!(report["status"], "success");
    assert_eq!(report["method"], "fallback");
    assert_eq!(report["width"], 1920);
    assert_eq!(report["height"], 960);
    assert!(out.path().join("b_compressed.webp").exists());
    Ok(())
}

#[rstest]
fn same_stem_keeps_both_outputs() -> Result<()> {
    let conf_dir = TempDir::new()?;
    let dir = TempDir::new()?;
    fs::write(dir.path().join("photo.png"), encoded_image(40, 30, ImageFormat::Png, 7))?;
    fs::write(dir.path().join("photo.jpg"), encoded_image(50, 40, ImageFormat::Jpeg, 8))?;

    cargo_run!("vqpress", "-c", conf_dir.path(), "compress", "--no-codec", dir.path())
        .success()
        .stdout(predicate::str::contains("[OK]").count(2));

    let from_png = utils::imdecode(&fs::read(dir.path().join("photo_png_compressed.jpg"))?)?;
    let from_jpg = utils::imdecode(&fs::read(dir.path().join("photo_compressed.jpg"))?)?;
    assert_eq!((from_png.cols(), from_png.rows()), (40, 30));
    assert_eq!((from_jpg.cols(), from_jpg.rows()), (50, 40));
    Ok(())
}

#[rstest]
fn duplicate_output_target_fails() -> Result<()> {
    let conf_dir = TempDir::new()?;
    let dir = TempDir::new()?;
    let out = TempDir::new()?;
    for (sub, seed) in [("a", 9), ("b", 10)] {
        fs::create_dir(dir.path().join(sub))?;
        fs::write(dir.path().join(sub).join("x.jpg"), encoded_image(30, 20, ImageFormat::Jpeg, seed))?;
    }

    cargo_run!(
        "vqpress",
        "-c",
        conf_dir.path(),
        "compress",
        "--no-codec",
        "-o",
        out.path(),
        dir.path().join("a"),
        dir.path().join("b")
    )
    .failure()
    .stdout(predicate::str::contains("[OK]").count(1))
    .stderr(predicate::str::contains("已被"));

    let outputs: Vec<_> = fs::read_dir(out.path())?.collect();
    assert_eq!(outputs.len(), 1);
    assert!(out.path().join("x_compressed.jpg").exists());
    Ok(())
}

#[rstest]
fn corrupt_file_reports_failure() -> Result<()> {
    let conf_dir = TempDir::new()?;
    let dir = TempDir::new()?;
    let bad = dir.path().join("bad.png");
    fs::write(&bad, b"garbage")?;

    cargo_run!("vqpress", "-c", conf_dir.path(), "compress", &bad)
        .failure()
        .stderr(predicate::str::contains("[ERR]"));
    assert!(!dir.path().join("bad_compressed.jpg").exists());
    Ok(())
}

#[rstest]
fn compress_with_default_weights(dataset: TempDir) -> Result<()> {
    let conf_dir = TempDir::new()?;
    let config = tiny_config();
    fs::write(conf_dir.path().join("vqgan.npz"), random_weights(&config, 3, true))?;

    cargo_run!(
        "vqpress",
        "-c",
        conf_dir.path(),
        "compress",
        "--resolution",
        "16",
        "--num-embeddings",
        "8",
        "--embedding-dim",
        "8",
        "--hidden",
        "8",
        dataset.path().join("a.png")
    )
    .success()
    .stdout(predicate::str::contains("learned"));
    Ok(())
}

#[rstest]
fn inspect_weights() -> Result<()> {
    let conf_dir = TempDir::new()?;
    let dir = TempDir::new()?;
    let weights = dir.path().join("model.npz");
    let image = dir.path().join("in.png");
    let recon = dir.path().join("recon.png");
    fs::write(&weights, random_weights(&tiny_config(), 4, false))?;
    fs::write(&image, encoded_image(40, 40, ImageFormat::Png, 5))?;

    cargo_run!(
        "vqpress",
        "-c",
        conf_dir.path(),
        "inspect",
        "-w",
        &weights,
        "--resolution",
        "16",
        "--num-embeddings",
        "8",
        "--embedding-dim",
        "8",
        "--hidden",
        "8",
        "-i",
        &image,
        "-r",
        &recon
    )
    .success()
    .stdout(predicate::str::contains("Flat"))
    .stdout(predicate::str::contains("latent          : 4x4"));

    assert!(recon.exists());
    Ok(())
}

#[rstest]
fn inspect_without_weights_fails() -> Result<()> {
    let conf_dir = TempDir::new()?;
    cargo_run!("vqpress", "-c", conf_dir.path(), "inspect").failure();
    Ok(())
}
