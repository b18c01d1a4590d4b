//! CLI end-to-end tests
//!
//! Tests for the parallax command-line interface.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

/// Get a command for the parallax binary
#[allow(deprecated)]
fn parallax_cmd() -> Command {
    Command::cargo_bin("parallax").unwrap()
}

#[test]
fn test_cli_no_args_shows_help() {
    let mut cmd = parallax_cmd();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let mut cmd = parallax_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallax"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_flag() {
    let mut cmd = parallax_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallax"));
}

#[test]
fn test_cli_play_help() {
    let mut cmd = parallax_cmd();
    cmd.args(["play", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--reversed"))
        .stdout(predicate::str::contains("--synthetic"));
}

#[test]
fn test_cli_detect_half_sbs() {
    let mut cmd = parallax_cmd();
    cmd.args(["detect", "Movie", "Half-SBS"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stereoscopic: yes (hsbs)"));
}

#[test]
fn test_cli_detect_plain_video() {
    let mut cmd = parallax_cmd();
    cmd.args(["detect", "Drama", "HD"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stereoscopic: no"));
}

#[test]
fn test_cli_detect_json() {
    let mut cmd = parallax_cmd();
    let output = cmd.args(["detect", "3D", "--json"]).output().unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["is_stereoscopic"], true);
    assert_eq!(value["format"], "side_by_side");
}

#[test]
fn test_cli_dims_over_under() {
    let mut cmd = parallax_cmd();
    cmd.args(["dims", "--format", "ou", "1920", "2160"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1920x1080 per eye"));
}

#[test]
fn test_cli_dims_rejects_unknown_format() {
    let mut cmd = parallax_cmd();
    cmd.args(["dims", "--format", "anaglyph", "1920", "1080"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stereo format"));
}

#[test]
fn test_cli_validate_config() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, r#"{"cache": {"max_bytes": 1048576}}"#).unwrap();

    let mut cmd = parallax_cmd();
    cmd.args(["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("1048576 bytes"));
}

#[test]
fn test_cli_validate_reports_warnings() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, r#"{"cache": {"max_bytes": 0}}"#).unwrap();

    let mut cmd = parallax_cmd();
    cmd.args(["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("cache.max_bytes is 0"));
}

#[test]
fn test_cli_validate_rejects_zero_frame_rate() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, r#"{"transcode": {"default_frame_rate": 0}}"#).unwrap();

    let mut cmd = parallax_cmd();
    cmd.args(["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("default_frame_rate"));
}

#[test]
fn test_cli_validate_invalid_json() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, "{ not json").unwrap();

    let mut cmd = parallax_cmd();
    cmd.args(["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config parse error"));
}

#[test]
fn test_cli_cache_stats_empty() {
    let dir = tempdir().unwrap();

    let mut cmd = parallax_cmd();
    cmd.args(["cache", "stats", "--cache-dir", dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries: 0"));
}

#[test]
fn test_cli_cache_remove_missing_entry() {
    let dir = tempdir().unwrap();

    let mut cmd = parallax_cmd();
    cmd.args([
        "cache",
        "remove",
        "scene-1",
        "sbs_n_90_200",
        "--cache-dir",
        dir.path().to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("No entry for scene-1_sbs_n_90_200"));
}

#[test]
fn test_cli_selftest() {
    let mut cmd = parallax_cmd();
    cmd.arg("selftest")
        .assert()
        .success()
        .stdout(predicate::str::contains("sbs_n_90_200"))
        .stdout(predicate::str::contains("sbs_r_90_200"))
        .stdout(predicate::str::contains("cache holds 2 entries"));
}

#[test]
fn test_cli_play_synthetic_file_source() {
    let dir = tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let source = dir.path().join("clip.json");
    px_av::SyntheticPattern::new(64, 16, 30.0, 5).write_to(&source).unwrap();

    let mut cmd = parallax_cmd();
    cmd.args([
        "play",
        &format!("file://{}", source.display()),
        "--id",
        "clip",
        "--synthetic",
        "--reversed",
        "--cache-dir",
        cache_dir.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Key: clip_sbs_r_90_200"));

    let mut cmd = parallax_cmd();
    cmd.args(["cache", "list", "--cache-dir", cache_dir.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("clip_sbs_r_90_200"));
}
