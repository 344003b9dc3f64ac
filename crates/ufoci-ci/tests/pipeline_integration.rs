//! Integration tests for the build pipeline against a local git repository
//! and script stand-ins for the hardware.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ufoci_ci::{BuildPipeline, BuildReport, BuildRequest, BUILD_REPORT_FILE, FAILURE_FILE};
use ufoci_core::hooks::HookRegistry;
use ufoci_core::testing::REPORT_FILE;
use ufoci_core::{BuildLock, Config, UfoError};

const BITFILE: &[u8] = b"\x00\x09\x0f\xf0 fake bitstream";

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(["-c", "user.name=ufoci", "-c", "user.email=ufoci@localhost"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Hardware repository with a bitfile and a build-provided reset script.
fn hardware_repo(root: &Path, with_bitfile: bool) -> PathBuf {
    let repo = root.join("ufo-target");
    fs::create_dir_all(repo.join("scripts")).unwrap();
    if with_bitfile {
        fs::create_dir_all(repo.join("bitfile")).unwrap();
        fs::write(repo.join("bitfile/ufo.bit"), BITFILE).unwrap();
    }
    fs::write(repo.join("scripts/reset.sh"), "echo '9050:  0000'\n").unwrap();
    run_git(&repo, &["init", "-q"]);
    run_git(&repo, &["checkout", "-q", "-b", "main"]);
    run_git(&repo, &["add", "."]);
    run_git(&repo, &["commit", "-q", "-m", "initial"]);
    repo
}

/// Home folder whose flash script records its argument.
fn home(root: &Path) -> Config {
    let home = root.join("home");
    fs::create_dir_all(home.join("scripts")).unwrap();
    fs::write(
        home.join("scripts/flash.sh"),
        format!("echo \"$1\" > {}\n", home.join("flashed.txt").display()),
    )
    .unwrap();
    fs::write(
        home.join("config.toml"),
        r#"
[ci]
test_suite = "ci"

[[ci.build_scripts]]
name = "reset"
relative_path = "scripts/reset.sh"
description = "Reset shipped with the hardware"

[tests.suites]
ci = ["mock", "loaded_scripts"]
"#,
    )
    .unwrap();
    Config::load(&home).unwrap()
}

fn request(repo: &Path) -> BuildRequest {
    BuildRequest {
        repository_url: repo.to_string_lossy().to_string(),
        branch: "main".to_string(),
        commit: "FETCH_HEAD".to_string(),
    }
}

fn build_folders(config: &Config) -> Vec<PathBuf> {
    match fs::read_dir(config.builds_path()) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_successful_build() {
    let root = tempfile::tempdir().unwrap();
    let repo = hardware_repo(root.path(), true);
    let config = home(root.path());
    let pipeline = BuildPipeline::new(config.clone(), Arc::new(HookRegistry::new()));

    let report = pipeline.run(request(&repo)).await.expect("build failed");

    // concrete commit recorded instead of FETCH_HEAD
    assert_eq!(report.commit.len(), 40);
    assert_eq!(report.repository_name, "ufo-target");

    // bitfile archived and flashed
    let bitfile = report.bitfile_path.clone().unwrap();
    assert!(bitfile.starts_with(&report.archive_path));
    assert_eq!(fs::read(&bitfile).unwrap(), BITFILE);
    assert_eq!(report.bitfile_sha256.as_ref().unwrap().len(), 64);
    let flashed = fs::read_to_string(config.home.join("flashed.txt")).unwrap();
    assert_eq!(flashed.trim(), bitfile.to_string_lossy());

    // loaded_scripts fails because only reset comes from the build
    assert_eq!(report.test_report.test_count, 2);
    assert_eq!(report.test_report.success_ratio, 0.5);

    // reports archived, clone removed, lock released
    assert!(report.archive_path.join(REPORT_FILE).is_file());
    let saved = BuildReport::load(&report.archive_path.join(BUILD_REPORT_FILE)).unwrap();
    assert_eq!(saved.build_id, report.build_id);
    assert!(!config.home.join("ufo-target").exists());
    assert!(!BuildLock::new(config.lock_path()).is_locked());
}

#[tokio::test]
async fn test_build_rejected_while_locked() {
    let root = tempfile::tempdir().unwrap();
    let repo = hardware_repo(root.path(), true);
    let config = home(root.path());
    let lock = BuildLock::new(config.lock_path());
    lock.acquire().unwrap();

    let pipeline = BuildPipeline::new(config.clone(), Arc::new(HookRegistry::new()));
    let err = pipeline.run(request(&repo)).await.unwrap_err();

    assert!(matches!(err, UfoError::LockHeld { .. }));
    assert!(build_folders(&config).is_empty());
    assert!(!config.home.join("ufo-target").exists());
    assert!(lock.is_locked(), "the foreign lock must stay in place");
}

#[tokio::test]
async fn test_missing_bitfile_fails_flash_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let repo = hardware_repo(root.path(), false);
    let config = home(root.path());
    let pipeline = BuildPipeline::new(config.clone(), Arc::new(HookRegistry::new()));

    let err = pipeline.run(request(&repo)).await.unwrap_err();
    assert!(matches!(err, UfoError::BuildStage { ref stage, .. } if stage == "flash"));
    assert_eq!(err.exit_code(), 8);

    let folders = build_folders(&config);
    assert_eq!(folders.len(), 1);
    assert!(folders[0].join(FAILURE_FILE).is_file());
    assert!(!folders[0].join(BUILD_REPORT_FILE).exists());
    assert!(!config.home.join("ufo-target").exists());
    assert!(!BuildLock::new(config.lock_path()).is_locked());
}

#[tokio::test]
async fn test_clone_failure_releases_lock() {
    let root = tempfile::tempdir().unwrap();
    let config = home(root.path());
    let pipeline = BuildPipeline::new(config.clone(), Arc::new(HookRegistry::new()));

    let err = pipeline
        .run(request(&root.path().join("does-not-exist")))
        .await
        .unwrap_err();
    assert!(matches!(err, UfoError::BuildStage { ref stage, .. } if stage == "clone"));
    assert!(!BuildLock::new(config.lock_path()).is_locked());
    assert!(!config.home.join("does-not-exist").exists());
}
