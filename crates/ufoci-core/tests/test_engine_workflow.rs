//! End-to-end test engine run against a scratch home folder: plugins,
//! config-defined scripts and a user test module.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ufoci_core::hooks::HookRegistry;
use ufoci_core::testing::{ResultBody, TestSource, REPORT_FILE};
use ufoci_core::{Config, ScriptManager, TestRunner, UfoError};

fn write_home(home: &Path) {
    fs::create_dir_all(home.join("scripts")).unwrap();
    fs::write(
        home.join("scripts/Reset_all.sh"),
        "echo 'Reset done'\necho '9010:  0001'\necho '9050:  0000'\n",
    )
    .unwrap();
    fs::write(home.join("scripts/status.sh"), "echo '9050:  000f'\nexit 0\n").unwrap();

    fs::create_dir_all(home.join("tests")).unwrap();
    fs::write(
        home.join("tests/registers.toml"),
        r#"
[[test]]
name = "status_registers"
description = "Status registers report no PCI error"
script = "status"
check_pci = true
"#,
    )
    .unwrap();

    fs::write(
        home.join("config.toml"),
        r#"
[tests]
reset_repetitions = 2

[tests.suites]
hardware = ["mock", "repeated_reset", "status_registers"]
"#,
    )
    .unwrap();
}

#[tokio::test]
async fn suite_run_combines_builtin_and_folder_tests() {
    let home = tempfile::tempdir().unwrap();
    write_home(home.path());

    let config = Config::load(home.path()).unwrap();
    let mut hooks = HookRegistry::new();
    assert_eq!(hooks.load_plugins(&config.plugin_path()).unwrap(), 0);
    let hooks = Arc::new(hooks);
    let scripts = Arc::new(ScriptManager::new(&config, hooks.clone()).unwrap());

    let runner = TestRunner::new(hooks, scripts).unwrap();
    assert!(matches!(
        runner.catalog().source("status_registers"),
        Some(TestSource::Folder(_))
    ));

    let report = runner.run_suite("hardware").await.unwrap();
    assert_eq!(report.test_count, 3);
    assert_eq!(report.passing_count, 2);
    assert_eq!(report.success_ratio, 0.67);
    assert!(!report.results["status_registers"].passing());

    match &report.results["repeated_reset"].body {
        ResultBody::Assertions { assertions, error_count } => {
            // exit code plus two register lines per repetition
            assert_eq!(assertions.len(), 6);
            assert_eq!(*error_count, 0);
        }
        other => panic!("unexpected body {other:?}"),
    }

    let saved = report.folder_path.join(REPORT_FILE);
    assert!(saved.starts_with(home.path().join("archive")));
    assert!(saved.is_file());
}

#[tokio::test]
async fn plugin_load_failure_surfaces() {
    let home = tempfile::tempdir().unwrap();
    let plugin = home.path().join("plugins/relay");
    fs::create_dir_all(&plugin).unwrap();
    fs::write(plugin.join("plugin.toml"), "entry = \"not_compiled_in\"\n").unwrap();

    let config = Config::load(home.path()).unwrap();
    let err = HookRegistry::new()
        .load_plugins(&config.plugin_path())
        .unwrap_err();
    assert!(matches!(err, UfoError::PluginLoad { ref plugin, .. } if plugin == "relay"));
    assert_eq!(err.exit_code(), 6);
}
