use anyhow::Result;
use insta::{Settings, assert_snapshot};
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;

use kfto_e2e::client::memory::InMemoryCluster;
use kfto_e2e::config::HarnessConfig;
use kfto_e2e::content::EmbeddedResources;
use kfto_e2e::scenarios::runner::render;
use kfto_e2e::scenarios::{ScenarioEnv, scenario_by_name};

/// helper to run the binary and capture output
fn run_command(args: &[&str], env_vars: &[(&str, &str)]) -> Result<(String, String, i32)> {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kfto-e2e"));
    cmd.args(args);

    for (key, value) in env_vars {
        cmd.env(key, value);
    }

    let output = cmd.output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    Ok((stdout, stderr, exit_code))
}

fn offline_env() -> ScenarioEnv {
    ScenarioEnv {
        client: Arc::new(InMemoryCluster::new()),
        config: HarnessConfig::default(),
        content: Arc::new(EmbeddedResources),
        metrics: None,
        api_url: "https://api.example.com:6443".to_string(),
    }
}

/// snapshot of the namespace and Kueue objects the GPU HPO scenario submits
#[test]
fn test_raytune_queue_manifests() -> Result<()> {
    let scenario = scenario_by_name("raytune-hpo-gpu").expect("scenario exists");
    let rendered = render(scenario.as_ref(), "test-ns-snapshot", &offline_env())?;

    // namespace, flavor, cluster queue, local queue
    let manifests = rendered
        .split("---\n")
        .take(4)
        .collect::<Vec<_>>()
        .join("---\n");

    let mut settings = Settings::clone_current();
    settings.set_snapshot_path("../snapshots");
    settings.bind(|| {
        assert_snapshot!("raytune_queue_manifests", manifests);
    });

    Ok(())
}

#[test]
fn test_list_shows_every_scenario() -> Result<()> {
    let (stdout, _stderr, exit_code) = run_command(&["list"], &[])?;

    assert_eq!(exit_code, 0);
    for name in [
        "mnist-cpu-single",
        "mnist-cpu-multi",
        "mnist-cuda-single-gpu",
        "mnist-cuda-multi-gpu",
        "mnist-rocm-single-gpu",
        "mnist-rocm-multi-gpu",
        "raytune-hpo-cpu",
        "raytune-hpo-gpu",
    ] {
        assert!(stdout.contains(name), "missing {} in:\n{}", name, stdout);
    }
    Ok(())
}

#[test]
fn test_render_redacts_notebook_token() -> Result<()> {
    let (stdout, stderr, exit_code) = run_command(
        &["render", "raytune-hpo-cpu", "--namespace", "test-ns-cli"],
        &[
            ("KFTO_NOTEBOOK_USER_NAME", "developer"),
            ("KFTO_NOTEBOOK_USER_TOKEN", "sha256~do-not-print"),
        ],
    )?;

    assert_eq!(exit_code, 0, "{}", stderr);
    assert!(!stdout.contains("sha256~do-not-print"));
    assert!(stdout.contains("kind: Notebook"));
    assert!(stdout.contains("namespace: test-ns-cli"));
    Ok(())
}

#[test]
fn test_unknown_scenario_is_rejected() -> Result<()> {
    let (_stdout, stderr, exit_code) = run_command(&["run", "mnist-tpu", "--dry-run"], &[])?;

    assert_ne!(exit_code, 0);
    assert!(stderr.contains("unknown scenario 'mnist-tpu'"));
    Ok(())
}

#[test]
fn test_config_schema_is_json() -> Result<()> {
    let (stdout, _stderr, exit_code) = run_command(&["config-schema"], &[])?;

    assert_eq!(exit_code, 0);
    let schema: Value = serde_json::from_str(&stdout)?;
    assert!(schema["properties"]["timeouts"].is_object());
    Ok(())
}

/// full CPU training run; needs a cluster with the training operator
#[test]
#[ignore]
fn test_mnist_cpu_run_on_cluster() -> Result<()> {
    let report = std::env::temp_dir().join("kfto-e2e-report.json");
    let report_path = report.to_string_lossy().to_string();
    let (stdout, stderr, exit_code) = run_command(
        &["run", "mnist-cpu-single", "--report", &report_path],
        &[],
    )?;

    assert_eq!(exit_code, 0, "{}{}", stderr, stdout);
    let reports: Value = serde_json::from_str(&std::fs::read_to_string(&report)?)?;
    assert_eq!(reports[0]["outcome"], "passed");
    assert_eq!(reports[0]["stages"].as_array().map(Vec::len), Some(2));
    Ok(())
}
