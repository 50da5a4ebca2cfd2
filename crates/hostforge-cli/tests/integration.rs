#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn hostforge(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("hostforge").unwrap();
    cmd.current_dir(dir.path()).env_remove("HOSTFORGE_CONFIG");
    cmd
}

fn config_path(dir: &TempDir) -> PathBuf {
    dir.path().join("hostforge.conf")
}

fn init_config(dir: &TempDir) -> PathBuf {
    let path = config_path(dir);
    hostforge(dir)
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    path
}

fn value_of(path: &PathBuf, key: &str) -> String {
    let content = std::fs::read_to_string(path).unwrap();
    content
        .lines()
        .find_map(|l| l.strip_prefix(&format!("{key}=")))
        .unwrap()
        .to_string()
}

// ---------------------------------------------------------------------------
// hostforge stages
// ---------------------------------------------------------------------------

#[test]
fn stages_lists_all_five_in_order() {
    let dir = TempDir::new().unwrap();
    let out = hostforge(&dir).arg("stages").assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    let positions: Vec<usize> = ["hardening", "docker", "wireguard", "monitoring", "alerting"]
        .iter()
        .map(|name| stdout.find(name).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{stdout}");
}

#[test]
fn stages_json_includes_dependencies() {
    let dir = TempDir::new().unwrap();
    let out = hostforge(&dir).args(["stages", "--json"]).assert().success();
    let stages: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(stages.as_array().unwrap().len(), 5);
    assert_eq!(stages[4]["name"], "alerting");
    assert_eq!(stages[4]["depends_on"], serde_json::json!(["monitoring"]));
    assert_eq!(stages[0]["depends_on"], serde_json::json!([]));
}

// ---------------------------------------------------------------------------
// hostforge config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_template_with_generated_password() {
    let dir = TempDir::new().unwrap();
    let path = init_config(&dir);
    let password = value_of(&path, "GRAFANA_ADMIN_PASSWORD");
    assert_eq!(password.len(), 24);
    assert_eq!(value_of(&path, "SSH_PORT"), "2222");
}

#[test]
fn config_init_refuses_to_overwrite_without_force() {
    let dir = TempDir::new().unwrap();
    let path = init_config(&dir);
    std::fs::write(&path, "SSH_PORT=2200\n").unwrap();

    hostforge(&dir)
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "SSH_PORT=2200\n");

    hostforge(&dir)
        .args(["config", "init", "--force", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(std::fs::read_to_string(&path).unwrap().contains("GRAFANA_ADMIN_PASSWORD="));
}

#[test]
fn config_validate_accepts_fresh_template() {
    let dir = TempDir::new().unwrap();
    let path = init_config(&dir);
    hostforge(&dir)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("[warning] SMTP_PASSWORD is empty"));
}

#[test]
fn config_validate_reports_errors_and_fails() {
    let dir = TempDir::new().unwrap();
    let path = config_path(&dir);
    std::fs::write(&path, "ADMIN_USER=root\nGRAFANA_ADMIN_PASSWORD=pw\n").unwrap();
    hostforge(&dir)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] ADMIN_USER must not be root"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_rejects_unparseable_value() {
    let dir = TempDir::new().unwrap();
    let path = config_path(&dir);
    std::fs::write(&path, "GRAFANA_PORT=eighty\n").unwrap();
    hostforge(&dir)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("GRAFANA_PORT"));
}

#[test]
fn config_show_masks_secrets() {
    let dir = TempDir::new().unwrap();
    let path = init_config(&dir);
    let password = value_of(&path, "GRAFANA_ADMIN_PASSWORD");

    let out = hostforge(&dir)
        .args(["config", "show", "--json", "--config"])
        .arg(&path)
        .assert()
        .success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    assert!(!stdout.contains(&password));
    let shown: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(shown["monitoring"]["grafana_admin_password"], "********");
    assert_eq!(shown["vpn"]["subnet"], "10.8.0.0/24");
}

#[test]
fn environment_overrides_file_in_show() {
    let dir = TempDir::new().unwrap();
    let path = init_config(&dir);
    hostforge(&dir)
        .args(["config", "show", "--config"])
        .arg(&path)
        .env("SSH_PORT", "2345")
        .assert()
        .success()
        .stdout(predicate::str::contains("ssh_port: 2345"));
}

// ---------------------------------------------------------------------------
// hostforge run / stage
// ---------------------------------------------------------------------------

#[test]
fn run_without_config_scaffolds_template_and_stops() {
    let dir = TempDir::new().unwrap();
    let path = config_path(&dir);
    hostforge(&dir)
        .args(["run", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("wrote a configuration template"));
    assert!(path.exists());
    assert_eq!(value_of(&path, "GRAFANA_ADMIN_PASSWORD").len(), 24);
}

#[test]
fn stage_with_unknown_name_fails_before_loading_config() {
    let dir = TempDir::new().unwrap();
    hostforge(&dir)
        .args(["stage", "firewall"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stage 'firewall'"));
    assert!(!config_path(&dir).exists());
}

// ---------------------------------------------------------------------------
// hostforge vpn
// ---------------------------------------------------------------------------

#[test]
fn client_qr_without_profile_fails() {
    let dir = TempDir::new().unwrap();
    hostforge(&dir)
        .args(["vpn", "client-qr", "--name", "no-such-client-hostforge-test"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run the wireguard stage first"));
}
