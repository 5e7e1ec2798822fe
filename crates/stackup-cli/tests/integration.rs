#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn stackup(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stackup").unwrap();
    cmd.current_dir(dir.path())
        .env("STACKUP_ROOT", dir.path())
        .env_remove("STACKUP_ENV")
        .env_remove("STACKUP_DRY_RUN")
        .env_remove("STACKUP_AUTO_APPROVE");
    cmd
}

/// A three-component stack whose drivers only touch marker files.
/// `gateway_deploy` replaces the gateway's deploy command.
fn write_stack(dir: &TempDir, gateway_deploy: &str) {
    let yaml = format!(
        r#"version: 1
components:
  - name: nomad
    kind: substrate
    rank: 0
    health:
      probe: {{ type: command, command: "true" }}
      interval_secs: 1
      timeout_secs: 2
    driver:
      deploy: touch deployed-nomad
      stop: touch stopped-nomad
      reload: touch reloaded-nomad
  - name: vault
    kind: secrets_manager
    rank: 1
    depends_on: [nomad]
    health:
      probe: {{ type: command, command: "true" }}
      interval_secs: 1
      timeout_secs: 2
    driver:
      deploy: touch deployed-vault
      stop: touch stopped-vault
  - name: traefik
    kind: gateway
    rank: 2
    depends_on: [vault]
    health:
      probe: {{ type: command, command: "true" }}
      interval_secs: 1
      timeout_secs: 2
    driver:
      deploy: "{gateway_deploy}"
      stop: touch stopped-traefik
    config: |
      entryPoints:
        web:
          address: ":80"
"#
    );
    std::fs::create_dir_all(dir.path().join(".stackup")).unwrap();
    std::fs::write(dir.path().join(".stackup/stack.yaml"), yaml).unwrap();
}

fn deploy_json(dir: &TempDir, extra: &[&str]) -> (i32, serde_json::Value) {
    let out = stackup(dir)
        .args(["deploy", "--json"])
        .args(extra)
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "invalid report json ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
    });
    (out.status.code().unwrap_or(-1), report)
}

fn statuses(report: &serde_json::Value) -> Vec<String> {
    report["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["status"].as_str().unwrap().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// stackup init
// ---------------------------------------------------------------------------

#[test]
fn init_writes_default_stack() {
    let dir = TempDir::new().unwrap();
    stackup(&dir).arg("init").assert().success();

    let content = std::fs::read_to_string(dir.path().join(".stackup/stack.yaml")).unwrap();
    for name in ["consul", "nomad", "vault", "traefik"] {
        assert!(content.contains(name), "missing {name}");
    }
    assert!(dir.path().join(".stackup/snapshots").is_dir());
}

#[test]
fn init_never_overwrites() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    let before = std::fs::read_to_string(dir.path().join(".stackup/stack.yaml")).unwrap();

    stackup(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists"));

    let after = std::fs::read_to_string(dir.path().join(".stackup/stack.yaml")).unwrap();
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// stackup deploy
// ---------------------------------------------------------------------------

#[test]
fn deploy_without_init_exits_2() {
    let dir = TempDir::new().unwrap();
    stackup(&dir)
        .arg("deploy")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn deploy_brings_up_stack_and_integrates() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");

    let (code, report) = deploy_json(&dir, &[]);
    assert_eq!(code, 0, "{report}");
    assert_eq!(statuses(&report), ["succeeded", "succeeded", "succeeded"]);
    assert_eq!(report["phase"], "integrated");
    assert_eq!(report["exit_code"], 0);

    for name in ["nomad", "vault", "traefik"] {
        assert!(dir.path().join(format!("deployed-{name}")).exists());
    }
    assert!(dir.path().join("reloaded-nomad").exists());
    let rendered = std::fs::read_to_string(dir.path().join(".stackup/rendered/nomad.conf")).unwrap();
    assert!(rendered.contains("create_from_role"));
    assert!(rendered.contains("http://127.0.0.1:8200"));
    let gateway = std::fs::read_to_string(dir.path().join(".stackup/rendered/traefik.conf")).unwrap();
    assert!(gateway.contains("entryPoints"));
}

#[test]
fn second_deploy_skips_everything() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    let (code, _) = deploy_json(&dir, &[]);
    assert_eq!(code, 0);
    std::fs::remove_file(dir.path().join("deployed-vault")).unwrap();

    let (code, report) = deploy_json(&dir, &[]);
    assert_eq!(code, 0);
    assert_eq!(statuses(&report), ["skipped", "skipped", "skipped"]);
    assert!(!dir.path().join("deployed-vault").exists(), "vault was redeployed");
}

#[test]
fn failing_gateway_exits_1_and_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "echo port 80 in use >&2; exit 1");

    let (code, report) = deploy_json(&dir, &[]);
    assert_eq!(code, 1);
    assert_eq!(statuses(&report), ["succeeded", "succeeded", "failed"]);
    let traefik = &report["components"][2];
    assert!(traefik["message"].as_str().unwrap().contains("port 80 in use"));
    assert_eq!(traefik["rollback"]["outcome"], "rolled_back");
    assert!(dir.path().join("stopped-traefik").exists());
    // The gateway does not gate the phase switch.
    assert_eq!(report["phase"], "integrated");
}

#[test]
fn dry_run_touches_nothing() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");

    stackup(&dir)
        .args(["deploy", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dry run: would deploy in stage 1"))
        .stdout(predicate::str::contains("stage 3: traefik"));

    stackup(&dir)
        .arg("deploy")
        .env("STACKUP_DRY_RUN", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));

    assert!(!dir.path().join("deployed-nomad").exists());
    stackup(&dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded"));
}

#[test]
fn deploy_subset_and_skip() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");

    let (code, report) = deploy_json(&dir, &["--components", "nomad", "--skip", "traefik"]);
    assert_eq!(code, 0);
    assert_eq!(statuses(&report), ["succeeded", "skipped", "skipped"]);
    assert!(!dir.path().join("deployed-vault").exists());
    assert_eq!(report["phase"], "pre_integration");
}

#[test]
fn unknown_component_exits_2() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    stackup(&dir)
        .args(["deploy", "--components", "postgres"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("postgres"));
}

#[test]
fn production_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");

    stackup(&dir)
        .args(["deploy", "--env", "production"])
        .write_stdin("no\n")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not confirmed"));
    assert!(!dir.path().join("deployed-nomad").exists());

    stackup(&dir)
        .args(["deploy", "--env", "production", "--dry-run"])
        .assert()
        .success();
}

#[test]
fn unknown_environment_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    stackup(&dir)
        .args(["deploy", "--env", "qa"])
        .assert()
        .code(2);
}

// ---------------------------------------------------------------------------
// stackup status / history
// ---------------------------------------------------------------------------

#[test]
fn status_reports_latest_records_and_phase() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");

    stackup(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("never deployed"));

    deploy_json(&dir, &[]);
    let out = stackup(&dir).args(["status", "--json"]).output().unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["components"][0]["name"], "nomad");
    assert_eq!(v["components"][2]["status"], "succeeded");
    assert_eq!(v["phase"]["phase"], "integrated");
}

#[test]
fn history_lists_runs() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    deploy_json(&dir, &[]);
    deploy_json(&dir, &["--force"]);

    let out = stackup(&dir).args(["history", "--json"]).output().unwrap();
    assert!(out.status.success());
    let runs: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1]["run_seq"], 2);
    assert_eq!(runs[1]["exit_code"], 0);

    stackup(&dir)
        .args(["history", "-n", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("develop"));
}

// ---------------------------------------------------------------------------
// stackup rollback / prune-snapshots
// ---------------------------------------------------------------------------

#[test]
fn rollback_restores_previous_gateway_config() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    deploy_json(&dir, &[]);

    // A forced redeploy snapshots the config it replaces.
    let stack = dir.path().join(".stackup/stack.yaml");
    let yaml = std::fs::read_to_string(&stack)
        .unwrap()
        .replace("address: \":80\"", "address: \":8081\"");
    std::fs::write(&stack, yaml).unwrap();
    let (code, _) = deploy_json(&dir, &["--force", "--components", "traefik"]);
    assert_eq!(code, 0);
    let rendered = dir.path().join(".stackup/rendered/traefik.conf");
    assert!(std::fs::read_to_string(&rendered).unwrap().contains(":8081"));

    stackup(&dir)
        .args(["rollback", "traefik"])
        .assert()
        .success()
        .stdout(predicate::str::contains("traefik"));

    assert!(dir.path().join("stopped-traefik").exists());
    assert!(std::fs::read_to_string(&rendered).unwrap().contains("\":80\""));
}

#[test]
fn rollback_unknown_component_exits_2() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    stackup(&dir)
        .args(["rollback", "postgres"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("component not found"));
}

#[test]
fn prune_snapshots_reports_count() {
    let dir = TempDir::new().unwrap();
    write_stack(&dir, "touch deployed-traefik");
    deploy_json(&dir, &[]);
    deploy_json(&dir, &["--force", "--components", "traefik"]);

    stackup(&dir)
        .args(["prune-snapshots", "traefik"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 snapshot(s) of traefik"));
    assert!(dir.path().join(".stackup/snapshots").is_dir());
}
