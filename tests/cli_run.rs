use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use assert_cmd::Command;
use tempfile::tempdir;

fn bunker_ci() -> Command {
    let mut cmd = Command::cargo_bin("bunker-ci").expect("binary present");
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn write_pipeline(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("pipeline.yaml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn successful_run_exits_zero_and_writes_report() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nstages:\n  - name: build\n    steps:\n      - uses: shell\n        command: echo built > out.txt\n        artifacts: [out.txt]\n",
    );
    let workspace = temp.path().join("ws");
    let report = temp.path().join("report.json");

    bunker_ci()
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(&workspace)
        .arg("--report")
        .arg(&report)
        .assert()
        .code(0);

    assert!(workspace.join("out.txt").is_file());
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["verdict"], "pass");
    assert_eq!(json["stages"][0]["steps"][0]["artifacts"][0], "out.txt");
}

#[test]
fn failing_step_exits_one() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nstages:\n  - name: test\n    steps:\n      - command: \"false\"\n",
    );

    bunker_ci()
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(temp.path().join("ws"))
        .assert()
        .code(1);
}

#[test]
fn timeout_flag_bounds_steps() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nstages:\n  - name: slow\n    steps:\n      - command: sleep\n        args: [\"30\"]\n",
    );

    bunker_ci()
        .timeout(Duration::from_secs(20))
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(temp.path().join("ws"))
        .arg("--timeout")
        .arg("1")
        .assert()
        .code(1);
}

#[test]
fn malformed_pipeline_exits_three() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nstages:\n  - name: a\n    steps:\n      - command: make\n  - name: a\n    steps:\n      - command: make\n",
    );

    bunker_ci()
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(temp.path().join("ws"))
        .assert()
        .code(3);
    assert!(!temp.path().join("ws").exists());

    bunker_ci().arg("validate").arg(&pipeline).assert().code(3);
}

#[test]
fn dry_run_prints_plan_without_executing() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nname: demo\nstages:\n  - name: build\n    steps:\n      - uses: shell\n        command: touch should-not-exist\n",
    );

    let output = bunker_ci()
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(temp.path().join("ws"))
        .arg("--dry-run")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Pipeline 'demo'"));
    assert!(stdout.contains("- build"));
    assert!(!temp.path().join("ws/should-not-exist").exists());
}

#[test]
fn list_steps_names_builtin_kinds() {
    let output = bunker_ci().arg("list-steps").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for kind in ["exec", "shell", "checkout", "sonar-scanner", "dependency-check", "trivy", "docker"] {
        assert!(stdout.contains(kind), "missing {kind}");
    }
}

#[test]
fn init_then_lint_round_trips() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("devsecops.yaml");

    bunker_ci()
        .arg("init")
        .arg("--preset")
        .arg("devsecops")
        .arg("--output")
        .arg(&path)
        .assert()
        .success();

    bunker_ci().arg("lint").arg(&path).assert().success();
}

#[cfg(unix)]
#[test]
fn interrupt_aborts_after_the_current_stage() {
    let temp = tempdir().unwrap();
    let pipeline = write_pipeline(
        temp.path(),
        "version: 1\nstages:\n  - name: build\n    steps:\n      - uses: shell\n        command: sleep 3 && touch built\n  - name: deploy\n    steps:\n      - uses: shell\n        command: touch deployed\n",
    );
    let workspace = temp.path().join("ws");

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("bunker-ci"))
        .env("RUST_LOG", "warn")
        .arg("run")
        .arg("--pipeline")
        .arg(&pipeline)
        .arg("--workspace")
        .arg(&workspace)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Leave the CLI time to install its interrupt handler.
    std::thread::sleep(Duration::from_millis(1500));
    unsafe {
        libc::kill(child.id() as i32, libc::SIGINT);
    }
    let status = child.wait().unwrap();

    assert_eq!(status.code(), Some(2));
    assert!(workspace.join("built").exists());
    assert!(!workspace.join("deployed").exists());
}
