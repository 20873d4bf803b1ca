//! Runs one external command for a step.
//!
//! The child gets the run workspace as its working directory and an
//! environment built only from what the caller passes in. stdout and stderr
//! are drained concurrently into bounded buffers so a chatty tool can neither
//! deadlock on a full pipe nor exhaust memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::ResolvedEnv;
use crate::run::{NO_EXIT_CODE, StepOutcome, StepResult, TIMEOUT_EXIT_CODE};

/// How long to keep draining pipes after the child is gone. Grandchildren
/// that inherited the pipes can otherwise keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// File timestamps can lag the wall clock by a filesystem tick (up to two
/// seconds on FAT), so the freshness cutoff starts this much before the step.
const MTIME_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub timeout: Duration,
    pub output_limit: usize,
    pub artifact_patterns: Vec<String>,
    /// Directories whose files never count as artifacts, such as the archive.
    pub artifact_exclude: Vec<PathBuf>,
}

impl ExecRequest {
    fn display_command(&self, secrets: &ResolvedEnv) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        secrets.mask(&line)
    }
}

pub async fn execute(request: &ExecRequest, secrets: &ResolvedEnv) -> StepResult {
    let started = Instant::now();
    let scope = ArtifactScope {
        since: SystemTime::now().checked_sub(MTIME_SLACK),
        exclude: request.artifact_exclude.clone(),
    };
    debug!(
        step = request.index,
        command = %request.display_command(secrets),
        timeout_secs = request.timeout.as_secs(),
        "Spawning step command"
    );

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .current_dir(&request.workspace)
        .env_clear()
        .envs(&request.env)
        .envs(secrets.variables())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(step = request.index, program = %request.program, error = %err, "Failed to spawn step command");
            return StepResult::not_started(
                request.index,
                request.name.clone(),
                request.kind.clone(),
                StepOutcome::SpawnError,
                NO_EXIT_CODE,
                format!("Failed to spawn '{}': {err}", request.program),
            );
        }
    };

    // Read past the cap by the longest secret so one straddling it is seen
    // whole and masked before the text is cut.
    let capture_limit = request.output_limit + secrets.longest_secret();
    let stdout = spawn_capture(child.stdout.take(), capture_limit);
    let stderr = spawn_capture(child.stderr.take(), capture_limit);

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(request.timeout) => None,
    };

    let (outcome, exit_code, note) = match waited {
        Some(Ok(status)) => {
            let code = exit_code_of(status);
            if status.success() {
                (StepOutcome::Succeeded, code, None)
            } else {
                (StepOutcome::Failed, code, None)
            }
        }
        Some(Err(err)) => (
            StepOutcome::Failed,
            NO_EXIT_CODE,
            Some(format!("Failed to wait for step command: {err}")),
        ),
        None => {
            terminate(&mut child).await;
            (
                StepOutcome::TimedOut,
                TIMEOUT_EXIT_CODE,
                Some(format!(
                    "Step timed out after {}s and was terminated",
                    request.timeout.as_secs()
                )),
            )
        }
    };

    let stdout = bounded_output(secrets, stdout.finish().await, request.output_limit);
    let mut stderr = bounded_output(secrets, stderr.finish().await, request.output_limit);
    if let Some(note) = note {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&note);
    }

    let artifacts = match collect_artifacts(&request.workspace, &request.artifact_patterns, &scope) {
        Ok(paths) => paths,
        Err(err) => {
            warn!(step = request.index, error = %err, "Failed to collect step artifacts");
            Vec::new()
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        step = request.index,
        name = %request.name,
        ?outcome,
        exit_code,
        duration_ms,
        artifacts = artifacts.len(),
        "Step finished"
    );

    StepResult {
        index: request.index,
        name: request.name.clone(),
        kind: request.kind.clone(),
        outcome,
        exit_code,
        stdout,
        stderr,
        duration_ms,
        artifacts,
        missing_credential: None,
    }
}

/// A child killed by a signal reports `128 + signal`, as shells do.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    NO_EXIT_CODE
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group; take the whole group down.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "Step process already gone");
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    omitted: usize,
}

struct CaptureTask {
    shared: Arc<Mutex<Capture>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureTask {
    /// The captured text and the number of bytes read past the capture limit.
    async fn finish(mut self) -> (String, usize) {
        if let Some(mut handle) = self.handle.take()
            && tokio::time::timeout(DRAIN_GRACE, &mut handle).await.is_err()
        {
            handle.abort();
        }
        let guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (String::from_utf8_lossy(&guard.bytes).to_string(), guard.omitted)
    }
}

fn spawn_capture<R>(reader: Option<R>, limit: usize) -> CaptureTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let shared = Arc::new(Mutex::new(Capture::default()));
    let handle = reader.map(|mut reader| {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; 8192];
            loop {
                let read = match reader.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                let Ok(mut capture) = shared.lock() else {
                    break;
                };
                let room = limit.saturating_sub(capture.bytes.len());
                let kept = room.min(read);
                capture.bytes.extend_from_slice(&buffer[..kept]);
                capture.omitted += read - kept;
            }
        })
    });
    CaptureTask { shared, handle }
}

fn bounded_output(secrets: &ResolvedEnv, (text, omitted): (String, usize), limit: usize) -> String {
    let (masked, dropped) = secrets.mask_bounded(&text, limit);
    render_capture(masked, omitted + dropped)
}

fn render_capture(mut text: String, omitted: usize) -> String {
    if omitted > 0 {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[output truncated: {omitted} bytes omitted]"));
    }
    text
}

/// Limits which matching files count as produced by a step.
#[derive(Debug, Clone, Default)]
pub struct ArtifactScope {
    /// Files last modified before this point predate the step.
    pub since: Option<SystemTime>,
    pub exclude: Vec<PathBuf>,
}

impl ArtifactScope {
    fn admits(&self, path: &Path, excluded: &[PathBuf]) -> bool {
        if excluded.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        let Some(since) = self.since else {
            return true;
        };
        match path.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified >= since,
            Err(_) => false,
        }
    }
}

/// Expands artifact patterns relative to `workspace`. Only regular files that
/// resolve inside the workspace and fall within `scope` are returned, as
/// workspace-relative paths.
pub fn collect_artifacts(
    workspace: &Path,
    patterns: &[String],
    scope: &ArtifactScope,
) -> Result<Vec<PathBuf>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let root = workspace
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace: {}", workspace.display()))?;
    let excluded: Vec<PathBuf> = scope
        .exclude
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());

    let mut found = Vec::new();
    for pattern in patterns {
        let full = format!("{}/{}", escaped_root, pattern.trim_start_matches("./"));
        let matches =
            glob::glob(&full).with_context(|| format!("Invalid artifact pattern: {pattern}"))?;
        for entry in matches.flatten() {
            let Ok(resolved) = entry.canonicalize() else {
                continue;
            };
            if !resolved.is_file() || !scope.admits(&resolved, &excluded) {
                continue;
            }
            match resolved.strip_prefix(&root) {
                Ok(relative) => found.push(relative.to_path_buf()),
                Err(_) => warn!(
                    artifact = %resolved.display(),
                    "Ignoring artifact outside the workspace"
                ),
            }
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;
    use crate::definition::CredentialRef;
    use std::fs;
    use tempfile::tempdir;

    fn request(workspace: &Path, program: &str, args: &[&str]) -> ExecRequest {
        ExecRequest {
            index: 0,
            name: "test".into(),
            kind: "exec".into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: [("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]
                .into_iter()
                .collect(),
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(30),
            output_limit: 1024,
            artifact_patterns: Vec::new(),
            artifact_exclude: Vec::new(),
        }
    }

    #[test]
    fn render_marks_truncation() {
        assert_eq!(render_capture("abc".into(), 0), "abc");
        assert_eq!(
            render_capture("abc".into(), 10),
            "abc\n[output truncated: 10 bytes omitted]"
        );
    }

    #[test]
    fn artifacts_stay_inside_workspace() {
        let temp = tempdir().unwrap();
        let workspace = temp.path().join("ws");
        fs::create_dir_all(workspace.join("reports")).unwrap();
        fs::write(workspace.join("reports/trivy.json"), "{}").unwrap();
        fs::write(workspace.join("reports/notes.txt"), "x").unwrap();
        fs::write(temp.path().join("outside.json"), "{}").unwrap();

        let found = collect_artifacts(
            &workspace,
            &["reports/*.json".to_string(), "../*.json".to_string()],
            &ArtifactScope::default(),
        )
        .unwrap();
        assert_eq!(found, vec![PathBuf::from("reports/trivy.json")]);
    }

    #[test]
    fn excluded_directories_are_not_artifacts() {
        let temp = tempdir().unwrap();
        let archive = temp.path().join(".bunker-ci/archive/run-1/scan");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join("report.json"), "{}").unwrap();
        fs::write(temp.path().join("report.json"), "{}").unwrap();

        let scope = ArtifactScope {
            since: None,
            exclude: vec![temp.path().join(".bunker-ci"), temp.path().join("missing")],
        };
        let found = collect_artifacts(temp.path(), &["**/*.json".to_string()], &scope).unwrap();
        assert_eq!(found, vec![PathBuf::from("report.json")]);
    }

    #[tokio::test]
    async fn files_older_than_the_step_are_not_artifacts() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("reports")).unwrap();
        let stale = fs::File::create(temp.path().join("reports/dependency-check-report.json")).unwrap();
        stale
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(stale);

        let mut req = request(temp.path(), "sh", &["-c", "echo '{}' > reports/trivy.json; exit 1"]);
        req.artifact_patterns = vec!["reports/*.json".into()];
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert_eq!(result.outcome, StepOutcome::Failed);
        assert_eq!(result.artifacts, vec![PathBuf::from("reports/trivy.json")]);
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), "sh", &["-c", "echo out; echo err >&2; exit 3"]);
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert_eq!(result.outcome, StepOutcome::Failed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn output_is_bounded() {
        let temp = tempdir().unwrap();
        let mut req = request(temp.path(), "sh", &["-c", "head -c 5000 /dev/zero | tr '\\0' a"]);
        req.output_limit = 100;
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert!(result.passed());
        assert!(result.stdout.starts_with(&"a".repeat(100)));
        assert!(result.stdout.ends_with("[output truncated: 4900 bytes omitted]"));
    }

    fn token(value: &str) -> ResolvedEnv {
        CredentialStore::from_pairs([("tok", value)])
            .resolve(&[CredentialRef::Name("tok".into())])
            .unwrap()
    }

    #[tokio::test]
    async fn secret_across_the_output_cap_is_masked() {
        let temp = tempdir().unwrap();
        let secrets = token("SUPERSECRETVALUE");
        let mut req = request(temp.path(), "sh", &["-c", "printf 'xxxx%s' \"$TOK\""]);
        req.output_limit = 12;
        let result = execute(&req, &secrets).await;
        assert!(result.passed());
        assert_eq!(result.stdout, "xxxx***");

        let mut req = request(
            temp.path(),
            "sh",
            &["-c", "printf 'xxxx%syyyyyyyyyy' \"$TOK\"; printf 'ab%s' \"$TOK\" >&2"],
        );
        req.output_limit = 12;
        let result = execute(&req, &secrets).await;
        assert_eq!(result.stdout, "xxxx***\n[output truncated: 10 bytes omitted]");
        assert_eq!(result.stderr, "ab***");
        assert!(!result.stdout.contains("SUPERSEC"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let temp = tempdir().unwrap();
        let mut req = request(temp.path(), "sh", &["-c", "sleep 30"]);
        req.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.outcome, StepOutcome::TimedOut);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let temp = tempdir().unwrap();
        let req = request(temp.path(), "definitely-not-a-real-tool-4821", &[]);
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert_eq!(result.outcome, StepOutcome::SpawnError);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_ne!(result.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let temp = tempdir().unwrap();
        let mut req = request(temp.path(), "sh", &["-c", "echo \"[$HOME][$STEP_VAR]\""]);
        req.env.insert("STEP_VAR".into(), "set".into());
        let result = execute(&req, &ResolvedEnv::empty()).await;
        assert_eq!(result.stdout.trim(), "[][set]");
    }
}
