//! Approval gateway: a control-plane loop over an inbox of change
//! requests.
//!
//! Task files land in the inbox, pass a path/command allow-list, produce
//! a diff proposal in the outbox, and block for a human approval record
//! up to a bounded timeout before any content mutates. A task file is
//! consumed exactly once; every failure mode leaves a record in the
//! outbox naming the originating file, and the watch loop survives all of
//! them.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use crate::bus;
use crate::logging::ts_epoch_ms;
use crate::state::{BridgePaths, Config};

// =============================================================================
// Tasks and policy
// =============================================================================

/// Inbox task kinds. Each variant carries its required fields; anything
/// missing or unknown fails at parse time and becomes an error record,
/// never a half-processed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    WriteFile { path: String, content: String },
    PatchFile { path: String, after: String },
    RunCommand { cmd: Vec<String> },
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub allowed_paths: Vec<String>,
    pub allowed_cmds: Vec<String>,
    pub require_approval: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_paths: vec![
                "configs/".to_string(),
                "strategies/".to_string(),
                "policies/".to_string(),
            ],
            allowed_cmds: vec!["git".to_string(), "cargo".to_string()],
            require_approval: true,
        }
    }
}

impl Policy {
    /// Load the on-disk policy, seeding defaults on first run. An
    /// unreadable policy file falls back to the defaults rather than
    /// opening the gate.
    pub fn load(paths: &BridgePaths) -> Policy {
        let file = paths.policy_file();
        if !file.exists() {
            let policy = Policy::default();
            let _ = bus::write_json(&file, &policy);
            return policy;
        }
        bus::read_json(&file).unwrap_or_default()
    }

    pub fn allows_path(&self, rel: &str) -> bool {
        let rel = rel.replace('\\', "/");
        self.allowed_paths.iter().any(|pat| {
            rel == *pat || rel.starts_with(&format!("{}/", pat.trim_end_matches('/')))
        })
    }

    pub fn allows_cmd(&self, program: &str) -> bool {
        let base = program.split_whitespace().next().unwrap_or("");
        self.allowed_cmds.iter().any(|c| c == base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Applied,
    Pending,
    Rejected,
    Error,
    CommandRan,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approval {
    Granted,
    Denied,
    TimedOut,
}

// =============================================================================
// Diff rendering
// =============================================================================

/// Minimal line diff for proposals: unchanged prefix/suffix trimmed, the
/// differing middle shown as removals then additions.
pub fn make_diff(old: &str, new: &str, path: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut out = format!("--- {}\n+++ {}\n", path, path);
    for line in &old_lines[prefix..old_lines.len() - suffix] {
        out.push_str(&format!("-{}\n", line));
    }
    for line in &new_lines[prefix..new_lines.len() - suffix] {
        out.push_str(&format!("+{}\n", line));
    }
    out
}

// =============================================================================
// Gateway
// =============================================================================

pub struct Gateway {
    paths: BridgePaths,
    workspace: PathBuf,
    approval_timeout: Duration,
    approval_poll: Duration,
    command_timeout: Duration,
}

impl Gateway {
    pub fn new(paths: BridgePaths, cfg: &Config) -> Self {
        let workspace = paths.inbox.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            paths,
            workspace,
            approval_timeout: Duration::from_secs(cfg.approval_timeout_secs),
            approval_poll: Duration::from_millis(500),
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, approval: Duration, poll: Duration) -> Self {
        self.approval_timeout = approval;
        self.approval_poll = poll;
        self
    }

    /// Pending task files, oldest first. Approval records are not tasks.
    pub fn scan_inbox(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.paths.inbox) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .filter(|p| !Self::is_approval(p))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    fn is_approval(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("approve"))
            .unwrap_or(false)
    }

    fn write_out(&self, name: &str, payload: Value) -> Result<PathBuf> {
        use rand::Rng;
        let suffix: u32 = rand::thread_rng().gen_range(1..1_000_000);
        let path = self.paths.outbox.join(format!("{}_{}_{:06}.json", ts_epoch_ms(), name, suffix));
        std::fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("cannot write outbox record {}", path.display()))?;
        Ok(path)
    }

    /// Resolve a task path inside the workspace. Absolute paths and any
    /// `..` traversal are refused before the policy even looks at them.
    fn safe_path(&self, rel: &str) -> Result<PathBuf> {
        let p = Path::new(rel);
        if p.is_absolute()
            || p.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            anyhow::bail!("unsafe path outside workspace: {}", rel);
        }
        Ok(self.workspace.join(p))
    }

    /// Process one inbox task file end to end. The file is consumed no
    /// matter the outcome; any error becomes an outbox record referencing
    /// it by name.
    pub async fn process_task_file(&self, path: &Path) -> TaskOutcome {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parsed: Result<Task> = std::fs::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|b| serde_json::from_slice(&b).map_err(anyhow::Error::from));
        let _ = std::fs::remove_file(path);

        let outcome = match parsed {
            Ok(task) => self.handle_task(&task, &file_name).await,
            Err(err) => {
                let _ = self.write_out("error", json!({ "file": file_name, "error": err.to_string() }));
                return TaskOutcome::Error;
            }
        };
        match outcome {
            Ok(o) => o,
            Err(err) => {
                let _ = self.write_out("error", json!({ "file": file_name, "error": err.to_string() }));
                TaskOutcome::Error
            }
        }
    }

    async fn handle_task(&self, task: &Task, file_name: &str) -> Result<TaskOutcome> {
        let policy = Policy::load(&self.paths);
        match task {
            Task::WriteFile { path, content } => {
                self.apply_content(&policy, task, "write_file", path, content).await
            }
            Task::PatchFile { path, after } => {
                self.apply_content(&policy, task, "patch_file", path, after).await
            }
            Task::RunCommand { cmd } => self.run_command(&policy, task, cmd).await,
            Task::Restart => {
                self.write_out(
                    "info",
                    json!({ "file": file_name, "msg": "restart request recorded; supervision is external" }),
                )?;
                Ok(TaskOutcome::Acknowledged)
            }
        }
    }

    /// Shared write_file/patch_file path: policy gate, diff proposal,
    /// approval wait, then the single content mutation.
    async fn apply_content(
        &self,
        policy: &Policy,
        task: &Task,
        kind: &str,
        rel: &str,
        after: &str,
    ) -> Result<TaskOutcome> {
        if !policy.allows_path(rel) {
            self.write_out("rejected", json!({ "task": task, "reason": "path not allowed" }))?;
            return Ok(TaskOutcome::Rejected);
        }
        let target = self.safe_path(rel)?;
        let before = std::fs::read_to_string(&target).unwrap_or_default();
        let diff = make_diff(&before, after, rel);
        let proposal =
            self.write_out("proposal", json!({ "type": kind, "path": rel, "diff": diff }))?;

        let approval = if policy.require_approval {
            self.wait_for_approval(&proposal).await
        } else {
            Approval::Granted
        };
        match approval {
            Approval::Granted => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("cannot create {}", parent.display()))?;
                }
                std::fs::write(&target, after)
                    .with_context(|| format!("cannot write {}", target.display()))?;
                self.write_out("applied", json!({ "task": task, "path": rel }))?;
                Ok(TaskOutcome::Applied)
            }
            Approval::Denied => {
                self.write_out("rejected", json!({ "task": task, "reason": "approval denied" }))?;
                Ok(TaskOutcome::Rejected)
            }
            Approval::TimedOut => {
                self.write_out("pending", json!({ "task": task, "path": rel }))?;
                Ok(TaskOutcome::Pending)
            }
        }
    }

    /// Block until an `approve*.json` record names this proposal, or the
    /// deadline passes. Timeout degrades to "not approved", never hangs.
    async fn wait_for_approval(&self, proposal: &Path) -> Approval {
        let target = proposal
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let deadline = tokio::time::Instant::now() + self.approval_timeout;

        loop {
            let approvals: Vec<PathBuf> = std::fs::read_dir(&self.paths.inbox)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| Self::is_approval(p))
                        .collect()
                })
                .unwrap_or_default();
            for ap in approvals {
                let Some(record) = bus::read_json::<Value>(&ap) else { continue };
                if record["proposal"] == target.as_str() {
                    let _ = std::fs::remove_file(&ap);
                    return if record["approve"].as_bool().unwrap_or(false) {
                        Approval::Granted
                    } else {
                        Approval::Denied
                    };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Approval::TimedOut;
            }
            sleep(self.approval_poll).await;
        }
    }

    async fn run_command(
        &self,
        policy: &Policy,
        task: &Task,
        cmd: &[String],
    ) -> Result<TaskOutcome> {
        let Some(program) = cmd.first() else {
            self.write_out("rejected", json!({ "task": task, "reason": "empty command" }))?;
            return Ok(TaskOutcome::Rejected);
        };
        if !policy.allows_cmd(program) {
            self.write_out("rejected", json!({ "task": task, "reason": "cmd not allowed" }))?;
            return Ok(TaskOutcome::Rejected);
        }

        let mut command = tokio::process::Command::new(program);
        command.args(&cmd[1..]).current_dir(&self.workspace);
        let result = timeout(self.command_timeout, command.output()).await;
        let record = match result {
            Ok(Ok(output)) => json!({
                "cmd": cmd,
                "code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
            Ok(Err(err)) => json!({ "cmd": cmd, "error": err.to_string() }),
            Err(_) => json!({ "cmd": cmd, "error": "command timed out" }),
        };
        self.write_out("command_result", record)?;
        Ok(TaskOutcome::CommandRan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_gateway(policy: Policy) -> (tempfile::TempDir, BridgePaths, Gateway) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bridge_out");
        let paths = BridgePaths::new(root.to_str().unwrap());
        paths.ensure().unwrap();
        bus::write_json(&paths.policy_file(), &policy).unwrap();
        let gw = Gateway::new(paths.clone(), &Config::from_env())
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(20));
        (tmp, paths, gw)
    }

    fn open_policy() -> Policy {
        Policy {
            allowed_paths: vec!["configs/".to_string()],
            allowed_cmds: vec!["echo".to_string()],
            require_approval: false,
        }
    }

    fn drop_task(paths: &BridgePaths, name: &str, task: &Value) -> PathBuf {
        let p = paths.inbox.join(name);
        std::fs::write(&p, task.to_string()).unwrap();
        p
    }

    fn outbox_records(paths: &BridgePaths, kind: &str) -> Vec<Value> {
        let mut names: Vec<PathBuf> = std::fs::read_dir(&paths.outbox)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().contains(kind))
            .collect();
        names.sort();
        names.iter().map(|p| bus::read_json::<Value>(p).unwrap()).collect()
    }

    // ==========================================================================
    // Task parsing (tagged variants, required fields)
    // ==========================================================================

    #[test]
    fn test_task_parse_tagged() {
        let t: Task = serde_json::from_str(
            "{\"type\": \"write_file\", \"path\": \"configs/a.toml\", \"content\": \"x\"}",
        )
        .unwrap();
        assert!(matches!(t, Task::WriteFile { .. }));

        let t: Task = serde_json::from_str("{\"type\": \"restart\"}").unwrap();
        assert!(matches!(t, Task::Restart));
    }

    #[test]
    fn test_task_parse_rejects_missing_fields_and_unknown_types() {
        // patch_file without the replacement content is malformed
        assert!(serde_json::from_str::<Task>(
            "{\"type\": \"patch_file\", \"path\": \"configs/a.toml\"}"
        )
        .is_err());
        assert!(serde_json::from_str::<Task>("{\"type\": \"format_disk\"}").is_err());
        assert!(serde_json::from_str::<Task>("{\"path\": \"no type\"}").is_err());
    }

    // ==========================================================================
    // Policy
    // ==========================================================================

    #[test]
    fn test_policy_path_prefixes() {
        let policy = Policy::default();
        assert!(policy.allows_path("configs/risk.toml"));
        assert!(policy.allows_path("strategies/sma.toml"));
        assert!(!policy.allows_path("src/main.rs"));
        assert!(!policy.allows_path("configs_evil/x"));
    }

    #[test]
    fn test_policy_seeded_on_first_load() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bridge_out");
        let paths = BridgePaths::new(root.to_str().unwrap());
        paths.ensure().unwrap();
        assert!(!paths.policy_file().exists());
        let policy = Policy::load(&paths);
        assert!(paths.policy_file().exists());
        assert!(policy.require_approval);
    }

    #[test]
    fn test_diff_marks_changed_middle_only() {
        let diff = make_diff("a\nb\nc\n", "a\nB\nc\n", "configs/x");
        assert!(diff.contains("--- configs/x"));
        assert!(diff.contains("-b\n"));
        assert!(diff.contains("+B\n"));
        assert!(!diff.contains("-a"));
        assert!(!diff.contains("-c"));
    }

    // ==========================================================================
    // Processing
    // ==========================================================================

    #[tokio::test]
    async fn test_write_file_applies_without_approval_requirement() {
        let (tmp, paths, gw) = temp_gateway(open_policy());
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "write_file", "path": "configs/risk.toml", "content": "limit = 8.0\n"}),
        );
        let outcome = gw.process_task_file(&task).await;
        assert_eq!(outcome, TaskOutcome::Applied);
        assert!(!task.exists(), "task file must be consumed");
        let written = std::fs::read_to_string(tmp.path().join("configs/risk.toml")).unwrap();
        assert_eq!(written, "limit = 8.0\n");
        assert_eq!(outbox_records(&paths, "proposal").len(), 1);
        assert_eq!(outbox_records(&paths, "applied").len(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_path_rejected_without_mutation() {
        let (tmp, paths, gw) = temp_gateway(open_policy());
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "write_file", "path": "src/main.rs", "content": "gotcha"}),
        );
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Rejected);
        assert!(!tmp.path().join("src/main.rs").exists());
        let rejects = outbox_records(&paths, "rejected");
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0]["reason"], "path not allowed");
    }

    #[tokio::test]
    async fn test_traversal_path_becomes_error_record() {
        let (_tmp, paths, gw) = temp_gateway(Policy {
            allowed_paths: vec!["../".to_string()],
            ..open_policy()
        });
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "write_file", "path": "../outside.txt", "content": "x"}),
        );
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Error);
        let errors = outbox_records(&paths, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["file"], "t1.json");
    }

    #[tokio::test]
    async fn test_approval_timeout_leaves_pending() {
        let mut policy = open_policy();
        policy.require_approval = true;
        let (tmp, paths, gw) = temp_gateway(policy);
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "write_file", "path": "configs/risk.toml", "content": "x"}),
        );
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Pending);
        assert!(!tmp.path().join("configs/risk.toml").exists(), "no mutation without approval");
        assert_eq!(outbox_records(&paths, "pending").len(), 1);
    }

    #[tokio::test]
    async fn test_pre_staged_approval_applies_once() {
        let mut policy = open_policy();
        policy.require_approval = true;
        let (tmp, paths, gw) = temp_gateway(policy);
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "patch_file", "path": "configs/risk.toml", "after": "limit = 5.0\n"}),
        );

        // Stage an approval for whatever proposal lands next: watch the
        // outbox from a helper task and answer it.
        let inbox = paths.inbox.clone();
        let outbox = paths.outbox.clone();
        let approver = tokio::spawn(async move {
            for _ in 0..100 {
                if let Ok(entries) = std::fs::read_dir(&outbox) {
                    for e in entries.filter_map(|e| e.ok()) {
                        let name = e.file_name().to_string_lossy().into_owned();
                        if name.contains("proposal") {
                            std::fs::write(
                                inbox.join("approve_1.json"),
                                json!({"proposal": name, "approve": true}).to_string(),
                            )
                            .unwrap();
                            return;
                        }
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        });

        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Applied);
        approver.await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("configs/risk.toml")).unwrap(),
            "limit = 5.0\n"
        );
        // The approval record was consumed with the proposal
        assert!(!paths.inbox.join("approve_1.json").exists());
    }

    #[tokio::test]
    async fn test_denied_approval_rejects() {
        let mut policy = open_policy();
        policy.require_approval = true;
        let (tmp, paths, gw) = temp_gateway(policy);
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "write_file", "path": "configs/risk.toml", "content": "x"}),
        );
        let inbox = paths.inbox.clone();
        let outbox = paths.outbox.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                if let Ok(entries) = std::fs::read_dir(&outbox) {
                    for e in entries.filter_map(|e| e.ok()) {
                        let name = e.file_name().to_string_lossy().into_owned();
                        if name.contains("proposal") {
                            std::fs::write(
                                inbox.join("approve_1.json"),
                                json!({"proposal": name, "approve": false}).to_string(),
                            )
                            .unwrap();
                            return;
                        }
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Rejected);
        assert!(!tmp.path().join("configs/risk.toml").exists());
    }

    #[tokio::test]
    async fn test_malformed_task_error_record_names_file() {
        let (_tmp, paths, gw) = temp_gateway(open_policy());
        let task = paths.inbox.join("broken.json");
        std::fs::write(&task, "{\"type\": \"write_file\", \"path\":").unwrap();
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Error);
        assert!(!task.exists());
        let errors = outbox_records(&paths, "error");
        assert_eq!(errors[0]["file"], "broken.json");
    }

    #[tokio::test]
    async fn test_run_command_allowed() {
        let (_tmp, paths, gw) = temp_gateway(open_policy());
        let task = drop_task(
            &paths,
            "t1.json",
            &json!({"type": "run_command", "cmd": ["echo", "hello"]}),
        );
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::CommandRan);
        let results = outbox_records(&paths, "command_result");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["code"], 0);
        assert_eq!(results[0]["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_run_command_disallowed() {
        let (_tmp, paths, gw) = temp_gateway(open_policy());
        let task = drop_task(&paths, "t1.json", &json!({"type": "run_command", "cmd": ["rm", "-rf", "/"]}));
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Rejected);
        assert_eq!(outbox_records(&paths, "rejected")[0]["reason"], "cmd not allowed");
    }

    #[tokio::test]
    async fn test_restart_acknowledged() {
        let (_tmp, paths, gw) = temp_gateway(open_policy());
        let task = drop_task(&paths, "t1.json", &json!({"type": "restart"}));
        assert_eq!(gw.process_task_file(&task).await, TaskOutcome::Acknowledged);
        assert_eq!(outbox_records(&paths, "info").len(), 1);
    }

    #[test]
    fn test_scan_inbox_skips_approvals() {
        let (_tmp, paths, gw) = temp_gateway(open_policy());
        drop_task(&paths, "b_task.json", &json!({"type": "restart"}));
        drop_task(&paths, "a_task.json", &json!({"type": "restart"}));
        drop_task(&paths, "approve_1.json", &json!({"proposal": "x", "approve": true}));
        std::fs::write(paths.inbox.join("notes.txt"), "not a task").unwrap();

        let files = gw.scan_inbox();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_task.json", "b_task.json"]);
    }
}
