#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use issuefix_core::agent::{AgentBackend, AgentOutput};
use issuefix_core::config::PipelineSettings;
use issuefix_core::git::{CommitAuthor, VersionControl};
use issuefix_core::platform::{ApiError, ChangeRequestSpec, PlatformApi};
use issuefix_core::retry::RetryPolicy;
use issuefix_core::types::{ChangeRequestRef, Event, EventKind, FileChange};

// ── Platform ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePlatform {
    pub files: Mutex<HashMap<String, String>>,
    pub fetch_error: Mutex<Option<ApiError>>,
    pub comments: Mutex<Vec<(String, u64, String)>>,
    pub comment_attempts: AtomicU32,
    /// Fail this many post_comment calls with a 503 before succeeding.
    pub transient_comment_failures: AtomicU32,
    /// Fail every post_comment call with a 422.
    pub reject_comments: Mutex<bool>,
    pub requests: Mutex<Vec<(String, ChangeRequestSpec)>>,
    pub open_requests: Mutex<HashMap<String, ChangeRequestRef>>,
}

impl FakePlatform {
    pub fn with_policy(yaml: &str) -> Self {
        let p = Self::default();
        p.files
            .lock()
            .unwrap()
            .insert(".github/issuefix.yml".into(), yaml.into());
        p
    }

    pub fn comment_bodies(&self) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn status(code: u16) -> ApiError {
    ApiError::Status {
        operation: "fake".into(),
        status: code,
        body: String::new(),
        rate_limited: false,
        retry_after: None,
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn fetch_file(&self, _repo: &str, path: &str) -> Result<Vec<u8>, ApiError> {
        if let Some(e) = self.fetch_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|s| s.clone().into_bytes())
            .ok_or(ApiError::NotFound)
    }

    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<(), ApiError> {
        self.comment_attempts.fetch_add(1, Ordering::SeqCst);
        if *self.reject_comments.lock().unwrap() {
            return Err(status(422));
        }
        let remaining = self.transient_comment_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_comment_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(status(503));
        }
        self.comments
            .lock()
            .unwrap()
            .push((repo.to_string(), issue_number, body.to_string()));
        Ok(())
    }

    async fn create_change_request(
        &self,
        repo: &str,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequestRef, ApiError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push((repo.to_string(), spec.clone()));
        let number = 100 + requests.len() as u64;
        let cr = ChangeRequestRef {
            number,
            url: format!("https://github.com/{repo}/pull/{number}"),
        };
        self.open_requests
            .lock()
            .unwrap()
            .insert(spec.head.clone(), cr.clone());
        Ok(cr)
    }

    async fn find_open_change_request(
        &self,
        _repo: &str,
        branch: &str,
    ) -> Result<Option<ChangeRequestRef>, ApiError> {
        Ok(self.open_requests.lock().unwrap().get(branch).cloned())
    }

    async fn default_branch(&self, _repo: &str) -> Result<String, ApiError> {
        Ok("main".into())
    }

    fn clone_url(&self, repo: &str) -> String {
        format!("https://example.invalid/{repo}.git")
    }
}

// ── Version control ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Commit {
    pub dir: PathBuf,
    pub files: BTreeMap<String, FileChange>,
    pub message: String,
}

#[derive(Default)]
pub struct FakeVcs {
    pub remote_branches: Mutex<HashSet<String>>,
    pub changed: Mutex<Vec<String>>,
    pub commits: Mutex<Vec<Commit>>,
    pub pushes: Mutex<Vec<String>>,
    pub fail_clone: Mutex<bool>,
    pub fail_push: Mutex<bool>,
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, _url: &str, _base_ref: &str, dest: &Path) -> Result<()> {
        if *self.fail_clone.lock().unwrap() {
            bail!("fatal: repository not found");
        }
        tokio::fs::create_dir_all(dest).await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, _dir: &Path, branch: &str) -> Result<bool> {
        Ok(self.remote_branches.lock().unwrap().contains(branch))
    }

    async fn create_branch(&self, _dir: &Path, _branch: &str, _base_ref: &str) -> Result<()> {
        Ok(())
    }

    async fn changed_files(&self, _dir: &Path) -> Result<Vec<String>> {
        Ok(self.changed.lock().unwrap().clone())
    }

    async fn write_and_commit(
        &self,
        dir: &Path,
        changes: &BTreeMap<String, FileChange>,
        message: &str,
        _author: &CommitAuthor,
    ) -> Result<String> {
        self.commits.lock().unwrap().push(Commit {
            dir: dir.to_path_buf(),
            files: changes.clone(),
            message: message.to_string(),
        });
        Ok("0123abcd".into())
    }

    async fn push(&self, _dir: &Path, branch: &str) -> Result<()> {
        if *self.fail_push.lock().unwrap() {
            bail!("remote rejected");
        }
        self.pushes.lock().unwrap().push(branch.to_string());
        self.remote_branches.lock().unwrap().insert(branch.to_string());
        Ok(())
    }
}

// ── Agent ────────────────────────────────────────────────────────────────────

pub enum Script {
    Reply(String),
    TimedOut,
    SpawnError,
}

pub struct FakeAgent {
    pub script: Script,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub tasks: Mutex<Vec<String>>,
    /// Target paths handed to each invocation.
    pub targets: Mutex<Vec<Vec<String>>>,
    /// Files written into the working copy before replying.
    pub writes: Vec<(String, String)>,
}

impl FakeAgent {
    pub fn replying(text: &str) -> Self {
        Self::new(Script::Reply(text.to_string()))
    }

    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            writes: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for FakeAgent {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_with_files(
        &self,
        task_description: &str,
        working_copy: &Path,
        target_paths: &[String],
        timeout: Duration,
    ) -> Result<AgentOutput> {
        self.targets.lock().unwrap().push(target_paths.to_vec());
        self.run(task_description, working_copy, timeout).await
    }

    async fn run(&self, task_description: &str, working_copy: &Path, _timeout: Duration) -> Result<AgentOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().unwrap().push(task_description.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for (path, content) in &self.writes {
            let target = working_copy.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, content).await?;
        }
        match &self.script {
            Script::Reply(text) => Ok(AgentOutput::Completed(text.clone())),
            Script::TimedOut => Ok(AgentOutput::TimedOut),
            Script::SpawnError => bail!("failed to spawn agent: No such file or directory"),
        }
    }
}

// ── Builders ─────────────────────────────────────────────────────────────────

pub const KEYERROR_ISSUE: &str =
    "Bug: KeyError: 'profile' in user_profile.py line 42 ```python\nreturn user['profile']['name']\n```";

pub const FIXED_REPLY: &str = "<<<FILE user_profile.py>>>\n\
return user.get('profile', {}).get('name')\n\
<<<END FILE>>>\n\
Guard the missing profile key with dict.get.";

pub fn event(issue_number: u64, labels: &[&str], raw_text: &str, delivery_id: &str) -> Event {
    Event {
        kind: EventKind::IssueCreated,
        repository: "acme/webapp".into(),
        issue_number,
        actor: "alice".into(),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        title: "Profile page crashes".into(),
        raw_text: raw_text.into(),
        delivery_id: delivery_id.into(),
    }
}

pub fn settings(workspace_root: &Path) -> PipelineSettings {
    PipelineSettings {
        workspace_root: workspace_root.to_path_buf(),
        agent_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(10),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..PipelineSettings::default()
    }
}
