mod common;

use std::time::Duration;

use common::{FakeAgent, FakeVcs, Script};
use issuefix_core::fixer::{
    build_task_description, filter_paths, parse_agent_output, AgentReply, Fixer, MalformedOutput,
    DEFAULT_MAX_TASK_BYTES,
};
use issuefix_core::types::{FileChange, FixTask, RepositoryPolicy};

// ── helpers ──────────────────────────────────────────────────────────────────

fn task(dir: &std::path::Path, policy: RepositoryPolicy) -> FixTask {
    FixTask {
        working_copy: dir.to_path_buf(),
        branch: "fix/issue-7".into(),
        issue_number: 7,
        title: "Profile page crashes".into(),
        body: "KeyError: 'profile' in app/user_profile.py".into(),
        target_paths: vec!["app/user_profile.py".into(), "secrets/keys.py".into()],
        error_context: vec!["KeyError: 'profile'".into()],
        policy,
    }
}

fn excluding_secrets() -> RepositoryPolicy {
    RepositoryPolicy {
        path_excludes: vec!["secrets/**".into()],
        ..RepositoryPolicy::default()
    }
}

async fn generate_with(agent: &FakeAgent, vcs: &FakeVcs, task: &FixTask) -> issuefix_core::ChangeSet {
    let fixer = Fixer {
        agent,
        vcs,
        agent_timeout: Duration::from_secs(5),
        max_task_bytes: DEFAULT_MAX_TASK_BYTES,
    };
    fixer.generate(task).await
}

fn section<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let from = text.find(start).map(|i| i + start.len()).unwrap_or(text.len());
    let rest = &text[from..];
    let to = rest.find(end).unwrap_or(rest.len());
    &rest[..to]
}

// ── parsing ──────────────────────────────────────────────────────────────────

#[test]
fn test_parse_two_files_and_notes() {
    let raw = "Here is the fix.\n<<<FILE a.py>>>\nx = 1\n<<<END FILE>>>\n<<<FILE b/c.py>>>\ny = 2\n<<<END FILE>>>\nDone.";
    let AgentReply::Files { files, notes } = parse_agent_output(raw).unwrap() else {
        panic!("expected files");
    };
    assert_eq!(files.len(), 2);
    assert_eq!(files["a.py"], FileChange::Content("x = 1\n".into()));
    assert_eq!(files["b/c.py"], FileChange::Content("y = 2\n".into()));
    assert_eq!(notes, "Here is the fix.\nDone.");
}

#[test]
fn test_parse_diff_fragment() {
    let raw = "<<<FILE a.py>>>\n--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-x = 0\n+x = 1\n<<<END FILE>>>";
    let AgentReply::Files { files, .. } = parse_agent_output(raw).unwrap() else {
        panic!("expected files");
    };
    assert!(matches!(files["a.py"], FileChange::Diff(_)));
}

#[test]
fn test_parse_unclosed_block() {
    let err = parse_agent_output("<<<FILE a.py>>>\nx = 1\n").unwrap_err();
    assert_eq!(err, MalformedOutput::Unclosed("a.py".into()));
}

#[test]
fn test_parse_nested_block() {
    let err = parse_agent_output("<<<FILE a.py>>>\n<<<FILE b.py>>>\n<<<END FILE>>>\n<<<END FILE>>>").unwrap_err();
    assert!(matches!(err, MalformedOutput::Nested { .. }));
}

#[test]
fn test_parse_close_without_open() {
    let err = parse_agent_output("text\n<<<END FILE>>>").unwrap_err();
    assert_eq!(err, MalformedOutput::StrayEnd(2));
}

#[test]
fn test_parse_empty_path() {
    let err = parse_agent_output("<<<FILE >>>\nx\n<<<END FILE>>>").unwrap_err();
    assert_eq!(err, MalformedOutput::EmptyPath(1));
}

#[test]
fn test_parse_duplicate_path() {
    let raw = "<<<FILE a.py>>>\n1\n<<<END FILE>>>\n<<<FILE a.py>>>\n2\n<<<END FILE>>>";
    assert_eq!(
        parse_agent_output(raw).unwrap_err(),
        MalformedOutput::Duplicate("a.py".into())
    );
}

#[test]
fn test_parse_cannot_fix() {
    let reply = parse_agent_output("Looked around.\n<<<CANNOT FIX>>> needs a database migration").unwrap();
    assert_eq!(reply, AgentReply::CannotFix("needs a database migration".into()));
}

// ── task description ─────────────────────────────────────────────────────────

#[test]
fn test_excluded_paths_not_offered() {
    let dir = tempfile::tempdir().unwrap();
    let t = task(dir.path(), excluding_secrets());
    assert_eq!(filter_paths(&t.target_paths, &t.policy), vec!["app/user_profile.py"]);

    let desc = build_task_description(&t, DEFAULT_MAX_TASK_BYTES);
    let listed = section(&desc, "## Files likely involved", "## Constraints");
    assert!(listed.contains("app/user_profile.py"));
    assert!(!listed.contains("secrets/keys.py"));
    assert!(desc.contains("<<<FILE path/to/file>>>"));
    assert!(desc.contains("<<<CANNOT FIX>>>"));
}

#[test]
fn test_description_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = task(dir.path(), RepositoryPolicy::default());
    t.body = "a very long body line\n".repeat(5000);
    t.error_context = vec!["E".repeat(50_000)];
    let desc = build_task_description(&t, 8 * 1024);
    assert!(desc.len() <= 8 * 1024, "len = {}", desc.len());
    assert!(desc.contains("[truncated]"));
    assert!(desc.contains("<<<END FILE>>>"));
}

// ── generation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_generate_success() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("<<<FILE app/user_profile.py>>>\nfixed\n<<<END FILE>>>\nok");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(cs.success);
    assert_eq!(cs.paths(), vec!["app/user_profile.py"]);
    assert_eq!(cs.agent_message, "ok");
}

#[tokio::test]
async fn test_generate_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::new(Script::TimedOut);
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(!cs.success);
    assert!(cs.files.is_empty());
    assert!(cs.agent_message.contains("timeout"));
}

#[tokio::test]
async fn test_generate_spawn_error_is_agent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::new(Script::SpawnError);
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(!cs.success);
    assert!(cs.agent_message.contains("agent invocation failed"));
}

#[tokio::test]
async fn test_generate_cannot_fix_keeps_reason() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("<<<CANNOT FIX>>> the bug is in a third-party service");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(!cs.success);
    assert_eq!(cs.agent_message, "the bug is in a third-party service");
}

#[tokio::test]
async fn test_generate_malformed_is_never_partial() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("<<<FILE a.py>>>\nok\n<<<END FILE>>>\n<<<FILE b.py>>>\nunclosed");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(!cs.success);
    assert!(cs.files.is_empty());
    assert!(cs.agent_message.contains("never closed"));
}

#[tokio::test]
async fn test_generate_zero_files_fails() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("I think it is fine.");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(!cs.success);
    assert!(cs.agent_message.contains("no file changes"));
}

#[tokio::test]
async fn test_generate_drops_excluded_and_escaping_paths() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying(
        "<<<FILE secrets/keys.py>>>\nx\n<<<END FILE>>>\n<<<FILE ../outside.py>>>\ny\n<<<END FILE>>>\n<<<FILE app/user_profile.py>>>\nz\n<<<END FILE>>>",
    );
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), excluding_secrets())).await;
    assert!(cs.success);
    assert_eq!(cs.paths(), vec!["app/user_profile.py"]);
}

#[tokio::test]
async fn test_generate_only_excluded_fails() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("<<<FILE secrets/keys.py>>>\nx\n<<<END FILE>>>");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), excluding_secrets())).await;
    assert!(!cs.success);
}

#[tokio::test]
async fn test_generate_reads_back_in_place_edits() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = FakeAgent::replying("<<<FILE app/user_profile.py>>>\ndeclared\n<<<END FILE>>>");
    agent.writes = vec![
        ("app/user_profile.py".into(), "on disk\n".into()),
        ("app/helpers.py".into(), "helper\n".into()),
    ];
    let vcs = FakeVcs::default();
    *vcs.changed.lock().unwrap() = vec!["app/user_profile.py".into(), "app/helpers.py".into()];

    let cs = generate_with(&agent, &vcs, &task(dir.path(), RepositoryPolicy::default())).await;
    assert!(cs.success);
    assert_eq!(cs.files["app/user_profile.py"], FileChange::Content("declared\n".into()));
    assert_eq!(cs.files["app/helpers.py"], FileChange::Content("helper\n".into()));
}

#[tokio::test]
async fn test_agent_receives_only_allowed_target_paths() {
    let dir = tempfile::tempdir().unwrap();
    let agent = FakeAgent::replying("<<<FILE app/user_profile.py>>>\nfixed\n<<<END FILE>>>");
    let cs = generate_with(&agent, &FakeVcs::default(), &task(dir.path(), excluding_secrets())).await;
    assert!(cs.success);
    let targets = agent.targets.lock().unwrap().clone();
    assert_eq!(targets, vec![vec!["app/user_profile.py".to_string()]]);
}
