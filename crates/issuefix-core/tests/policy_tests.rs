mod common;

use std::collections::BTreeSet;

use common::FakePlatform;
use issuefix_core::platform::ApiError;
use issuefix_core::policy::{parse_policy, resolve, POLICY_PATH};
use issuefix_core::types::RepositoryPolicy;
use tracing_test::traced_test;

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_missing_pr_section_keeps_pr_defaults() {
    let yaml = "labels:\n  process: [crash]\n  ignore: [question]\nfiles:\n  include: ['src/**']\n  exclude: ['src/vendor/**']\n";
    let p = parse_policy(yaml).unwrap();
    assert_eq!(p.process_labels, set(&["crash"]));
    assert_eq!(p.ignore_labels, set(&["question"]));
    assert_eq!(p.path_includes, vec!["src/**"]);
    assert_eq!(p.path_excludes, vec!["src/vendor/**"]);

    let d = RepositoryPolicy::default();
    assert_eq!(p.reviewers, d.reviewers);
    assert_eq!(p.draft, d.draft);
    assert_eq!(p.pr_labels, d.pr_labels);
}

#[test]
fn test_full_document() {
    let yaml = r#"
labels:
  process: ["bug", "autofix"]
  ignore: []
files:
  include: ["**/*.py"]
pr:
  reviewers: [octocat]
  draft: true
  labels: [automated]
unrelated: 12
"#;
    let p = parse_policy(yaml).unwrap();
    assert_eq!(p.process_labels, set(&["bug", "autofix"]));
    assert!(p.ignore_labels.is_empty());
    assert_eq!(p.path_includes, vec!["**/*.py"]);
    assert!(p.path_excludes.is_empty());
    assert_eq!(p.reviewers, set(&["octocat"]));
    assert!(p.draft);
    assert_eq!(p.pr_labels, set(&["automated"]));
}

#[test]
fn test_bad_draft_reverts_only_draft() {
    let p = parse_policy("pr:\n  draft: maybe\n  reviewers: [a]\n").unwrap();
    assert!(!p.draft);
    assert_eq!(p.reviewers, set(&["a"]));
}

#[test]
fn test_section_with_wrong_shape_is_ignored() {
    let p = parse_policy("labels: [bug]\npr:\n  draft: true\n").unwrap();
    assert_eq!(p.process_labels, RepositoryPolicy::default().process_labels);
    assert!(p.draft);
}

#[test]
fn test_malformed_yaml_is_error() {
    assert!(parse_policy("labels: [unclosed\n  - : :").is_err());
}

#[tokio::test]
#[traced_test]
async fn test_resolve_missing_file_uses_defaults() {
    let platform = FakePlatform::default();
    let r = resolve(&platform, "acme/webapp", POLICY_PATH).await;
    assert!(r.used_defaults);
    assert_eq!(r.policy, RepositoryPolicy::default());
    assert!(logs_contain("no policy file"));
}

#[tokio::test]
async fn test_resolve_fetch_error_uses_defaults() {
    let platform = FakePlatform::default();
    *platform.fetch_error.lock().unwrap() = Some(ApiError::Transport {
        operation: "fetch file".into(),
        detail: "connection reset".into(),
        transient: true,
    });
    let r = resolve(&platform, "acme/webapp", POLICY_PATH).await;
    assert!(r.used_defaults);
    assert_eq!(r.policy, RepositoryPolicy::default());
}

#[tokio::test]
async fn test_resolve_invalid_document_uses_defaults() {
    let platform = FakePlatform::with_policy("labels: [unclosed\n  - : :");
    let r = resolve(&platform, "acme/webapp", POLICY_PATH).await;
    assert!(r.used_defaults);
}

#[tokio::test]
async fn test_resolve_valid_document() {
    let platform = FakePlatform::with_policy("pr:\n  draft: true\n");
    let r = resolve(&platform, "acme/webapp", POLICY_PATH).await;
    assert!(!r.used_defaults);
    assert!(r.policy.draft);
    assert_eq!(r.policy.process_labels, RepositoryPolicy::default().process_labels);
}
