use issuefix_core::analyzer::{analyze, analyze_bounded};
use issuefix_core::types::{FixPotential, IssueCategory};

#[test]
fn test_keyerror_report_is_fixable() {
    let a = analyze(
        "Bug: KeyError: 'profile' in user_profile.py line 42 ```python\nreturn user['profile']['name']\n```",
    );
    assert_eq!(a.file_paths, vec!["user_profile.py"]);
    assert_eq!(a.error_excerpts, vec!["KeyError: 'profile'"]);
    assert_eq!(a.code_blocks, vec!["return user['profile']['name']"]);
    assert_eq!(a.category, IssueCategory::Bug);
    assert_eq!(a.fix_potential, FixPotential::High);
    assert!(a.is_fixable);
}

#[test]
fn test_fenced_stack_trace_with_path_is_high() {
    let text = "Crash when saving a record.\n\
                ```\n\
                Traceback (most recent call last):\n  File \"app/models.py\", line 10, in save\nValueError: bad value\n\
                ```\n\
                Relevant code lives in app/models.py";
    let a = analyze(text);
    assert_eq!(a.file_paths, vec!["app/models.py"]);
    assert_eq!(a.error_excerpts.len(), 1);
    assert!(a.error_excerpts[0].starts_with("Traceback"));
    assert_eq!(a.code_blocks.len(), 1);
    assert_eq!(a.fix_potential, FixPotential::High);
    assert!(a.is_fixable);
}

#[test]
fn test_prose_traceback_is_one_excerpt() {
    let text = "Running it gives:\n\
                Traceback (most recent call last):\n  File \"main.py\", line 3, in <module>\n\
                ZeroDivisionError: division by zero\n\nThanks";
    let a = analyze(text);
    assert_eq!(a.error_excerpts.len(), 1);
    assert_eq!(a.error_excerpts[0].lines().count(), 3);
    assert_eq!(a.file_paths, vec!["main.py"]);
    assert!(a.is_fixable);
}

#[test]
fn test_feature_request_is_not_fixable() {
    let a = analyze("Please add support for dark mode in the settings page");
    assert_eq!(a.category, IssueCategory::Feature);
    assert!(!a.is_fixable);
}

#[test]
fn test_question_is_not_fixable() {
    let a = analyze("How do I configure the logger?");
    assert_eq!(a.category, IssueCategory::Question);
    assert_eq!(a.fix_potential, FixPotential::None);
    assert!(!a.is_fixable);
}

#[test]
fn test_bug_without_evidence_is_low() {
    let a = analyze("The app crashes on startup");
    assert_eq!(a.category, IssueCategory::Bug);
    assert_eq!(a.fix_potential, FixPotential::Low);
    assert!(!a.is_fixable);
}

#[test]
fn test_bug_with_only_path_is_medium() {
    let a = analyze("Login is broken, see src/auth/login.py");
    assert_eq!(a.category, IssueCategory::Bug);
    assert_eq!(a.fix_potential, FixPotential::Medium);
    assert!(a.is_fixable);
}

#[test]
fn test_tied_scores_are_other() {
    // bug scores 3; how + why + "?" also score 3
    let a = analyze("why is this a bug? how");
    assert_eq!(a.category, IssueCategory::Other);
    assert!(!a.is_fixable);
}

#[test]
fn test_empty_text() {
    for text in ["", "   \n\t  "] {
        let a = analyze(text);
        assert_eq!(a.category, IssueCategory::Other);
        assert_eq!(a.fix_potential, FixPotential::None);
        assert!(!a.is_fixable);
        assert!(a.file_paths.is_empty());
    }
}

#[test]
fn test_paths_are_deduplicated_in_order() {
    let a = analyze("Error: boom in `src/a.rs` and src/b.rs, also src/a.rs:12");
    assert_eq!(a.file_paths, vec!["src/a.rs", "src/b.rs"]);
}

#[test]
fn test_false_positive_paths_filtered() {
    let a = analyze("bug seen on https://example.com/index.py with v1.0 on docs.example.com");
    assert!(a.file_paths.is_empty(), "{:?}", a.file_paths);
}

#[test]
fn test_paths_inside_fences_are_not_scanned() {
    let a = analyze("bug\n```\nimport lib/helpers.py\n```");
    assert!(a.file_paths.is_empty());
}

#[test]
fn test_truncation_applies_before_scanning() {
    let mut text = "crash ".repeat(20);
    text.push_str("in src/late/file.rs");
    let a = analyze_bounded(&text, 60);
    assert!(a.file_paths.is_empty());
    let full = analyze_bounded(&text, 10_000);
    assert_eq!(full.file_paths, vec!["src/late/file.rs"]);
}

#[test]
fn test_analyze_is_deterministic() {
    let text = "TypeError: x is undefined at web/app.js:10";
    assert_eq!(analyze(text), analyze(text));
}

#[test]
fn test_fixable_implies_bug() {
    let samples = [
        "Please add an Error: handling feature to src/lib.rs",
        "How does src/main.rs work?",
        "TypeError: oops in web/app.js",
        "",
    ];
    for s in samples {
        let a = analyze(s);
        if a.is_fixable {
            assert_eq!(a.category, IssueCategory::Bug);
            assert_ne!(a.fix_potential, FixPotential::None);
        }
    }
}

#[test]
fn test_stack_trace_mention_in_feature_request_is_not_a_bug() {
    let a = analyze("Please add support for printing the stack trace in src/log.rs");
    assert_eq!(a.category, IssueCategory::Feature);
    assert!(a.error_excerpts.is_empty());
    assert!(!a.is_fixable);
}

#[test]
fn test_no_bug_keywords_is_never_bug() {
    let samples = [
        "Please add support for printing the stack trace in src/log.rs",
        "TypeError: oops in web/app.js",
        "```\nValueError: bad value\n```\nsee app/models.py",
        "How does src/main.rs handle retries?",
        "Feature: expose the stacktrace to `lib/report.py`",
        "Refactor web/app.js",
    ];
    for s in samples {
        let a = analyze(s);
        assert_ne!(a.category, IssueCategory::Bug, "{s:?}");
        assert!(!a.is_fixable, "{s:?}");
        assert_eq!(a, analyze(s));
    }
}

#[test]
fn test_fenced_exception_reaches_bug_through_keywords() {
    let a = analyze("```\nException in thread main\n```\nsee app/models.py");
    assert_eq!(a.category, IssueCategory::Bug);
    assert_eq!(a.fix_potential, FixPotential::High);
    assert!(a.is_fixable);
}
