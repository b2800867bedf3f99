use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify, Semaphore};
use tracing::{error, info, warn};

pub use crate::types::PipelineEvent;

use crate::{
    agent::AgentBackend,
    analyzer::analyze_bounded,
    audit::AuditLog,
    config::PipelineSettings,
    fixer::Fixer,
    git::VersionControl,
    notify::{is_bot_actor, is_self_authored, Notifier},
    platform::{PlatformApi, RetryingPlatform},
    policy,
    submitter::{SubmitContext, Submitter},
    types::{
        Event, EventKind, FixTask, IssueAnalysis, IssueKey, PipelineRun, RepositoryPolicy, RunOutcome,
        RunState,
    },
    workspace::{branch_name_for, run_dir, PrepareError, Preparer, WorkingCopy},
};

/// What `dispatch` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A new run started for the issue.
    Started,
    /// A run is active; the event will run after it (replacing any earlier queued event).
    Queued,
    /// Already seen, or carries nothing new relative to the active/queued event.
    Duplicate,
    /// Authored by the bot itself (its account, or a comment it posted).
    SelfAuthored,
}

/// Lock-table entry: the event being processed and at most one successor.
struct IssueSlot {
    active: Event,
    queued: Option<Event>,
}

/// Bounded memory of recently seen delivery ids.
struct RecentDeliveries {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentDeliveries {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when `id` was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct Pipeline {
    platform: Arc<dyn PlatformApi>,
    vcs: Arc<dyn VersionControl>,
    agent: Arc<dyn AgentBackend>,
    settings: PipelineSettings,
    audit: Option<AuditLog>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    locks: Mutex<HashMap<IssueKey, IssueSlot>>,
    recent: Mutex<RecentDeliveries>,
    permits: Arc<Semaphore>,
    idle: Notify,
}

impl Pipeline {
    /// Platform calls made by the pipeline are retried per `settings.retry`.
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        vcs: Arc<dyn VersionControl>,
        agent: Arc<dyn AgentBackend>,
        settings: PipelineSettings,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let platform: Arc<dyn PlatformApi> =
            Arc::new(RetryingPlatform::new(platform, settings.retry.clone()));
        let p = Self {
            platform,
            vcs,
            agent,
            audit: settings.audit_log.clone().map(AuditLog::new),
            event_tx: tx,
            locks: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentDeliveries::new(settings.recent_deliveries)),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            idle: Notify::new(),
            settings,
        };
        (p, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    // ── Dispatch ──────────────────────────────────────────────────────────

    /// Entry point for inbound events. Starts a run, queues the event behind
    /// the issue's active run, or drops it as a duplicate.
    pub async fn dispatch(self: &Arc<Self>, event: Event) -> Dispatch {
        let key = event.issue_key();

        if is_bot_actor(&event.actor, &self.settings.bot_login)
            || (event.kind == EventKind::IssueComment && is_self_authored(&event.raw_text))
        {
            info!(issue = %key, actor = %event.actor, "event authored by the bot; dropped");
            return Dispatch::SelfAuthored;
        }

        if !event.delivery_id.is_empty() && !self.recent.lock().await.insert(&event.delivery_id) {
            info!(issue = %key, delivery = %event.delivery_id, "duplicate delivery dropped");
            return Dispatch::Duplicate;
        }

        let mut locks = self.locks.lock().await;
        if let Some(slot) = locks.get_mut(&key) {
            let repeats_active = slot.active.same_content(&event);
            let repeats_queued = slot.queued.as_ref().is_some_and(|q| q.same_content(&event));
            if repeats_active || repeats_queued {
                info!(issue = %key, "event carries no new information; dropped");
                return Dispatch::Duplicate;
            }
            info!(issue = %key, replaced = slot.queued.is_some(), "run active; event queued");
            slot.queued = Some(event);
            return Dispatch::Queued;
        }

        locks.insert(
            key.clone(),
            IssueSlot {
                active: event.clone(),
                queued: None,
            },
        );
        drop(locks);

        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.drive(key, event).await });
        Dispatch::Started
    }

    /// Resolves once no issue has an active or queued run.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.locks.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub async fn active_issues(&self) -> Vec<IssueKey> {
        self.locks.lock().await.keys().cloned().collect()
    }

    /// Run `event` and then any events queued for the same issue, releasing
    /// the lock-table entry when the queue drains.
    async fn drive(self: Arc<Self>, key: IssueKey, first: Event) {
        let mut event = first;
        loop {
            self.run_event(event).await;

            let mut locks = self.locks.lock().await;
            let next = match locks.get_mut(&key) {
                Some(slot) => match slot.queued.take() {
                    Some(next) => {
                        slot.active = next.clone();
                        Some(next)
                    }
                    None => None,
                },
                None => None,
            };
            match next {
                Some(next) => event = next,
                None => {
                    locks.remove(&key);
                    if locks.is_empty() {
                        self.idle.notify_waiters();
                    }
                    return;
                }
            }
        }
    }

    // ── Single run ────────────────────────────────────────────────────────

    /// Execute one run to a terminal state under the concurrency cap and the
    /// overall run timeout. Bypasses the lock table.
    pub async fn run_event(&self, event: Event) -> PipelineRun {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => Some(p),
            Err(e) => {
                error!("run semaphore closed: {e}");
                None
            }
        };

        let mut run = PipelineRun::new(event);
        let repo = run.event.repository.clone();
        let issue = run.event.issue_number;
        let notifier = Notifier::new(&*self.platform, &repo, issue);
        info!(run_id = %run.run_id, repo = %repo, issue, kind = ?run.event.kind, "run started");
        self.emit_transition(&run);

        let timed_out = tokio::time::timeout(
            self.settings.run_timeout,
            self.execute(&mut run, &notifier),
        )
        .await
        .is_err();

        if timed_out && !run.state.is_terminal() {
            let detail = format!(
                "run timed out after {}s in state {}",
                self.settings.run_timeout.as_secs(),
                run.state.as_str()
            );
            warn!(run_id = %run.run_id, repo = %repo, issue, "{detail}");
            self.fail(&mut run, &notifier, detail).await;
        }

        let dir = run_dir(&self.settings.workspace_root, &repo, &run.run_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(run_id = %run.run_id, path = %dir.display(), "failed to remove working copy: {e}");
            }
        }

        self.record_finish(&run).await;
        run
    }

    async fn execute(&self, run: &mut PipelineRun, notifier: &Notifier<'_>) {
        let repo = run.event.repository.clone();
        let issue = run.event.issue_number;

        // Received → Filtered
        let resolved = policy::resolve(&*self.platform, &repo, &self.settings.policy_path).await;
        let policy = resolved.policy;
        run.policy = Some(policy.clone());
        run.used_default_policy = resolved.used_defaults;

        if let Some(reason) = ignore_reason(&run.event, &policy) {
            notifier.suppress();
            info!(run_id = %run.run_id, repo = %repo, issue, "ignored: {reason}");
            self.finish(run, RunState::Ignored, RunOutcome::RejectedIgnored, Some(reason));
            return;
        }
        self.advance(run, RunState::Filtered);

        // Filtered → Analyzed
        let analysis = analyze_bounded(&run.event.raw_text, self.settings.max_issue_bytes);
        run.analysis = Some(analysis.clone());
        info!(
            run_id = %run.run_id,
            category = %analysis.category,
            fix_potential = %analysis.fix_potential,
            fixable = analysis.is_fixable,
            paths = analysis.file_paths.len(),
            "issue analyzed"
        );
        if !analysis.is_fixable {
            notifier.notify_best_effort(&unfixable_comment(&analysis)).await;
            self.finish(
                run,
                RunState::Rejected,
                RunOutcome::RejectedUnfixable,
                Some(format!("not fixable: category={} potential={}", analysis.category, analysis.fix_potential)),
            );
            return;
        }
        self.advance(run, RunState::Analyzed);

        // Analyzed → Prepared
        let branch = branch_name_for(issue);
        run.branch = Some(branch.clone());
        let wc = match self.prepare(&repo, &branch, &run.run_id).await {
            Ok(wc) => wc,
            Err(e) => {
                self.fail(run, notifier, format!("preparation failed: {e}")).await;
                return;
            }
        };
        self.advance(run, RunState::Prepared);

        // Prepared → Generated
        let task = FixTask {
            working_copy: wc.path.clone(),
            branch: branch.clone(),
            issue_number: issue,
            title: run.event.title.clone(),
            body: run.event.raw_text.clone(),
            target_paths: analysis.file_paths.clone(),
            error_context: analysis.error_excerpts.clone(),
            policy: policy.clone(),
        };
        let fixer = Fixer {
            agent: &*self.agent,
            vcs: &*self.vcs,
            agent_timeout: self.settings.agent_timeout,
            max_task_bytes: self.settings.max_task_bytes,
        };
        let change_set = fixer.generate(&task).await;
        run.change_set = Some(change_set.clone());
        if !change_set.is_submittable() {
            let message = change_set.agent_message.clone();
            notifier.notify_best_effort(&agent_failure_comment(&message)).await;
            self.finish(run, RunState::Rejected, RunOutcome::RejectedUnfixable, Some(message));
            return;
        }
        self.advance(run, RunState::Generated);

        // Generated → Submitted
        let submitter = Submitter {
            vcs: &*self.vcs,
            platform: &*self.platform,
        };
        let title = run.event.title.clone();
        let ctx = SubmitContext {
            repository: &repo,
            issue_number: issue,
            title: &title,
            analysis: &analysis,
            policy: &policy,
            author: &self.settings.author,
            notifier,
        };
        let submitted = submitter.submit(&wc, change_set, &ctx).await;
        match submitted {
            Ok(request) => {
                run.change_request = Some(request);
                self.finish(run, RunState::Submitted, RunOutcome::Submitted, None);
            }
            Err(e) => {
                warn!(run_id = %run.run_id, step = %e.step, "submission failed: {}", e.detail);
                run.change_request = e.change_request.clone();
                if e.change_request.is_none() {
                    notifier
                        .notify_best_effort(&failure_comment(&format!("the {} step failed: {}", e.step, e.detail)))
                        .await;
                }
                self.finish(run, RunState::Failed, RunOutcome::Failed, Some(e.to_string()));
            }
        }
    }

    async fn prepare(&self, repo: &str, branch: &str, run_id: &str) -> Result<WorkingCopy, PrepareError> {
        let base_ref = self
            .platform
            .default_branch(repo)
            .await
            .map_err(|e| PrepareError::CloneFailed(format!("could not resolve default branch: {e}")))?;
        let preparer = Preparer {
            vcs: &*self.vcs,
            platform: &*self.platform,
            workspace_root: &self.settings.workspace_root,
        };
        preparer.prepare(repo, &base_ref, branch, run_id).await
    }

    // ── State transitions ─────────────────────────────────────────────────

    fn advance(&self, run: &mut PipelineRun, state: RunState) {
        run.advance(state);
        info!(run_id = %run.run_id, issue = %run.event.issue_key(), state = state.as_str(), "run transition");
        self.emit_transition(run);
    }

    fn finish(&self, run: &mut PipelineRun, state: RunState, outcome: RunOutcome, detail: Option<String>) {
        run.finish(state, outcome, detail);
        self.emit_transition(run);
    }

    async fn fail(&self, run: &mut PipelineRun, notifier: &Notifier<'_>, detail: String) {
        notifier.notify_best_effort(&failure_comment(&detail)).await;
        self.finish(run, RunState::Failed, RunOutcome::Failed, Some(detail));
    }

    async fn record_finish(&self, run: &PipelineRun) {
        let outcome = run.outcome.unwrap_or(RunOutcome::Failed);
        let message = run.error.clone().unwrap_or_else(|| match &run.change_request {
            Some(cr) => cr.url.clone(),
            None => String::new(),
        });
        info!(
            run_id = %run.run_id,
            issue = %run.event.issue_key(),
            state = run.state.as_str(),
            outcome = ?outcome,
            "run finished"
        );
        self.emit(PipelineEvent::Finished {
            run_id: run.run_id.clone(),
            issue: run.event.issue_key(),
            outcome,
            message,
        });
        if let Some(audit) = &self.audit {
            audit.append(run).await;
        }
    }

    // ── Event broadcast ───────────────────────────────────────────────────

    fn emit_transition(&self, run: &PipelineRun) {
        self.emit(PipelineEvent::Transition {
            run_id: run.run_id.clone(),
            issue: run.event.issue_key(),
            state: run.state,
        });
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Why the event is out of scope for this repository's policy, if it is.
pub fn ignore_reason(event: &Event, policy: &RepositoryPolicy) -> Option<String> {
    if let Some(label) = event.labels.iter().find(|l| policy.ignore_labels.contains(*l)) {
        return Some(format!("carries ignore label {label:?}"));
    }
    if !policy.process_labels.is_empty() && event.labels.is_disjoint(&policy.process_labels) {
        return Some("carries no processing label".to_string());
    }
    None
}

fn unfixable_comment(analysis: &IssueAnalysis) -> String {
    format!(
        "I looked at this issue but couldn't find enough to attempt an automatic fix.\n\n{}\n\
         Adding the affected file paths and the full error output usually helps.",
        analysis.summary()
    )
}

fn agent_failure_comment(message: &str) -> String {
    format!("I tried to generate a fix for this issue but couldn't produce one.\n\nReason: {message}")
}

fn failure_comment(detail: &str) -> String {
    format!(
        "I tried to fix this issue automatically but ran into an error: {detail}\n\n\
         Re-labeling or updating the issue will retry."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use std::collections::BTreeSet;

    fn event(labels: &[&str]) -> Event {
        Event {
            kind: EventKind::IssueCreated,
            repository: "acme/app".into(),
            issue_number: 1,
            actor: "alice".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            title: String::new(),
            raw_text: String::new(),
            delivery_id: String::new(),
        }
    }

    #[test]
    fn ignore_label_wins_over_process_label() {
        let p = RepositoryPolicy::default();
        assert!(ignore_reason(&event(&["bug", "wontfix"]), &p).is_some());
        assert!(ignore_reason(&event(&["bug"]), &p).is_none());
        assert!(ignore_reason(&event(&["docs"]), &p).is_some());
    }

    #[test]
    fn empty_process_set_accepts_everything() {
        let p = RepositoryPolicy {
            process_labels: BTreeSet::new(),
            ..RepositoryPolicy::default()
        };
        assert!(ignore_reason(&event(&[]), &p).is_none());
    }

    #[test]
    fn recent_deliveries_are_bounded() {
        let mut r = RecentDeliveries::new(2);
        assert!(r.insert("a"));
        assert!(!r.insert("a"));
        assert!(r.insert("b"));
        assert!(r.insert("c"));
        // "a" fell out of the window
        assert!(r.insert("a"));
    }
}
