//! Status poller for delegated steps.
//!
//! One poller serves a whole run: every in-flight delegated step is an
//! entry with its own deadline and backoff interval, and the run driver
//! sleeps until [`Poller::next_wake`] then calls [`Poller::poll_due`].
//! Polls are non-blocking reads through the [`CommandChannel`].
//!
//! A step that times out is not forgotten: its context stays on a watch
//! list so that a status arriving afterwards can be reported as late
//! (and otherwise ignored).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::{CommandChannel, PollResult, StatusArtifact};
use crate::config::{PollConfig, MAX_WAIT_SECS};
use crate::worktree::{ExecutionContext, WorktreeManager};

/// A delegated step waiting on the external runtime.
#[derive(Debug, Clone)]
pub struct PollRegistration {
    pub step: String,
    pub invocation_id: String,
    pub context: ExecutionContext,
    /// Remaining wait budget from the moment of registration
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Terminal status received in time
    Completed {
        step: String,
        invocation_id: String,
        status: StatusArtifact,
    },
    TimedOut {
        step: String,
        invocation_id: String,
        waited: Duration,
    },
    /// Terminal status for a step that had already timed out
    Late {
        step: String,
        invocation_id: String,
        status: StatusArtifact,
    },
}

struct Entry {
    reg: PollRegistration,
    registered_at: Instant,
    deadline: Instant,
    next_poll: Instant,
    interval: Duration,
    seen_running: bool,
}

struct Watch {
    step: String,
    invocation_id: String,
    context: ExecutionContext,
    next_poll: Instant,
}

pub struct Poller {
    config: PollConfig,
    channel: Arc<dyn CommandChannel>,
    worktrees: WorktreeManager,
    entries: Vec<Entry>,
    expired: Vec<Watch>,
}

impl Poller {
    pub fn new(
        config: PollConfig,
        channel: Arc<dyn CommandChannel>,
        worktrees: WorktreeManager,
    ) -> Self {
        Self {
            config,
            channel,
            worktrees,
            entries: Vec::new(),
            expired: Vec::new(),
        }
    }

    /// Start waiting on a step. Pins its context until deregistered.
    pub fn register(&mut self, reg: PollRegistration) {
        let now = Instant::now();
        self.worktrees.pin(&reg.context.id);
        tracing::debug!(
            "[Poller] Watching {} (invocation {}) for up to {:?}",
            reg.step,
            reg.invocation_id,
            reg.timeout
        );
        self.entries.push(Entry {
            registered_at: now,
            deadline: later(now, reg.timeout),
            next_poll: now,
            interval: self.config.initial_interval(),
            seen_running: false,
            reg,
        });
    }

    /// Drop every registration and watch. Returns the steps that were being polled.
    pub fn deregister_all(&mut self) -> Vec<String> {
        self.expired.clear();
        self.entries
            .drain(..)
            .map(|e| {
                self.worktrees.unpin(&e.reg.context.id);
                e.reg.step
            })
            .collect()
    }

    pub fn is_registered(&self, step: &str) -> bool {
        self.entries.iter().any(|e| e.reg.step == step)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest instant at which `poll_due` has something to do.
    pub fn next_wake(&self) -> Option<Instant> {
        let active = self.entries.iter().map(|e| e.next_poll.min(e.deadline));
        let watched = self.expired.iter().map(|w| w.next_poll);
        active.chain(watched).min()
    }

    /// Poll every entry that is due at `now`, and expire overdue ones.
    pub fn poll_due(&mut self, now: Instant) -> Vec<PollEvent> {
        let mut events = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());

        for mut entry in std::mem::take(&mut self.entries) {
            // Deadline first: nothing read after the budget ran out is applied.
            if now >= entry.deadline {
                let waited = now.saturating_duration_since(entry.registered_at);
                tracing::warn!(
                    "[Poller] {} timed out after {:?} (invocation {})",
                    entry.reg.step,
                    waited,
                    entry.reg.invocation_id
                );
                self.worktrees.unpin(&entry.reg.context.id);
                events.push(PollEvent::TimedOut {
                    step: entry.reg.step.clone(),
                    invocation_id: entry.reg.invocation_id.clone(),
                    waited,
                });
                self.expired.push(Watch {
                    step: entry.reg.step,
                    invocation_id: entry.reg.invocation_id,
                    context: entry.reg.context,
                    next_poll: later(now, self.config.max_interval()),
                });
                continue;
            }

            if now < entry.next_poll {
                remaining.push(entry);
                continue;
            }

            match self.channel.poll(&entry.reg.context, &entry.reg.invocation_id) {
                Ok(PollResult::Status(status)) if status.is_terminal() => {
                    tracing::info!(
                        "[Poller] {} finished: {:?}",
                        entry.reg.step,
                        status.state
                    );
                    self.worktrees.unpin(&entry.reg.context.id);
                    events.push(PollEvent::Completed {
                        step: entry.reg.step,
                        invocation_id: entry.reg.invocation_id,
                        status,
                    });
                    continue;
                }
                Ok(PollResult::Status(_)) => {
                    if !entry.seen_running {
                        tracing::info!("[Poller] {} picked up by runtime", entry.reg.step);
                        entry.seen_running = true;
                    }
                }
                Ok(PollResult::Pending) => {}
                Err(e) => {
                    tracing::warn!("[Poller] Poll failed for {}: {}", entry.reg.step, e);
                }
            }

            entry.interval = self.config.next_interval(entry.interval);
            entry.next_poll = later(now, entry.interval);
            remaining.push(entry);
        }
        self.entries = remaining;

        let mut still_watched = Vec::with_capacity(self.expired.len());
        for mut watch in std::mem::take(&mut self.expired) {
            if now < watch.next_poll {
                still_watched.push(watch);
                continue;
            }
            match self.channel.poll(&watch.context, &watch.invocation_id) {
                Ok(PollResult::Status(status)) if status.is_terminal() => {
                    tracing::warn!(
                        "[Poller] Ignoring late {:?} status for timed-out step {} (invocation {})",
                        status.state,
                        watch.step,
                        watch.invocation_id
                    );
                    events.push(PollEvent::Late {
                        step: watch.step,
                        invocation_id: watch.invocation_id,
                        status,
                    });
                }
                _ => {
                    watch.next_poll = later(now, self.config.max_interval());
                    still_watched.push(watch);
                }
            }
        }
        self.expired = still_watched;

        events
    }
}

/// A driver that is aborted mid-run still gives its contexts back.
impl Drop for Poller {
    fn drop(&mut self) {
        self.deregister_all();
    }
}

/// `now + wait`, with waits capped so the deadline always exists.
fn later(now: Instant, wait: Duration) -> Instant {
    let wait = wait.min(Duration::from_secs(MAX_WAIT_SECS));
    now.checked_add(wait).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CommandArtifact, InMemoryChannel, StatusState};
    use crate::config::ProvisionerKind;

    fn config() -> PollConfig {
        PollConfig {
            initial_interval_ms: 10,
            max_interval_ms: 40,
            backoff_factor: 2.0,
            default_timeout_secs: 60,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        channel: InMemoryChannel,
        worktrees: WorktreeManager,
        poller: Poller,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let worktrees = WorktreeManager::new(
            dir.path(),
            dir.path(),
            ProvisionerKind::Directory,
            Duration::ZERO,
        );
        let channel = InMemoryChannel::new();
        let poller = Poller::new(config(), Arc::new(channel.clone()), worktrees.clone());
        Fixture {
            _dir: dir,
            channel,
            worktrees,
            poller,
        }
    }

    fn dispatch(f: &mut Fixture, step: &str, inv: &str, timeout: Duration) -> ExecutionContext {
        let ctx = f.worktrees.acquire("run-1", step, inv).unwrap();
        f.channel
            .send(&ctx, CommandArtifact::new("run-1", step, inv, "act"))
            .unwrap();
        f.poller.register(PollRegistration {
            step: step.into(),
            invocation_id: inv.into(),
            context: ctx.clone(),
            timeout,
        });
        ctx
    }

    #[test]
    fn test_pending_backs_off_up_to_max() {
        let mut f = fixture();
        dispatch(&mut f, "b", "inv-b", Duration::from_secs(60));

        let start = Instant::now();
        let mut now = start;
        let mut gaps = Vec::new();
        for _ in 0..5 {
            assert!(f.poller.poll_due(now).is_empty());
            let wake = f.poller.next_wake().unwrap();
            gaps.push(wake - now);
            now = wake;
        }
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
    }

    #[test]
    fn test_terminal_status_completes_and_unpins() {
        let mut f = fixture();
        let ctx = dispatch(&mut f, "b", "inv-b", Duration::from_secs(60));
        assert!(f.worktrees.is_pinned(&ctx.id));

        f.channel.respond_to_step("b", StatusState::Running);
        assert!(f.poller.poll_due(Instant::now()).is_empty());

        f.channel.respond_to_step("b", StatusState::Succeeded);
        let events = f.poller.poll_due(Instant::now() + Duration::from_secs(1));
        assert!(matches!(
            &events[..],
            [PollEvent::Completed { step, .. }] if step == "b"
        ));
        assert!(f.poller.is_empty());
        assert!(!f.worktrees.is_pinned(&ctx.id));
    }

    #[test]
    fn test_timeout_then_late_status_is_reported_not_applied() {
        let mut f = fixture();
        let ctx = dispatch(&mut f, "c", "inv-c", Duration::from_millis(50));

        let after = Instant::now() + Duration::from_millis(60);
        let events = f.poller.poll_due(after);
        assert!(matches!(&events[..], [PollEvent::TimedOut { step, .. }] if step == "c"));
        assert!(!f.worktrees.is_pinned(&ctx.id));
        assert!(f.poller.is_empty());

        f.channel.respond_to_step("c", StatusState::Succeeded);
        let wake = f.poller.next_wake().unwrap();
        let events = f.poller.poll_due(wake);
        assert!(matches!(&events[..], [PollEvent::Late { step, .. }] if step == "c"));
        assert!(f.poller.next_wake().is_none());
    }

    #[test]
    fn test_status_present_at_deadline_still_times_out() {
        let mut f = fixture();
        dispatch(&mut f, "c", "inv-c", Duration::from_millis(50));
        f.channel.respond_to_step("c", StatusState::Succeeded);

        let events = f.poller.poll_due(Instant::now() + Duration::from_millis(60));
        assert!(matches!(&events[..], [PollEvent::TimedOut { .. }]));
    }

    #[test]
    fn test_huge_timeout_is_capped_not_overflowed() {
        let mut f = fixture();
        dispatch(&mut f, "b", "inv-b", Duration::from_secs(u64::MAX));

        let now = Instant::now();
        assert!(f.poller.poll_due(now).is_empty());
        assert!(f.poller.is_registered("b"));

        f.channel.respond_to_step("b", StatusState::Succeeded);
        let events = f.poller.poll_due(f.poller.next_wake().unwrap());
        assert!(matches!(&events[..], [PollEvent::Completed { step, .. }] if step == "b"));
    }

    #[test]
    fn test_dropping_poller_unpins_contexts() {
        let mut f = fixture();
        let ctx = dispatch(&mut f, "b", "inv-b", Duration::from_secs(60));
        assert!(f.worktrees.is_pinned(&ctx.id));

        let Fixture { worktrees, poller, .. } = f;
        drop(poller);
        assert!(!worktrees.is_pinned(&ctx.id));
    }

    #[test]
    fn test_deregister_all_unpins() {
        let mut f = fixture();
        let a = dispatch(&mut f, "a", "inv-a", Duration::from_secs(60));
        let b = dispatch(&mut f, "b", "inv-b", Duration::from_secs(60));
        assert_eq!(f.poller.len(), 2);

        let mut steps = f.poller.deregister_all();
        steps.sort();
        assert_eq!(steps, vec!["a", "b"]);
        assert!(!f.worktrees.is_pinned(&a.id));
        assert!(!f.worktrees.is_pinned(&b.id));
        assert!(f.poller.next_wake().is_none());
    }
}
