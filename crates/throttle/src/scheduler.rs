//! Shared periodic driver for analysis ticks.
//!
//! A single tokio task per service keeps a min-heap of tick deadlines, one
//! entry per subscription. Every subscription ticks on its own phase: the first
//! tick is one period after it was registered and each following one exactly a
//! period later, regardless of when other subscriptions tick.
//!
//! # Late ticks
//!
//! If the task falls behind, the overdue tick still drains the accumulated
//! window, and the deadlines missed meanwhile are passed along with it. The
//! target accounts for them as empty windows in one step, so the signal decays
//! once per elapsed period no matter how long the stall was.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, ThrottleError};

/// Work driven by the scheduler once per period.
pub(crate) trait ScheduledAnalysis: Send + Sync + 'static {
    /// Run one analysis tick, followed by `missed_periods` periods that elapsed
    /// without a tick. Returns `false` once the target has been retired and
    /// must not be scheduled again.
    fn run_tick(&self, missed_periods: u64) -> bool;

    fn label(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    id: SubscriptionId,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties broken by registration order
        match self.at.cmp(&other.at) {
            Ordering::Equal => self.id.cmp(&other.id),
            ord => ord,
        }
    }
}

struct Entry {
    period: Duration,
    target: Weak<dyn ScheduledAnalysis>,
}

enum SchedulerCommand {
    Register {
        id: SubscriptionId,
        first_deadline: Instant,
        entry: Entry,
    },
    Cancel {
        id: SubscriptionId,
    },
    Shutdown,
}

/// Handle to the background analysis task.
///
/// The task stops when the handle is dropped or [`AnalysisScheduler::shutdown`]
/// is called.
pub(crate) struct AnalysisScheduler {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    next_id: AtomicU64,
}

impl AnalysisScheduler {
    pub(crate) fn start(handle: &Handle) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        handle.spawn(run_scheduler(rx));
        Self {
            commands,
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedule `target` to tick every `period`, starting one period from now.
    pub(crate) fn register(
        &self,
        target: Weak<dyn ScheduledAnalysis>,
        period: Duration,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let first_deadline = Instant::now() + period;
        self.commands
            .send(SchedulerCommand::Register {
                id,
                first_deadline,
                entry: Entry { period, target },
            })
            .map_err(|_| ThrottleError::SchedulerStopped)?;
        Ok(id)
    }

    /// Drop a subscription from the schedule. Targets are also dropped lazily
    /// at their next deadline once retired, so this only frees the slot early.
    pub(crate) fn cancel(&self, id: SubscriptionId) {
        if self.commands.send(SchedulerCommand::Cancel { id }).is_err() {
            tracing::trace!(?id, "Scheduler already stopped, nothing to cancel");
        }
    }

    pub(crate) fn shutdown(&self) {
        _ = self.commands.send(SchedulerCommand::Shutdown);
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

async fn run_scheduler(mut commands: mpsc::UnboundedReceiver<SchedulerCommand>) {
    let mut deadlines: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
    let mut entries: HashMap<SubscriptionId, Entry> = HashMap::new();
    tracing::debug!("Throttle analysis scheduler started");

    loop {
        let next_deadline = deadlines.peek().map(|Reverse(deadline)| deadline.at);
        let wait_for_deadline = async {
            match next_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(SchedulerCommand::Register { id, first_deadline, entry }) => {
                    entries.insert(id, entry);
                    deadlines.push(Reverse(Deadline { at: first_deadline, id }));
                }
                Some(SchedulerCommand::Cancel { id }) => {
                    entries.remove(&id);
                }
                Some(SchedulerCommand::Shutdown) | None => break,
            },
            _ = wait_for_deadline => {
                fire_due(&mut deadlines, &mut entries, Instant::now());
            }
        }
    }

    tracing::debug!(pending = entries.len(), "Throttle analysis scheduler stopped");
}

fn fire_due(
    deadlines: &mut BinaryHeap<Reverse<Deadline>>,
    entries: &mut HashMap<SubscriptionId, Entry>,
    now: Instant,
) {
    while let Some(Reverse(due)) = deadlines.peek().copied() {
        if due.at > now {
            break;
        }
        deadlines.pop();

        // Cancelled while waiting in the heap
        let Some(entry) = entries.get(&due.id) else {
            continue;
        };
        let period = entry.period;
        let Some(target) = entry.target.upgrade() else {
            entries.remove(&due.id);
            continue;
        };

        let missed = missed_periods(now.saturating_duration_since(due.at), period);
        if missed > 0 {
            tracing::warn!(
                session = target.label(),
                missed,
                lag_ms = now.saturating_duration_since(due.at).as_millis() as u64,
                "Throttle analysis fell behind, catching up missed ticks"
            );
        }

        if target.run_tick(missed) {
            let ticks = u32::try_from(missed.saturating_add(1)).unwrap_or(u32::MAX);
            let next = due.at + period.saturating_mul(ticks);
            deadlines.push(Reverse(Deadline { at: next, id: due.id }));
        } else {
            tracing::trace!(session = target.label(), "Dropping retired subscription");
            entries.remove(&due.id);
        }
    }
}

/// Number of whole periods that elapsed past a deadline.
fn missed_periods(lag: Duration, period: Duration) -> u64 {
    if period.is_zero() {
        return 0;
    }
    (lag.as_nanos() / period.as_nanos()).try_into().unwrap_or(u64::MAX)
}
