//! Layered readiness timers.
//!
//! DESIGN
//! ======
//! While the system is not ready, two tokio timers run: a soft one (~500ms)
//! and a hard one (~15s). Both are aborted the instant readiness flips true.
//! Each arming bumps a generation number carried by the firing message, so a
//! firing already queued when the timers were disarmed is recognized as
//! stale and ignored.
//!
//! A third, independent timer re-checks the provider once a sign-out held back
//! by the transient window expires. Readiness does not touch it: the session is
//! still present and ready while it runs. It has its own generation counter.
//!
//! The supervisor only reports firings. What a firing means (resolve a guest,
//! force degraded readiness) is decided by the context that owns the inputs.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Soft,
    Hard,
    SignOutRecheck,
}

impl TimerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::SignOutRecheck => "sign_out_recheck",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub struct TimeoutSupervisor {
    soft_after: Duration,
    hard_after: Duration,
    generation: u64,
    soft: Option<JoinHandle<()>>,
    hard: Option<JoinHandle<()>>,
    recheck_generation: u64,
    recheck: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimeoutSupervisor {
    #[must_use]
    pub fn new(soft_after: Duration, hard_after: Duration, tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            soft_after,
            hard_after,
            generation: 0,
            soft: None,
            hard: None,
            recheck_generation: 0,
            recheck: None,
            tx,
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.hard.is_some()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arm when not ready, disarm when ready. Idempotent.
    pub fn sync(&mut self, ready: bool) {
        if ready {
            self.disarm();
        } else if !self.is_armed() {
            self.arm();
        }
    }

    #[must_use]
    pub fn has_recheck(&self) -> bool {
        self.recheck.is_some()
    }

    /// Whether a firing belongs to the live arming, or to the pending recheck.
    #[must_use]
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        match fired.kind {
            TimerKind::SignOutRecheck => self.has_recheck() && fired.generation == self.recheck_generation,
            TimerKind::Soft | TimerKind::Hard => self.is_armed() && fired.generation == self.generation,
        }
    }

    /// Fire one `SignOutRecheck` after `after`, replacing any pending one.
    pub fn schedule_recheck(&mut self, after: Duration) {
        self.cancel_recheck();
        self.recheck_generation += 1;
        let generation = self.recheck_generation;
        self.recheck = Some(spawn_timer(self.tx.clone(), TimerKind::SignOutRecheck, after, generation));
        debug!(generation, after = ?after, "sign-out recheck scheduled");
    }

    pub fn cancel_recheck(&mut self) {
        if let Some(handle) = self.recheck.take() {
            handle.abort();
            self.recheck_generation += 1;
            debug!(generation = self.recheck_generation, "sign-out recheck cancelled");
        }
    }

    /// Start a fresh pair of timers, discarding any live ones.
    pub fn rearm(&mut self) {
        self.disarm();
        self.arm();
    }

    pub fn disarm(&mut self) {
        let had_timers = self.hard.is_some();
        if let Some(handle) = self.soft.take() {
            handle.abort();
        }
        if let Some(handle) = self.hard.take() {
            handle.abort();
        }
        if had_timers {
            self.generation += 1;
            debug!(generation = self.generation, "readiness timers disarmed");
        }
    }

    fn arm(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.soft = Some(spawn_timer(self.tx.clone(), TimerKind::Soft, self.soft_after, generation));
        self.hard = Some(spawn_timer(self.tx.clone(), TimerKind::Hard, self.hard_after, generation));
        debug!(generation, "readiness timers armed");
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.disarm();
        self.cancel_recheck();
    }
}

fn spawn_timer(
    tx: mpsc::UnboundedSender<TimerFired>,
    kind: TimerKind,
    after: Duration,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(TimerFired { kind, generation });
    })
}

#[cfg(test)]
#[path = "timeout_test.rs"]
mod tests;
