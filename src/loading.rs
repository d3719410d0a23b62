//! Loading gate for the image panel.
//!
//! Every selection change opens a gate. It closes once the image texture, the
//! session listing and the analysis panel have all reported ready for that
//! index and the minimum loading time has passed. Callers pass `now`
//! explicitly so the timing is testable.

use std::time::{Duration, Instant};

use crate::image_set::{SelectionChange, TransitionDirection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub image: bool,
    pub session: bool,
    pub analysis: bool,
}

impl Readiness {
    pub fn all(self) -> bool {
        self.image && self.session && self.analysis
    }

    /// Names of the signals still outstanding, for the loading indicator.
    pub fn pending(self) -> Vec<&'static str> {
        [
            (self.image, "image"),
            (self.session, "scan"),
            (self.analysis, "analysis"),
        ]
        .into_iter()
        .filter(|(ready, _)| !ready)
        .map(|(_, name)| name)
        .collect()
    }
}

#[derive(Debug, Clone)]
struct Gate {
    index: usize,
    opened_at: Instant,
    signals: Readiness,
    settled_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct LoadingCoordinator {
    min_duration: Duration,
    gate: Option<Gate>,
    direction: Option<TransitionDirection>,
    cache_revision: u64,
}

impl LoadingCoordinator {
    pub fn new(min_duration: Duration) -> Self {
        Self {
            min_duration,
            gate: None,
            direction: None,
            cache_revision: 0,
        }
    }

    pub fn min_duration(&self) -> Duration {
        self.min_duration
    }

    /// Opens a fresh gate for `index`, discarding whatever the previous one had
    /// collected.
    pub fn begin(&mut self, index: usize, previous: Option<usize>, now: Instant) {
        self.direction = TransitionDirection::between(previous, index);
        self.gate = Some(Gate {
            index,
            opened_at: now,
            signals: Readiness::default(),
            settled_at: None,
        });
    }

    pub fn on_selection(&mut self, change: SelectionChange, now: Instant) {
        if let SelectionChange::Moved { previous, current } = change {
            self.begin(current, previous, now);
        }
    }

    /// Reopens the gate for the current index, e.g. after the image set was
    /// reloaded underneath it.
    pub fn invalidate(&mut self, now: Instant) {
        if let Some(index) = self.gate.as_ref().map(|gate| gate.index) {
            self.direction = None;
            self.begin(index, None, now);
        }
    }

    /// Drops the latched analysis signal when the cache changed while the gate
    /// is still open, so it is re-evaluated against the new contents.
    pub fn observe_cache_revision(&mut self, revision: u64) {
        if revision == self.cache_revision {
            return;
        }
        self.cache_revision = revision;
        if let Some(gate) = self.gate.as_mut().filter(|gate| gate.settled_at.is_none()) {
            gate.signals.analysis = false;
        }
    }

    /// Latches the signals reported for `index` and closes the gate when it
    /// can. Reports for any other index are ignored. Returns whether the gate
    /// is still open.
    pub fn update(&mut self, index: usize, readiness: Readiness, now: Instant) -> bool {
        let min_duration = self.min_duration;
        let Some(gate) = self.gate.as_mut() else {
            return false;
        };
        if gate.settled_at.is_some() {
            return false;
        }
        if gate.index != index {
            return true;
        }

        gate.signals.image |= readiness.image;
        gate.signals.session |= readiness.session;
        gate.signals.analysis |= readiness.analysis;

        if gate.signals.all() && now.duration_since(gate.opened_at) >= min_duration {
            log::debug!(
                "Loading gate for image {index} closed after {:?}",
                now.duration_since(gate.opened_at)
            );
            gate.settled_at = Some(now);
            return false;
        }
        true
    }

    pub fn is_loading(&self) -> bool {
        self.gate
            .as_ref()
            .is_some_and(|gate| gate.settled_at.is_none())
    }

    pub fn gate_index(&self) -> Option<usize> {
        self.gate.as_ref().map(|gate| gate.index)
    }

    pub fn signals(&self) -> Readiness {
        self.gate
            .as_ref()
            .map(|gate| gate.signals)
            .unwrap_or_default()
    }

    /// Time left before the gate may close, for scheduling the next repaint.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let gate = self.gate.as_ref().filter(|gate| gate.settled_at.is_none())?;
        Some(
            self.min_duration
                .saturating_sub(now.duration_since(gate.opened_at)),
        )
    }

    /// Horizontal slide offset in `-1.0..=1.0` of the panel width, easing to
    /// zero over `duration` after the gate closed.
    pub fn slide_offset(&self, now: Instant, duration: Duration) -> f32 {
        let (Some(direction), Some(settled_at)) = (
            self.direction,
            self.gate.as_ref().and_then(|gate| gate.settled_at),
        ) else {
            return 0.0;
        };
        if duration.is_zero() {
            return 0.0;
        }

        let t = (now.duration_since(settled_at).as_secs_f32() / duration.as_secs_f32())
            .clamp(0.0, 1.0);
        let remaining = (1.0 - t).powi(3);
        match direction {
            TransitionDirection::Forward => remaining,
            TransitionDirection::Backward => -remaining,
        }
    }
}
