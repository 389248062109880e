//! State shared by the pipeline workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{info, warn};

use rk_common::{OutputRect, Resolution};

use crate::error::PipelineError;
use crate::mailbox::Mailbox;
use crate::state::PipelineState;

/// Picture size and its placement on the display, fixed once the pool
/// exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub source: Resolution,
    pub output: OutputRect,
}

/// One explicit context per run, shared by `Arc` between the feeder, the
/// harvester and the presenter.
#[derive(Default)]
pub struct PipelineContext {
    mailbox: Mailbox,
    state: Mutex<PipelineState>,
    geometry: OnceLock<Geometry>,
    halted: AtomicBool,
    harvester_exited: AtomicBool,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn transition(&self, next: PipelineState) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        let from = *state;
        *state = from.transition(next)?;
        info!(?from, to = ?next, "Pipeline state");
        Ok(())
    }

    /// Publish the geometry for the presenter. Happens before the first
    /// surface is published, so the presenter always finds it.
    pub fn set_geometry(&self, geometry: Geometry) -> bool {
        self.geometry.set(geometry).is_ok()
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry.get().copied()
    }

    /// Stop the pipeline after a fatal error: the presenter is released
    /// and the feeder stops reading.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            warn!("Pipeline halted");
        }
        self.mailbox.signal_eos();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_harvester_exited(&self) {
        self.harvester_exited.store(true, Ordering::Release);
    }

    /// Nobody is pulling from the decoder any more.
    pub fn harvester_exited(&self) -> bool {
        self.harvester_exited.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Delivery;

    #[test]
    fn geometry_is_set_once() {
        let ctx = PipelineContext::new();
        assert!(ctx.geometry().is_none());
        let geometry = Geometry {
            source: Resolution::HD,
            output: OutputRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
            },
        };
        assert!(ctx.set_geometry(geometry));
        assert!(!ctx.set_geometry(geometry));
        assert_eq!(ctx.geometry(), Some(geometry));
    }

    #[test]
    fn halt_releases_presenter() {
        let ctx = PipelineContext::new();
        ctx.halt();
        assert!(ctx.is_halted());
        assert_eq!(ctx.mailbox().take_or_wait(), Delivery::EndOfStream);
    }

    #[test]
    fn transitions_are_checked() {
        let ctx = PipelineContext::new();
        ctx.transition(PipelineState::AwaitingFirstResolution).unwrap();
        assert!(ctx.transition(PipelineState::Terminated).is_err());
        assert_eq!(ctx.state(), PipelineState::AwaitingFirstResolution);
    }
}
