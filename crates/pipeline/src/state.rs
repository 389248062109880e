//! Pipeline lifecycle state machine.

use crate::error::PipelineError;

/// Lifecycle of one playback run.
///
/// ```text
/// Idle -> AwaitingFirstResolution -> Streaming -> Draining -> Terminated
///                    |                               ^
///                    +-------------------------------+  (stream ended before any picture)
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Idle,
    /// Workers running, no buffer pool yet.
    AwaitingFirstResolution,
    /// Pool allocated, pictures flowing.
    Streaming,
    /// End of stream seen by the harvester.
    Draining,
    /// Workers joined and pool released.
    Terminated,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, AwaitingFirstResolution)
                | (AwaitingFirstResolution, Streaming)
                | (AwaitingFirstResolution, Draining)
                | (Streaming, Draining)
                | (Draining, Terminated)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: PipelineState) -> Result<PipelineState, PipelineError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}
