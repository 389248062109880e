//! Presentation worker: shows the newest surface on the overlay plane.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rk_common::{DisplaySurfaceProvider, SourceRect, SurfaceId};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::mailbox::Delivery;

/// Presenter counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PresentStats {
    pub presented: u64,
    /// Surfaces dropped by the mailbox before they could be shown.
    pub skipped: u64,
    /// Largest number of surfaces dropped between two presents.
    pub max_skip_burst: u32,
    pub last_surface: Option<SurfaceId>,
}

pub struct Presenter<P: DisplaySurfaceProvider> {
    display: Arc<P>,
    ctx: Arc<PipelineContext>,
    stats: PresentStats,
}

impl<P: DisplaySurfaceProvider> Presenter<P> {
    pub fn new(display: Arc<P>, ctx: Arc<PipelineContext>) -> Self {
        Self {
            display,
            ctx,
            stats: PresentStats::default(),
        }
    }

    /// Present surfaces until the mailbox reports end of stream.
    ///
    /// `update_plane` is paced by the display refresh; while it blocks the
    /// mailbox keeps only the newest surface.
    pub fn run(mut self) -> Result<PresentStats, PipelineError> {
        loop {
            match self.ctx.mailbox().take_or_wait() {
                Delivery::EndOfStream => break,
                Delivery::Surface { surface, skipped } => self.present(surface, skipped)?,
            }
        }
        info!(
            presented = self.stats.presented,
            skipped = self.stats.skipped,
            max_skip_burst = self.stats.max_skip_burst,
            "Presenter finished"
        );
        Ok(self.stats)
    }

    fn present(&mut self, surface: SurfaceId, skipped: u32) -> Result<(), PipelineError> {
        if skipped > 0 {
            warn!(skipped, "Display skipped frames");
            self.stats.skipped += u64::from(skipped);
            self.stats.max_skip_burst = self.stats.max_skip_burst.max(skipped);
        }

        let geometry = self.ctx.geometry().ok_or(PipelineError::GeometryMissing)?;
        self.display
            .update_plane(surface, SourceRect::from(geometry.source), geometry.output)?;

        self.stats.presented += 1;
        self.stats.last_surface = Some(surface);
        debug!(%surface, presented = self.stats.presented, "Surface presented");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Geometry;
    use rk_common::{BufferAllocation, OutputRect, PixelFormat, PlaneLayout, Resolution};
    use rk_display::{DisplayCall, SimDisplay};

    fn surface(display: &SimDisplay) -> SurfaceId {
        let allocation: BufferAllocation = display.create_buffer(64, 32).unwrap();
        display
            .import_as_surface(
                &allocation,
                Resolution::new(64, 16),
                PixelFormat::Nv12,
                &[PlaneLayout { offset: 0, pitch: 64 }],
            )
            .unwrap()
    }

    fn geometry() -> Geometry {
        Geometry {
            source: Resolution::new(64, 16),
            output: OutputRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 480,
            },
        }
    }

    #[test]
    fn presents_newest_and_counts_skips() {
        let display = Arc::new(SimDisplay::default());
        let ctx = Arc::new(PipelineContext::new());
        ctx.set_geometry(geometry());
        let surfaces: Vec<_> = (0..3).map(|_| surface(&display)).collect();

        for &s in &surfaces {
            ctx.mailbox().publish(s);
        }
        ctx.mailbox().signal_eos();

        let stats = Presenter::new(display.clone(), ctx).run().unwrap();
        assert_eq!(stats.presented, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.max_skip_burst, 2);
        assert_eq!(stats.last_surface, Some(surfaces[2]));

        let updates: Vec<_> = display
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DisplayCall::UpdatePlane { .. }))
            .collect();
        assert_eq!(
            updates,
            vec![DisplayCall::UpdatePlane {
                surface: surfaces[2],
                src: SourceRect {
                    width: 64,
                    height: 16
                },
                dst: geometry().output,
            }]
        );
    }

    #[test]
    fn eos_with_nothing_pending_exits() {
        let display = Arc::new(SimDisplay::default());
        let ctx = Arc::new(PipelineContext::new());
        ctx.mailbox().signal_eos();
        let stats = Presenter::new(display.clone(), ctx).run().unwrap();
        assert_eq!(stats.presented, 0);
        assert!(display.presented().is_empty());
    }

    #[test]
    fn missing_geometry_is_fatal() {
        let display = Arc::new(SimDisplay::default());
        let ctx = Arc::new(PipelineContext::new());
        let s = surface(&display);
        ctx.mailbox().publish(s);
        let err = Presenter::new(display, ctx).run().unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMissing));
    }

    #[test]
    fn display_failure_is_fatal() {
        let display = Arc::new(SimDisplay::default());
        let ctx = Arc::new(PipelineContext::new());
        ctx.set_geometry(geometry());
        // Never imported, so the provider rejects it.
        ctx.mailbox().publish(SurfaceId(9999));
        let err = Presenter::new(display, ctx).run().unwrap_err();
        assert!(matches!(err, PipelineError::Display(_)));
    }
}
