//! Harvester worker: drains the decoder and feeds the mailbox.
//!
//! The harvester is the only thread that pulls from the decoder and the
//! only owner of the buffer pool. For every event it either
//! - builds the pool (resolution change),
//! - resolves the picture's buffer to its surface, publishes the surface
//!   and hands the picture back to the decoder, or
//! - propagates end of stream to the presenter.

use std::sync::Arc;

use tracing::{debug, info};

use rk_common::{DecodedPicture, DecoderEngine, DisplaySurfaceProvider, FrameEvent, FrameFormat};

use crate::context::{Geometry, PipelineContext};
use crate::error::PipelineError;
use crate::pool::BufferPoolManager;
use crate::state::PipelineState;

/// Outcome of handling one event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished,
}

/// Harvester counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub pictures: u64,
    pub resolution_changes: u32,
    /// Publishes that found an untaken surface in the mailbox.
    pub overwrites: u64,
    /// Highest skip count seen right after a publish.
    pub max_pending_skips: u32,
}

/// What the harvester thread hands back when it exits.
///
/// The pool manager always comes back, even on failure, so the pool can be
/// released after the presenter has been joined.
pub struct HarvesterExit<P: DisplaySurfaceProvider> {
    pub pool: BufferPoolManager<P>,
    pub result: Result<HarvestStats, PipelineError>,
}

pub struct Harvester<D: DecoderEngine, P: DisplaySurfaceProvider> {
    decoder: Arc<D>,
    pool: BufferPoolManager<P>,
    ctx: Arc<PipelineContext>,
    stats: HarvestStats,
}

impl<D: DecoderEngine, P: DisplaySurfaceProvider> Harvester<D, P> {
    pub fn new(decoder: Arc<D>, pool: BufferPoolManager<P>, ctx: Arc<PipelineContext>) -> Self {
        Self {
            decoder,
            pool,
            ctx,
            stats: HarvestStats::default(),
        }
    }

    pub fn stats(&self) -> HarvestStats {
        self.stats
    }

    pub fn pool(&self) -> &BufferPoolManager<P> {
        &self.pool
    }

    /// Pull and handle events until end of stream or the first error.
    pub fn run(mut self) -> HarvesterExit<P> {
        let result = loop {
            let event = match self.decoder.pull_event() {
                Ok(event) => event,
                Err(e) => break Err(e.into()),
            };
            match self.handle_event(event) {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => break Ok(self.stats),
                Err(e) => break Err(e),
            }
        };

        info!(
            pictures = self.stats.pictures,
            overwrites = self.stats.overwrites,
            ok = result.is_ok(),
            "Harvester finished"
        );
        HarvesterExit {
            pool: self.pool,
            result,
        }
    }

    pub fn handle_event(
        &mut self,
        event: FrameEvent<D::Picture>,
    ) -> Result<Step, PipelineError> {
        match event {
            FrameEvent::ResolutionChanged(format) => {
                self.on_resolution_changed(format)?;
                Ok(Step::Continue)
            }
            FrameEvent::PictureReady(picture) => {
                self.on_picture(picture)?;
                Ok(Step::Continue)
            }
            FrameEvent::EndOfStream => {
                self.ctx.transition(PipelineState::Draining)?;
                self.ctx.mailbox().signal_eos();
                debug!("End of stream propagated to presenter");
                Ok(Step::Finished)
            }
        }
    }

    fn on_resolution_changed(&mut self, format: FrameFormat) -> Result<(), PipelineError> {
        self.stats.resolution_changes += 1;
        info!(
            width = format.width,
            height = format.height,
            hor_stride = format.hor_stride,
            ver_stride = format.ver_stride,
            format = ?format.pixel_format,
            "Resolution change"
        );

        let crtc = self.pool.display_size();
        let (_, output) = self.pool.allocate(&*self.decoder, format, crtc)?;
        self.ctx.set_geometry(Geometry {
            source: format.resolution(),
            output,
        });
        self.ctx.transition(PipelineState::Streaming)
    }

    fn on_picture(&mut self, picture: D::Picture) -> Result<(), PipelineError> {
        let identity = picture.buffer_identity();
        let surface = match self.pool.pool() {
            Some(pool) => pool
                .lookup(identity)
                .map(|entry| entry.surface)
                .map_err(PipelineError::from),
            None => Err(PipelineError::GeometryMissing),
        };

        let surface = match surface {
            Ok(surface) => surface,
            Err(e) => {
                self.decoder.release_picture(picture);
                return Err(e);
            }
        };

        let skipped = self.ctx.mailbox().publish(surface);
        self.decoder.release_picture(picture);

        self.stats.pictures += 1;
        if skipped > 0 {
            self.stats.overwrites += 1;
            self.stats.max_pending_skips = self.stats.max_pending_skips.max(skipped);
        }
        debug!(
            picture = self.stats.pictures,
            identity = identity.0,
            %surface,
            skipped,
            "Picture published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::mailbox::Delivery;
    use rk_common::{BufferIdentity, Fit, PixelFormat};
    use rk_decoder::{SimDecoder, SimDecoderConfig, SimPicture};
    use rk_display::SimDisplay;

    fn harvester(
        decoder: Arc<SimDecoder>,
        capacity: usize,
    ) -> (Harvester<SimDecoder, SimDisplay>, Arc<PipelineContext>) {
        let display = Arc::new(SimDisplay::default());
        let ctx = Arc::new(PipelineContext::new());
        ctx.transition(PipelineState::AwaitingFirstResolution)
            .unwrap();
        let pool = BufferPoolManager::new(display, capacity, Fit::Aspect).unwrap();
        (Harvester::new(decoder, pool, ctx.clone()), ctx)
    }

    fn pull(decoder: &SimDecoder) -> FrameEvent<SimPicture> {
        decoder.pull_event().unwrap()
    }

    #[test]
    fn resolution_change_then_pictures() {
        let decoder = Arc::new(SimDecoder::new(SimDecoderConfig {
            queue_depth: 8,
            ..Default::default()
        }));
        let (mut harvester, ctx) = harvester(decoder.clone(), 4);
        for _ in 0..2 {
            decoder.submit_packet(&[1; 32], false).unwrap();
        }

        assert_eq!(harvester.handle_event(pull(&decoder)).unwrap(), Step::Continue);
        assert_eq!(ctx.state(), PipelineState::Streaming);
        let geometry = ctx.geometry().unwrap();
        assert_eq!(geometry.source, decoder.format().resolution());

        harvester.handle_event(pull(&decoder)).unwrap();
        harvester.handle_event(pull(&decoder)).unwrap();

        let pool = harvester.pool().pool().unwrap();
        let second = pool.entries()[1].surface;
        assert_eq!(
            ctx.mailbox().take_or_wait(),
            Delivery::Surface {
                surface: second,
                skipped: 1
            }
        );
        assert_eq!(harvester.stats().pictures, 2);
        assert_eq!(harvester.stats().max_pending_skips, 1);
        assert_eq!(decoder.stats().released, 2);
        assert_eq!(decoder.stats().outstanding, 0);
    }

    #[test]
    fn second_resolution_change_is_fatal() {
        let decoder = Arc::new(SimDecoder::new(SimDecoderConfig {
            queue_depth: 8,
            second_resolution_after: Some(1),
            ..Default::default()
        }));
        let (mut harvester, _ctx) = harvester(decoder.clone(), 2);
        for _ in 0..2 {
            decoder.submit_packet(&[1; 32], false).unwrap();
        }
        harvester.handle_event(pull(&decoder)).unwrap();
        harvester.handle_event(pull(&decoder)).unwrap();

        let err = harvester.handle_event(pull(&decoder)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Pool(PoolError::PoolAlreadyActive { .. })
        ));
    }

    #[test]
    fn fabricated_identity_is_fatal_and_released() {
        let decoder = Arc::new(SimDecoder::default());
        let (mut harvester, ctx) = harvester(decoder.clone(), 2);
        decoder.submit_packet(&[1; 32], false).unwrap();
        harvester.handle_event(pull(&decoder)).unwrap();

        let fake = SimPicture::new(BufferIdentity(31337));
        let err = harvester
            .handle_event(FrameEvent::PictureReady(fake))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Pool(PoolError::UnknownBuffer(BufferIdentity(31337)))
        ));
        assert_eq!(decoder.stats().released, 1);
        assert_eq!(ctx.mailbox().stats().published, 0);
    }

    #[test]
    fn picture_before_resolution_is_fatal() {
        let decoder = Arc::new(SimDecoder::default());
        let (mut harvester, _ctx) = harvester(decoder, 2);
        let err = harvester
            .handle_event(FrameEvent::PictureReady(SimPicture::new(BufferIdentity(3))))
            .unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMissing));
    }

    #[test]
    fn end_of_stream_finishes_and_wakes_presenter() {
        let decoder = Arc::new(SimDecoder::default());
        let (mut harvester, ctx) = harvester(decoder, 2);
        assert_eq!(
            harvester.handle_event(FrameEvent::EndOfStream).unwrap(),
            Step::Finished
        );
        assert_eq!(ctx.state(), PipelineState::Draining);
        assert_eq!(ctx.mailbox().take_or_wait(), Delivery::EndOfStream);
    }

    #[test]
    fn unsupported_format_is_fatal() {
        let format = FrameFormat {
            pixel_format: PixelFormat::I420,
            ..SimDecoderConfig::default().format
        };
        let decoder = Arc::new(SimDecoder::new(SimDecoderConfig {
            format,
            ..Default::default()
        }));
        let (mut harvester, _ctx) = harvester(decoder.clone(), 2);
        decoder.submit_packet(&[1; 32], false).unwrap();
        let err = harvester.handle_event(pull(&decoder)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Pool(PoolError::UnsupportedFormat(PixelFormat::I420))
        ));
    }
}
