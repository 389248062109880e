//! Pipeline orchestration: threads, fatal policy and teardown order.
//!
//! ```text
//! caller thread       rk-harvester                  rk-presenter
//! -------------       ------------                  ------------
//! Feeder ──packets──▶ DecoderEngine ──events──▶ Harvester ──Mailbox──▶ Presenter ──▶ DisplaySurfaceProvider
//!                                                  │
//!                                          BufferPoolManager
//! ```
//!
//! Teardown is strict: join the harvester, signal and join the presenter,
//! release the pool, reset the decoder, drop the decoder, drop the display.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use rk_common::{DecoderEngine, DisplaySurfaceProvider, Fit, OutputRect, PlayerConfig, SurfaceId};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::feeder::{FeedStats, Feeder};
use crate::harvester::{HarvestStats, Harvester, HarvesterExit};
use crate::pool::BufferPoolManager;
use crate::presenter::{PresentStats, Presenter};
use crate::state::PipelineState;

/// Called once for every fatal worker error.
pub type FatalHook = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// The production policy: log and abort the process. A broken decode or
/// display state is not continued.
pub fn abort_on_fatal() -> FatalHook {
    Arc::new(|e: &PipelineError| {
        error!(error = %e, "Fatal pipeline error, aborting");
        std::process::abort();
    })
}

/// Pipeline tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub pool_capacity: usize,
    pub packet_size: usize,
    pub submit_backoff: Duration,
    pub fit: Fit,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PlayerConfig::default())
    }
}

impl From<&PlayerConfig> for PipelineConfig {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            pool_capacity: config.pool_capacity,
            packet_size: config.packet_size,
            submit_backoff: config.submit_backoff(),
            fit: config.fit,
        }
    }
}

/// Summary of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub bytes_fed: u64,
    pub packets_fed: u64,
    pub submit_retries: u64,
    pub pictures_decoded: u64,
    pub pictures_presented: u64,
    pub pictures_skipped: u64,
    pub max_skip_burst: u32,
    pub pool_capacity: usize,
    /// `None` when the stream ended before any resolution change.
    pub output_rect: Option<OutputRect>,
    pub last_surface: Option<SurfaceId>,
}

impl PlaybackReport {
    fn new(
        capacity: usize,
        ctx: &PipelineContext,
        feed: FeedStats,
        harvest: HarvestStats,
        present: PresentStats,
    ) -> Self {
        Self {
            bytes_fed: feed.bytes,
            packets_fed: feed.packets,
            submit_retries: feed.retries,
            pictures_decoded: harvest.pictures,
            pictures_presented: present.presented,
            pictures_skipped: ctx.mailbox().stats().skipped,
            max_skip_burst: present.max_skip_burst,
            pool_capacity: capacity,
            output_rect: ctx.geometry().map(|g| g.output),
            last_surface: present.last_surface,
        }
    }
}

/// One decode-and-display run over a decoder and a display.
pub struct Pipeline<D, P>
where
    D: DecoderEngine + 'static,
    P: DisplaySurfaceProvider + 'static,
{
    decoder: Arc<D>,
    display: Arc<P>,
    config: PipelineConfig,
    fatal: FatalHook,
    ctx: Arc<PipelineContext>,
}

impl<D, P> Pipeline<D, P>
where
    D: DecoderEngine + 'static,
    P: DisplaySurfaceProvider + 'static,
{
    /// The pipeline's references to both backends are dropped at the end of
    /// `run`, decoder first.
    pub fn new(decoder: Arc<D>, display: Arc<P>, config: PipelineConfig) -> Self {
        Self {
            decoder,
            display,
            config,
            fatal: abort_on_fatal(),
            ctx: Arc::new(PipelineContext::new()),
        }
    }

    /// Replace the abort-on-fatal policy. When the hook returns, the
    /// pipeline halts and `run` returns the error.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal = hook;
        self
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        self.ctx.clone()
    }

    /// Play `reader` to the end.
    pub fn run<R: Read>(self, reader: R) -> Result<PlaybackReport, PipelineError> {
        let Self {
            decoder,
            display,
            config,
            fatal,
            ctx,
        } = self;

        let capacity = config.pool_capacity;
        let manager = BufferPoolManager::new(display.clone(), capacity, config.fit)?;
        ctx.transition(PipelineState::AwaitingFirstResolution)?;

        let harvester = {
            let decoder = decoder.clone();
            let worker_ctx = ctx.clone();
            let fatal = fatal.clone();
            thread::Builder::new()
                .name("rk-harvester".into())
                .spawn(move || {
                    let exit = Harvester::new(decoder, manager, worker_ctx.clone()).run();
                    worker_ctx.mark_harvester_exited();
                    if let Err(e) = &exit.result {
                        fatal(e);
                        worker_ctx.halt();
                    }
                    exit
                })
                .map_err(|source| PipelineError::Spawn {
                    name: "harvester",
                    source,
                })?
        };

        let presenter = {
            let display = display.clone();
            let worker_ctx = ctx.clone();
            let fatal = fatal.clone();
            thread::Builder::new()
                .name("rk-presenter".into())
                .spawn(move || {
                    let result = Presenter::new(display, worker_ctx.clone()).run();
                    if let Err(e) = &result {
                        fatal(e);
                        worker_ctx.halt();
                    }
                    result
                })
                .map_err(|source| {
                    // The harvester is already running; without EOS it never
                    // returns, so it is left detached.
                    ctx.halt();
                    PipelineError::Spawn {
                        name: "presenter",
                        source,
                    }
                })?
        };

        let feed = Feeder::new(
            &*decoder,
            &ctx,
            config.packet_size,
            config.submit_backoff,
        )
        .feed(reader);
        if let Err(e) = &feed {
            if !matches!(e, PipelineError::Halted) {
                fatal(e);
            }
            ctx.halt();
        }

        // Teardown, in order.
        let harvested = harvester.join();
        ctx.mailbox().signal_eos();
        let presented = presenter
            .join()
            .unwrap_or(Err(PipelineError::WorkerPanicked("presenter")));

        let (harvest, released) = match harvested {
            Ok(HarvesterExit { mut pool, result }) => {
                let released = pool.release().map_err(PipelineError::from);
                drop(pool);
                (result, released)
            }
            Err(_) => (Err(PipelineError::WorkerPanicked("harvester")), Ok(())),
        };

        if let Err(e) = decoder.reset() {
            warn!(error = %e, "Decoder reset failed");
        }
        drop(decoder);
        drop(display);

        // Report the root cause: a worker's own error before the Halted it
        // caused elsewhere.
        let (feed, harvest, present) = first_cause(feed, harvest, presented)?;
        released?;

        ctx.transition(PipelineState::Terminated)?;
        let report = PlaybackReport::new(capacity, &ctx, feed, harvest, present);
        info!(
            pictures = report.pictures_decoded,
            presented = report.pictures_presented,
            skipped = report.pictures_skipped,
            "Playback finished"
        );
        Ok(report)
    }
}

fn first_cause(
    feed: Result<FeedStats, PipelineError>,
    harvest: Result<HarvestStats, PipelineError>,
    present: Result<PresentStats, PipelineError>,
) -> Result<(FeedStats, HarvestStats, PresentStats), PipelineError> {
    match (feed, harvest, present) {
        (Ok(f), Ok(h), Ok(p)) => Ok((f, h, p)),
        (_, Err(e), _) if !matches!(e, PipelineError::Halted) => Err(e),
        (_, _, Err(e)) if !matches!(e, PipelineError::Halted) => Err(e),
        (Err(e), _, _) => Err(e),
        (_, Err(e), _) | (_, _, Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_common::BufferIdentity;

    #[test]
    fn config_from_player_config() {
        let player = PlayerConfig {
            pool_capacity: 20,
            submit_backoff_ms: 5,
            fit: Fit::Fullscreen,
            ..Default::default()
        };
        let config = PipelineConfig::from(&player);
        assert_eq!(config.pool_capacity, 20);
        assert_eq!(config.submit_backoff, Duration::from_millis(5));
        assert_eq!(config.fit, Fit::Fullscreen);
        assert_eq!(PipelineConfig::default().pool_capacity, 24);
    }

    #[test]
    fn root_cause_wins_over_halted() {
        let unknown = || {
            PipelineError::Pool(crate::error::PoolError::UnknownBuffer(BufferIdentity(5)))
        };
        let err = first_cause(
            Err(PipelineError::Halted),
            Err(unknown()),
            Ok(PresentStats::default()),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Pool(_)));

        let err = first_cause(
            Err(PipelineError::Halted),
            Ok(HarvestStats::default()),
            Err(PipelineError::GeometryMissing),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMissing));
    }
}
