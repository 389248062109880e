//! End-to-end playback over the simulated decoder and display.
//!
//! Every test installs a recording fatal hook; the default hook aborts the
//! process.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use rk_common::{
    BufferIdentity, DecodeError, DecoderEngine, ExportDescriptor, Fit, FrameEvent, FrameFormat,
    OutputRect, PixelFormat, SubmitStatus, SurfaceId,
};
use rk_decoder::{SimDecoder, SimDecoderConfig, SimPicture};
use rk_display::{DisplayCall, SimDisplay, SimDisplayConfig};
use rk_pipeline::{FatalHook, Pipeline, PipelineConfig, PipelineError, PoolError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PACKET: usize = 64;

fn config(capacity: usize) -> PipelineConfig {
    PipelineConfig {
        pool_capacity: capacity,
        packet_size: PACKET,
        submit_backoff: Duration::from_millis(1),
        fit: Fit::Aspect,
    }
}

fn stream(packets: usize) -> Cursor<Vec<u8>> {
    Cursor::new(vec![0x42; packets * PACKET])
}

fn recording_hook() -> (FatalHook, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook: FatalHook = {
        let seen = seen.clone();
        Arc::new(move |e: &PipelineError| seen.lock().push(e.to_string()))
    };
    (hook, seen)
}

/// Simulated decoder that notes how long the display call log was each
/// time it was reset, placing the reset in the teardown sequence.
struct TrackedDecoder {
    inner: SimDecoder,
    display: Arc<SimDisplay>,
    resets_at: Mutex<Vec<usize>>,
}

impl DecoderEngine for TrackedDecoder {
    type Picture = SimPicture;

    fn submit_packet(&self, data: &[u8], is_eos: bool) -> Result<SubmitStatus, DecodeError> {
        self.inner.submit_packet(data, is_eos)
    }

    fn pull_event(&self) -> Result<FrameEvent<SimPicture>, DecodeError> {
        self.inner.pull_event()
    }

    fn commit_external_buffer(
        &self,
        descriptor: ExportDescriptor,
        size: u64,
    ) -> Result<BufferIdentity, DecodeError> {
        self.inner.commit_external_buffer(descriptor, size)
    }

    fn register_external_buffer_group(&self) -> Result<(), DecodeError> {
        self.inner.register_external_buffer_group()
    }

    fn acknowledge_resolution_ready(&self) -> Result<(), DecodeError> {
        self.inner.acknowledge_resolution_ready()
    }

    fn release_picture(&self, picture: SimPicture) {
        self.inner.release_picture(picture)
    }

    fn reset(&self) -> Result<(), DecodeError> {
        self.resets_at.lock().push(self.display.calls().len());
        self.inner.reset()
    }
}

fn decoder(config: SimDecoderConfig, display: &Arc<SimDisplay>) -> Arc<TrackedDecoder> {
    Arc::new(TrackedDecoder {
        inner: SimDecoder::new(SimDecoderConfig {
            queue_depth: 8,
            ..config
        }),
        display: display.clone(),
        resets_at: Mutex::new(Vec::new()),
    })
}

/// Surfaces in import order, which is pool entry order.
fn imported(display: &SimDisplay) -> Vec<SurfaceId> {
    display
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DisplayCall::Import { surface, .. } => Some(surface),
            _ => None,
        })
        .collect()
}

fn assert_torn_down(display: &SimDisplay, decoder: &TrackedDecoder, capacity: usize) {
    let calls = display.calls();
    let last_update = calls
        .iter()
        .rposition(|c| matches!(c, DisplayCall::UpdatePlane { .. }));
    let first_destroy = calls
        .iter()
        .position(|c| matches!(c, DisplayCall::DestroySurface(_)))
        .expect("pool released");
    if let Some(last_update) = last_update {
        assert!(first_destroy > last_update, "surface destroyed while presenting");
    }

    let destroyed_surfaces = calls
        .iter()
        .filter(|c| matches!(c, DisplayCall::DestroySurface(_)))
        .count();
    let destroyed_buffers = calls
        .iter()
        .filter(|c| matches!(c, DisplayCall::DestroyBuffer(_)))
        .count();
    assert_eq!(destroyed_surfaces, capacity);
    assert_eq!(destroyed_buffers, capacity);
    assert_eq!(display.live_surfaces(), 0);
    assert_eq!(display.live_buffers(), 0);
    assert_eq!(decoder.inner.stats().outstanding, 0);

    // Reset exactly once, after the last buffer was destroyed.
    assert!(matches!(calls.last(), Some(DisplayCall::DestroyBuffer(_))));
    assert_eq!(*decoder.resets_at.lock(), vec![calls.len()]);
    assert_eq!(decoder.inner.stats().resets, 1);
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[test]
fn slow_display_skips_but_shows_the_last_picture() {
    let display = Arc::new(SimDisplay::new(SimDisplayConfig {
        update_delay: Duration::from_millis(50),
        slow_updates: 10,
        ..Default::default()
    }));
    let decoder = decoder(SimDecoderConfig::default(), &display);
    let (hook, fatal) = recording_hook();

    let report = Pipeline::new(decoder.clone(), display.clone(), config(24))
        .with_fatal_hook(hook)
        .run(stream(30))
        .expect("playback should complete");

    assert!(fatal.lock().is_empty());
    assert_eq!(report.packets_fed, 30);
    assert_eq!(report.bytes_fed, 30 * PACKET as u64);
    assert_eq!(report.pictures_decoded, 30);
    assert!(report.pictures_skipped > 0, "display never fell behind");
    assert_eq!(
        report.pictures_presented + report.pictures_skipped,
        report.pictures_decoded
    );

    // Pictures land in pool entries round-robin; picture 29 uses entry 5.
    let surfaces = imported(&display);
    assert_eq!(surfaces.len(), 24);
    assert_eq!(report.last_surface, Some(surfaces[29 % 24]));
    assert_eq!(display.presented().last(), Some(&surfaces[29 % 24]));

    assert_eq!(decoder.inner.stats().released, 30);
    assert_torn_down(&display, &decoder, 24);
}

#[test]
fn letterboxes_small_pictures() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(
        SimDecoderConfig {
            format: FrameFormat {
                width: 640,
                height: 480,
                hor_stride: 640,
                ver_stride: 480,
                pixel_format: PixelFormat::Nv12,
            },
            ..Default::default()
        },
        &display,
    );
    let (hook, _) = recording_hook();

    let report = Pipeline::new(decoder.clone(), display.clone(), config(16))
        .with_fatal_hook(hook)
        .run(stream(4))
        .unwrap();

    let expected = OutputRect {
        x: 240,
        y: 0,
        width: 1440,
        height: 1080,
    };
    assert_eq!(report.output_rect, Some(expected));
    let dst: Vec<_> = display
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DisplayCall::UpdatePlane { dst, .. } => Some(dst),
            _ => None,
        })
        .collect();
    assert!(!dst.is_empty());
    assert!(dst.iter().all(|d| *d == expected));
}

#[test]
fn empty_input_touches_nothing() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(SimDecoderConfig::default(), &display);
    let (hook, fatal) = recording_hook();

    let report = Pipeline::new(decoder.clone(), display.clone(), config(24))
        .with_fatal_hook(hook)
        .run(Cursor::new(Vec::new()))
        .unwrap();

    assert!(fatal.lock().is_empty());
    assert_eq!(report.pictures_decoded, 0);
    assert_eq!(report.output_rect, None);
    assert_eq!(report.last_surface, None);
    assert!(display.calls().is_empty());
    assert_eq!(*decoder.resets_at.lock(), vec![0]);
}

// ---------------------------------------------------------------------------
// Fatal paths
// ---------------------------------------------------------------------------

#[test]
fn foreign_buffer_is_fatal_and_pool_is_still_released() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(
        SimDecoderConfig {
            report_foreign_buffer: true,
            ..Default::default()
        },
        &display,
    );
    let (hook, fatal) = recording_hook();

    let err = Pipeline::new(decoder.clone(), display.clone(), config(24))
        .with_fatal_hook(hook)
        .run(stream(10))
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Pool(PoolError::UnknownBuffer(BufferIdentity(-7)))
    ));
    assert_eq!(fatal.lock().len(), 1);
    assert!(display.presented().is_empty());
    assert_torn_down(&display, &decoder, 24);
}

#[test]
fn second_resolution_change_is_fatal() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(
        SimDecoderConfig {
            second_resolution_after: Some(3),
            ..Default::default()
        },
        &display,
    );
    let (hook, fatal) = recording_hook();

    let err = Pipeline::new(decoder.clone(), display.clone(), config(24))
        .with_fatal_hook(hook)
        .run(stream(10))
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Pool(PoolError::PoolAlreadyActive { capacity: 24 })
    ));
    assert_eq!(fatal.lock().len(), 1);
    assert_torn_down(&display, &decoder, 24);
}

#[test]
fn decode_failure_is_fatal() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(
        SimDecoderConfig {
            fail_after: Some(5),
            ..Default::default()
        },
        &display,
    );
    let (hook, fatal) = recording_hook();

    let err = Pipeline::new(decoder.clone(), display.clone(), config(16))
        .with_fatal_hook(hook)
        .run(stream(20))
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Decode(DecodeError::DecodeFailed { picture: 5, .. })
    ));
    assert_eq!(fatal.lock().len(), 1);
    assert_torn_down(&display, &decoder, 16);
}

#[test]
fn zero_capacity_is_rejected_before_any_work() {
    let display = Arc::new(SimDisplay::default());
    let decoder = decoder(SimDecoderConfig::default(), &display);
    let (hook, _) = recording_hook();

    let err = Pipeline::new(decoder, display.clone(), config(0))
        .with_fatal_hook(hook)
        .run(stream(1))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Pool(PoolError::InvalidCapacity(0))
    ));
    assert!(display.calls().is_empty());
}
