//! Buffer pool shared between the decoder and the display.
//!
//! On the decoder's resolution change the [`BufferPoolManager`] allocates a
//! fixed number of display buffers, hands each one to the decoder as an
//! external output buffer and wraps each one in a display surface. The
//! decoder then writes pictures straight into memory the display can scan
//! out, so pixel data is never copied.
//!
//! ## Buffer layout
//!
//! Each buffer is `hor_stride` bytes wide and `2 * ver_stride` rows tall.
//! NV12 needs 1.5 rows per picture row; the decoder stores extra
//! per-picture data behind the chroma plane, so the full double height is
//! allocated. The surface uses two planes over the same allocation:
//!
//! | plane  | offset                    | pitch        |
//! |--------|---------------------------|--------------|
//! | luma   | 0                         | `hor_stride` |
//! | chroma | `hor_stride * ver_stride` | `hor_stride` |
//!
//! ## Lifetime
//!
//! Exactly one pool may exist per run. It is created by the harvester and
//! released by the pipeline after both workers have been joined.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use rk_common::{
    BufferAllocation, BufferIdentity, DecoderEngine, DisplaySurfaceProvider, Fit, FrameFormat,
    OutputRect, PixelFormat, PlaneLayout, Resolution, SurfaceId,
};

use crate::error::PoolError;
use crate::rect::output_rect;

/// One display buffer known to both the decoder and the display.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    pub allocation: BufferAllocation,
    /// Identity the decoder reports for pictures written to this buffer.
    pub identity: BufferIdentity,
    pub surface: SurfaceId,
}

/// The buffers for one resolution epoch.
#[derive(Debug)]
pub struct BufferPool {
    entries: Vec<PoolEntry>,
    format: FrameFormat,
    output: OutputRect,
}

impl BufferPool {
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn output_rect(&self) -> OutputRect {
        self.output
    }

    /// Find the entry the decoder wrote a picture into.
    ///
    /// A miss means the decoder and the pool disagree about which buffers
    /// exist; it is never silently ignored.
    pub fn lookup(&self, identity: BufferIdentity) -> Result<&PoolEntry, PoolError> {
        self.entries
            .iter()
            .find(|entry| entry.identity == identity)
            .ok_or(PoolError::UnknownBuffer(identity))
    }
}

/// Owns the live [`BufferPool`] and performs allocation and release.
pub struct BufferPoolManager<P: DisplaySurfaceProvider> {
    display: Arc<P>,
    capacity: usize,
    fit: Fit,
    active: Option<BufferPool>,
}

impl<P: DisplaySurfaceProvider> BufferPoolManager<P> {
    pub fn new(display: Arc<P>, capacity: usize, fit: Fit) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity(capacity));
        }
        Ok(Self {
            display,
            capacity,
            fit,
            active: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn display_size(&self) -> Resolution {
        self.display.display_size()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Build the pool for `format` and complete the decoder's
    /// resolution-change handshake.
    ///
    /// The group is registered and the change acknowledged only after every
    /// entry has been committed, so the decoder never asks for a buffer
    /// that does not exist yet.
    pub fn allocate<D: DecoderEngine>(
        &mut self,
        decoder: &D,
        format: FrameFormat,
        crtc: Resolution,
    ) -> Result<(&BufferPool, OutputRect), PoolError> {
        if self.active.is_some() {
            return Err(PoolError::PoolAlreadyActive {
                capacity: self.capacity,
            });
        }
        if format.pixel_format != PixelFormat::Nv12 {
            return Err(PoolError::UnsupportedFormat(format.pixel_format));
        }

        let output = output_rect(format.resolution(), crtc, self.fit);
        let (width_bytes, height_rows) = format.buffer_dims();
        let planes = format.nv12_planes();
        info!(
            capacity = self.capacity,
            width = format.width,
            height = format.height,
            hor_stride = format.hor_stride,
            ver_stride = format.ver_stride,
            %output,
            "Allocating buffer pool"
        );

        let mut entries = Vec::with_capacity(self.capacity);
        for index in 0..self.capacity {
            match self.build_entry(decoder, format, width_bytes, height_rows, &planes) {
                Ok(entry) => {
                    debug!(
                        index,
                        handle = entry.allocation.handle,
                        identity = entry.identity.0,
                        surface = %entry.surface,
                        "Pool entry ready"
                    );
                    entries.push(entry);
                }
                Err(e) => {
                    error!(index, error = %e, "Pool entry allocation failed");
                    self.destroy_entries(&entries);
                    return Err(e);
                }
            }
        }

        if let Err(e) = decoder
            .register_external_buffer_group()
            .and_then(|()| decoder.acknowledge_resolution_ready())
        {
            self.destroy_entries(&entries);
            return Err(e.into());
        }

        let pool: &BufferPool = self.active.insert(BufferPool {
            entries,
            format,
            output,
        });
        info!(entries = pool.len(), "Buffer pool registered with decoder");
        Ok((pool, output))
    }

    fn build_entry<D: DecoderEngine>(
        &self,
        decoder: &D,
        format: FrameFormat,
        width_bytes: u32,
        height_rows: u32,
        planes: &[PlaneLayout],
    ) -> Result<PoolEntry, PoolError> {
        let allocation = self.display.create_buffer(width_bytes, height_rows)?;

        let committed = self
            .display
            .export(&allocation)
            .map_err(PoolError::from)
            .and_then(|descriptor| {
                decoder
                    .commit_external_buffer(descriptor, allocation.size)
                    .map_err(PoolError::from)
            });
        let identity = match committed {
            Ok(identity) => identity,
            Err(e) => {
                self.destroy_buffer(allocation);
                return Err(e);
            }
        };

        match self.display.import_as_surface(
            &allocation,
            format.resolution(),
            format.pixel_format,
            planes,
        ) {
            Ok(surface) => Ok(PoolEntry {
                allocation,
                identity,
                surface,
            }),
            Err(e) => {
                self.destroy_buffer(allocation);
                Err(e.into())
            }
        }
    }

    /// Destroy the live pool: every surface first, then every allocation.
    ///
    /// Call only once no worker can touch a surface any more. Destruction
    /// continues past failures; the first one is returned.
    pub fn release(&mut self) -> Result<(), PoolError> {
        let Some(pool) = self.active.take() else {
            debug!("No buffer pool to release");
            return Ok(());
        };

        let mut first_error = None;
        for entry in &pool.entries {
            if let Err(e) = self.display.destroy_surface(entry.surface) {
                warn!(surface = %entry.surface, error = %e, "Failed to destroy surface");
                first_error.get_or_insert(e);
            }
        }
        for entry in &pool.entries {
            if let Err(e) = self.display.destroy_buffer(entry.allocation) {
                warn!(handle = entry.allocation.handle, error = %e, "Failed to destroy buffer");
                first_error.get_or_insert(e);
            }
        }

        info!(entries = pool.len(), "Buffer pool released");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn destroy_entries(&self, entries: &[PoolEntry]) {
        for entry in entries {
            if let Err(e) = self.display.destroy_surface(entry.surface) {
                warn!(surface = %entry.surface, error = %e, "Failed to destroy surface");
            }
        }
        for entry in entries {
            self.destroy_buffer(entry.allocation);
        }
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) {
        if let Err(e) = self.display.destroy_buffer(allocation) {
            warn!(handle = allocation.handle, error = %e, "Failed to destroy buffer");
        }
    }
}

impl<P: DisplaySurfaceProvider> Drop for BufferPoolManager<P> {
    fn drop(&mut self) {
        // Releasing here could pull surfaces from under a running
        // presenter, so a live pool is only reported.
        if let Some(pool) = &self.active {
            warn!(entries = pool.len(), "Buffer pool manager dropped with a live pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_common::FrameEvent;
    use rk_decoder::{SimDecoder, SimDecoderConfig};
    use rk_display::{DisplayCall, SimDisplay, SimDisplayConfig};

    /// A sim decoder that has announced its resolution and waits for buffers.
    fn announced_decoder(format: FrameFormat) -> SimDecoder {
        let decoder = SimDecoder::new(SimDecoderConfig {
            format,
            ..Default::default()
        });
        decoder.submit_packet(&[0; 16], false).unwrap();
        match decoder.pull_event().unwrap() {
            FrameEvent::ResolutionChanged(announced) => assert_eq!(announced, format),
            other => panic!("expected resolution change, got {other:?}"),
        }
        decoder
    }

    fn fhd() -> FrameFormat {
        FrameFormat {
            width: 1920,
            height: 1080,
            hor_stride: 1920,
            ver_stride: 1088,
            pixel_format: PixelFormat::Nv12,
        }
    }

    #[test]
    fn allocate_builds_every_entry() {
        let display = Arc::new(SimDisplay::default());
        let decoder = announced_decoder(fhd());
        let mut manager = BufferPoolManager::new(display.clone(), 4, Fit::Aspect).unwrap();

        let (pool, rect) = manager.allocate(&decoder, fhd(), Resolution::FHD).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(rect, OutputRect { x: 0, y: 0, width: 1920, height: 1080 });

        let calls = display.calls();
        assert!(calls.contains(&DisplayCall::CreateBuffer {
            handle: 1,
            width_bytes: 1920,
            height_rows: 2176,
        }));
        let expected_planes = vec![
            PlaneLayout { offset: 0, pitch: 1920 },
            PlaneLayout {
                offset: 1920 * 1088,
                pitch: 1920,
            },
        ];
        let imports: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                DisplayCall::Import { planes, size, .. } => Some((planes.clone(), *size)),
                _ => None,
            })
            .collect();
        assert_eq!(imports.len(), 4);
        for (planes, size) in imports {
            assert_eq!(planes, expected_planes);
            assert_eq!(size, Resolution::new(1920, 1080));
        }
        assert_eq!(decoder.stats().committed, 4);
    }

    #[test]
    fn second_allocation_fails_while_active() {
        let display = Arc::new(SimDisplay::default());
        let decoder = announced_decoder(fhd());
        let mut manager = BufferPoolManager::new(display.clone(), 2, Fit::Aspect).unwrap();
        manager.allocate(&decoder, fhd(), Resolution::FHD).unwrap();

        let before = display.calls().len();
        let err = manager
            .allocate(&decoder, fhd(), Resolution::FHD)
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolAlreadyActive { capacity: 2 }));
        // Nothing was allocated for the rejected request.
        assert_eq!(display.calls().len(), before);
        manager.release().unwrap();
    }

    #[test]
    fn non_nv12_is_rejected() {
        let display = Arc::new(SimDisplay::default());
        let format = FrameFormat {
            pixel_format: PixelFormat::Nv15,
            ..fhd()
        };
        let decoder = announced_decoder(format);
        let mut manager = BufferPoolManager::new(display.clone(), 2, Fit::Aspect).unwrap();
        let err = manager
            .allocate(&decoder, format, Resolution::FHD)
            .unwrap_err();
        assert!(matches!(err, PoolError::UnsupportedFormat(PixelFormat::Nv15)));
        assert!(display.calls().is_empty());
    }

    #[test]
    fn lookup_resolves_identity_or_fails() {
        let display = Arc::new(SimDisplay::default());
        let decoder = announced_decoder(fhd());
        let mut manager = BufferPoolManager::new(display, 3, Fit::Aspect).unwrap();
        let (pool, _) = manager.allocate(&decoder, fhd(), Resolution::FHD).unwrap();

        let second = pool.entries()[1];
        assert_eq!(pool.lookup(second.identity).unwrap().surface, second.surface);
        assert!(matches!(
            pool.lookup(BufferIdentity(-1)),
            Err(PoolError::UnknownBuffer(BufferIdentity(-1)))
        ));
        manager.release().unwrap();
    }

    #[test]
    fn release_destroys_surfaces_before_buffers() {
        let display = Arc::new(SimDisplay::default());
        let decoder = announced_decoder(fhd());
        let mut manager = BufferPoolManager::new(display.clone(), 3, Fit::Aspect).unwrap();
        manager.allocate(&decoder, fhd(), Resolution::FHD).unwrap();
        manager.release().unwrap();

        let calls = display.calls();
        let last_surface = calls
            .iter()
            .rposition(|c| matches!(c, DisplayCall::DestroySurface(_)))
            .unwrap();
        let first_buffer = calls
            .iter()
            .position(|c| matches!(c, DisplayCall::DestroyBuffer(_)))
            .unwrap();
        assert!(last_surface < first_buffer);
        assert_eq!(display.live_buffers(), 0);
        assert_eq!(display.live_surfaces(), 0);
        assert!(!manager.is_active());

        // A second release is a no-op.
        manager.release().unwrap();
        assert_eq!(display.calls().len(), calls.len());
    }

    #[test]
    fn failed_allocation_cleans_up_built_entries() {
        let display = Arc::new(SimDisplay::new(SimDisplayConfig {
            fail_alloc_at: Some(2),
            ..Default::default()
        }));
        let decoder = announced_decoder(fhd());
        let mut manager = BufferPoolManager::new(display.clone(), 4, Fit::Aspect).unwrap();
        let err = manager
            .allocate(&decoder, fhd(), Resolution::FHD)
            .unwrap_err();
        assert!(matches!(err, PoolError::Display(_)));
        assert!(!manager.is_active());
        assert_eq!(display.live_buffers(), 0);
        assert_eq!(display.live_surfaces(), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let display = Arc::new(SimDisplay::default());
        assert!(matches!(
            BufferPoolManager::new(display, 0, Fit::Aspect),
            Err(PoolError::InvalidCapacity(0))
        ));
    }
}
