//! Recording display provider.
//!
//! `SimDisplay` hands out fake handles, descriptors and surface ids and
//! appends every call to an ordered log. `update_plane` can be slowed down
//! for the first few calls to model a display that lags the decoder.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use rk_common::{
    BufferAllocation, DisplayError, DisplaySurfaceProvider, ExportDescriptor, OutputRect,
    PixelFormat, PlaneLayout, Resolution, SourceRect, SurfaceId,
};

const FIRST_HANDLE: u32 = 1;
const FIRST_DESCRIPTOR: i32 = 40;
const FIRST_SURFACE: u32 = 100;

/// One recorded provider call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayCall {
    CreateBuffer {
        handle: u32,
        width_bytes: u32,
        height_rows: u32,
    },
    Export {
        handle: u32,
        descriptor: i32,
    },
    Import {
        handle: u32,
        surface: SurfaceId,
        size: Resolution,
        planes: Vec<PlaneLayout>,
    },
    UpdatePlane {
        surface: SurfaceId,
        src: SourceRect,
        dst: OutputRect,
    },
    DestroySurface(SurfaceId),
    DestroyBuffer(u32),
}

/// Behaviour knobs for [`SimDisplay`].
#[derive(Clone, Debug)]
pub struct SimDisplayConfig {
    pub size: Resolution,
    /// Delay applied to each of the first `slow_updates` plane updates.
    pub update_delay: Duration,
    pub slow_updates: usize,
    /// Fail the n-th buffer allocation (0-based).
    pub fail_alloc_at: Option<usize>,
}

impl Default for SimDisplayConfig {
    fn default() -> Self {
        Self {
            size: Resolution::FHD,
            update_delay: Duration::ZERO,
            slow_updates: 0,
            fail_alloc_at: None,
        }
    }
}

#[derive(Default)]
struct SimDisplayState {
    calls: Vec<DisplayCall>,
    next_handle: u32,
    next_surface: u32,
    allocations: usize,
    updates: usize,
    live_buffers: HashSet<u32>,
    live_surfaces: HashSet<SurfaceId>,
}

/// In-process display provider.
pub struct SimDisplay {
    config: SimDisplayConfig,
    state: Mutex<SimDisplayState>,
}

impl SimDisplay {
    pub fn new(config: SimDisplayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimDisplayState {
                next_handle: FIRST_HANDLE,
                next_surface: FIRST_SURFACE,
                ..Default::default()
            }),
        }
    }

    pub fn with_size(size: Resolution) -> Self {
        Self::new(SimDisplayConfig {
            size,
            ..Default::default()
        })
    }

    /// Ordered log of every call so far.
    pub fn calls(&self) -> Vec<DisplayCall> {
        self.state.lock().calls.clone()
    }

    /// Surfaces passed to `update_plane`, in order.
    pub fn presented(&self) -> Vec<SurfaceId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                DisplayCall::UpdatePlane { surface, .. } => Some(*surface),
                _ => None,
            })
            .collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().live_buffers.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().live_surfaces.len()
    }
}

impl Default for SimDisplay {
    fn default() -> Self {
        Self::new(SimDisplayConfig::default())
    }
}

impl DisplaySurfaceProvider for SimDisplay {
    fn display_size(&self) -> Resolution {
        self.config.size
    }

    fn create_buffer(
        &self,
        width_bytes: u32,
        height_rows: u32,
    ) -> Result<BufferAllocation, DisplayError> {
        let mut state = self.state.lock();
        let index = state.allocations;
        state.allocations += 1;
        if self.config.fail_alloc_at == Some(index) {
            return Err(DisplayError::AllocFailed {
                width: width_bytes,
                height: height_rows,
                reason: "simulated allocation failure".into(),
            });
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.live_buffers.insert(handle);
        state.calls.push(DisplayCall::CreateBuffer {
            handle,
            width_bytes,
            height_rows,
        });
        Ok(BufferAllocation {
            handle,
            pitch: width_bytes,
            size: u64::from(width_bytes) * u64::from(height_rows),
        })
    }

    fn export(&self, allocation: &BufferAllocation) -> Result<ExportDescriptor, DisplayError> {
        let mut state = self.state.lock();
        if !state.live_buffers.contains(&allocation.handle) {
            return Err(DisplayError::ExportFailed {
                handle: allocation.handle,
                reason: "unknown handle".into(),
            });
        }
        let descriptor = FIRST_DESCRIPTOR + allocation.handle as i32;
        state.calls.push(DisplayCall::Export {
            handle: allocation.handle,
            descriptor,
        });
        Ok(ExportDescriptor(descriptor))
    }

    fn import_as_surface(
        &self,
        allocation: &BufferAllocation,
        size: Resolution,
        pixel_format: PixelFormat,
        planes: &[PlaneLayout],
    ) -> Result<SurfaceId, DisplayError> {
        if pixel_format.drm_fourcc().is_none() {
            return Err(DisplayError::UnsupportedFormat(pixel_format));
        }
        let mut state = self.state.lock();
        if !state.live_buffers.contains(&allocation.handle) {
            return Err(DisplayError::ImportFailed(format!(
                "unknown handle {}",
                allocation.handle
            )));
        }
        let surface = SurfaceId(state.next_surface);
        state.next_surface += 1;
        state.live_surfaces.insert(surface);
        state.calls.push(DisplayCall::Import {
            handle: allocation.handle,
            surface,
            size,
            planes: planes.to_vec(),
        });
        Ok(surface)
    }

    fn update_plane(
        &self,
        surface: SurfaceId,
        src: SourceRect,
        dst: OutputRect,
    ) -> Result<(), DisplayError> {
        let slow = {
            let mut state = self.state.lock();
            if !state.live_surfaces.contains(&surface) {
                return Err(DisplayError::PlaneUpdate(format!("unknown surface {surface}")));
            }
            state.calls.push(DisplayCall::UpdatePlane { surface, src, dst });
            let index = state.updates;
            state.updates += 1;
            index < self.config.slow_updates
        };
        trace!(%surface, %dst, slow, "Simulated plane update");
        if slow {
            thread::sleep(self.config.update_delay);
        }
        Ok(())
    }

    fn destroy_surface(&self, surface: SurfaceId) -> Result<(), DisplayError> {
        let mut state = self.state.lock();
        if !state.live_surfaces.remove(&surface) {
            return Err(DisplayError::DestroyFailed(format!("unknown surface {surface}")));
        }
        state.calls.push(DisplayCall::DestroySurface(surface));
        Ok(())
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) -> Result<(), DisplayError> {
        let mut state = self.state.lock();
        if !state.live_buffers.remove(&allocation.handle) {
            return Err(DisplayError::DestroyFailed(format!(
                "unknown handle {}",
                allocation.handle
            )));
        }
        state.calls.push(DisplayCall::DestroyBuffer(allocation.handle));
        Ok(())
    }
}
