//! DRM/KMS display surface provider.
//!
//! `DrmDevice` owns the open DRM node and the output chosen at startup.
//! Pool buffers are dumb buffers (8 bits per "pixel", so width and height
//! are given in bytes and rows), exported as dma-buf descriptors for the
//! decoder and wrapped in framebuffers for scan-out on the overlay plane.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use rk_common::{
    BufferAllocation, DisplayError, DisplaySurfaceProvider, ExportDescriptor, OutputRect,
    PixelFormat, PlaneLayout, Resolution, SourceRect, SurfaceId,
};

use super::ffi::{
    check_drm_result, DrmLibrary, DrmModeCreateDumb, DrmModeDestroyDumb, DRM_CLOEXEC,
    DRM_IOCTL_MODE_CREATE_DUMB, DRM_IOCTL_MODE_DESTROY_DUMB, DRM_RDWR,
};
use super::output::{select_output, OutputSelection};

/// Bits per element for dumb buffers holding YUV data byte by byte.
const DUMB_BPP: u32 = 8;

/// Open a device node read-write. std sets close-on-exec on every open.
fn open_node(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// An open DRM device with a selected overlay output.
pub struct DrmDevice {
    lib: DrmLibrary,
    file: File,
    path: PathBuf,
    output: OutputSelection,
    live_buffers: AtomicUsize,
    live_surfaces: AtomicUsize,
}

impl std::fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice")
            .field("path", &self.path)
            .field("output", &self.output)
            .finish()
    }
}

impl DrmDevice {
    /// Open `path` and select an overlay plane able to show `pixel_format`.
    pub fn open(
        lib: DrmLibrary,
        path: &Path,
        pixel_format: PixelFormat,
    ) -> Result<Self, DisplayError> {
        let fourcc = pixel_format
            .drm_fourcc()
            .ok_or(DisplayError::UnsupportedFormat(pixel_format))?;

        let file = open_node(path)
            .map_err(|e| DisplayError::DeviceOpen(format!("{}: {e}", path.display())))?;

        let output = select_output(&lib, file.as_raw_fd(), fourcc)?;
        info!(
            device = %path.display(),
            crtc_id = output.crtc_id,
            plane_id = output.plane_id,
            size = %output.size,
            "DRM output ready"
        );

        Ok(Self {
            lib,
            file,
            path: path.to_path_buf(),
            output,
            live_buffers: AtomicUsize::new(0),
            live_surfaces: AtomicUsize::new(0),
        })
    }

    pub fn output(&self) -> &OutputSelection {
        &self.output
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DisplaySurfaceProvider for DrmDevice {
    fn display_size(&self) -> Resolution {
        self.output.size
    }

    fn create_buffer(
        &self,
        width_bytes: u32,
        height_rows: u32,
    ) -> Result<BufferAllocation, DisplayError> {
        let mut request = DrmModeCreateDumb {
            width: width_bytes,
            height: height_rows,
            bpp: DUMB_BPP,
            ..Default::default()
        };
        // SAFETY: request matches the ioctl's struct; drmIoctl retries
        // EINTR and EAGAIN.
        let result = unsafe {
            (self.lib.drm_ioctl)(
                self.fd(),
                DRM_IOCTL_MODE_CREATE_DUMB,
                &mut request as *mut DrmModeCreateDumb as *mut c_void,
            )
        };
        check_drm_result(result, "DRM_IOCTL_MODE_CREATE_DUMB").map_err(|reason| {
            DisplayError::AllocFailed {
                width: width_bytes,
                height: height_rows,
                reason,
            }
        })?;

        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        debug!(
            handle = request.handle,
            pitch = request.pitch,
            size = request.size,
            "Dumb buffer created"
        );
        Ok(BufferAllocation {
            handle: request.handle,
            pitch: request.pitch,
            size: request.size,
        })
    }

    fn export(&self, allocation: &BufferAllocation) -> Result<ExportDescriptor, DisplayError> {
        let mut prime_fd: i32 = -1;
        // SAFETY: handle is a live dumb buffer on this device.
        let result = unsafe {
            (self.lib.drm_prime_handle_to_fd)(
                self.fd(),
                allocation.handle,
                DRM_CLOEXEC | DRM_RDWR,
                &mut prime_fd,
            )
        };
        check_drm_result(result, "drmPrimeHandleToFD").map_err(|reason| {
            DisplayError::ExportFailed {
                handle: allocation.handle,
                reason,
            }
        })?;
        Ok(ExportDescriptor(prime_fd))
    }

    fn import_as_surface(
        &self,
        allocation: &BufferAllocation,
        size: Resolution,
        pixel_format: PixelFormat,
        planes: &[PlaneLayout],
    ) -> Result<SurfaceId, DisplayError> {
        let fourcc = pixel_format
            .drm_fourcc()
            .ok_or(DisplayError::UnsupportedFormat(pixel_format))?;
        if planes.is_empty() || planes.len() > 4 {
            return Err(DisplayError::ImportFailed(format!(
                "{} planes given, 1 to 4 supported",
                planes.len()
            )));
        }

        let mut handles = [0u32; 4];
        let mut pitches = [0u32; 4];
        let mut offsets = [0u32; 4];
        for (i, plane) in planes.iter().enumerate() {
            handles[i] = allocation.handle;
            pitches[i] = plane.pitch;
            offsets[i] = plane.offset;
        }

        let mut fb_id = 0u32;
        // SAFETY: the arrays have the four entries drmModeAddFB2 reads.
        let result = unsafe {
            (self.lib.drm_mode_add_fb2)(
                self.fd(),
                size.width,
                size.height,
                fourcc,
                handles.as_ptr(),
                pitches.as_ptr(),
                offsets.as_ptr(),
                &mut fb_id,
                0,
            )
        };
        check_drm_result(result, "drmModeAddFB2").map_err(DisplayError::ImportFailed)?;

        self.live_surfaces.fetch_add(1, Ordering::Relaxed);
        debug!(fb_id, handle = allocation.handle, %size, "Framebuffer added");
        Ok(SurfaceId(fb_id))
    }

    fn update_plane(
        &self,
        surface: SurfaceId,
        src: SourceRect,
        dst: OutputRect,
    ) -> Result<(), DisplayError> {
        // Source coordinates are 16.16 fixed point. The call waits for the
        // next vblank, which paces the presenter.
        // SAFETY: plane and CRTC were selected on this device.
        let result = unsafe {
            (self.lib.drm_mode_set_plane)(
                self.fd(),
                self.output.plane_id,
                self.output.crtc_id,
                surface.0,
                0,
                dst.x as i32,
                dst.y as i32,
                dst.width,
                dst.height,
                0,
                0,
                src.width << 16,
                src.height << 16,
            )
        };
        check_drm_result(result, "drmModeSetPlane").map_err(DisplayError::PlaneUpdate)
    }

    fn destroy_surface(&self, surface: SurfaceId) -> Result<(), DisplayError> {
        // SAFETY: surface is a framebuffer id created by import_as_surface.
        let result = unsafe { (self.lib.drm_mode_rm_fb)(self.fd(), surface.0) };
        check_drm_result(result, "drmModeRmFB").map_err(DisplayError::DestroyFailed)?;
        self.live_surfaces.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn destroy_buffer(&self, allocation: BufferAllocation) -> Result<(), DisplayError> {
        let mut request = DrmModeDestroyDumb {
            handle: allocation.handle,
        };
        // SAFETY: request matches the ioctl's struct.
        let result = unsafe {
            (self.lib.drm_ioctl)(
                self.fd(),
                DRM_IOCTL_MODE_DESTROY_DUMB,
                &mut request as *mut DrmModeDestroyDumb as *mut c_void,
            )
        };
        check_drm_result(result, "DRM_IOCTL_MODE_DESTROY_DUMB")
            .map_err(DisplayError::DestroyFailed)?;
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        let buffers = self.live_buffers.load(Ordering::Relaxed);
        let surfaces = self.live_surfaces.load(Ordering::Relaxed);
        if buffers > 0 || surfaces > 0 {
            // Closing the node releases them anyway.
            warn!(buffers, surfaces, "DRM device closed with live objects");
        }
        info!(device = %self.path.display(), "DRM device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_node_is_close_on_exec() {
        let file = open_node(Path::new("/dev/null")).unwrap();
        let fdinfo =
            std::fs::read_to_string(format!("/proc/self/fdinfo/{}", file.as_raw_fd())).unwrap();
        let flags = fdinfo
            .lines()
            .find_map(|line| line.strip_prefix("flags:"))
            .map(|v| u32::from_str_radix(v.trim(), 8).unwrap())
            .unwrap();
        assert_ne!(flags & 0o2_000_000, 0, "O_CLOEXEC missing");
        assert_eq!(flags & 0o3, 0o2, "not opened read-write");
    }

    #[test]
    #[ignore = "requires libdrm and a KMS device with an NV12 overlay"]
    fn open_card0() {
        let lib = DrmLibrary::load().expect("libdrm");
        let device = DrmDevice::open(lib, Path::new("/dev/dri/card0"), PixelFormat::Nv12)
            .expect("device");
        assert!(!device.display_size().is_empty());

        let allocation = device.create_buffer(1920, 2176).expect("dumb buffer");
        assert!(allocation.size >= 1920 * 2176);
        device.destroy_buffer(allocation).expect("destroy");
    }
}
