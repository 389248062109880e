//! Raw FFI bindings for libdrm (`libdrm.so.2`).
//!
//! Loaded dynamically at runtime via `libloading`, like the decoder
//! bindings. Only the KMS calls needed to pick an overlay plane and to
//! scan out dumb buffers are bound.
//!
//! Reference: `xf86drm.h`, `xf86drmMode.h`, `drm_mode.h`, `drm_fourcc.h`.

use std::ffi::{c_char, c_int, c_ulong, c_void};
use std::path::Path;

use libloading::Library;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// `DRM_IOWR(0xB2, struct drm_mode_create_dumb)`
pub const DRM_IOCTL_MODE_CREATE_DUMB: c_ulong = 0xC020_64B2;

/// `DRM_IOWR(0xB4, struct drm_mode_destroy_dumb)`
pub const DRM_IOCTL_MODE_DESTROY_DUMB: c_ulong = 0xC004_64B4;

/// Flags for `drmPrimeHandleToFD`.
pub const DRM_CLOEXEC: u32 = 0o2_000_000;
pub const DRM_RDWR: u32 = 0o2;

/// Expose primary and cursor planes alongside overlays.
pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;

pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;

/// Plane "type" property value for overlay planes.
pub const DRM_PLANE_TYPE_OVERLAY: u64 = 0;

/// `drmModeConnection::DRM_MODE_CONNECTED`
pub const DRM_MODE_CONNECTED: c_int = 1;

const DRM_DISPLAY_MODE_LEN: usize = 32;
const DRM_PROP_NAME_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeDestroyDumb {
    pub handle: u32,
}

#[repr(C)]
pub struct DrmModeRes {
    pub count_fbs: c_int,
    pub fbs: *mut u32,
    pub count_crtcs: c_int,
    pub crtcs: *mut u32,
    pub count_connectors: c_int,
    pub connectors: *mut u32,
    pub count_encoders: c_int,
    pub encoders: *mut u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
pub struct DrmModeModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: [c_char; DRM_DISPLAY_MODE_LEN],
}

#[repr(C)]
pub struct DrmModeConnector {
    pub connector_id: u32,
    pub encoder_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: c_int,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: c_int,
    pub count_modes: c_int,
    pub modes: *mut DrmModeModeInfo,
    pub count_props: c_int,
    pub props: *mut u32,
    pub prop_values: *mut u64,
    pub count_encoders: c_int,
    pub encoders: *mut u32,
}

#[repr(C)]
pub struct DrmModeEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
pub struct DrmModeCrtc {
    pub crtc_id: u32,
    pub buffer_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mode_valid: c_int,
    pub mode: DrmModeModeInfo,
    pub gamma_size: c_int,
}

#[repr(C)]
pub struct DrmModePlaneRes {
    pub count_planes: u32,
    pub planes: *mut u32,
}

#[repr(C)]
pub struct DrmModePlane {
    pub count_formats: u32,
    pub formats: *mut u32,
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub crtc_x: u32,
    pub crtc_y: u32,
    pub x: u32,
    pub y: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
}

#[repr(C)]
pub struct DrmModeObjectProperties {
    pub count_props: u32,
    pub props: *mut u32,
    pub prop_values: *mut u64,
}

#[repr(C)]
pub struct DrmModeProperty {
    pub prop_id: u32,
    pub flags: u32,
    pub name: [c_char; DRM_PROP_NAME_LEN],
    pub count_values: c_int,
    pub values: *mut u64,
    pub count_enums: c_int,
    pub enums: *mut c_void,
    pub count_blobs: c_int,
    pub blob_ids: *mut u32,
}

/// View a C `(count, pointer)` pair as a slice.
///
/// # Safety
///
/// `ptr` must point to `count` initialised elements that outlive `'a`.
pub unsafe fn c_array<'a, T>(ptr: *const T, count: impl TryInto<usize>) -> &'a [T] {
    let count = count.try_into().unwrap_or(0);
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count)
    }
}

// ---------------------------------------------------------------------------
// Function table
// ---------------------------------------------------------------------------

/// Dynamically loaded libdrm function table.
pub struct DrmLibrary {
    _lib: Library,

    // -- Core --
    pub drm_ioctl: unsafe extern "C" fn(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int,
    pub drm_set_client_cap: unsafe extern "C" fn(fd: c_int, capability: u64, value: u64) -> c_int,
    pub drm_prime_handle_to_fd:
        unsafe extern "C" fn(fd: c_int, handle: u32, flags: u32, prime_fd: *mut c_int) -> c_int,

    // -- Framebuffers and planes --
    pub drm_mode_add_fb2: unsafe extern "C" fn(
        fd: c_int,
        width: u32,
        height: u32,
        pixel_format: u32,
        bo_handles: *const u32,
        pitches: *const u32,
        offsets: *const u32,
        buf_id: *mut u32,
        flags: u32,
    ) -> c_int,
    pub drm_mode_rm_fb: unsafe extern "C" fn(fd: c_int, buffer_id: u32) -> c_int,
    pub drm_mode_set_plane: unsafe extern "C" fn(
        fd: c_int,
        plane_id: u32,
        crtc_id: u32,
        fb_id: u32,
        flags: u32,
        crtc_x: i32,
        crtc_y: i32,
        crtc_w: u32,
        crtc_h: u32,
        src_x: u32,
        src_y: u32,
        src_w: u32,
        src_h: u32,
    ) -> c_int,

    // -- Resource queries --
    pub drm_mode_get_resources: unsafe extern "C" fn(fd: c_int) -> *mut DrmModeRes,
    pub drm_mode_free_resources: unsafe extern "C" fn(ptr: *mut DrmModeRes),
    pub drm_mode_get_connector:
        unsafe extern "C" fn(fd: c_int, connector_id: u32) -> *mut DrmModeConnector,
    pub drm_mode_free_connector: unsafe extern "C" fn(ptr: *mut DrmModeConnector),
    pub drm_mode_get_encoder: unsafe extern "C" fn(fd: c_int, encoder_id: u32) -> *mut DrmModeEncoder,
    pub drm_mode_free_encoder: unsafe extern "C" fn(ptr: *mut DrmModeEncoder),
    pub drm_mode_get_crtc: unsafe extern "C" fn(fd: c_int, crtc_id: u32) -> *mut DrmModeCrtc,
    pub drm_mode_free_crtc: unsafe extern "C" fn(ptr: *mut DrmModeCrtc),
    pub drm_mode_get_plane_resources: unsafe extern "C" fn(fd: c_int) -> *mut DrmModePlaneRes,
    pub drm_mode_free_plane_resources: unsafe extern "C" fn(ptr: *mut DrmModePlaneRes),
    pub drm_mode_get_plane: unsafe extern "C" fn(fd: c_int, plane_id: u32) -> *mut DrmModePlane,
    pub drm_mode_free_plane: unsafe extern "C" fn(ptr: *mut DrmModePlane),
    pub drm_mode_object_get_properties: unsafe extern "C" fn(
        fd: c_int,
        object_id: u32,
        object_type: u32,
    ) -> *mut DrmModeObjectProperties,
    pub drm_mode_free_object_properties: unsafe extern "C" fn(ptr: *mut DrmModeObjectProperties),
    pub drm_mode_get_property:
        unsafe extern "C" fn(fd: c_int, property_id: u32) -> *mut DrmModeProperty,
    pub drm_mode_free_property: unsafe extern "C" fn(ptr: *mut DrmModeProperty),
}

// SAFETY: only function pointers into the loaded library; libdrm calls are
// plain ioctls on the descriptor passed in and are thread-safe.
unsafe impl Send for DrmLibrary {}
unsafe impl Sync for DrmLibrary {}

impl std::fmt::Debug for DrmLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmLibrary").field("loaded", &true).finish()
    }
}

/// # Safety
///
/// `T` must match the C signature of `name`.
unsafe fn resolve<T: Copy>(lib: &Library, name: &str) -> Result<T, DrmLoadError> {
    lib.get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|e| DrmLoadError::SymbolNotFound(format!("{name}: {e}")))
}

impl DrmLibrary {
    pub fn load() -> Result<Self, DrmLoadError> {
        Self::load_from(Path::new("libdrm.so.2"))
    }

    pub fn load_from(path: &Path) -> Result<Self, DrmLoadError> {
        info!(library = %path.display(), "Loading libdrm");

        // SAFETY: libdrm has no load-time side effects beyond symbol setup.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DrmLoadError::LibraryNotFound(format!("{}: {e}", path.display())))?;

        // SAFETY: field types match the libdrm headers.
        let loaded = unsafe {
            Self {
                drm_ioctl: resolve(&lib, "drmIoctl")?,
                drm_set_client_cap: resolve(&lib, "drmSetClientCap")?,
                drm_prime_handle_to_fd: resolve(&lib, "drmPrimeHandleToFD")?,
                drm_mode_add_fb2: resolve(&lib, "drmModeAddFB2")?,
                drm_mode_rm_fb: resolve(&lib, "drmModeRmFB")?,
                drm_mode_set_plane: resolve(&lib, "drmModeSetPlane")?,
                drm_mode_get_resources: resolve(&lib, "drmModeGetResources")?,
                drm_mode_free_resources: resolve(&lib, "drmModeFreeResources")?,
                drm_mode_get_connector: resolve(&lib, "drmModeGetConnector")?,
                drm_mode_free_connector: resolve(&lib, "drmModeFreeConnector")?,
                drm_mode_get_encoder: resolve(&lib, "drmModeGetEncoder")?,
                drm_mode_free_encoder: resolve(&lib, "drmModeFreeEncoder")?,
                drm_mode_get_crtc: resolve(&lib, "drmModeGetCrtc")?,
                drm_mode_free_crtc: resolve(&lib, "drmModeFreeCrtc")?,
                drm_mode_get_plane_resources: resolve(&lib, "drmModeGetPlaneResources")?,
                drm_mode_free_plane_resources: resolve(&lib, "drmModeFreePlaneResources")?,
                drm_mode_get_plane: resolve(&lib, "drmModeGetPlane")?,
                drm_mode_free_plane: resolve(&lib, "drmModeFreePlane")?,
                drm_mode_object_get_properties: resolve(&lib, "drmModeObjectGetProperties")?,
                drm_mode_free_object_properties: resolve(&lib, "drmModeFreeObjectProperties")?,
                drm_mode_get_property: resolve(&lib, "drmModeGetProperty")?,
                drm_mode_free_property: resolve(&lib, "drmModeFreeProperty")?,
                _lib: lib,
            }
        };

        debug!("All libdrm symbols resolved");
        Ok(loaded)
    }
}

/// Errors that can occur when loading libdrm.
#[derive(Debug, thiserror::Error)]
pub enum DrmLoadError {
    #[error("libdrm not found: {0}")]
    LibraryNotFound(String),

    #[error("Required symbol not found: {0}")]
    SymbolNotFound(String),
}

/// Map a libdrm return value (0 or negative errno, or -1 with errno set)
/// to a readable error.
pub fn check_drm_result(result: c_int, function_name: &str) -> Result<(), String> {
    if result == 0 {
        return Ok(());
    }
    let err = if result == -1 {
        std::io::Error::last_os_error()
    } else {
        std::io::Error::from_raw_os_error(result.saturating_neg())
    };
    Err(format!("{function_name} failed: {err}"))
}
