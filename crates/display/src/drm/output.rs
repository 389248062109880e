//! Output discovery: connector, encoder, CRTC and overlay plane.
//!
//! The search mirrors what a bare KMS client does at startup:
//! 1. Take the first connected connector that has at least one mode.
//! 2. Follow its current encoder to the CRTC it drives.
//! 3. Pick an idle overlay plane on that CRTC that can scan out NV12.
//!
//! The libdrm objects are wrapped in [`DrmObject`] so every early return
//! frees what was fetched. The choice itself is made by plain functions
//! over [`ConnectorInfo`] and [`PlaneInfo`] so it can be tested without a
//! display.

use std::ffi::{c_int, CStr};
use std::ops::Deref;

use tracing::{debug, info};

use rk_common::{DisplayError, Resolution};

use super::ffi::{
    c_array, check_drm_result, DrmLibrary, DRM_CLIENT_CAP_UNIVERSAL_PLANES, DRM_MODE_CONNECTED,
    DRM_MODE_OBJECT_PLANE, DRM_PLANE_TYPE_OVERLAY,
};

// ---------------------------------------------------------------------------
// RAII wrapper for libdrm-allocated objects
// ---------------------------------------------------------------------------

/// Owns one object returned by a `drmModeGet*` call and frees it on drop.
pub(crate) struct DrmObject<T> {
    ptr: *mut T,
    free: unsafe extern "C" fn(*mut T),
}

impl<T> DrmObject<T> {
    /// Returns `None` for a null pointer.
    fn new(ptr: *mut T, free: unsafe extern "C" fn(*mut T)) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self { ptr, free })
        }
    }
}

impl<T> Deref for DrmObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: non-null and valid until freed in Drop.
        unsafe { &*self.ptr }
    }
}

impl<T> Drop for DrmObject<T> {
    fn drop(&mut self) {
        // SAFETY: ptr came from the matching drmModeGet* call.
        unsafe { (self.free)(self.ptr) }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The display path chosen at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSelection {
    pub connector_id: u32,
    pub encoder_id: u32,
    pub crtc_id: u32,
    /// Position of the CRTC in the resource list (bit index in `possible_crtcs`).
    pub crtc_index: u32,
    pub plane_id: u32,
    /// Size of the CRTC's current mode.
    pub size: Resolution,
}

/// What the selection needs to know about a connector.
#[derive(Clone, Debug)]
pub struct ConnectorInfo {
    pub connector_id: u32,
    pub encoder_id: u32,
    pub connected: bool,
    pub mode_count: usize,
}

/// What the selection needs to know about a plane.
#[derive(Clone, Debug)]
pub struct PlaneInfo {
    pub plane_id: u32,
    pub formats: Vec<u32>,
    pub possible_crtcs: u32,
    /// CRTC currently bound to the plane (0 when idle).
    pub crtc_id: u32,
    pub is_overlay: bool,
}

/// First connected connector with at least one mode.
pub fn pick_connector(connectors: &[ConnectorInfo]) -> Option<&ConnectorInfo> {
    connectors
        .iter()
        .find(|c| c.connected && c.mode_count > 0)
}

/// First idle overlay plane that can reach `crtc_index` and scan out `fourcc`.
pub fn pick_plane(planes: &[PlaneInfo], crtc_index: u32, fourcc: u32) -> Option<&PlaneInfo> {
    let crtc_bit = 1u32.checked_shl(crtc_index).unwrap_or(0);
    planes.iter().find(|p| {
        p.is_overlay
            && p.crtc_id == 0
            && p.possible_crtcs & crtc_bit != 0
            && p.formats.contains(&fourcc)
    })
}

/// Query the device and choose connector, CRTC and overlay plane.
pub fn select_output(
    lib: &DrmLibrary,
    fd: c_int,
    fourcc: u32,
) -> Result<OutputSelection, DisplayError> {
    // SAFETY: fd is an open DRM device; the result is freed by DrmObject.
    let resources = DrmObject::new(
        unsafe { (lib.drm_mode_get_resources)(fd) },
        lib.drm_mode_free_resources,
    )
    .ok_or_else(|| DisplayError::NoOutput("drmModeGetResources returned nothing".into()))?;

    // SAFETY: the arrays are owned by `resources`, which outlives the views.
    let (connector_ids, encoder_ids, crtc_ids) = unsafe {
        (
            c_array(resources.connectors, resources.count_connectors),
            c_array(resources.encoders, resources.count_encoders),
            c_array(resources.crtcs, resources.count_crtcs),
        )
    };

    let connectors: Vec<ConnectorInfo> = connector_ids
        .iter()
        .filter_map(|&id| {
            // SAFETY: id comes from the resource list.
            let connector = DrmObject::new(
                unsafe { (lib.drm_mode_get_connector)(fd, id) },
                lib.drm_mode_free_connector,
            )?;
            Some(ConnectorInfo {
                connector_id: connector.connector_id,
                encoder_id: connector.encoder_id,
                connected: connector.connection == DRM_MODE_CONNECTED,
                mode_count: usize::try_from(connector.count_modes).unwrap_or(0),
            })
        })
        .collect();

    let connector = pick_connector(&connectors)
        .ok_or_else(|| DisplayError::NoOutput("no connected connector with modes".into()))?;
    info!(connector_id = connector.connector_id, "Connector selected");

    if !encoder_ids.contains(&connector.encoder_id) {
        return Err(DisplayError::NoOutput(format!(
            "connector {} has no active encoder",
            connector.connector_id
        )));
    }
    // SAFETY: encoder id comes from the resource list.
    let encoder = DrmObject::new(
        unsafe { (lib.drm_mode_get_encoder)(fd, connector.encoder_id) },
        lib.drm_mode_free_encoder,
    )
    .ok_or_else(|| DisplayError::NoOutput(format!("encoder {} unavailable", connector.encoder_id)))?;

    let crtc_index = crtc_ids
        .iter()
        .position(|&id| id == encoder.crtc_id)
        .ok_or_else(|| {
            DisplayError::NoOutput(format!("encoder {} drives no CRTC", encoder.encoder_id))
        })?;
    // SAFETY: crtc id comes from the resource list.
    let crtc = DrmObject::new(
        unsafe { (lib.drm_mode_get_crtc)(fd, encoder.crtc_id) },
        lib.drm_mode_free_crtc,
    )
    .ok_or_else(|| DisplayError::NoOutput(format!("CRTC {} unavailable", encoder.crtc_id)))?;

    let size = Resolution::new(crtc.width, crtc.height);
    if size.is_empty() {
        return Err(DisplayError::NoOutput(format!(
            "CRTC {} has no active mode",
            crtc.crtc_id
        )));
    }
    info!(crtc_id = crtc.crtc_id, %size, "CRTC selected");

    // SAFETY: plain capability ioctl.
    let result = unsafe { (lib.drm_set_client_cap)(fd, DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1) };
    check_drm_result(result, "drmSetClientCap").map_err(DisplayError::NoOutput)?;

    let planes = query_planes(lib, fd)?;
    let crtc_index = crtc_index as u32;
    let plane = pick_plane(&planes, crtc_index, fourcc).ok_or_else(|| {
        DisplayError::NoOutput(format!(
            "no idle overlay plane with format {fourcc:#010x} on CRTC {}",
            crtc.crtc_id
        ))
    })?;
    info!(plane_id = plane.plane_id, "Overlay plane selected");

    Ok(OutputSelection {
        connector_id: connector.connector_id,
        encoder_id: encoder.encoder_id,
        crtc_id: crtc.crtc_id,
        crtc_index,
        plane_id: plane.plane_id,
        size,
    })
}

fn query_planes(lib: &DrmLibrary, fd: c_int) -> Result<Vec<PlaneInfo>, DisplayError> {
    // SAFETY: fd is an open DRM device.
    let resources = DrmObject::new(
        unsafe { (lib.drm_mode_get_plane_resources)(fd) },
        lib.drm_mode_free_plane_resources,
    )
    .ok_or_else(|| DisplayError::NoOutput("drmModeGetPlaneResources returned nothing".into()))?;

    // SAFETY: owned by `resources`.
    let plane_ids = unsafe { c_array(resources.planes, resources.count_planes) };

    let mut planes = Vec::with_capacity(plane_ids.len());
    for &id in plane_ids {
        // SAFETY: id comes from the plane list.
        let Some(plane) = DrmObject::new(
            unsafe { (lib.drm_mode_get_plane)(fd, id) },
            lib.drm_mode_free_plane,
        ) else {
            continue;
        };
        // SAFETY: owned by `plane`.
        let formats = unsafe { c_array(plane.formats, plane.count_formats) }.to_vec();
        let is_overlay = plane_type(lib, fd, id) == Some(DRM_PLANE_TYPE_OVERLAY);
        debug!(
            plane_id = plane.plane_id,
            crtc_id = plane.crtc_id,
            possible_crtcs = plane.possible_crtcs,
            formats = formats.len(),
            is_overlay,
            "Plane"
        );
        planes.push(PlaneInfo {
            plane_id: plane.plane_id,
            formats,
            possible_crtcs: plane.possible_crtcs,
            crtc_id: plane.crtc_id,
            is_overlay,
        });
    }
    Ok(planes)
}

/// Value of the plane's "type" property.
fn plane_type(lib: &DrmLibrary, fd: c_int, plane_id: u32) -> Option<u64> {
    // SAFETY: plane id comes from the plane list.
    let props = DrmObject::new(
        unsafe { (lib.drm_mode_object_get_properties)(fd, plane_id, DRM_MODE_OBJECT_PLANE) },
        lib.drm_mode_free_object_properties,
    )?;
    // SAFETY: both arrays hold count_props entries owned by `props`.
    let (ids, values) = unsafe {
        (
            c_array(props.props, props.count_props),
            c_array(props.prop_values, props.count_props),
        )
    };

    ids.iter().zip(values).find_map(|(&prop_id, &value)| {
        // SAFETY: prop id comes from the object's property list.
        let prop = DrmObject::new(
            unsafe { (lib.drm_mode_get_property)(fd, prop_id) },
            lib.drm_mode_free_property,
        )?;
        // SAFETY: libdrm NUL-terminates property names.
        let name = unsafe { CStr::from_ptr(prop.name.as_ptr()) };
        (name.to_bytes() == b"type").then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NV12: u32 = 0x3231_564E;
    const XR24: u32 = 0x3432_5258;

    fn plane(id: u32, formats: &[u32], possible: u32, crtc: u32, overlay: bool) -> PlaneInfo {
        PlaneInfo {
            plane_id: id,
            formats: formats.to_vec(),
            possible_crtcs: possible,
            crtc_id: crtc,
            is_overlay: overlay,
        }
    }

    #[test]
    fn first_connected_connector_with_modes() {
        let connectors = [
            ConnectorInfo {
                connector_id: 1,
                encoder_id: 10,
                connected: false,
                mode_count: 3,
            },
            ConnectorInfo {
                connector_id: 2,
                encoder_id: 11,
                connected: true,
                mode_count: 0,
            },
            ConnectorInfo {
                connector_id: 3,
                encoder_id: 12,
                connected: true,
                mode_count: 5,
            },
        ];
        assert_eq!(pick_connector(&connectors).map(|c| c.connector_id), Some(3));
        assert!(pick_connector(&connectors[..2]).is_none());
    }

    #[test]
    fn plane_must_be_idle_nv12_overlay_on_crtc() {
        let planes = [
            // primary plane
            plane(30, &[NV12, XR24], 0b01, 0, false),
            // busy overlay
            plane(31, &[NV12], 0b01, 50, true),
            // wrong CRTC
            plane(32, &[NV12], 0b10, 0, true),
            // no NV12
            plane(33, &[XR24], 0b01, 0, true),
            plane(34, &[XR24, NV12], 0b11, 0, true),
        ];
        assert_eq!(pick_plane(&planes, 0, NV12).map(|p| p.plane_id), Some(34));
        assert_eq!(pick_plane(&planes, 1, NV12).map(|p| p.plane_id), Some(32));
        assert!(pick_plane(&planes, 2, NV12).is_none());
    }

    #[test]
    fn large_crtc_index_does_not_overflow() {
        let planes = [plane(1, &[NV12], u32::MAX, 0, true)];
        assert!(pick_plane(&planes, 40, NV12).is_none());
    }
}
