//! Core value types shared between the decoder, display and pipeline crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width/height pair in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self::new(1280, 720);
    pub const FHD: Self = Self::new(1920, 1080);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns `true` if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Decoder output pixel layout.
///
/// Only [`PixelFormat::Nv12`] can be scanned out by the overlay path; the
/// other variants exist so an unsupported stream is reported by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit semi-planar 4:2:0 (Y plane followed by interleaved CbCr).
    Nv12,
    /// 10-bit packed semi-planar 4:2:0 (NV15).
    Nv15,
    /// 8-bit semi-planar 4:2:2.
    Nv16,
    /// 8-bit fully planar 4:2:0.
    I420,
    /// Anything else, carrying the raw decoder format code.
    Other(i32),
}

impl PixelFormat {
    /// DRM fourcc for formats the display path can import.
    pub fn drm_fourcc(&self) -> Option<u32> {
        match self {
            Self::Nv12 => Some(fourcc(b"NV12")),
            Self::Nv16 => Some(fourcc(b"NV16")),
            _ => None,
        }
    }
}

/// Build a little-endian fourcc code (same packing as `drm_fourcc.h`).
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Geometry reported by the decoder on a resolution change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    /// Visible picture width.
    pub width: u32,
    /// Visible picture height.
    pub height: u32,
    /// Horizontal stride (bytes per luma row).
    pub hor_stride: u32,
    /// Vertical stride (luma rows including alignment padding).
    pub ver_stride: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Bytes per allocation row and number of rows for one picture buffer.
    ///
    /// The vertical stride is doubled rather than multiplied by 3/2: the
    /// decoder writes side information after the chroma plane.
    pub fn buffer_dims(&self) -> (u32, u32) {
        (self.hor_stride, self.ver_stride * 2)
    }

    /// Size in bytes committed to the decoder for one picture buffer.
    pub fn buffer_size(&self) -> u64 {
        let (w, h) = self.buffer_dims();
        w as u64 * h as u64
    }

    /// Two-plane NV12 layout inside one buffer.
    pub fn nv12_planes(&self) -> [PlaneLayout; 2] {
        [
            PlaneLayout {
                offset: 0,
                pitch: self.hor_stride,
            },
            PlaneLayout {
                offset: self.hor_stride * self.ver_stride,
                pitch: self.hor_stride,
            },
        ]
    }
}

/// Offset and pitch of one plane inside a hardware buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub pitch: u32,
}

/// Placement of the picture on the display, in CRTC pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for OutputRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// How the picture is fitted to the display.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fit {
    /// Preserve aspect ratio, letterbox or pillarbox as needed.
    #[default]
    Aspect,
    /// Stretch to cover the whole CRTC.
    Fullscreen,
}

/// Display-importable object built from one pool buffer (a DRM framebuffer id).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb#{}", self.0)
    }
}

/// The identity the decoder reports for a committed output buffer.
///
/// For the hardware path this is the dma-buf descriptor number the decoder
/// holds after import.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferIdentity(pub i32);

/// Exported, importable descriptor for one hardware buffer (a dma-buf fd).
///
/// Ownership passes to the decoder when committed.
#[derive(Debug, PartialEq, Eq)]
pub struct ExportDescriptor(pub i32);

/// Hardware allocation backing one pool entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferAllocation {
    /// Provider handle used to export and destroy the buffer.
    pub handle: u32,
    /// Row pitch chosen by the provider.
    pub pitch: u32,
    /// Total allocation size in bytes.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_fourcc_matches_drm() {
        // DRM_FORMAT_NV12 from drm_fourcc.h
        assert_eq!(PixelFormat::Nv12.drm_fourcc(), Some(0x3231_564E));
        assert_eq!(PixelFormat::I420.drm_fourcc(), None);
    }

    #[test]
    fn buffer_dims_double_vertical_stride() {
        let format = FrameFormat {
            width: 1920,
            height: 1080,
            hor_stride: 1920,
            ver_stride: 1088,
            pixel_format: PixelFormat::Nv12,
        };
        assert_eq!(format.buffer_dims(), (1920, 2176));
        assert_eq!(format.buffer_size(), 1920 * 2176);

        let [luma, chroma] = format.nv12_planes();
        assert_eq!(luma, PlaneLayout { offset: 0, pitch: 1920 });
        assert_eq!(
            chroma,
            PlaneLayout {
                offset: 1920 * 1088,
                pitch: 1920
            }
        );
    }

    #[test]
    fn resolution_display_and_empty() {
        assert_eq!(Resolution::FHD.to_string(), "1920x1080");
        assert!(Resolution::new(0, 720).is_empty());
        assert!(!Resolution::HD.is_empty());
    }
}
