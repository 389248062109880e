//! Placement of the decoded picture on the display.

use rk_common::{Fit, OutputRect, Resolution};

/// Compute where a `frame` sized picture lands on a `display` sized CRTC.
///
/// With [`Fit::Aspect`] the picture keeps its aspect ratio: a display wider
/// than the picture gets a centred pillarbox, otherwise a centred
/// letterbox. All arithmetic is integer, so the same inputs always give
/// the same rectangle.
pub fn output_rect(frame: Resolution, display: Resolution, fit: Fit) -> OutputRect {
    let full = OutputRect {
        x: 0,
        y: 0,
        width: display.width,
        height: display.height,
    };
    if fit == Fit::Fullscreen || frame.is_empty() || display.is_empty() {
        return full;
    }

    let (fw, fh) = (u64::from(frame.width), u64::from(frame.height));
    let (cw, ch) = (u64::from(display.width), u64::from(display.height));

    // cw/ch > fw/fh without division.
    if cw * fh > fw * ch {
        let width = (fw * ch / fh) as u32;
        OutputRect {
            x: (display.width - width) / 2,
            y: 0,
            width,
            height: display.height,
        }
    } else {
        let height = (cw * fh / fw) as u32;
        OutputRect {
            x: 0,
            y: (display.height - height) / 2,
            width: display.width,
            height,
        }
    }
}
