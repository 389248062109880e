//! Compressed coding formats understood by the hardware decoder.

use std::fmt;
use std::str::FromStr;

/// Coding format of the input elementary stream.
///
/// The numeric ids are the decoder's own coding type codes, which is what
/// the command line accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodingFormat {
    Mpeg2,
    H263,
    Mpeg4,
    H264,
    Mjpeg,
    Vp8,
    Vp9,
    H265,
    Av1,
}

impl CodingFormat {
    /// Every format with a decoder id, in id order.
    pub const ALL: [CodingFormat; 9] = [
        Self::Mpeg2,
        Self::H263,
        Self::Mpeg4,
        Self::H264,
        Self::Mjpeg,
        Self::Vp8,
        Self::Vp9,
        Self::H265,
        Self::Av1,
    ];

    /// Decoder coding type id.
    pub const fn id(&self) -> i32 {
        match self {
            Self::Mpeg2 => 2,
            Self::H263 => 3,
            Self::Mpeg4 => 4,
            Self::H264 => 7,
            Self::Mjpeg => 8,
            Self::Vp8 => 9,
            Self::Vp9 => 10,
            Self::H265 => 0x0100_0004,
            Self::Av1 => 0x0100_0008,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.id() == id)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mpeg2 => "MPEG-2",
            Self::H263 => "H.263",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::H264 => "H.264/AVC",
            Self::Mjpeg => "Motion JPEG",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::H265 => "H.265/HEVC",
            Self::Av1 => "AV1",
        }
    }

    /// Whether the format can be decoded through the plain packet/frame
    /// interface. MJPEG needs the task-based interface and is not supported.
    pub fn is_streamable(&self) -> bool {
        !matches!(self, Self::Mjpeg)
    }
}

impl fmt::Display for CodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error returned when a coding format argument cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown coding format '{0}'")]
pub struct UnknownCodingFormat(pub String);

impl FromStr for CodingFormat {
    type Err = UnknownCodingFormat;

    /// Accepts a decimal id, a `0x` hex id, or a short name (`h264`, `hevc`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let id = if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            i32::from_str_radix(hex, 16).ok()
        } else {
            trimmed.parse::<i32>().ok()
        };
        if let Some(format) = id.and_then(Self::from_id) {
            return Ok(format);
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "mpeg2" => Ok(Self::Mpeg2),
            "h263" => Ok(Self::H263),
            "mpeg4" => Ok(Self::Mpeg4),
            "h264" | "avc" => Ok(Self::H264),
            "mjpeg" => Ok(Self::Mjpeg),
            "vp8" => Ok(Self::Vp8),
            "vp9" => Ok(Self::Vp9),
            "h265" | "hevc" => Ok(Self::H265),
            "av1" => Ok(Self::Av1),
            _ => Err(UnknownCodingFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_table() {
        for format in CodingFormat::ALL {
            assert_eq!(CodingFormat::from_id(format.id()), Some(format));
        }
        assert_eq!(CodingFormat::from_id(0), None);
    }

    #[test]
    fn parses_ids_and_names() {
        assert_eq!("7".parse::<CodingFormat>(), Ok(CodingFormat::H264));
        assert_eq!("16777220".parse::<CodingFormat>(), Ok(CodingFormat::H265));
        assert_eq!("0x01000004".parse::<CodingFormat>(), Ok(CodingFormat::H265));
        assert_eq!("HEVC".parse::<CodingFormat>(), Ok(CodingFormat::H265));
        assert!("42".parse::<CodingFormat>().is_err());
    }

    #[test]
    fn mjpeg_is_not_streamable() {
        assert!(!CodingFormat::Mjpeg.is_streamable());
        assert!(CodingFormat::H264.is_streamable());
    }
}
