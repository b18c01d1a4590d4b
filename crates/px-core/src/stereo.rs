//! Stereo domain types: frame layouts, conversion settings, and sources.
//!
//! [`ConversionSettings::settings_key`] is the cache partitioning rule: two
//! settings values that differ in any field always produce different keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// StereoFormat
// ---------------------------------------------------------------------------

/// Layout of the two eye images inside one combined source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoFormat {
    /// Left eye in the left half, right eye in the right half.
    SideBySide,
    /// Left eye in the top half, right eye in the bottom half.
    OverUnder,
    /// Side-by-side with each eye horizontally squeezed to half width.
    HalfSideBySide,
    /// Over-under with each eye vertically squeezed to half height.
    HalfOverUnder,
}

impl StereoFormat {
    /// All formats, in declaration order.
    pub const ALL: [StereoFormat; 4] = [
        StereoFormat::SideBySide,
        StereoFormat::OverUnder,
        StereoFormat::HalfSideBySide,
        StereoFormat::HalfOverUnder,
    ];

    /// Short code used in settings keys and on the command line.
    pub fn code(self) -> &'static str {
        match self {
            Self::SideBySide => "sbs",
            Self::OverUnder => "ou",
            Self::HalfSideBySide => "hsbs",
            Self::HalfOverUnder => "hou",
        }
    }

    /// Whether the eyes are split along the horizontal axis (left/right columns).
    pub fn is_side_by_side(self) -> bool {
        matches!(self, Self::SideBySide | Self::HalfSideBySide)
    }

    /// Whether the source frame is pre-squeezed to half resolution per eye.
    pub fn is_half_resolution(self) -> bool {
        matches!(self, Self::HalfSideBySide | Self::HalfOverUnder)
    }
}

impl fmt::Display for StereoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for StereoFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "sbs" | "side_by_side" => Ok(Self::SideBySide),
            "ou" | "tb" | "over_under" | "top_bottom" => Ok(Self::OverUnder),
            "hsbs" | "half_sbs" | "half_side_by_side" => Ok(Self::HalfSideBySide),
            "hou" | "htb" | "half_ou" | "half_over_under" => Ok(Self::HalfOverUnder),
            other => Err(Error::Validation(format!("unknown stereo format '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ConversionSettings
// ---------------------------------------------------------------------------

/// Immutable conversion parameters for one stereo transcode.
///
/// Constructed through [`ConversionSettings::new`], which rejects non-finite
/// numbers so that value equality and key equality always agree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSettings", into = "RawSettings")]
pub struct ConversionSettings {
    format: StereoFormat,
    eyes_reversed: bool,
    horizontal_fov_degrees: f64,
    horizontal_disparity_adjustment: f64,
}

#[derive(Serialize, Deserialize)]
struct RawSettings {
    format: StereoFormat,
    eyes_reversed: bool,
    horizontal_fov_degrees: f64,
    horizontal_disparity_adjustment: f64,
}

impl TryFrom<RawSettings> for ConversionSettings {
    type Error = Error;

    fn try_from(raw: RawSettings) -> Result<Self> {
        ConversionSettings::new(
            raw.format,
            raw.eyes_reversed,
            raw.horizontal_fov_degrees,
            raw.horizontal_disparity_adjustment,
        )
    }
}

impl From<ConversionSettings> for RawSettings {
    fn from(s: ConversionSettings) -> Self {
        RawSettings {
            format: s.format,
            eyes_reversed: s.eyes_reversed,
            horizontal_fov_degrees: s.horizontal_fov_degrees,
            horizontal_disparity_adjustment: s.horizontal_disparity_adjustment,
        }
    }
}

impl ConversionSettings {
    /// Build a settings value, rejecting NaN and infinite numbers.
    pub fn new(
        format: StereoFormat,
        eyes_reversed: bool,
        horizontal_fov_degrees: f64,
        horizontal_disparity_adjustment: f64,
    ) -> Result<Self> {
        if !horizontal_fov_degrees.is_finite() {
            return Err(Error::Validation(format!(
                "horizontal field of view must be finite, got {horizontal_fov_degrees}"
            )));
        }
        if !horizontal_disparity_adjustment.is_finite() {
            return Err(Error::Validation(format!(
                "disparity adjustment must be finite, got {horizontal_disparity_adjustment}"
            )));
        }
        Ok(Self {
            format,
            eyes_reversed,
            horizontal_fov_degrees: normalize_zero(horizontal_fov_degrees),
            horizontal_disparity_adjustment: normalize_zero(horizontal_disparity_adjustment),
        })
    }

    pub fn format(&self) -> StereoFormat {
        self.format
    }

    pub fn eyes_reversed(&self) -> bool {
        self.eyes_reversed
    }

    pub fn horizontal_fov_degrees(&self) -> f64 {
        self.horizontal_fov_degrees
    }

    pub fn horizontal_disparity_adjustment(&self) -> f64 {
        self.horizontal_disparity_adjustment
    }

    /// Deterministic cache partition key, e.g. `sbs_n_90_200`.
    ///
    /// Numbers are rendered with Rust's shortest round-trip formatting, so
    /// whole values stay compact while any fractional change still alters
    /// the key.
    pub fn settings_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.format.code(),
            if self.eyes_reversed { "r" } else { "n" },
            self.horizontal_fov_degrees,
            self.horizontal_disparity_adjustment,
        )
    }
}

/// Fold `-0.0` into `0.0` so equal values render identically.
fn normalize_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

// ---------------------------------------------------------------------------
// SourceDescriptor
// ---------------------------------------------------------------------------

/// A remote stereo source as supplied by the catalog.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Stable per-source identifier; the cache partition root.
    pub id: String,
    /// URL the source can be streamed or downloaded from.
    pub stream_url: String,
    /// Combined frame width in pixels.
    pub source_width: u32,
    /// Combined frame height in pixels.
    pub source_height: u32,
    /// Optional bearer credential sent as an `Authorization` header.
    #[serde(default, skip_serializing)]
    pub auth_credential: Option<String>,
    /// Duration reported by the catalog, if known.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub duration: Option<Duration>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, stream_url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            stream_url: stream_url.into(),
            source_width: width,
            source_height: height,
            auth_credential: None,
            duration: None,
        }
    }

    /// Builder: attach a bearer credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.auth_credential = Some(credential.into());
        self
    }

    /// Builder: attach a catalog-supplied duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("id", &self.id)
            .field("stream_url", &self.stream_url)
            .field("source_width", &self.source_width)
            .field("source_height", &self.source_height)
            .field("auth_credential", &self.auth_credential.as_ref().map(|_| "<redacted>"))
            .field("duration", &self.duration)
            .finish()
    }
}

/// Serde helpers to (de)serialize `Option<Duration>` as fractional seconds.
mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}

// ---------------------------------------------------------------------------
// ChunkDescriptor
// ---------------------------------------------------------------------------

/// One byte-range chunk of a remote source. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Zero-based chunk index.
    pub index: usize,
    /// Half-open byte range `[start, end)` within the source.
    pub byte_range: Range<u64>,
    /// Playback time this chunk is expected to cover.
    pub estimated_duration: Duration,
    /// Whether this is the final chunk of the source.
    pub is_last: bool,
}

impl ChunkDescriptor {
    /// Number of bytes covered by this chunk.
    pub fn len(&self) -> u64 {
        self.byte_range.end.saturating_sub(self.byte_range.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn range_header(&self) -> String {
        format!(
            "bytes={}-{}",
            self.byte_range.start,
            self.byte_range.end.saturating_sub(1)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(format: StereoFormat, reversed: bool, fov: f64, disparity: f64) -> ConversionSettings {
        ConversionSettings::new(format, reversed, fov, disparity).unwrap()
    }

    #[test]
    fn settings_key_for_whole_numbers() {
        let s = settings(StereoFormat::SideBySide, false, 90.0, 200.0);
        assert_eq!(s.settings_key(), "sbs_n_90_200");
    }

    #[test]
    fn settings_key_changes_with_every_field() {
        let base = settings(StereoFormat::SideBySide, false, 90.0, 200.0);
        let variants = [
            settings(StereoFormat::HalfSideBySide, false, 90.0, 200.0),
            settings(StereoFormat::SideBySide, true, 90.0, 200.0),
            settings(StereoFormat::SideBySide, false, 90.5, 200.0),
            settings(StereoFormat::SideBySide, false, 90.0, 200.001),
            settings(StereoFormat::SideBySide, false, 90.0, -200.0),
        ];
        for v in variants {
            assert_ne!(base, v);
            assert_ne!(base.settings_key(), v.settings_key(), "{v:?}");
        }
    }

    #[test]
    fn equal_settings_share_key() {
        let a = settings(StereoFormat::OverUnder, true, 100.0, 0.0);
        let b = settings(StereoFormat::OverUnder, true, 100.0, -0.0);
        assert_eq!(a, b);
        assert_eq!(a.settings_key(), b.settings_key());
        assert_eq!(a.settings_key(), "ou_r_100_0");
    }

    #[test]
    fn tiny_disparity_change_changes_key() {
        let a = settings(StereoFormat::SideBySide, false, 90.0, 200.0);
        let b = settings(StereoFormat::SideBySide, false, 90.0, 200.0 + f64::EPSILON * 256.0);
        assert_ne!(a.settings_key(), b.settings_key());
    }

    #[test]
    fn non_finite_settings_rejected() {
        assert!(ConversionSettings::new(StereoFormat::SideBySide, false, f64::NAN, 0.0).is_err());
        assert!(ConversionSettings::new(StereoFormat::SideBySide, false, 90.0, f64::INFINITY).is_err());
    }

    #[test]
    fn settings_serde_validates() {
        let json = r#"{"format":"half_over_under","eyes_reversed":false,"horizontal_fov_degrees":80.0,"horizontal_disparity_adjustment":12.5}"#;
        let s: ConversionSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.format(), StereoFormat::HalfOverUnder);
        assert_eq!(s.settings_key(), "hou_n_80_12.5");
        let back = serde_json::to_string(&s).unwrap();
        assert!(back.contains("half_over_under"));
    }

    #[test]
    fn format_parse_accepts_codes_and_names() {
        assert_eq!("sbs".parse::<StereoFormat>().unwrap(), StereoFormat::SideBySide);
        assert_eq!("Over-Under".parse::<StereoFormat>().unwrap(), StereoFormat::OverUnder);
        assert_eq!("hsbs".parse::<StereoFormat>().unwrap(), StereoFormat::HalfSideBySide);
        assert_eq!("half ou".parse::<StereoFormat>().unwrap(), StereoFormat::HalfOverUnder);
        assert!("anaglyph".parse::<StereoFormat>().is_err());
    }

    #[test]
    fn source_debug_redacts_credential() {
        let src = SourceDescriptor::new("abc", "https://example.com/v.mp4", 3840, 1080)
            .with_credential("secret-token");
        let dbg = format!("{src:?}");
        assert!(!dbg.contains("secret-token"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn chunk_range_header_is_inclusive() {
        let chunk = ChunkDescriptor {
            index: 1,
            byte_range: 100..200,
            estimated_duration: Duration::from_secs(10),
            is_last: false,
        };
        assert_eq!(chunk.len(), 100);
        assert_eq!(chunk.range_header(), "bytes=100-199");
    }
}
