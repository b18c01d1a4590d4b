//! Stereo layout detection from catalog tags.
//!
//! Tags are free text supplied by the catalog ("3D", "Half-SBS", "vr180").
//! Every tag is lower-cased, trimmed, and has `-`/`_` folded into spaces
//! before it is compared against a fixed vocabulary. Half-resolution tokens
//! are checked before full-resolution ones so that a more specific token
//! always wins.

use px_core::StereoFormat;
use serde::Serialize;

/// Half-resolution side-by-side spellings.
const HALF_SBS_TOKENS: &[&str] = &["hsbs", "h sbs", "half sbs", "half side by side", "sbs half"];

/// Half-resolution over-under spellings.
const HALF_OU_TOKENS: &[&str] = &[
    "hou",
    "htb",
    "htab",
    "h ou",
    "h tb",
    "half ou",
    "half tb",
    "half tab",
    "half over under",
    "half top bottom",
    "half top and bottom",
    "ou half",
];

/// Full-resolution side-by-side spellings.
const SBS_TOKENS: &[&str] = &["sbs", "fsbs", "full sbs", "side by side", "3d sbs", "sbs 3d"];

/// Full-resolution over-under spellings.
const OU_TOKENS: &[&str] = &[
    "ou",
    "tb",
    "tab",
    "fou",
    "full ou",
    "over under",
    "top bottom",
    "top and bottom",
    "3d ou",
    "3d tb",
];

/// Tags that mark a source as stereoscopic without naming a layout.
const GENERIC_TOKENS: &[&str] = &[
    "stereoscopic",
    "stereo 3d",
    "3d",
    "vr",
    "vr180",
    "vr 180",
    "180",
    "180 3d",
    "spatial",
];

/// Result of [`detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub is_stereoscopic: bool,
    pub format: Option<StereoFormat>,
}

impl Detection {
    const NONE: Detection = Detection {
        is_stereoscopic: false,
        format: None,
    };

    fn of(format: StereoFormat) -> Self {
        Self {
            is_stereoscopic: true,
            format: Some(format),
        }
    }
}

/// Classify a stereo layout from a set of free-text tags.
///
/// A generic stereoscopic tag with no layout token defaults to
/// side-by-side. No recognised tag yields `(false, None)`.
pub fn detect<I, S>(tags: I) -> Detection
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let normalized: Vec<String> = tags.into_iter().map(|t| normalize(t.as_ref())).collect();
    let has_any = |vocab: &[&str]| normalized.iter().any(|t| vocab.contains(&t.as_str()));

    let ordered: [(&[&str], StereoFormat); 4] = [
        (HALF_SBS_TOKENS, StereoFormat::HalfSideBySide),
        (HALF_OU_TOKENS, StereoFormat::HalfOverUnder),
        (SBS_TOKENS, StereoFormat::SideBySide),
        (OU_TOKENS, StereoFormat::OverUnder),
    ];

    for (vocab, format) in ordered {
        if has_any(vocab) {
            return Detection::of(format);
        }
    }

    if has_any(GENERIC_TOKENS) {
        return Detection::of(StereoFormat::SideBySide);
    }

    Detection::NONE
}

fn normalize(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .replace(['-', '_', '/'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-eye output dimensions for a combined source frame.
///
/// Side-by-side layouts halve the width, over-under layouts halve the
/// height. Half-resolution layouts follow the same rule; the detector does
/// not unsqueeze. Both dimensions are at least 1.
pub fn per_eye_dimensions(format: StereoFormat, source_width: u32, source_height: u32) -> (u32, u32) {
    let (w, h) = if format.is_side_by_side() {
        (source_width / 2, source_height)
    } else {
        (source_width, source_height / 2)
    };
    (w.max(1), h.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_tokens_win_over_full() {
        assert_eq!(detect(["hsbs"]), Detection::of(StereoFormat::HalfSideBySide));
        assert_eq!(detect(["sbs", "Half-SBS"]), Detection::of(StereoFormat::HalfSideBySide));
        assert_eq!(detect(["3D", "HOU"]), Detection::of(StereoFormat::HalfOverUnder));
        assert_eq!(detect(["tb", "half_tb"]), Detection::of(StereoFormat::HalfOverUnder));
    }

    #[test]
    fn half_tokens_never_yield_full_format() {
        for half in HALF_SBS_TOKENS.iter().chain(HALF_OU_TOKENS) {
            for full in SBS_TOKENS.iter().chain(OU_TOKENS).chain(GENERIC_TOKENS) {
                let d = detect([*full, *half]);
                let format = d.format.unwrap();
                assert!(format.is_half_resolution(), "{full:?} + {half:?} -> {format:?}");
            }
        }
    }

    #[test]
    fn full_formats() {
        assert_eq!(detect([" Side-By-Side "]), Detection::of(StereoFormat::SideBySide));
        assert_eq!(detect(["Over/Under"]), Detection::of(StereoFormat::OverUnder));
        assert_eq!(detect(["top  and bottom"]), Detection::of(StereoFormat::OverUnder));
    }

    #[test]
    fn generic_indicator_defaults_to_sbs() {
        assert_eq!(detect(["Stereoscopic"]), Detection::of(StereoFormat::SideBySide));
        assert_eq!(detect(["VR"]), Detection::of(StereoFormat::SideBySide));
        assert_eq!(detect(["documentary", "3d"]), Detection::of(StereoFormat::SideBySide));
    }

    #[test]
    fn no_match() {
        assert_eq!(detect(["documentary", "4k", "hdr"]), Detection::NONE);
        assert_eq!(detect(Vec::<String>::new()), Detection::NONE);
        // Substrings do not count.
        assert_eq!(detect(["subsonic", "without"]), Detection::NONE);
    }

    #[test]
    fn per_eye_dimensions_follow_split_axis() {
        assert_eq!(per_eye_dimensions(StereoFormat::SideBySide, 3840, 1080), (1920, 1080));
        assert_eq!(per_eye_dimensions(StereoFormat::HalfSideBySide, 1920, 1080), (960, 1080));
        assert_eq!(per_eye_dimensions(StereoFormat::OverUnder, 1920, 2160), (1920, 1080));
        assert_eq!(per_eye_dimensions(StereoFormat::HalfOverUnder, 1920, 1080), (1920, 540));
    }

    #[test]
    fn per_eye_dimensions_always_positive() {
        for format in StereoFormat::ALL {
            for (w, h) in [(1, 1), (0, 0), (3, 5), (7681, 4321)] {
                let (ew, eh) = per_eye_dimensions(format, w, h);
                assert!(ew >= 1 && eh >= 1);
                if format.is_side_by_side() {
                    assert_eq!(eh, h.max(1));
                } else {
                    assert_eq!(ew, w.max(1));
                }
            }
        }
    }
}
