//! Splitting one combined stereo frame into two eye images.
//!
//! The geometric left (side-by-side) or top (over-under) region is always
//! returned first. Eye reversal is the caller's concern.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use px_core::{Error, Result, StereoFormat};

/// Resampling filter for non-identity scales.
///
/// `image` widens the filter support by the scale ratio when downscaling,
/// so every source pixel under a destination pixel contributes.
const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

/// A pixel rectangle inside the combined frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Source rectangles for the (left, right) eyes of a `width`x`height` frame.
///
/// An odd leftover column or row is dropped so both regions match in size.
pub fn source_regions(format: StereoFormat, width: u32, height: u32) -> (Region, Region) {
    if format.is_side_by_side() {
        let half = width / 2;
        (
            Region { x: 0, y: 0, width: half, height },
            Region { x: half, y: 0, width: half, height },
        )
    } else {
        let half = height / 2;
        (
            Region { x: 0, y: 0, width, height: half },
            Region { x: 0, y: half, width, height: half },
        )
    }
}

/// Extract both eye regions of `frame` and resample each to
/// `target_width`x`target_height`.
///
/// # Errors
///
/// - [`Error::PixelBufferCreationFailed`] if a target dimension is zero or
///   an output buffer cannot be built.
/// - [`Error::FrameSplitFailed`] if the frame is too small to hold two eye
///   regions.
pub fn split_frame(
    frame: &RgbaImage,
    format: StereoFormat,
    target_width: u32,
    target_height: u32,
) -> Result<(RgbaImage, RgbaImage)> {
    if target_width == 0 || target_height == 0 {
        return Err(Error::PixelBufferCreationFailed(format!(
            "invalid target dimensions {target_width}x{target_height}"
        )));
    }

    let (left, right) = source_regions(format, frame.width(), frame.height());
    if left.width == 0 || left.height == 0 {
        return Err(Error::FrameSplitFailed(format!(
            "{}x{} frame is too small for {format} layout",
            frame.width(),
            frame.height()
        )));
    }

    Ok((
        extract_eye(frame, left, target_width, target_height)?,
        extract_eye(frame, right, target_width, target_height)?,
    ))
}

fn extract_eye(frame: &RgbaImage, region: Region, target_width: u32, target_height: u32) -> Result<RgbaImage> {
    let cropped = copy_region(frame, region)?;
    if region.width == target_width && region.height == target_height {
        return Ok(cropped);
    }
    Ok(imageops::resize(&cropped, target_width, target_height, RESAMPLE_FILTER))
}

/// Copy a rectangle out of `frame` row by row.
fn copy_region(frame: &RgbaImage, region: Region) -> Result<RgbaImage> {
    if region.x + region.width > frame.width() || region.y + region.height > frame.height() {
        return Err(Error::FrameSplitFailed(format!(
            "region {region:?} exceeds {}x{} frame",
            frame.width(),
            frame.height()
        )));
    }

    let src = frame.as_raw();
    let src_stride = frame.width() as usize * 4;
    let row_len = region.width as usize * 4;
    let x_off = region.x as usize * 4;

    let mut out = Vec::with_capacity(row_len * region.height as usize);
    for row in region.y..region.y + region.height {
        let start = row as usize * src_stride + x_off;
        let slice = src.get(start..start + row_len).ok_or_else(|| {
            Error::FrameSplitFailed(format!("source row {row} is out of bounds"))
        })?;
        out.extend_from_slice(slice);
    }

    RgbaImage::from_raw(region.width, region.height, out).ok_or_else(|| {
        Error::PixelBufferCreationFailed(format!("{}x{} eye buffer", region.width, region.height))
    })
}
