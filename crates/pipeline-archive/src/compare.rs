//! Pixel buffer comparison
//!
//! This module compares the probe output of a live-compiled pipeline with the
//! output of its archive-loaded counterpart. Any byte difference is a failure.

use crate::probe::PixelBuffer;
use std::fmt;

/// Maximum number of differing pixels listed in a mismatch message
const MAX_REPORTED_DIFFERENCES: usize = 8;

/// A single pixel that differs between two buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDifference {
    /// Column of the pixel
    pub x: u32,
    /// Row of the pixel
    pub y: u32,
    /// Raw bytes in the expected buffer
    pub expected: [u8; 4],
    /// Raw bytes in the actual buffer
    pub actual: [u8; 4],
}

/// Result of comparing two pixel buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareResult {
    /// Buffers match exactly
    Match,
    /// Buffers have different dimensions or formats
    DimensionMismatch {
        /// Dimensions of the expected buffer
        expected_dimensions: (u32, u32),
        /// Dimensions of the actual buffer
        actual_dimensions: (u32, u32),
    },
    /// Buffers have matching dimensions but different pixel values
    PixelMismatch {
        /// Whether the first channel matched across all pixels
        c0_matched: bool,
        /// Whether the second channel matched across all pixels
        c1_matched: bool,
        /// Whether the third channel matched across all pixels
        c2_matched: bool,
        /// Whether the fourth channel matched across all pixels
        c3_matched: bool,
        /// Every differing pixel in row-major order
        differences: Vec<PixelDifference>,
    },
}

impl CompareResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Compares two buffers pixel by pixel
pub fn compare_pixels(expected: &PixelBuffer, actual: &PixelBuffer) -> CompareResult {
    // Differently shaped buffers fail immediately; a format change counts as a shape change
    if expected.dimensions() != actual.dimensions() || expected.format() != actual.format() {
        return CompareResult::DimensionMismatch {
            expected_dimensions: expected.dimensions(),
            actual_dimensions: actual.dimensions(),
        };
    }

    let mut matched = [true; 4];
    let mut differences = Vec::new();

    for (index, (expected_pixel, actual_pixel)) in expected.pixels().zip(actual.pixels()).enumerate() {
        if expected_pixel == actual_pixel {
            continue;
        }
        for i in 0..4 {
            if expected_pixel[i] != actual_pixel[i] {
                matched[i] = false;
            }
        }
        let index = index as u32;
        differences.push(PixelDifference {
            x: index % expected.width(),
            y: index / expected.width(),
            expected: expected_pixel,
            actual: actual_pixel,
        });
    }

    if differences.is_empty() {
        CompareResult::Match
    } else {
        CompareResult::PixelMismatch {
            c0_matched: matched[0],
            c1_matched: matched[1],
            c2_matched: matched[2],
            c3_matched: matched[3],
            differences,
        }
    }
}

/// Probe outputs of two pipelines that should be equivalent differ
#[derive(Debug, Clone)]
pub struct MismatchError {
    /// What was compared, e.g. the descriptor
    pub context: String,
    /// Output of the live-compiled pipeline
    pub expected: PixelBuffer,
    /// Output of the archive-loaded pipeline
    pub actual: PixelBuffer,
    /// Detailed comparison result, never [`CompareResult::Match`]
    pub result: CompareResult,
}

impl MismatchError {
    /// Compares the buffers and returns an error if they differ
    pub fn check(context: impl Into<String>, expected: &PixelBuffer, actual: &PixelBuffer) -> Result<(), Self> {
        match compare_pixels(expected, actual) {
            CompareResult::Match => Ok(()),
            result => Err(Self {
                context: context.into(),
                expected: expected.clone(),
                actual: actual.clone(),
                result,
            }),
        }
    }

    /// Positions of differing pixels; empty for a dimension mismatch
    pub fn differing_positions(&self) -> Vec<(u32, u32)> {
        match &self.result {
            CompareResult::PixelMismatch { differences, .. } => differences.iter().map(|d| (d.x, d.y)).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for MismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            CompareResult::Match => write!(f, "pixel outputs of {} match", self.context),
            CompareResult::DimensionMismatch {
                expected_dimensions,
                actual_dimensions,
            } => write!(
                f,
                "pixel mismatch for {}: expected {:?} {}, got {:?} {}",
                self.context,
                expected_dimensions,
                self.expected.format(),
                actual_dimensions,
                self.actual.format()
            ),
            CompareResult::PixelMismatch {
                c0_matched,
                c1_matched,
                c2_matched,
                c3_matched,
                differences,
            } => {
                write!(
                    f,
                    "pixel mismatch for {}: {} of {} pixels differ (channels matched: {c0_matched}/{c1_matched}/{c2_matched}/{c3_matched})",
                    self.context,
                    differences.len(),
                    self.expected.width() * self.expected.height()
                )?;
                for difference in differences.iter().take(MAX_REPORTED_DIFFERENCES) {
                    write!(f, "; ({}, {}) expected {:?} actual {:?}", difference.x, difference.y, difference.expected, difference.actual)?;
                }
                if differences.len() > MAX_REPORTED_DIFFERENCES {
                    write!(f, "; ...")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MismatchError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PixelFormat;

    #[test]
    fn test_identical_buffers_match() {
        let a = PixelBuffer::filled(4, 4, PixelFormat::Rgba8Unorm, [255, 0, 0, 255]);
        let b = a.clone();
        assert_eq!(compare_pixels(&a, &b), CompareResult::Match);
        assert!(MismatchError::check("test", &a, &b).is_ok());
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = PixelBuffer::filled(4, 4, PixelFormat::Rgba8Unorm, [0, 0, 0, 0]);
        let b = PixelBuffer::filled(2, 2, PixelFormat::Rgba8Unorm, [0, 0, 0, 0]);
        assert_eq!(
            compare_pixels(&a, &b),
            CompareResult::DimensionMismatch {
                expected_dimensions: (4, 4),
                actual_dimensions: (2, 2),
            }
        );
    }

    #[test]
    fn test_format_change_is_a_mismatch() {
        let a = PixelBuffer::filled(4, 4, PixelFormat::Rgba8Unorm, [0, 0, 0, 0]);
        let b = PixelBuffer::filled(4, 4, PixelFormat::Bgra8Unorm, [0, 0, 0, 0]);
        assert!(!compare_pixels(&a, &b).is_match());
    }

    #[test]
    fn test_pixel_mismatch_lists_positions() {
        let a = PixelBuffer::filled(4, 4, PixelFormat::Rgba8Unorm, [255, 0, 0, 255]);
        let mut bytes = a.as_bytes().to_vec();
        // Pixel (3, 1) loses its alpha
        bytes[((1 * 4 + 3) * 4 + 3) as usize] = 0;
        let b = PixelBuffer::new(4, 4, PixelFormat::Rgba8Unorm, bytes).unwrap();

        let err = MismatchError::check("probe", &a, &b).unwrap_err();
        assert_eq!(err.differing_positions(), vec![(3, 1)]);
        match &err.result {
            CompareResult::PixelMismatch {
                c0_matched,
                c3_matched,
                differences,
                ..
            } => {
                assert!(*c0_matched);
                assert!(!*c3_matched);
                assert_eq!(differences[0].expected, [255, 0, 0, 255]);
                assert_eq!(differences[0].actual, [255, 0, 0, 0]);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(err.to_string().contains("1 of 16 pixels differ"));
        assert!(err.to_string().contains("(3, 1)"));
    }
}
