//! Render pipeline descriptors
//!
//! A [`PipelineDescriptor`] is the canonical, hashable description of a render
//! pipeline that is independent of any compiled bytes. Archives are keyed by the
//! descriptor's content digest, so two descriptors address the same archive entry
//! exactly when their entry points and attachment format are identical.

use crate::error::{ArchiveError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Color attachment formats supported by the render probe
///
/// All formats are 8 bits per channel, 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    #[serde(rename = "rgba8")]
    Rgba8Unorm,
    #[serde(rename = "bgra8")]
    Bgra8Unorm,
    #[serde(rename = "rgba8-srgb")]
    Rgba8UnormSrgb,
    #[serde(rename = "bgra8-srgb")]
    Bgra8UnormSrgb,
}

impl PixelFormat {
    /// Bytes per pixel for every supported format
    pub const BYTES_PER_PIXEL: u32 = 4;

    /// Stable tag used by the archive codec
    pub fn tag(self) -> u8 {
        match self {
            Self::Rgba8Unorm => 1,
            Self::Bgra8Unorm => 2,
            Self::Rgba8UnormSrgb => 3,
            Self::Bgra8UnormSrgb => 4,
        }
    }

    /// Inverse of [`PixelFormat::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Rgba8Unorm),
            2 => Some(Self::Bgra8Unorm),
            3 => Some(Self::Rgba8UnormSrgb),
            4 => Some(Self::Bgra8UnormSrgb),
            _ => None,
        }
    }

    /// Whether bytes are stored blue-first
    pub fn is_bgra(self) -> bool {
        matches!(self, Self::Bgra8Unorm | Self::Bgra8UnormSrgb)
    }

    /// Short lowercase name, also accepted by [`FromStr`]
    pub fn name(self) -> &'static str {
        match self {
            Self::Rgba8Unorm => "rgba8",
            Self::Bgra8Unorm => "bgra8",
            Self::Rgba8UnormSrgb => "rgba8-srgb",
            Self::Bgra8UnormSrgb => "bgra8-srgb",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgba8" | "rgba8unorm" => Ok(Self::Rgba8Unorm),
            "bgra8" | "bgra8unorm" => Ok(Self::Bgra8Unorm),
            "rgba8-srgb" | "rgba8unormsrgb" => Ok(Self::Rgba8UnormSrgb),
            "bgra8-srgb" | "bgra8unormsrgb" => Ok(Self::Bgra8UnormSrgb),
            _ => Err(ArchiveError::InvalidDescriptor(format!(
                "unknown pixel format '{s}' (expected rgba8, bgra8, rgba8-srgb or bgra8-srgb)"
            ))),
        }
    }
}

/// Canonical description of a vertex + fragment render pipeline
///
/// Immutable once built; use [`PipelineDescriptor::build`] to construct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PipelineDescriptor {
    vertex_entry_point: String,
    fragment_entry_point: String,
    color_attachment_format: PixelFormat,
}

impl PipelineDescriptor {
    /// Builds a descriptor, rejecting empty entry point names
    pub fn build(vertex_entry: impl Into<String>, fragment_entry: impl Into<String>, attachment_format: PixelFormat) -> Result<Self> {
        let vertex_entry_point = vertex_entry.into();
        let fragment_entry_point = fragment_entry.into();

        if vertex_entry_point.trim().is_empty() {
            return Err(ArchiveError::InvalidDescriptor("vertex entry point name is empty".to_string()));
        }
        if fragment_entry_point.trim().is_empty() {
            return Err(ArchiveError::InvalidDescriptor("fragment entry point name is empty".to_string()));
        }
        // Lengths are stored as u16 in the archive codec
        for name in [&vertex_entry_point, &fragment_entry_point] {
            if name.len() > u16::MAX as usize {
                return Err(ArchiveError::InvalidDescriptor(format!("entry point name is {} bytes long", name.len())));
            }
        }

        Ok(Self {
            vertex_entry_point,
            fragment_entry_point,
            color_attachment_format: attachment_format,
        })
    }

    pub fn vertex_entry_point(&self) -> &str {
        &self.vertex_entry_point
    }

    pub fn fragment_entry_point(&self) -> &str {
        &self.fragment_entry_point
    }

    pub fn color_attachment_format(&self) -> PixelFormat {
        self.color_attachment_format
    }

    /// Canonical byte encoding used for content addressing
    ///
    /// Each name is length-prefixed so that ("ab", "c") and ("a", "bc") differ.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.vertex_entry_point.len() + self.fragment_entry_point.len() + 9);
        for name in [&self.vertex_entry_point, &self.fragment_entry_point] {
            bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
            bytes.extend_from_slice(name.as_bytes());
        }
        bytes.push(self.color_attachment_format.tag());
        bytes
    }

    /// xxh3-128 digest of [`PipelineDescriptor::canonical_bytes`]
    pub fn digest(&self) -> u128 {
        xxh3_128(&self.canonical_bytes())
    }

    /// Lowercase hex form of [`PipelineDescriptor::digest`]
    pub fn digest_hex(&self) -> String {
        format!("{:032x}", self.digest())
    }
}

impl fmt::Display for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline(vertex='{}', fragment='{}', format={})",
            self.vertex_entry_point, self.fragment_entry_point, self.color_attachment_format
        )
    }
}
