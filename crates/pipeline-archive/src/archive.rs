//! Binary pipeline archives
//!
//! A [`BinaryArchive`] maps pipeline descriptors to backend-compiled functions.
//! The envelope is defined here; entry payloads are opaque backend bytes.
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! magic    "PLARCHV\0"
//! version  u32
//! backend  u16 len + utf-8
//! label    u16 len + utf-8       free-form, not checksummed
//! count    u32
//! entries  count x { vertex: u16 len + utf-8, fragment: u16 len + utf-8,
//!                    format: u8, payload: u32 len + bytes, checksum: u64 }
//! ```

use crate::backend::CompiledFunctions;
use crate::descriptor::{PipelineDescriptor, PixelFormat};
use crate::error::{ArchiveError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

/// File magic identifying a pipeline archive
pub const ARCHIVE_MAGIC: &[u8; 8] = b"PLARCHV\0";
/// Current archive format version
pub const ARCHIVE_VERSION: u32 = 1;
/// File extension used for content-addressed archive names
pub const ARCHIVE_EXTENSION: &str = "plar";

/// Content-addressed file name for the archive of `descriptor`
pub fn archive_file_name(descriptor: &PipelineDescriptor) -> String {
    format!("pipeline-{}.{ARCHIVE_EXTENSION}", descriptor.digest_hex())
}

/// Compiled functions for one descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    descriptor: PipelineDescriptor,
    functions: CompiledFunctions,
}

impl ArchiveEntry {
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    pub fn functions(&self) -> &CompiledFunctions {
        &self.functions
    }

    pub fn payload(&self) -> &[u8] {
        &self.functions.payload
    }

    /// xxh3-64 of the payload, as stored on disk
    pub fn checksum(&self) -> u64 {
        xxh3_64(&self.functions.payload)
    }
}

/// In-memory pipeline archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArchive {
    backend: String,
    label: String,
    /// Keyed by descriptor digest so serialization order is stable
    entries: BTreeMap<u128, ArchiveEntry>,
}

/// JSON-friendly summary of an archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifest {
    pub version: u32,
    pub backend: String,
    pub label: String,
    pub entries: Vec<ManifestEntry>,
}

/// One entry of an [`ArchiveManifest`]
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub descriptor: PipelineDescriptor,
    pub digest: String,
    pub payload_bytes: usize,
    pub checksum: String,
}

impl BinaryArchive {
    /// Creates an empty archive for the named backend
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            label: String::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Sets the free-form label stored in the header
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records compiled functions for `descriptor`, returning any replaced entry
    pub fn insert(&mut self, descriptor: PipelineDescriptor, functions: CompiledFunctions) -> Option<ArchiveEntry> {
        self.entries.insert(descriptor.digest(), ArchiveEntry { descriptor, functions })
    }

    /// Entry whose descriptor matches `descriptor` exactly
    pub fn entry(&self, descriptor: &PipelineDescriptor) -> Option<&ArchiveEntry> {
        // Digest collisions must not alias two descriptors
        self.entries.get(&descriptor.digest()).filter(|entry| entry.descriptor == *descriptor)
    }

    /// Like [`BinaryArchive::entry`], but a miss is an [`ArchiveError::ArchiveMiss`] naming `path`
    pub fn lookup(&self, descriptor: &PipelineDescriptor, path: &Path) -> Result<&ArchiveEntry> {
        self.entry(descriptor).ok_or_else(|| ArchiveError::ArchiveMiss {
            descriptor: descriptor.to_string(),
            path: path.to_path_buf(),
            backend: self.backend.clone(),
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.values()
    }

    pub fn manifest(&self) -> ArchiveManifest {
        ArchiveManifest {
            version: ARCHIVE_VERSION,
            backend: self.backend.clone(),
            label: self.label.clone(),
            entries: self
                .entries
                .values()
                .map(|entry| ManifestEntry {
                    descriptor: entry.descriptor.clone(),
                    digest: entry.descriptor.digest_hex(),
                    payload_bytes: entry.payload().len(),
                    checksum: format!("{:016x}", entry.checksum()),
                })
                .collect(),
        }
    }

    /// Encodes the archive into its on-disk representation
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(ARCHIVE_MAGIC);
        buf.put_u32_le(ARCHIVE_VERSION);
        put_short_str(&mut buf, &self.backend);
        put_short_str(&mut buf, &self.label);
        buf.put_u32_le(self.entries.len() as u32);

        for entry in self.entries.values() {
            put_short_str(&mut buf, entry.descriptor.vertex_entry_point());
            put_short_str(&mut buf, entry.descriptor.fragment_entry_point());
            buf.put_u8(entry.descriptor.color_attachment_format().tag());
            buf.put_u32_le(entry.payload().len() as u32);
            buf.put_slice(entry.payload());
            buf.put_u64_le(entry.checksum());
        }

        buf.freeze()
    }

    /// Decodes an archive; `path` is only used for error context
    pub fn decode(data: &[u8], path: &Path) -> Result<Self> {
        let mut reader = Reader { buf: data, path };

        let magic = reader.take(ARCHIVE_MAGIC.len(), "magic")?;
        if magic[..] != ARCHIVE_MAGIC[..] {
            return Err(ArchiveError::invalid_data(path, "not a pipeline archive (bad magic)"));
        }
        let version = reader.u32("version")?;
        if version != ARCHIVE_VERSION {
            return Err(ArchiveError::invalid_data(path, format!("unsupported archive version {version}")));
        }
        let backend = reader.short_str("backend")?;
        let label_bytes = reader.short_bytes("label")?;
        let label = String::from_utf8_lossy(&label_bytes).into_owned();
        let count = reader.u32("entry count")?;

        let mut entries = BTreeMap::new();
        for index in 0..count {
            let vertex = reader.short_str("vertex entry point")?;
            let fragment = reader.short_str("fragment entry point")?;
            let tag = reader.u8("attachment format")?;
            let format = PixelFormat::from_tag(tag).ok_or_else(|| ArchiveError::invalid_data(path, format!("entry {index}: unknown attachment format tag {tag}")))?;
            let payload_len = reader.u32("payload length")? as usize;
            let payload = reader.take(payload_len, "payload")?;
            let checksum = reader.u64("checksum")?;

            let descriptor = PipelineDescriptor::build(vertex, fragment, format).map_err(|e| ArchiveError::invalid_data(path, format!("entry {index}: {e}")))?;
            if xxh3_64(&payload) != checksum {
                return Err(ArchiveError::invalid_data(path, format!("entry {index} ({descriptor}) failed its payload checksum")));
            }

            let digest = descriptor.digest();
            let entry = ArchiveEntry {
                descriptor,
                functions: CompiledFunctions::new(payload),
            };
            if let Some(previous) = entries.insert(digest, entry) {
                return Err(ArchiveError::invalid_data(path, format!("duplicate entry for {}", previous.descriptor)));
            }
        }

        if reader.buf.has_remaining() {
            return Err(ArchiveError::invalid_data(path, format!("{} trailing bytes after last entry", reader.buf.remaining())));
        }

        Ok(Self { backend, label, entries })
    }

    /// Writes the archive to `path`, replacing any previous file
    ///
    /// The bytes go to a temporary file in the same directory which is then
    /// renamed over `path`, so readers never observe a partially written archive.
    pub fn serialize_to(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let data = self.encode();

        let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(|e| ArchiveError::io(path, e))?;
        file.write_all(&data).map_err(|e| ArchiveError::io(path, e))?;
        file.as_file().sync_all().map_err(|e| ArchiveError::io(path, e))?;
        file.persist(path).map_err(|e| ArchiveError::io(path, e.error))?;

        tracing::debug!(path = %path.display(), bytes = data.len(), entries = self.entries.len(), "serialized pipeline archive");
        Ok(())
    }

    /// Reads and decodes the archive at `path`
    pub fn deserialize_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| ArchiveError::io(path, e))?;
        let archive = Self::decode(&data, path)?;
        tracing::debug!(path = %path.display(), bytes = data.len(), entries = archive.entries.len(), "deserialized pipeline archive");
        Ok(archive)
    }
}

fn put_short_str(buf: &mut BytesMut, value: &str) {
    // Descriptor names are bounded at build time; longer labels are truncated on a char boundary
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16_le(end as u16);
    buf.put_slice(&value.as_bytes()[..end]);
}

/// Bounds-checked cursor over archive bytes
struct Reader<'a> {
    buf: &'a [u8],
    path: &'a Path,
}

impl Reader<'_> {
    fn ensure(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(ArchiveError::io(
                self.path,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("archive truncated while reading {what}")),
            ));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn take(&mut self, len: usize, what: &str) -> Result<Bytes> {
        self.ensure(len, what)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn short_bytes(&mut self, what: &str) -> Result<Bytes> {
        self.ensure(2, what)?;
        let len = self.buf.get_u16_le() as usize;
        self.take(len, what)
    }

    fn short_str(&mut self, what: &str) -> Result<String> {
        let bytes = self.short_bytes(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ArchiveError::invalid_data(self.path, format!("{what} is not valid UTF-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn descriptor(format: PixelFormat) -> PipelineDescriptor {
        PipelineDescriptor::build("main_vertex", "main_fragment", format).unwrap()
    }

    fn sample_archive() -> BinaryArchive {
        let mut archive = BinaryArchive::new("test").with_label("unit test");
        archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![1u8, 2, 3, 4]));
        archive.insert(descriptor(PixelFormat::Bgra8Unorm), CompiledFunctions::new(vec![9u8; 32]));
        archive
    }

    #[test]
    fn test_encode_decode_preserves_entries() {
        let archive = sample_archive();
        let decoded = BinaryArchive::decode(&archive.encode(), Path::new("mem")).unwrap();

        assert_eq!(decoded, archive);
        assert_eq!(decoded.backend(), "test");
        assert_eq!(decoded.label(), "unit test");
        assert_eq!(decoded.entry(&descriptor(PixelFormat::Rgba8Unorm)).unwrap().payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_lookup_miss_names_descriptor_and_path() {
        let mut archive = BinaryArchive::new("test");
        archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![0u8]));

        let err = archive.lookup(&descriptor(PixelFormat::Bgra8Unorm), Path::new("a.plar")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveMiss);
        let message = err.to_string();
        assert!(message.contains("a.plar"));
        assert!(message.contains("format=bgra8"));
    }

    #[test]
    fn test_insert_replaces_same_descriptor() {
        let mut archive = BinaryArchive::new("test");
        assert!(archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![1u8])).is_none());
        assert!(archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![2u8])).is_some());
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_truncation() {
        let encoded = sample_archive().encode();

        let mut bad_magic = encoded.to_vec();
        bad_magic[0] = b'X';
        assert_eq!(BinaryArchive::decode(&bad_magic, Path::new("mem")).unwrap_err().kind(), ErrorKind::Io);

        let truncated = &encoded[..encoded.len() - 3];
        match BinaryArchive::decode(truncated, Path::new("mem")).unwrap_err() {
            ArchiveError::Io { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error {other:?}"),
        }

        let mut trailing = encoded.to_vec();
        trailing.push(0);
        assert!(BinaryArchive::decode(&trailing, Path::new("mem")).is_err());
    }

    #[test]
    fn test_decode_detects_payload_corruption() {
        let mut archive = BinaryArchive::new("test");
        archive.insert(descriptor(PixelFormat::Rgba8Unorm), CompiledFunctions::new(vec![7u8; 16]));
        let mut encoded = archive.encode().to_vec();

        // Payload sits right before the trailing 8-byte checksum
        let index = encoded.len() - 8 - 1;
        encoded[index] ^= 0xff;

        let err = BinaryArchive::decode(&encoded, Path::new("mem")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_label_corruption_is_tolerated() {
        let archive = sample_archive();
        let mut encoded = archive.encode().to_vec();

        // magic + version + backend ("test") + label length
        let label_start = 8 + 4 + 2 + 4 + 2;
        encoded[label_start] = 0xff;

        let decoded = BinaryArchive::decode(&encoded, Path::new("mem")).unwrap();
        assert_ne!(decoded.label(), archive.label());
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_serialize_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(archive_file_name(&descriptor(PixelFormat::Rgba8Unorm)));

        let archive = sample_archive();
        archive.serialize_to(&path).unwrap();
        assert_eq!(BinaryArchive::deserialize_from(&path).unwrap(), archive);

        // Overwrites rather than merges
        BinaryArchive::new("test").serialize_to(&path).unwrap();
        assert!(BinaryArchive::deserialize_from(&path).unwrap().is_empty());
    }

    #[test]
    fn test_manifest_lists_entries() {
        let manifest = sample_archive().manifest();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.label, "unit test");
        assert!(manifest.entries.iter().all(|entry| entry.digest.len() == 32));

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["backend"], "test");
    }

    #[test]
    fn test_archive_file_name_is_content_addressed() {
        let rgba = archive_file_name(&descriptor(PixelFormat::Rgba8Unorm));
        let bgra = archive_file_name(&descriptor(PixelFormat::Bgra8Unorm));
        assert_ne!(rgba, bgra);
        assert!(rgba.starts_with("pipeline-"));
        assert!(rgba.ends_with(".plar"));
    }
}
