//! Resource stream providers
//!
//! Two operations are all the converters need from the outside world: read every byte
//! of a named resource, and read a byte range at an absolute container offset.

use base64::Engine;
use glb_builder::{GltfError, GlbReader, Result};
use hashbrown::HashMap;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

/// Reads whole resources addressed by uri
pub trait StreamReader: Send {
    fn read_resource(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Writes whole resources addressed by uri
pub trait StreamWriter: Send {
    fn write_resource(&mut self, uri: &str, data: &[u8]) -> Result<()>;
}

/// Random access into a container file
pub trait ContainerSource {
    /// Read `length` bytes starting at absolute `offset`
    fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>>;
}

/// Decode a `data:` uri, returning its declared media type and payload
pub fn decode_data_uri(uri: &str) -> Result<Option<(Option<String>, Vec<u8>)>> {
    let Some(rest) = uri.strip_prefix("data:") else {
        return Ok(None);
    };
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| GltfError::format("data uri has no ',' separator"))?;

    let (media, is_base64) = match header.strip_suffix(";base64") {
        Some(media) => (media, true),
        None => (header, false),
    };
    let media = (!media.is_empty()).then(|| media.to_string());

    let data = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| GltfError::format(format!("invalid base64 data uri: {e}")))?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok(Some((media, data)))
}

/// Resolves uris relative to a base directory; `data:` uris are decoded in place
#[derive(Debug, Clone)]
pub struct FileStreamReader {
    base_dir: PathBuf,
}

impl FileStreamReader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Reader for resources next to `manifest`
    pub fn beside(manifest: &Path) -> Self {
        Self::new(manifest.parent().unwrap_or(Path::new("")))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl StreamReader for FileStreamReader {
    fn read_resource(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some((_, data)) = decode_data_uri(uri)? {
            return Ok(data);
        }
        let path = self.base_dir.join(uri);
        tracing::debug!("Reading resource {}", path.display());
        Ok(std::fs::read(&path)?)
    }
}

/// In-memory resources keyed by uri
#[derive(Debug, Clone, Default)]
pub struct MemoryStreamReader {
    resources: HashMap<String, Vec<u8>>,
}

impl MemoryStreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, data: Vec<u8>) {
        self.resources.insert(uri.into(), data);
    }

    pub fn with(mut self, uri: impl Into<String>, data: Vec<u8>) -> Self {
        self.insert(uri, data);
        self
    }
}

impl StreamReader for MemoryStreamReader {
    fn read_resource(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some((_, data)) = decode_data_uri(uri)? {
            return Ok(data);
        }
        self.resources.get(uri).cloned().ok_or_else(|| {
            GltfError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("resource '{uri}' not found"),
            ))
        })
    }
}

/// Writes resources into a directory, creating it on first use
#[derive(Debug, Clone)]
pub struct FileStreamWriter {
    dir: PathBuf,
}

impl FileStreamWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StreamWriter for FileStreamWriter {
    fn write_resource(&mut self, uri: &str, data: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(uri);
        tracing::debug!("Writing {} ({} bytes)", path.display(), data.len());
        std::fs::write(&path, data)?;
        Ok(())
    }
}

/// Collects written resources in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStreamWriter {
    pub resources: HashMap<String, Vec<u8>>,
}

impl MemoryStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&[u8]> {
        self.resources.get(uri).map(Vec::as_slice)
    }
}

impl StreamWriter for MemoryStreamWriter {
    fn write_resource(&mut self, uri: &str, data: &[u8]) -> Result<()> {
        self.resources.insert(uri.to_string(), data.to_vec());
        Ok(())
    }
}

impl<R: Read + Seek> ContainerSource for GlbReader<R> {
    fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        GlbReader::read_at(self, offset, length)
    }
}

impl ContainerSource for [u8] {
    fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = usize::try_from(offset).ok();
        let end = start
            .zip(usize::try_from(length).ok())
            .and_then(|(s, l)| s.checked_add(l));
        match (start, end) {
            (Some(start), Some(end)) if end <= self.len() => Ok(self[start..end].to_vec()),
            _ => Err(GltfError::Container(format!(
                "{} bytes at {} are outside the {}-byte container",
                length,
                offset,
                self.len()
            ))),
        }
    }
}

impl ContainerSource for Vec<u8> {
    fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.as_mut_slice().read_at(offset, length)
    }
}
