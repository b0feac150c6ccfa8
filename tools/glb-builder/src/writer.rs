//! Backing storage for bytes appended through a [`BufferBuilder`](crate::BufferBuilder)

use crate::error::{GltfError, Result};
use std::collections::BTreeMap;

/// Destination for buffer bytes.
///
/// The builder asks the writer for each new buffer's uri and hands it every byte range
/// it lays out. Gaps left by alignment padding must read back as zeros.
pub trait ResourceWriter: Send {
    /// Uri recorded on a buffer created with `buffer_id`; `None` for embedded buffers
    fn buffer_uri(&self, buffer_id: &str) -> Option<String>;

    /// Store `data` at `byte_offset` within buffer `buffer_id`
    fn write(&mut self, buffer_id: &str, byte_offset: usize, data: &[u8]) -> Result<()>;
}

fn write_at(blob: &mut Vec<u8>, byte_offset: usize, data: &[u8]) {
    let end = byte_offset + data.len();
    if blob.len() < end {
        blob.resize(end, 0);
    }
    blob[byte_offset..end].copy_from_slice(data);
}

/// Writer for the single anonymous buffer stored in a GLB binary chunk
#[derive(Debug, Default)]
pub struct GlbBufferWriter {
    buffer_id: Option<String>,
    data: Vec<u8>,
}

impl GlbBufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl ResourceWriter for GlbBufferWriter {
    fn buffer_uri(&self, _buffer_id: &str) -> Option<String> {
        None
    }

    fn write(&mut self, buffer_id: &str, byte_offset: usize, data: &[u8]) -> Result<()> {
        match &self.buffer_id {
            Some(existing) if existing != buffer_id => {
                return Err(GltfError::format(format!(
                    "GLB output holds a single buffer ('{existing}'), cannot write to '{buffer_id}'"
                )));
            }
            Some(_) => {}
            None => self.buffer_id = Some(buffer_id.to_string()),
        }
        write_at(&mut self.data, byte_offset, data);
        Ok(())
    }
}

/// Writer producing one external `.bin` resource per buffer
#[derive(Debug)]
pub struct ExternalBufferWriter {
    base_name: String,
    blobs: BTreeMap<String, Vec<u8>>,
}

impl ExternalBufferWriter {
    /// Buffers are named `<base_name>_<bufferId>.bin`
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            blobs: BTreeMap::new(),
        }
    }

    /// Contents of every buffer written so far, keyed by uri
    pub fn resources(&self) -> impl Iterator<Item = (String, &[u8])> + '_ {
        self.blobs
            .iter()
            .map(|(id, data)| (self.uri_for(id), data.as_slice()))
    }

    fn uri_for(&self, buffer_id: &str) -> String {
        format!("{}_{}.bin", self.base_name, buffer_id)
    }
}

impl ResourceWriter for ExternalBufferWriter {
    fn buffer_uri(&self, buffer_id: &str) -> Option<String> {
        Some(self.uri_for(buffer_id))
    }

    fn write(&mut self, buffer_id: &str, byte_offset: usize, data: &[u8]) -> Result<()> {
        let blob = self.blobs.entry(buffer_id.to_string()).or_default();
        write_at(blob, byte_offset, data);
        Ok(())
    }
}
