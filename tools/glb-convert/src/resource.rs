//! Typed reads of accessor, image and buffer contents

use crate::stream::{FileStreamReader, StreamReader};
use glb_builder::{Accessor, AccessorData, Document, GltfError, Image, Result, read_glb};
use hashbrown::HashMap;
use std::path::Path;

/// Reads binary payloads referenced by a document.
///
/// Buffers with a uri are loaded through the stream reader; the buffer without one is
/// the GLB binary chunk, if any. Loaded buffers are cached by id.
pub struct ResourceReader {
    streams: Box<dyn StreamReader>,
    glb_bin: Option<Vec<u8>>,
    buffers: HashMap<String, Vec<u8>>,
}

impl ResourceReader {
    pub fn new(streams: impl StreamReader + 'static) -> Self {
        Self {
            streams: Box::new(streams),
            glb_bin: None,
            buffers: HashMap::new(),
        }
    }

    /// Use `bin` as the contents of the buffer that has no uri
    pub fn with_glb_bin(mut self, bin: Vec<u8>) -> Self {
        self.glb_bin = Some(bin);
        self
    }

    /// Read all bytes of an external resource
    pub fn read_uri(&self, uri: &str) -> Result<Vec<u8>> {
        self.streams.read_resource(uri)
    }

    /// Whole contents of buffer `buffer_id`
    pub fn buffer_bytes(&mut self, document: &Document, buffer_id: &str) -> Result<&[u8]> {
        if !self.buffers.contains_key(buffer_id) {
            let buffer = document.buffers.get(buffer_id).ok_or_else(|| {
                GltfError::format(format!("missing buffer '{buffer_id}'"))
            })?;
            let data = match (&buffer.uri, &self.glb_bin) {
                (Some(uri), _) => self.streams.read_resource(uri)?,
                (None, Some(bin)) => bin.clone(),
                (None, None) => {
                    return Err(GltfError::format(format!(
                        "buffer '{buffer_id}' has no uri and there is no GLB binary chunk"
                    )));
                }
            };
            if data.len() < buffer.byte_length {
                return Err(GltfError::format(format!(
                    "buffer '{}' declares {} bytes but its resource holds {}",
                    buffer_id,
                    buffer.byte_length,
                    data.len()
                )));
            }
            self.buffers.insert(buffer_id.to_string(), data);
        }
        self.buffers
            .get(buffer_id)
            .map(Vec::as_slice)
            .ok_or_else(|| GltfError::format(format!("missing buffer '{buffer_id}'")))
    }

    /// Bytes covered by buffer view `view_id`
    pub fn view_bytes(&mut self, document: &Document, view_id: &str) -> Result<Vec<u8>> {
        let view = document
            .buffer_views
            .get(view_id)
            .ok_or_else(|| GltfError::format(format!("missing bufferView '{view_id}'")))?;
        let data = self.buffer_bytes(document, &view.buffer)?;
        view.byte_offset
            .checked_add(view.byte_length)
            .and_then(|end| data.get(view.byte_offset..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                GltfError::format(format!(
                    "bufferView '{}' ({} bytes at {}) exceeds its buffer",
                    view.id, view.byte_length, view.byte_offset
                ))
            })
    }

    /// Decode an accessor's elements, applying sparse substitutions
    pub fn read_accessor(&mut self, document: &Document, accessor: &Accessor) -> Result<AccessorData> {
        let components = accessor.accessor_type.component_count();

        let mut data = match document.accessor_view(accessor)? {
            Some(view) => {
                let stride = view.byte_stride;
                let bytes = self.view_bytes(document, &view.id)?;
                let start = accessor.byte_offset.min(bytes.len());
                AccessorData::read(
                    accessor.component_type,
                    &bytes[start..],
                    accessor.count,
                    components,
                    stride,
                )?
            }
            None => {
                let len = accessor.count.checked_mul(components).ok_or_else(|| {
                    GltfError::format(format!("accessor '{}' count overflows", accessor.id))
                })?;
                AccessorData::zeroed(accessor.component_type, len)
            }
        };

        if let Some(sparse) = &accessor.sparse {
            let index_bytes = self.view_bytes(document, &sparse.indices_buffer_view)?;
            let indices = AccessorData::read(
                sparse.indices_component_type,
                index_bytes.get(sparse.indices_byte_offset..).unwrap_or_default(),
                sparse.count,
                1,
                None,
            )?;
            let value_bytes = self.view_bytes(document, &sparse.values_buffer_view)?;
            let values = AccessorData::read(
                accessor.component_type,
                value_bytes.get(sparse.values_byte_offset..).unwrap_or_default(),
                sparse.count,
                components,
                None,
            )?;

            for i in 0..sparse.count {
                let target = indices.get_f64(i).unwrap_or_default() as usize;
                if target >= accessor.count {
                    return Err(GltfError::format(format!(
                        "sparse index {} of accessor '{}' exceeds count {}",
                        target, accessor.id, accessor.count
                    )));
                }
                data.copy_element_from(target, &values, i, components)?;
            }
        }

        Ok(data)
    }

    /// Raw bytes of an image, from its uri or its buffer view
    pub fn read_image(&mut self, document: &Document, image: &Image) -> Result<Vec<u8>> {
        match (&image.uri, &image.buffer_view) {
            (Some(uri), _) if !uri.is_empty() => self.read_uri(uri),
            (_, Some(view)) => self.view_bytes(document, view),
            _ => Err(GltfError::format(format!(
                "image '{}' has neither a uri nor a bufferView",
                image.id
            ))),
        }
    }
}

/// Load a `.gltf` or `.glb` file with a reader for the resources it references
pub fn open_document(path: &Path) -> Result<(Document, ResourceReader)> {
    let bytes = std::fs::read(path)?;
    let streams = FileStreamReader::beside(path);
    let is_glb = bytes.starts_with(b"glTF")
        || path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("glb"));

    if is_glb {
        let (json, bin) = read_glb(&bytes)?;
        let document = Document::from_json(&json)?;
        Ok((document, ResourceReader::new(streams).with_glb_bin(bin)))
    } else {
        let document = Document::from_json(&bytes)?;
        Ok((document, ResourceReader::new(streams)))
    }
}
