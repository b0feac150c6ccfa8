//! glTF JSON manifest parsing and serialization
//!
//! The manifest stores references as array indices. On parse every record gets the
//! decimal string of its index as id; on serialize every id reference is resolved back to
//! the position of the referenced record.

use crate::document::{
    Accessor, AccessorType, Buffer, BufferView, BufferViewTarget, Collection, ComponentType,
    Document, Element, Extensions, Image, Sparse, default_asset,
};
use crate::error::{GltfError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extensions_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extensions_required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    accessors: Vec<RawAccessor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    animations: Vec<Value>,
    #[serde(default = "default_asset")]
    asset: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    buffers: Vec<RawBuffer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    buffer_views: Vec<RawBufferView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cameras: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<RawImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    materials: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    meshes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    samplers: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scene: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scenes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    skins: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    textures: Vec<Value>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extras: Option<Value>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBuffer {
    byte_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extras: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBufferView {
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    byte_stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extras: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccessor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    count: usize,
    component_type: u32,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default, skip_serializing_if = "is_false")]
    normalized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    min: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    max: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sparse: Option<RawSparse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extras: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSparse {
    count: usize,
    indices: RawSparseIndices,
    values: RawSparseValues,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSparseIndices {
    buffer_view: usize,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSparseValues {
    buffer_view: usize,
    #[serde(default)]
    byte_offset: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buffer_view: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extras: Option<Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn index_id(index: usize, len: usize, what: &str) -> Result<String> {
    if index < len {
        Ok(index.to_string())
    } else {
        Err(GltfError::format(format!(
            "{what} index {index} out of range ({len} available)"
        )))
    }
}

fn resolve<T: Element>(collection: &Collection<T>, id: &str, what: &str) -> Result<usize> {
    collection
        .index_of(id)
        .ok_or_else(|| GltfError::format(format!("dangling {what} reference '{id}'")))
}

impl Document {
    /// Parse a glTF JSON manifest
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawRoot = serde_json::from_slice(bytes)?;

        let buffer_count = raw.buffers.len();
        let view_count = raw.buffer_views.len();

        let mut document = Document {
            asset: raw.asset,
            scene: raw.scene,
            meshes: raw.meshes,
            nodes: raw.nodes,
            materials: raw.materials,
            textures: raw.textures,
            samplers: raw.samplers,
            scenes: raw.scenes,
            skins: raw.skins,
            animations: raw.animations,
            cameras: raw.cameras,
            extensions_used: raw.extensions_used,
            extensions_required: raw.extensions_required,
            extensions: raw.extensions,
            extras: raw.extras,
            other: raw.other,
            ..Document::default()
        };

        for (index, buffer) in raw.buffers.into_iter().enumerate() {
            document.buffers.append(Buffer {
                id: index.to_string(),
                byte_length: buffer.byte_length,
                uri: buffer.uri,
                name: buffer.name,
                extensions: buffer.extensions,
                extras: buffer.extras,
            })?;
        }

        for (index, view) in raw.buffer_views.into_iter().enumerate() {
            document.buffer_views.append(BufferView {
                id: index.to_string(),
                buffer: index_id(view.buffer, buffer_count, "buffer")?,
                byte_offset: view.byte_offset,
                byte_length: view.byte_length,
                byte_stride: view.byte_stride,
                target: view.target.map(BufferViewTarget::from_gl).transpose()?,
                name: view.name,
                extensions: view.extensions,
                extras: view.extras,
            })?;
        }

        for (index, accessor) in raw.accessors.into_iter().enumerate() {
            let sparse = match accessor.sparse {
                Some(sparse) => Some(Sparse {
                    count: sparse.count,
                    indices_buffer_view: index_id(
                        sparse.indices.buffer_view,
                        view_count,
                        "bufferView",
                    )?,
                    indices_byte_offset: sparse.indices.byte_offset,
                    indices_component_type: ComponentType::from_gl(
                        sparse.indices.component_type,
                    )?,
                    values_buffer_view: index_id(
                        sparse.values.buffer_view,
                        view_count,
                        "bufferView",
                    )?,
                    values_byte_offset: sparse.values.byte_offset,
                }),
                None => None,
            };

            document.accessors.append(Accessor {
                id: index.to_string(),
                buffer_view: accessor
                    .buffer_view
                    .map(|view| index_id(view, view_count, "bufferView"))
                    .transpose()?,
                byte_offset: accessor.byte_offset,
                count: accessor.count,
                component_type: ComponentType::from_gl(accessor.component_type)?,
                accessor_type: AccessorType::from_name(&accessor.type_)?,
                normalized: accessor.normalized,
                min: accessor.min,
                max: accessor.max,
                sparse,
                name: accessor.name,
                extensions: accessor.extensions,
                extras: accessor.extras,
            })?;
        }

        for (index, image) in raw.images.into_iter().enumerate() {
            document.images.append(Image {
                id: index.to_string(),
                uri: image.uri,
                buffer_view: image
                    .buffer_view
                    .map(|view| index_id(view, view_count, "bufferView"))
                    .transpose()?,
                mime_type: image.mime_type,
                name: image.name,
                extensions: image.extensions,
                extras: image.extras,
            })?;
        }

        Ok(document)
    }

    /// Serialize the document to a `serde_json::Value`, resolving ids to indices
    pub fn to_json_value(&self) -> Result<Value> {
        let buffers = self
            .buffers
            .iter()
            .map(|buffer| RawBuffer {
                byte_length: buffer.byte_length,
                uri: buffer.uri.clone(),
                name: buffer.name.clone(),
                extensions: buffer.extensions.clone(),
                extras: buffer.extras.clone(),
            })
            .collect();

        let buffer_views = self
            .buffer_views
            .iter()
            .map(|view| {
                Ok(RawBufferView {
                    buffer: resolve(&self.buffers, &view.buffer, "buffer")?,
                    byte_offset: view.byte_offset,
                    byte_length: view.byte_length,
                    byte_stride: view.byte_stride,
                    target: view.target.map(BufferViewTarget::gl_code),
                    name: view.name.clone(),
                    extensions: view.extensions.clone(),
                    extras: view.extras.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let accessors = self
            .accessors
            .iter()
            .map(|accessor| {
                let sparse = match &accessor.sparse {
                    Some(sparse) => Some(RawSparse {
                        count: sparse.count,
                        indices: RawSparseIndices {
                            buffer_view: resolve(
                                &self.buffer_views,
                                &sparse.indices_buffer_view,
                                "bufferView",
                            )?,
                            byte_offset: sparse.indices_byte_offset,
                            component_type: sparse.indices_component_type.gl_code(),
                        },
                        values: RawSparseValues {
                            buffer_view: resolve(
                                &self.buffer_views,
                                &sparse.values_buffer_view,
                                "bufferView",
                            )?,
                            byte_offset: sparse.values_byte_offset,
                        },
                    }),
                    None => None,
                };

                Ok(RawAccessor {
                    buffer_view: accessor
                        .buffer_view
                        .as_deref()
                        .map(|id| resolve(&self.buffer_views, id, "bufferView"))
                        .transpose()?,
                    byte_offset: accessor.byte_offset,
                    count: accessor.count,
                    component_type: accessor.component_type.gl_code(),
                    type_: accessor.accessor_type.name().to_string(),
                    normalized: accessor.normalized,
                    min: accessor.min.clone(),
                    max: accessor.max.clone(),
                    sparse,
                    name: accessor.name.clone(),
                    extensions: accessor.extensions.clone(),
                    extras: accessor.extras.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let images = self
            .images
            .iter()
            .map(|image| {
                Ok(RawImage {
                    uri: image.uri.clone(),
                    buffer_view: image
                        .buffer_view
                        .as_deref()
                        .map(|id| resolve(&self.buffer_views, id, "bufferView"))
                        .transpose()?,
                    mime_type: image.mime_type.clone(),
                    name: image.name.clone(),
                    extensions: image.extensions.clone(),
                    extras: image.extras.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let raw = RawRoot {
            extensions_used: self.extensions_used.clone(),
            extensions_required: self.extensions_required.clone(),
            accessors,
            animations: self.animations.clone(),
            asset: self.asset.clone(),
            buffers,
            buffer_views,
            cameras: self.cameras.clone(),
            images,
            materials: self.materials.clone(),
            meshes: self.meshes.clone(),
            nodes: self.nodes.clone(),
            samplers: self.samplers.clone(),
            scene: self.scene,
            scenes: self.scenes.clone(),
            skins: self.skins.clone(),
            textures: self.textures.clone(),
            extensions: self.extensions.clone(),
            extras: self.extras.clone(),
            other: self.other.clone(),
        };

        Ok(serde_json::to_value(raw)?)
    }

    /// Serialize the document to a JSON manifest string
    pub fn to_json_string(&self, pretty: bool) -> Result<String> {
        let value = self.to_json_value()?;
        let json = if pretty {
            serde_json::to_string_pretty(&value)?
        } else {
            serde_json::to_string(&value)?
        };
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "asset": { "version": "2.0", "generator": "test" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] }],
        "buffers": [{ "byteLength": 44, "uri": "tri.bin" }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 6, "target": 34963,
              "extras": { "note": "indices" } }
        ],
        "accessors": [
            { "bufferView": 0, "count": 3, "componentType": 5126, "type": "VEC3",
              "min": [0, 0, 0], "max": [1, 1, 0] },
            { "bufferView": 1, "count": 3, "componentType": 5123, "type": "SCALAR" }
        ],
        "images": [{ "uri": "albedo.png" }],
        "extensionsUsed": ["EXT_custom"],
        "extensions": { "EXT_custom": { "flag": true } },
        "customTopLevel": 7
    }"#;

    #[test]
    fn test_parse_assigns_index_ids() {
        let doc = Document::from_json(MANIFEST.as_bytes()).unwrap();
        assert_eq!(doc.buffers.len(), 1);
        assert_eq!(doc.buffer_views.len(), 2);
        assert_eq!(doc.accessors.elements()[1].id, "1");
        assert_eq!(doc.accessors.elements()[1].buffer_view.as_deref(), Some("1"));
        assert_eq!(
            doc.buffer_views.elements()[1].target,
            Some(BufferViewTarget::Index)
        );
        assert_eq!(doc.accessors.elements()[0].min, vec![0.0, 0.0, 0.0]);
        assert_eq!(doc.meshes.len(), 1);
        assert_eq!(doc.other.get("customTopLevel"), Some(&Value::from(7)));
    }

    #[test]
    fn test_serialize_preserves_members() {
        let doc = Document::from_json(MANIFEST.as_bytes()).unwrap();
        let json = doc.to_json_value().unwrap();

        assert_eq!(json["bufferViews"][1]["extras"]["note"], "indices");
        assert_eq!(json["accessors"][1]["bufferView"], 1);
        assert_eq!(json["accessors"][0]["type"], "VEC3");
        assert_eq!(json["extensions"]["EXT_custom"]["flag"], true);
        assert_eq!(json["customTopLevel"], 7);
        assert_eq!(json["meshes"][0]["primitives"][0]["indices"], 1);

        let reparsed = Document::from_json(doc.to_json_string(false).unwrap().as_bytes()).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn test_serialize_resolves_ids_by_position() {
        let mut doc = Document::from_json(MANIFEST.as_bytes()).unwrap();
        // Rename the first view; references must follow the position, not the id text
        let mut views = doc.buffer_views.clone().into_vec();
        views[0].id = "positions".to_string();
        doc.buffer_views = Collection::new();
        for view in views {
            doc.buffer_views.append(view).unwrap();
        }
        doc.accessors.iter_mut().next().unwrap().buffer_view = Some("positions".to_string());

        let json = doc.to_json_value().unwrap();
        assert_eq!(json["accessors"][0]["bufferView"], 0);
    }

    #[test]
    fn test_dangling_reference_is_format_error() {
        let mut doc = Document::from_json(MANIFEST.as_bytes()).unwrap();
        doc.accessors.iter_mut().next().unwrap().buffer_view = Some("99".to_string());
        assert!(matches!(doc.to_json_value(), Err(GltfError::Format(_))));
    }

    #[test]
    fn test_unknown_component_type_is_unsupported() {
        let json = r#"{ "asset": { "version": "2.0" },
            "accessors": [{ "count": 1, "componentType": 5130, "type": "SCALAR" }] }"#;
        assert!(matches!(
            Document::from_json(json.as_bytes()),
            Err(GltfError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_out_of_range_view_index_rejected() {
        let json = r#"{ "asset": { "version": "2.0" },
            "buffers": [{ "byteLength": 4 }],
            "bufferViews": [{ "buffer": 1, "byteLength": 4 }] }"#;
        assert!(matches!(
            Document::from_json(json.as_bytes()),
            Err(GltfError::Format(_))
        ));
    }

    #[test]
    fn test_output_readable_by_gltf_json() {
        let doc = Document::from_json(MANIFEST.as_bytes()).unwrap();
        let json = doc.to_json_string(true).unwrap();
        let root = gltf_json::Root::from_slice(json.as_bytes()).unwrap();
        assert_eq!(root.accessors.len(), 2);
        assert_eq!(root.buffer_views.len(), 2);
    }
}
