//! Packing a document and its external resources into one binary buffer

use crate::mime::mime_type_from_uri;
use crate::resource::{ResourceReader, open_document};
use crate::stream::{FileStreamWriter, StreamWriter, decode_data_uri};
use glb_builder::refs::{
    BUFFER_VIEW_KEY, PAYLOAD_MEMBER, URI_KEY, index_member, visit_element_view_references,
    visit_references, visit_root_references,
};
use glb_builder::{
    Accessor, AccessorDesc, BufferBuilder, ComponentType, Document, ExternalBufferWriter,
    GlbBufferWriter, GltfError, ResourceWriter, Result, ViewOptions, write_glb,
};
use hashbrown::HashMap;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;

/// Chooses the component type an accessor is stored with
pub type AccessorConversion = Box<dyn Fn(&Accessor) -> ComponentType + Send + Sync>;

/// Packing options
#[derive(Default)]
pub struct PackOptions {
    /// When set, accessors are numerically cast to the returned component type
    /// and their bounds recomputed
    pub accessor_conversion: Option<AccessorConversion>,
}

/// A rebuilt document together with the bytes of its single buffer
#[derive(Debug)]
pub struct PackedGlb {
    pub document: Document,
    pub bin: Vec<u8>,
}

/// Counts reported after packing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub accessors: usize,
    pub images: usize,
    pub extension_blobs: usize,
    pub bin_length: usize,
}

/// Rebuild `document` so every accessor, image and extension blob lives in a single
/// buffer produced by `writer`.
///
/// Accessors are appended first, in document order, then images, then extension blobs.
/// Extensions and extras of the source buffer, views and accessors are carried over.
pub fn rebuild_document<W: ResourceWriter>(
    document: &Document,
    reader: &mut ResourceReader,
    writer: W,
    options: &PackOptions,
) -> Result<(Document, W, PackSummary)> {
    let mut out = document.clone();
    out.buffers.clear();
    out.buffer_views.clear();
    out.accessors.clear();

    let mut builder = BufferBuilder::new(writer);
    builder.add_buffer(None)?;

    // New view id -> source view id, used to restore extensions and extras
    let mut view_sources: Vec<(String, String)> = Vec::new();
    let mut summary = PackSummary::default();

    for accessor in document.accessors.iter() {
        if accessor.count == 0 {
            return Err(GltfError::format(format!(
                "accessor '{}' has count 0",
                accessor.id
            )));
        }

        let mut data = reader.read_accessor(document, accessor)?;
        let mut min = accessor.min.clone();
        let mut max = accessor.max.clone();

        if let Some(convert) = &options.accessor_conversion {
            let component_type = convert(accessor);
            if component_type != accessor.component_type {
                data = data.convert(component_type);
                min.clear();
                max.clear();
            }
        }

        let components = accessor.accessor_type.component_count();
        if min.is_empty() || max.is_empty() {
            (min, max) = data.min_max(components);
        }

        let source_view = document.accessor_view(accessor)?;
        let target = source_view.and_then(|view| view.target);
        let view_id = builder.add_buffer_view(target, None)?.id.clone();
        if let Some(view) = source_view {
            view_sources.push((view_id, view.id.clone()));
        }

        let desc = AccessorDesc::new(accessor.count, data.component_type(), accessor.accessor_type)
            .normalized(accessor.normalized)
            .with_bounds(min, max);
        builder.add_accessor(data.as_bytes(), desc)?;
        summary.accessors += 1;
    }

    for image in out.images.iter_mut() {
        let data = reader.read_image(document, image)?;
        let source_view = image.buffer_view.clone();
        let view_id = builder
            .add_buffer_view_data(&data, ViewOptions::new().alignment(4))?
            .id
            .clone();
        if let Some(source) = source_view {
            view_sources.push((view_id.clone(), source));
        }

        if image.mime_type.is_none() {
            image.mime_type = Some(match image.uri.as_deref() {
                Some(uri) => image_mime_type(uri)?,
                None => crate::mime::FALLBACK_MIMETYPE.to_string(),
            });
        }
        image.buffer_view = Some(view_id);
        image.uri = None;
        summary.images += 1;
    }

    // Existing extension views first: embedded uris already carry new indices
    let copies = copy_extension_views(document, &mut out, reader, &mut builder)?;
    summary.extension_blobs += copies.len();
    summary.extension_blobs += embed_root_extension_blobs(&mut out, reader, &mut builder)?;

    // The single buffer is kept even when it ends up empty
    builder.output(&mut out)?;

    // Restore what the rebuild dropped
    if let ([source], Some(buffer)) = (document.buffers.elements(), out.buffers.iter_mut().next()) {
        buffer.name = source.name.clone();
        buffer.extensions = source.extensions.clone();
        buffer.extras = source.extras.clone();
    }
    for (view_id, source_id) in &view_sources {
        if let (Some(source), Some(view)) = (
            document.buffer_views.get(source_id),
            out.buffer_views.get_mut(view_id),
        ) {
            view.name = source.name.clone();
            view.extensions = source.extensions.clone();
            view.extras = source.extras.clone();
        }
    }
    for (source, accessor) in document.accessors.iter().zip(out.accessors.iter_mut()) {
        accessor.name = source.name.clone();
        accessor.extensions = source.extensions.clone();
        accessor.extras = source.extras.clone();
    }
    let restored = out
        .buffers
        .iter_mut()
        .map(|b| &mut b.extensions)
        .chain(out.buffer_views.iter_mut().map(|v| &mut v.extensions))
        .chain(out.accessors.iter_mut().map(|a| &mut a.extensions));
    for extensions in restored {
        for payload in extensions.values_mut() {
            visit_references(payload, PAYLOAD_MEMBER, BUFFER_VIEW_KEY, |_, object| {
                point_at_copy(object, &copies)
            });
        }
    }

    out.validate_view_ranges()?;
    summary.bin_length = out.buffers.iter().map(|b| b.byte_length).sum();
    Ok((out, builder.into_writer(), summary))
}

fn image_mime_type(uri: &str) -> Result<String> {
    if let Some((Some(media), _)) = decode_data_uri(uri)? {
        return Ok(media);
    }
    Ok(mime_type_from_uri(uri).to_string())
}

/// Embed every `uri` object found in root-level extension payloads
fn embed_root_extension_blobs<W: ResourceWriter>(
    out: &mut Document,
    reader: &mut ResourceReader,
    builder: &mut BufferBuilder<W>,
) -> Result<usize> {
    let mut uris = Vec::new();
    visit_root_references(&mut out.extensions, URI_KEY, |_, _, object| {
        if let Some(Value::String(uri)) = object.get(URI_KEY) {
            uris.push(uri.clone());
        }
    });

    let mut embedded = Vec::with_capacity(uris.len());
    for uri in &uris {
        let data = reader.read_uri(uri)?;
        builder.add_buffer_view_data(&data, ViewOptions::new().alignment(4))?;
        embedded.push((builder.buffer_view_count() - 1, image_mime_type(uri)?));
    }

    let mut embedded = embedded.into_iter();
    visit_root_references(&mut out.extensions, URI_KEY, |name, member, object| {
        if let Some((index, mime_type)) = embedded.next() {
            tracing::debug!("Embedding {}/{} as bufferView {}", name, member, index);
            object.remove(URI_KEY);
            object.insert(BUFFER_VIEW_KEY.to_string(), Value::from(index));
            object
                .entry("mimeType")
                .or_insert_with(|| Value::String(mime_type));
        }
    });

    Ok(uris.len())
}

/// Visit every `bufferView` reference held by root-level and element-level extensions
fn visit_extension_view_references<F>(document: &mut Document, mut f: F)
where
    F: FnMut(&mut Map<String, Value>),
{
    visit_root_references(&mut document.extensions, BUFFER_VIEW_KEY, |_, _, object| {
        f(object)
    });
    visit_element_view_references(document, &mut f);
}

fn point_at_copy(object: &mut Map<String, Value>, copies: &HashMap<usize, usize>) {
    if let Some(new_index) = index_member(object, BUFFER_VIEW_KEY).and_then(|i| copies.get(&i)) {
        object.insert(BUFFER_VIEW_KEY.to_string(), Value::from(*new_index));
    }
}

/// Copy the views that extensions of `document` reference and point the references
/// already present in `out` at the copies.
///
/// Returns source view index -> copied view index. Buffer, view and accessor extensions
/// are restored on `out` later and remapped with the same table.
fn copy_extension_views<W: ResourceWriter>(
    document: &Document,
    out: &mut Document,
    reader: &mut ResourceReader,
    builder: &mut BufferBuilder<W>,
) -> Result<HashMap<usize, usize>> {
    let mut referenced = Vec::new();
    let mut source = document.clone();
    visit_extension_view_references(&mut source, |object| {
        if let Some(index) = index_member(object, BUFFER_VIEW_KEY) {
            referenced.push(index);
        }
    });

    let mut copies: HashMap<usize, usize> = HashMap::new();
    for index in referenced {
        if copies.contains_key(&index) {
            continue;
        }
        let view = document.buffer_views.elements().get(index).ok_or_else(|| {
            GltfError::format(format!("extension references missing bufferView {index}"))
        })?;
        let data = reader.view_bytes(document, &view.id)?;
        let options = ViewOptions {
            byte_stride: view.byte_stride,
            target: view.target,
            alignment: 4,
            ..Default::default()
        };
        builder.add_buffer_view_data(&data, options)?;
        copies.insert(index, builder.buffer_view_count() - 1);
    }

    visit_extension_view_references(out, |object| point_at_copy(object, &copies));

    Ok(copies)
}

/// Rebuild `document` around one embedded buffer
pub fn pack_document(
    document: &Document,
    reader: &mut ResourceReader,
    options: &PackOptions,
) -> Result<(PackedGlb, PackSummary)> {
    let (document, writer, summary) =
        rebuild_document(document, reader, GlbBufferWriter::new(), options)?;
    Ok((
        PackedGlb {
            document,
            bin: writer.into_data(),
        },
        summary,
    ))
}

/// Pack `document` and write the GLB container to `out`
pub fn pack_to_writer<W: Write>(
    document: &Document,
    reader: &mut ResourceReader,
    out: &mut W,
    options: &PackOptions,
) -> Result<PackSummary> {
    let (packed, summary) = pack_document(document, reader, options)?;
    let json = packed.document.to_json_string(false)?;
    write_glb(out, json.as_bytes(), &packed.bin)?;
    Ok(summary)
}

/// Pack a `.gltf` or `.glb` file into a `.glb` file
pub fn pack_file(input: &Path, output: &Path, options: &PackOptions) -> Result<PackSummary> {
    let (document, mut reader) = open_document(input)?;

    let mut glb = Vec::new();
    let summary = pack_to_writer(&document, &mut reader, &mut glb, options)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, &glb)?;

    tracing::info!(
        "Packed {} accessors, {} images into {} ({} bytes)",
        summary.accessors,
        summary.images,
        output.display(),
        glb.len()
    );
    Ok(summary)
}

/// Rebuild `document` around one external buffer and write `<name>.gltf` plus
/// `<name>_<bufferId>.bin` through `streams`
pub fn write_gltf<S: StreamWriter>(
    document: &Document,
    reader: &mut ResourceReader,
    name: &str,
    streams: &mut S,
    options: &PackOptions,
) -> Result<PackSummary> {
    let (document, writer, summary) =
        rebuild_document(document, reader, ExternalBufferWriter::new(name), options)?;
    for (uri, data) in writer.resources() {
        streams.write_resource(&uri, data)?;
    }
    let json = document.to_json_string(true)?;
    streams.write_resource(&format!("{name}.gltf"), json.as_bytes())?;
    Ok(summary)
}

/// Write `document` as `.gltf` with an external buffer into the directory of `output`
pub fn write_gltf_file(
    document: &Document,
    reader: &mut ResourceReader,
    output: &Path,
    options: &PackOptions,
) -> Result<PackSummary> {
    let name = output
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| GltfError::Unsupported(format!("output path {}", output.display())))?;
    let dir = output.parent().unwrap_or(Path::new(""));
    let mut streams = FileStreamWriter::new(dir);
    write_gltf(document, reader, name, &mut streams, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStreamReader;
    use glb_builder::{AccessorType, Buffer, BufferView, BufferViewTarget, Image, read_glb};
    use serde_json::json;

    fn external_doc(bytes: usize) -> Document {
        let mut doc = Document::new();
        doc.buffers
            .append(Buffer {
                id: "0".into(),
                byte_length: bytes,
                uri: Some("mesh.bin".into()),
                ..Default::default()
            })
            .unwrap();
        doc
    }

    #[test]
    fn test_pack_single_buffer_and_images_last() {
        let positions: Vec<u8> = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut doc = external_doc(positions.len());
        doc.buffer_views
            .append(BufferView {
                id: "0".into(),
                buffer: "0".into(),
                byte_length: positions.len(),
                target: Some(BufferViewTarget::Vertex),
                extras: Some(json!({ "tag": "positions" })),
                ..Default::default()
            })
            .unwrap();
        let mut accessor = Accessor::new("0", 2, ComponentType::F32, AccessorType::Vec3);
        accessor.buffer_view = Some("0".into());
        accessor.extras = Some(json!({ "kept": true }));
        doc.accessors.append(accessor).unwrap();
        doc.images
            .append(Image {
                id: "0".into(),
                uri: Some("albedo.png".into()),
                ..Default::default()
            })
            .unwrap();

        let streams = MemoryStreamReader::new()
            .with("mesh.bin", positions.clone())
            .with("albedo.png", vec![0x89, b'P', b'N', b'G', 1]);
        let mut reader = ResourceReader::new(streams);
        let (packed, summary) = pack_document(&doc, &mut reader, &PackOptions::default()).unwrap();

        let out = &packed.document;
        assert_eq!(out.buffers.len(), 1);
        assert!(out.buffers.elements()[0].uri.is_none());
        assert_eq!(summary.accessors, 1);
        assert_eq!(summary.images, 1);

        let accessor = &out.accessors.elements()[0];
        assert_eq!(accessor.min, vec![0.0, 1.0, 2.0]);
        assert_eq!(accessor.max, vec![3.0, 4.0, 5.0]);
        assert_eq!(accessor.extras, Some(json!({ "kept": true })));

        let views = out.buffer_views.elements();
        assert_eq!(views[0].target, Some(BufferViewTarget::Vertex));
        assert_eq!(views[0].extras, Some(json!({ "tag": "positions" })));
        assert_eq!(&packed.bin[..24], positions.as_slice());

        let image = &out.images.elements()[0];
        assert!(image.uri.is_none());
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));
        let image_view = out.buffer_views.get(image.buffer_view.as_deref().unwrap()).unwrap();
        assert_eq!(image_view.byte_offset, 24);
        assert_eq!(&packed.bin[24..29], &[0x89, b'P', b'N', b'G', 1]);
    }

    #[test]
    fn test_zero_count_accessor_is_fatal() {
        let mut doc = external_doc(0);
        doc.accessors
            .append(Accessor::new("0", 0, ComponentType::F32, AccessorType::Scalar))
            .unwrap();
        let mut reader = ResourceReader::new(MemoryStreamReader::new().with("mesh.bin", vec![]));
        assert!(matches!(
            pack_document(&doc, &mut reader, &PackOptions::default()),
            Err(GltfError::Format(_))
        ));
    }

    #[test]
    fn test_missing_resource_propagates_io_error() {
        let mut doc = external_doc(4);
        doc.buffer_views
            .append(BufferView {
                id: "0".into(),
                buffer: "0".into(),
                byte_length: 4,
                ..Default::default()
            })
            .unwrap();
        let mut accessor = Accessor::new("0", 1, ComponentType::F32, AccessorType::Scalar);
        accessor.buffer_view = Some("0".into());
        doc.accessors.append(accessor).unwrap();

        let mut reader = ResourceReader::new(MemoryStreamReader::new());
        assert!(matches!(
            pack_document(&doc, &mut reader, &PackOptions::default()),
            Err(GltfError::Io(_))
        ));
    }

    #[test]
    fn test_accessor_conversion() {
        let values: Vec<u8> = [1.0f32, 2.0, 300.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut doc = external_doc(values.len());
        doc.buffer_views
            .append(BufferView {
                id: "0".into(),
                buffer: "0".into(),
                byte_length: values.len(),
                ..Default::default()
            })
            .unwrap();
        let mut accessor = Accessor::new("0", 3, ComponentType::F32, AccessorType::Scalar);
        accessor.buffer_view = Some("0".into());
        accessor.min = vec![1.0];
        accessor.max = vec![300.0];
        doc.accessors.append(accessor).unwrap();

        let options = PackOptions {
            accessor_conversion: Some(Box::new(|_| ComponentType::U16)),
        };
        let mut reader = ResourceReader::new(MemoryStreamReader::new().with("mesh.bin", values));
        let (packed, _) = pack_document(&doc, &mut reader, &options).unwrap();

        let accessor = &packed.document.accessors.elements()[0];
        assert_eq!(accessor.component_type, ComponentType::U16);
        assert_eq!(accessor.max, vec![300.0]);
        assert_eq!(&packed.bin[..6], &[1, 0, 2, 0, 44, 1]);
    }

    #[test]
    fn test_extension_uri_embedded() {
        let mut doc = Document::new();
        doc.extensions.insert(
            "EXT_lights_image_based".into(),
            json!({ "lights": [{ "uri": "env.ktx2" }] }),
        );
        let streams = MemoryStreamReader::new().with("env.ktx2", vec![1, 2, 3]);
        let mut reader = ResourceReader::new(streams);
        let (packed, summary) = pack_document(&doc, &mut reader, &PackOptions::default()).unwrap();

        assert_eq!(summary.extension_blobs, 1);
        let light = &packed.document.extensions["EXT_lights_image_based"]["lights"][0];
        assert_eq!(light, &json!({ "bufferView": 0, "mimeType": "image/ktx2" }));
        assert_eq!(&packed.bin[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_element_extension_view_copied() {
        let mut doc = external_doc(8);
        for (id, offset) in [("0", 0), ("1", 4)] {
            doc.buffer_views
                .append(BufferView {
                    id: id.into(),
                    buffer: "0".into(),
                    byte_offset: offset,
                    byte_length: 4,
                    ..Default::default()
                })
                .unwrap();
        }
        doc.meshes.push(json!({
            "primitives": [{
                "attributes": {},
                "extensions": { "KHR_draco_mesh_compression": { "bufferView": 1, "attributes": {} } }
            }]
        }));

        let streams = MemoryStreamReader::new().with("mesh.bin", vec![0, 0, 0, 0, 9, 8, 7, 6]);
        let mut reader = ResourceReader::new(streams);
        let (packed, _) = pack_document(&doc, &mut reader, &PackOptions::default()).unwrap();

        let draco = &packed.document.meshes[0]["primitives"][0]["extensions"]["KHR_draco_mesh_compression"];
        assert_eq!(draco["bufferView"], json!(0));
        assert_eq!(packed.document.buffer_views.len(), 1);
        assert_eq!(&packed.bin[..4], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_empty_document_keeps_one_buffer() {
        let mut reader = ResourceReader::new(MemoryStreamReader::new());
        let (packed, summary) =
            pack_document(&Document::new(), &mut reader, &PackOptions::default()).unwrap();
        assert_eq!(packed.document.buffers.len(), 1);
        assert_eq!(packed.document.buffers.elements()[0].byte_length, 0);
        assert_eq!(summary.bin_length, 0);

        let mut glb = Vec::new();
        let json = packed.document.to_json_string(false).unwrap();
        write_glb(&mut glb, json.as_bytes(), &packed.bin).unwrap();
        let (json, bin) = read_glb(&glb).unwrap();
        assert!(bin.is_empty());
        let reparsed = Document::from_json(&json).unwrap();
        assert_eq!(reparsed.buffers.len(), 1);
        assert!(reparsed.buffers.elements()[0].uri.is_none());
    }

    #[test]
    fn test_accessor_extension_view_copied() {
        let mut doc = external_doc(8);
        for (id, offset) in [("0", 0), ("1", 4)] {
            doc.buffer_views
                .append(BufferView {
                    id: id.into(),
                    buffer: "0".into(),
                    byte_offset: offset,
                    byte_length: 4,
                    ..Default::default()
                })
                .unwrap();
        }
        let mut accessor = Accessor::new("0", 1, ComponentType::F32, AccessorType::Scalar);
        accessor.buffer_view = Some("0".into());
        accessor
            .extensions
            .insert("EXT_meshopt_compression".into(), json!({ "bufferView": 1 }));
        doc.accessors.append(accessor).unwrap();

        let streams = MemoryStreamReader::new().with("mesh.bin", vec![0, 0, 128, 63, 4, 3, 2, 1]);
        let mut reader = ResourceReader::new(streams);
        let (packed, summary) = pack_document(&doc, &mut reader, &PackOptions::default()).unwrap();
        assert_eq!(summary.extension_blobs, 1);

        let out = &packed.document;
        let meshopt = &out.accessors.elements()[0].extensions["EXT_meshopt_compression"];
        let index = meshopt["bufferView"].as_u64().unwrap() as usize;
        assert_eq!(index, 1);
        let view = &out.buffer_views.elements()[index];
        assert_eq!(
            &packed.bin[view.byte_offset..view.byte_offset + view.byte_length],
            &[4, 3, 2, 1]
        );
    }

    #[test]
    fn test_pack_to_writer_produces_glb() {
        let mut doc = external_doc(4);
        doc.buffer_views
            .append(BufferView {
                id: "0".into(),
                buffer: "0".into(),
                byte_length: 4,
                ..Default::default()
            })
            .unwrap();
        let mut accessor = Accessor::new("0", 2, ComponentType::U16, AccessorType::Scalar);
        accessor.buffer_view = Some("0".into());
        doc.accessors.append(accessor).unwrap();

        let mut reader = ResourceReader::new(MemoryStreamReader::new().with("mesh.bin", vec![1, 0, 2, 0]));
        let mut glb = Vec::new();
        pack_to_writer(&doc, &mut reader, &mut glb, &PackOptions::default()).unwrap();

        let (json, bin) = read_glb(&glb).unwrap();
        assert_eq!(bin, vec![1, 0, 2, 0]);
        let reparsed = Document::from_json(&json).unwrap();
        assert_eq!(reparsed.buffers.len(), 1);
        assert_eq!(reparsed.accessors.elements()[0].min, vec![1.0]);
    }
}
