//! Externalizing images and extension blobs from a GLB container

use crate::mime::extension_from_mime_type;
use crate::stream::{ContainerSource, FileStreamWriter, StreamWriter};
use glb_builder::refs::{
    BUFFER_VIEW_KEY, URI_KEY, index_member, remap_accessor_refs, visit_element_view_references,
    visit_root_references,
};
use glb_builder::{
    Accessor, Buffer, BufferView, Collection, Document, GlbReader, GltfError, Result,
    align_offset,
};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Alignment of every retained view in the compacted buffer
pub const RETAINED_VIEW_ALIGNMENT: usize = 4;

/// A byte range of the binary chunk written to its own file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub file_name: String,
    /// Offset relative to the start of the binary chunk
    pub byte_offset: usize,
    pub byte_length: usize,
}

/// Placement of a kept view in the compacted buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedView {
    pub old_offset: usize,
    pub new_offset: usize,
    pub byte_length: usize,
}

/// The rewritten document plus everything needed to produce its files
#[derive(Debug)]
pub struct UnpackPlan {
    pub document: Document,
    pub images: Vec<Extraction>,
    pub extension_blobs: Vec<Extraction>,
    pub retained: Vec<RetainedView>,
    pub bin_length: usize,
    pub skipped_references: usize,
    pub dropped_accessors: usize,
}

/// Counts reported after unpacking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    pub images: usize,
    pub extension_blobs: usize,
    pub retained_views: usize,
    pub bin_length: usize,
    pub skipped_references: usize,
    pub dropped_accessors: usize,
}

impl UnpackPlan {
    pub fn summary(&self) -> UnpackSummary {
        UnpackSummary {
            images: self.images.len(),
            extension_blobs: self.extension_blobs.len(),
            retained_views: self.retained.len(),
            bin_length: self.bin_length,
            skipped_references: self.skipped_references,
            dropped_accessors: self.dropped_accessors,
        }
    }
}

/// Classify the views of `glb_document` and build the unpacked document.
///
/// Views referenced by images or root-level extension payloads become external files;
/// the rest are compacted, in byteOffset order, into one buffer named `<name>.bin`.
pub fn create_unpacked_document(glb_document: &Document, name: &str) -> Result<UnpackPlan> {
    match glb_document.buffers.elements() {
        [] | [Buffer { uri: None, .. }] => {}
        [buffer] => {
            return Err(GltfError::Unsupported(format!(
                "buffer '{}' is external; only the embedded buffer can be unpacked",
                buffer.id
            )));
        }
        buffers => {
            return Err(GltfError::Unsupported(format!(
                "{} buffers; only single-buffer containers can be unpacked",
                buffers.len()
            )));
        }
    }
    glb_document.validate_view_ranges()?;

    let views = glb_document.buffer_views.elements();
    let mut removed = vec![false; views.len()];
    let mut document = glb_document.clone();

    let mut images = Vec::new();
    for (k, image) in document.images.iter_mut().enumerate() {
        let Some(view_id) = image.buffer_view.take() else {
            continue;
        };
        let position = glb_document
            .buffer_views
            .index_of(&view_id)
            .ok_or_else(|| {
                GltfError::format(format!("image {k} references missing bufferView '{view_id}'"))
            })?;
        let view = &views[position];
        let file_name = format!(
            "{}_image{}.{}",
            name,
            k,
            extension_from_mime_type(image.mime_type.as_deref())
        );
        removed[position] = true;
        image.uri = Some(file_name.clone());
        images.push(Extraction {
            file_name,
            byte_offset: view.byte_offset,
            byte_length: view.byte_length,
        });
    }

    let mut extension_blobs = Vec::new();
    let mut skipped_references = 0;
    visit_root_references(
        &mut document.extensions,
        BUFFER_VIEW_KEY,
        |extension, member, object| {
            let Some(view) = index_member(object, BUFFER_VIEW_KEY).and_then(|i| views.get(i)) else {
                tracing::warn!(
                    "Skipping {}/{}: bufferView {:?} does not exist",
                    extension,
                    member,
                    object.get(BUFFER_VIEW_KEY)
                );
                object.remove(BUFFER_VIEW_KEY);
                skipped_references += 1;
                return;
            };

            let mime_type = object.get("mimeType").and_then(Value::as_str);
            let file_name = format!(
                "{}_{}_{}_{}.{}",
                name,
                extension,
                member,
                view.id,
                extension_from_mime_type(mime_type)
            );
            if let Some(position) = index_member(object, BUFFER_VIEW_KEY) {
                removed[position] = true;
            }
            object.remove(URI_KEY);
            object.remove("mimeType");
            object.remove(BUFFER_VIEW_KEY);
            object.insert(URI_KEY.to_string(), Value::String(file_name.clone()));

            extension_blobs.push(Extraction {
                file_name,
                byte_offset: view.byte_offset,
                byte_length: view.byte_length,
            });
        },
    );

    // Compact the remaining views
    let mut order: Vec<usize> = (0..views.len()).filter(|&i| !removed[i]).collect();
    order.sort_by_key(|&i| views[i].byte_offset);

    let mut new_position = vec![None; views.len()];
    let mut retained = Vec::with_capacity(order.len());
    let mut new_views: Collection<BufferView> = Collection::new();
    let mut cursor = 0;
    for (new_index, &old_index) in order.iter().enumerate() {
        let source = &views[old_index];
        let new_offset = align_offset(cursor, RETAINED_VIEW_ALIGNMENT);
        tracing::debug!(
            "bufferView {} [{}..] -> {} [{}..] ({} bytes)",
            source.id,
            source.byte_offset,
            new_index,
            new_offset,
            source.byte_length
        );

        new_views.append(BufferView {
            id: new_index.to_string(),
            buffer: "0".to_string(),
            byte_offset: new_offset,
            ..source.clone()
        })?;
        retained.push(RetainedView {
            old_offset: source.byte_offset,
            new_offset,
            byte_length: source.byte_length,
        });
        new_position[old_index] = Some(new_index);
        cursor = new_offset + source.byte_length;
    }

    // Only empty views were left: no buffer, and nothing may point at them
    if cursor == 0 && !retained.is_empty() {
        tracing::debug!("Dropping {} empty bufferViews", retained.len());
        new_views.clear();
        retained.clear();
        new_position.fill(None);
    }
    document.buffer_views = new_views;

    document.buffers.clear();
    if cursor > 0 {
        let source = glb_document.buffers.elements().first();
        document.buffers.append(Buffer {
            id: "0".to_string(),
            byte_length: cursor,
            uri: Some(format!("{name}.bin")),
            name: source.and_then(|b| b.name.clone()),
            extensions: source.map(|b| b.extensions.clone()).unwrap_or_default(),
            extras: source.and_then(|b| b.extras.clone()),
        })?;
    }

    // Rewrite accessors, dropping the ones whose data left the buffer
    let retained_id = |view_id: &str| -> Option<String> {
        glb_document
            .buffer_views
            .index_of(view_id)
            .and_then(|i| new_position[i])
            .map(|i| i.to_string())
    };

    let mut accessor_position = Vec::with_capacity(glb_document.accessors.len());
    let mut accessors: Collection<Accessor> = Collection::new();
    for accessor in glb_document.accessors.iter() {
        match remap_accessor(accessor, accessors.len(), &retained_id) {
            Some(rewritten) => {
                accessor_position.push(Some(accessors.len()));
                accessors.append(rewritten)?;
            }
            None => {
                tracing::warn!(
                    "Dropping accessor {}: its data was externalized",
                    accessor.id
                );
                accessor_position.push(None);
            }
        }
    }
    let dropped_accessors = accessor_position.iter().filter(|p| p.is_none()).count();
    document.accessors = accessors;
    if dropped_accessors > 0 {
        let dropped_refs =
            remap_accessor_refs(&mut document, |i| accessor_position.get(i).copied().flatten());
        tracing::warn!("Removed {} references to dropped accessors", dropped_refs);
    }

    visit_element_view_references(&mut document, |object| {
        let Some(old) = index_member(object, BUFFER_VIEW_KEY) else {
            return;
        };
        match new_position.get(old).copied().flatten() {
            Some(new) => {
                object.insert(BUFFER_VIEW_KEY.to_string(), Value::from(new));
            }
            None => {
                tracing::warn!("Skipping extension reference to bufferView {}", old);
                object.remove(BUFFER_VIEW_KEY);
                skipped_references += 1;
            }
        }
    });

    Ok(UnpackPlan {
        document,
        images,
        extension_blobs,
        retained,
        bin_length: cursor,
        skipped_references,
        dropped_accessors,
    })
}

fn remap_accessor<F>(accessor: &Accessor, new_index: usize, retained_id: &F) -> Option<Accessor>
where
    F: Fn(&str) -> Option<String>,
{
    let mut rewritten = accessor.clone();
    rewritten.id = new_index.to_string();
    if let Some(view) = &accessor.buffer_view {
        rewritten.buffer_view = Some(retained_id(view)?);
    }
    if let Some(sparse) = &mut rewritten.sparse {
        sparse.indices_buffer_view = retained_id(&sparse.indices_buffer_view)?;
        sparse.values_buffer_view = retained_id(&sparse.values_buffer_view)?;
    }
    Some(rewritten)
}

/// Copy every image and extension blob of `plan` from `source` into `writer`.
///
/// `bin_offset` is the absolute offset of the binary chunk data within the container.
pub fn extract_files<S, W>(
    plan: &UnpackPlan,
    source: &mut S,
    bin_offset: u64,
    writer: &mut W,
) -> Result<()>
where
    S: ContainerSource + ?Sized,
    W: StreamWriter,
{
    for extraction in plan.images.iter().chain(&plan.extension_blobs) {
        let data = source.read_at(
            bin_offset + extraction.byte_offset as u64,
            extraction.byte_length as u64,
        )?;
        writer.write_resource(&extraction.file_name, &data)?;
    }
    Ok(())
}

/// Assemble the compacted buffer; padding between views is zero
pub fn save_bin<S>(plan: &UnpackPlan, source: &mut S, bin_offset: u64) -> Result<Vec<u8>>
where
    S: ContainerSource + ?Sized,
{
    let mut blob = vec![0u8; plan.bin_length];
    for view in &plan.retained {
        let data = source.read_at(bin_offset + view.old_offset as u64, view.byte_length as u64)?;
        blob[view.new_offset..view.new_offset + view.byte_length].copy_from_slice(&data);
    }
    Ok(blob)
}

/// Unpack a parsed container whose binary chunk is readable through `source`
pub fn unpack_source<S, W>(
    glb_document: &Document,
    source: &mut S,
    bin_offset: u64,
    name: &str,
    writer: &mut W,
) -> Result<UnpackSummary>
where
    S: ContainerSource + ?Sized,
    W: StreamWriter,
{
    let plan = create_unpacked_document(glb_document, name)?;
    extract_files(&plan, source, bin_offset, writer)?;

    if plan.bin_length > 0 {
        let blob = save_bin(&plan, source, bin_offset)?;
        writer.write_resource(&format!("{name}.bin"), &blob)?;
    }
    let json = plan.document.to_json_string(true)?;
    writer.write_resource(&format!("{name}.gltf"), json.as_bytes())?;

    Ok(plan.summary())
}

/// Unpack a `.glb` file into `out_dir`. Output files are named after `name`, or the
/// input file stem when `name` is `None`.
pub fn unpack_file(input: &Path, out_dir: &Path, name: Option<&str>) -> Result<UnpackSummary> {
    let name = match name {
        Some(name) => name.to_string(),
        None => input
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| GltfError::Unsupported(format!("input path {}", input.display())))?
            .to_string(),
    };

    let mut reader = GlbReader::new(BufReader::new(File::open(input)?))?;
    let json = reader.read_json()?;
    let document = Document::from_json(&json)?;

    let bin_length = reader.layout().bin_length;
    if let Some(buffer) = document.buffers.iter().find(|b| b.uri.is_none()) {
        if buffer.byte_length as u64 > bin_length {
            return Err(GltfError::Container(format!(
                "buffer '{}' declares {} bytes but the BIN chunk holds {}",
                buffer.id, buffer.byte_length, bin_length
            )));
        }
    }

    let bin_offset = match reader.layout().bin_offset {
        Some(offset) => offset,
        None if document.buffer_views.is_empty() => 0,
        None => {
            return Err(GltfError::Container(
                "bufferViews are declared but there is no BIN chunk".to_string(),
            ));
        }
    };

    let mut writer = FileStreamWriter::new(out_dir);
    let summary = unpack_source(&document, &mut reader, bin_offset, &name, &mut writer)?;

    tracing::info!(
        "Unpacked {} into {} ({} images, {} extension blobs, {} bytes retained)",
        input.display(),
        out_dir.display(),
        summary.images,
        summary.extension_blobs,
        summary.bin_length
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStreamWriter;
    use glb_builder::{AccessorType, ComponentType, Image};
    use serde_json::json;

    fn glb_doc(byte_length: usize, views: &[(usize, usize)]) -> Document {
        let mut doc = Document::new();
        doc.buffers
            .append(Buffer {
                id: "0".into(),
                byte_length,
                ..Default::default()
            })
            .unwrap();
        for (i, &(offset, length)) in views.iter().enumerate() {
            doc.buffer_views
                .append(BufferView {
                    id: i.to_string(),
                    buffer: "0".into(),
                    byte_offset: offset,
                    byte_length: length,
                    ..Default::default()
                })
                .unwrap();
        }
        doc
    }

    fn image(id: &str, view: &str, mime: &str) -> Image {
        Image {
            id: id.into(),
            buffer_view: Some(view.into()),
            mime_type: Some(mime.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_images_extracted_and_bin_compacted() {
        // Container byte k holds k; the binary chunk starts at 12
        let mut source: Vec<u8> = (0..=255).collect();
        let mut doc = glb_doc(100, &[(0, 8), (32, 4), (72, 2)]);
        doc.images.append(image("0", "1", "image/png")).unwrap();
        doc.images.append(image("1", "2", "image/jpeg")).unwrap();

        let mut writer = MemoryStreamWriter::new();
        let summary = unpack_source(&doc, &mut source, 12, "scene", &mut writer).unwrap();

        assert_eq!(summary.images, 2);
        assert_eq!(writer.get("scene_image0.png"), Some(&[44u8, 45, 46, 47][..]));
        assert_eq!(writer.get("scene_image1.jpg"), Some(&[84u8, 85][..]));
        assert_eq!(
            writer.get("scene.bin"),
            Some(&[12u8, 13, 14, 15, 16, 17, 18, 19][..])
        );

        let out = Document::from_json(writer.get("scene.gltf").unwrap()).unwrap();
        assert_eq!(out.buffer_views.len(), 1);
        assert_eq!(out.buffers.elements()[0].uri.as_deref(), Some("scene.bin"));
        assert_eq!(out.buffers.elements()[0].byte_length, 8);
        let images = out.images.elements();
        assert_eq!(images[0].uri.as_deref(), Some("scene_image0.png"));
        assert_eq!(images[0].mime_type.as_deref(), Some("image/png"));
        assert!(images[1].buffer_view.is_none());
    }

    #[test]
    fn test_retained_views_sorted_and_aligned() {
        let mut doc = glb_doc(64, &[(40, 3), (0, 5), (20, 6)]);
        let mut accessor = Accessor::new("0", 3, ComponentType::U8, AccessorType::Scalar);
        accessor.buffer_view = Some("0".into());
        doc.accessors.append(accessor).unwrap();

        let plan = create_unpacked_document(&doc, "m").unwrap();
        let offsets: Vec<(usize, usize)> =
            plan.retained.iter().map(|r| (r.old_offset, r.new_offset)).collect();
        assert_eq!(offsets, vec![(0, 0), (20, 8), (40, 16)]);
        assert!(plan.retained.iter().all(|r| r.new_offset % 4 == 0));
        assert_eq!(plan.bin_length, 19);
        // The accessor followed its view to the last position
        assert_eq!(
            plan.document.accessors.elements()[0].buffer_view.as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_extension_blob_externalized() {
        let mut doc = glb_doc(16, &[(0, 4), (4, 12)]);
        doc.extensions.insert(
            "EXT_lights_image_based".into(),
            json!({ "specularImages": [{ "bufferView": 1, "mimeType": "image/ktx2" }] }),
        );
        doc.extensions
            .insert("EXT_probe".into(), json!({ "bufferView": 7 }));

        let plan = create_unpacked_document(&doc, "env").unwrap();
        assert_eq!(plan.extension_blobs.len(), 1);
        assert_eq!(
            plan.extension_blobs[0].file_name,
            "env_EXT_lights_image_based_specularImages_1.ktx2"
        );
        assert_eq!(
            plan.document.extensions["EXT_lights_image_based"]["specularImages"][0],
            json!({ "uri": "env_EXT_lights_image_based_specularImages_1.ktx2" })
        );
        assert_eq!(plan.skipped_references, 1);
        assert_eq!(plan.document.extensions["EXT_probe"], json!({}));
        assert_eq!(plan.retained.len(), 1);
    }

    #[test]
    fn test_payload_member_name() {
        let mut doc = glb_doc(4, &[(0, 4)]);
        doc.extensions
            .insert("EXT_blob".into(), json!({ "bufferView": 0 }));
        let plan = create_unpacked_document(&doc, "a").unwrap();
        assert_eq!(plan.extension_blobs[0].file_name, "a_EXT_blob_data_0.bin");
        assert!(plan.document.buffers.is_empty());
        assert!(plan.document.buffer_views.is_empty());
    }

    #[test]
    fn test_accessors_on_extracted_views_dropped() {
        let mut doc = glb_doc(16, &[(0, 4), (4, 12)]);
        doc.images.append(image("0", "0", "image/png")).unwrap();
        let mut on_image = Accessor::new("0", 4, ComponentType::U8, AccessorType::Scalar);
        on_image.buffer_view = Some("0".into());
        let mut kept = Accessor::new("1", 3, ComponentType::F32, AccessorType::Scalar);
        kept.buffer_view = Some("1".into());
        doc.accessors.append(on_image).unwrap();
        doc.accessors.append(kept).unwrap();
        doc.meshes.push(json!({
            "primitives": [{ "attributes": { "POSITION": 1, "_JUNK": 0 } }]
        }));

        let plan = create_unpacked_document(&doc, "m").unwrap();
        assert_eq!(plan.dropped_accessors, 1);
        let accessors = plan.document.accessors.elements();
        assert_eq!(accessors.len(), 1);
        assert_eq!(accessors[0].id, "0");
        assert_eq!(accessors[0].buffer_view.as_deref(), Some("0"));
        assert_eq!(
            plan.document.meshes[0]["primitives"][0]["attributes"],
            json!({ "POSITION": 0 })
        );
    }

    #[test]
    fn test_element_extension_view_remapped() {
        let mut doc = glb_doc(16, &[(8, 8), (0, 8)]);
        doc.meshes.push(json!({
            "primitives": [{
                "attributes": {},
                "extensions": { "KHR_draco_mesh_compression": { "bufferView": 0 } }
            }]
        }));
        let plan = create_unpacked_document(&doc, "m").unwrap();
        let draco =
            &plan.document.meshes[0]["primitives"][0]["extensions"]["KHR_draco_mesh_compression"];
        assert_eq!(draco["bufferView"], json!(1));
    }

    #[test]
    fn test_empty_retained_views_leave_no_buffer() {
        let mut source: Vec<u8> = (0..32).collect();
        let mut doc = glb_doc(4, &[(0, 4), (4, 0)]);
        doc.images.append(image("0", "0", "image/png")).unwrap();
        doc.meshes.push(json!({
            "primitives": [{
                "attributes": {},
                "extensions": { "KHR_draco_mesh_compression": { "bufferView": 1 } }
            }]
        }));

        let mut writer = MemoryStreamWriter::new();
        let summary = unpack_source(&doc, &mut source, 12, "e", &mut writer).unwrap();
        assert_eq!(summary.bin_length, 0);
        assert_eq!(summary.retained_views, 0);
        assert_eq!(summary.skipped_references, 1);
        assert!(writer.get("e.bin").is_none());

        let out = Document::from_json(writer.get("e.gltf").unwrap()).unwrap();
        assert!(out.buffers.is_empty());
        assert!(out.buffer_views.is_empty());
        assert_eq!(out.images.elements()[0].uri.as_deref(), Some("e_image0.png"));
    }

    #[test]
    fn test_oversized_buffer_is_container_error() {
        let dir = tempfile::tempdir().unwrap();
        let json = br#"{"asset":{"version":"2.0"},"buffers":[{"byteLength":64}],"bufferViews":[{"buffer":0,"byteLength":64}]}"#;
        let glb = glb_builder::assemble_glb(json, &[1, 2, 3, 4]).unwrap();
        let input = dir.path().join("short.glb");
        std::fs::write(&input, glb).unwrap();

        assert!(matches!(
            unpack_file(&input, dir.path(), None),
            Err(GltfError::Container(_))
        ));
        assert!(!dir.path().join("short.gltf").exists());
    }

    #[test]
    fn test_multiple_buffers_unsupported() {
        let mut doc = glb_doc(4, &[]);
        doc.buffers
            .append(Buffer {
                id: "1".into(),
                byte_length: 4,
                uri: Some("other.bin".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            create_unpacked_document(&doc, "x"),
            Err(GltfError::Unsupported(_))
        ));
    }

    #[test]
    fn test_truncated_source_is_container_error() {
        let mut source: Vec<u8> = vec![0; 16];
        let doc = glb_doc(100, &[(0, 64)]);
        let mut writer = MemoryStreamWriter::new();
        assert!(matches!(
            unpack_source(&doc, &mut source, 12, "t", &mut writer),
            Err(GltfError::Container(_))
        ));
    }
}
