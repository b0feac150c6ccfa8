//! Merging documents as node levels of detail (`MSFT_lod`)
//!
//! Each LOD document is appended to the primary with every index rebased by the
//! primary's element counts at the time of the merge. Scenes are not appended: the
//! root nodes of each LOD scene become LOD alternatives of the matching primary root.

use crate::pack::{PackOptions, PackSummary, pack_document, pack_to_writer, write_gltf_file};
use crate::resource::{ResourceReader, open_document};
use crate::stream::MemoryStreamReader;
use glb_builder::refs::{
    BUFFER_VIEW_KEY, index_member, remap_accessor_refs, visit_element_view_references,
};
use glb_builder::{
    Accessor, Buffer, BufferView, Collection, Document, Element, GltfError, Image, Result,
};
use hashbrown::HashMap;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

pub const EXTENSION_MSFT_LOD: &str = "MSFT_lod";
pub const MSFT_LOD_IDS_KEY: &str = "ids";
pub const SCREEN_COVERAGE_KEY: &str = "MSFT_screencoverage";

/// Options for [`merge_documents_as_lods`]
#[derive(Debug, Clone, Default)]
pub struct LodOptions {
    /// Prefix for relative uris of each LOD document after the primary.
    /// Ignored unless there is exactly one entry per LOD.
    pub relative_paths: Vec<String>,
    /// Written to `extras.MSFT_screencoverage` of every primary root node when non-empty
    pub screen_coverage: Vec<f64>,
    /// LODs reuse the primary's samplers, images, textures and materials. Each LOD
    /// primitive is pointed at the primary material equal to its own, ignoring
    /// texture indices.
    pub shared_materials: bool,
}

/// LOD node ids of every node, by node index
pub fn parse_node_lods(document: &Document) -> Vec<Vec<usize>> {
    document
        .nodes
        .iter()
        .map(|node| {
            node.pointer(&format!("/extensions/{EXTENSION_MSFT_LOD}/{MSFT_LOD_IDS_KEY}"))
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_u64)
                        .filter_map(|id| usize::try_from(id).ok())
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect()
}

/// Highest number of LOD levels declared on any node
pub fn node_lod_levels(document: &Document) -> usize {
    parse_node_lods(document)
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
}

/// Merge `documents[1..]` into `documents[0]` as node LODs
pub fn merge_documents_as_lods(documents: &[Document], options: &LodOptions) -> Result<Document> {
    let (primary, lods) = documents
        .split_first()
        .ok_or_else(|| GltfError::format("no documents to merge"))?;

    let mut merged = primary.clone();
    let mut node_lods = parse_node_lods(&merged);

    for (i, lod) in lods.iter().enumerate() {
        let relative_path = if options.relative_paths.len() == lods.len() {
            options.relative_paths[i].as_str()
        } else {
            ""
        };
        add_node_lod(
            &mut merged,
            &mut node_lods,
            lod,
            relative_path,
            options.shared_materials,
        )?;
    }

    for (node, ids) in merged.nodes.iter_mut().zip(&node_lods) {
        if ids.is_empty() {
            continue;
        }
        if let Some(object) = node.as_object_mut() {
            let extensions = object
                .entry("extensions")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(extensions) = extensions.as_object_mut() {
                extensions.insert(
                    EXTENSION_MSFT_LOD.to_string(),
                    json!({ MSFT_LOD_IDS_KEY: ids }),
                );
            }
        }
    }

    if !options.screen_coverage.is_empty() {
        let roots: Vec<usize> = merged
            .scenes
            .iter()
            .flat_map(scene_roots)
            .collect();
        for root in roots {
            let Some(node) = merged.nodes.get_mut(root).and_then(Value::as_object_mut) else {
                continue;
            };
            let extras = node
                .entry("extras")
                .or_insert_with(|| Value::Object(Map::new()));
            if !extras.is_object() {
                *extras = Value::Object(Map::new());
            }
            if let Some(extras) = extras.as_object_mut() {
                extras.insert(SCREEN_COVERAGE_KEY.to_string(), json!(options.screen_coverage));
            }
        }
    }

    Ok(merged)
}

fn scene_roots(scene: &Value) -> Vec<usize> {
    scene
        .get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|n| usize::try_from(n).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Element counts of `merged` before a LOD is appended
#[derive(Debug, Clone, Copy)]
struct Offsets {
    buffers: usize,
    buffer_views: usize,
    accessors: usize,
    images: usize,
    samplers: usize,
    textures: usize,
    materials: usize,
    meshes: usize,
    nodes: usize,
    skins: usize,
    cameras: usize,
}

impl Offsets {
    fn of(document: &Document) -> Self {
        Self {
            buffers: document.buffers.len(),
            buffer_views: document.buffer_views.len(),
            accessors: document.accessors.len(),
            images: document.images.len(),
            samplers: document.samplers.len(),
            textures: document.textures.len(),
            materials: document.materials.len(),
            meshes: document.meshes.len(),
            nodes: document.nodes.len(),
            skins: document.skins.len(),
            cameras: document.cameras.len(),
        }
    }
}

fn add_node_lod(
    merged: &mut Document,
    node_lods: &mut [Vec<usize>],
    lod: &Document,
    relative_path: &str,
    shared_materials: bool,
) -> Result<()> {
    let primary_roots: Vec<Vec<usize>> = merged.scenes.iter().map(scene_roots).collect();
    let lod_roots: Vec<Vec<usize>> = lod.scenes.iter().map(scene_roots).collect();
    let shapes_match = primary_roots.len() == lod_roots.len()
        && primary_roots
            .iter()
            .zip(&lod_roots)
            .all(|(p, l)| p.len() == l.len());
    if primary_roots.is_empty() || !shapes_match {
        return Err(GltfError::format(
            "primary scene is empty or does not match the scene/root node counts of the LOD",
        ));
    }

    let level = primary_roots
        .iter()
        .flatten()
        .filter_map(|&root| node_lods.get(root).map(Vec::len))
        .max()
        .unwrap_or(0)
        + 1;
    let label = format!("_lod{level}");
    let offsets = Offsets::of(merged);
    tracing::debug!("Merging LOD level {} ({:?})", level, offsets);

    let mut lod = lod.clone();
    if shared_materials {
        share_primary_materials(merged, &mut lod)?;
    }
    rebase_typed(&mut lod, &offsets, relative_path)?;

    // Index references held by opaque members
    remap_accessor_refs(&mut lod, |i| Some(i + offsets.accessors));
    visit_element_view_references(&mut lod, |object| {
        add_offset(object, BUFFER_VIEW_KEY, offsets.buffer_views);
    });

    for texture in lod.textures.iter_mut().filter_map(Value::as_object_mut) {
        add_offset(texture, "sampler", offsets.samplers);
        add_offset(texture, "source", offsets.images);
        // MSFT_texture_dds, KHR_texture_basisu and friends point at images through `source`
        if let Some(extensions) = texture.get_mut("extensions").and_then(Value::as_object_mut) {
            for payload in extensions.values_mut().filter_map(Value::as_object_mut) {
                add_offset(payload, "source", offsets.images);
            }
        }
    }

    for material in &mut lod.materials {
        visit_texture_infos(material, &mut |info| add_offset(info, "index", offsets.textures));
        suffix_name(material, &label);
    }

    for mesh in &mut lod.meshes {
        suffix_name(mesh, &label);
        let primitives = mesh
            .get_mut("primitives")
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object_mut);
        for primitive in primitives {
            // Shared materials already hold primary indices
            if !shared_materials {
                add_offset(primitive, "material", offsets.materials);
            }
        }
    }

    for node in &mut lod.nodes {
        suffix_name(node, &label);
        let Some(node) = node.as_object_mut() else {
            continue;
        };
        add_offset(node, "mesh", offsets.meshes);
        add_offset(node, "skin", offsets.skins);
        add_offset(node, "camera", offsets.cameras);
        add_offset_all(node.get_mut("children"), offsets.nodes);
    }

    for skin in &mut lod.skins {
        suffix_name(skin, &label);
        let Some(skin) = skin.as_object_mut() else {
            continue;
        };
        add_offset(skin, "skeleton", offsets.nodes);
        add_offset_all(skin.get_mut("joints"), offsets.nodes);
    }

    for animation in &mut lod.animations {
        let channels = animation
            .get_mut("channels")
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten();
        for channel in channels {
            if let Some(target) = channel.get_mut("target").and_then(Value::as_object_mut) {
                add_offset(target, "node", offsets.nodes);
            }
        }
    }

    // Append everything but scenes
    for buffer in lod.buffers.into_vec() {
        merged.buffers.append(buffer)?;
    }
    for view in lod.buffer_views.into_vec() {
        merged.buffer_views.append(view)?;
    }
    for accessor in lod.accessors.into_vec() {
        merged.accessors.append(accessor)?;
    }
    for image in lod.images.into_vec() {
        merged.images.append(image)?;
    }
    merged.samplers.append(&mut lod.samplers);
    merged.textures.append(&mut lod.textures);
    merged.materials.append(&mut lod.materials);
    merged.meshes.append(&mut lod.meshes);
    merged.nodes.append(&mut lod.nodes);
    merged.skins.append(&mut lod.skins);
    merged.cameras.append(&mut lod.cameras);
    merge_animations(&mut merged.animations, lod.animations);

    for name in lod.extensions_used.iter() {
        merged.add_extension_used(name);
    }
    for name in lod.extensions_required {
        if !merged.extensions_required.contains(&name) {
            merged.extensions_required.push(name);
        }
    }
    merged.add_extension_used(EXTENSION_MSFT_LOD);

    for (primary, lod) in primary_roots.iter().zip(&lod_roots) {
        for (&root, &lod_root) in primary.iter().zip(lod) {
            if let Some(ids) = node_lods.get_mut(root) {
                ids.push(lod_root + offsets.nodes);
            }
        }
    }
    Ok(())
}

/// Give typed records fresh positional ids and rebase their references
fn rebase_typed(lod: &mut Document, offsets: &Offsets, relative_path: &str) -> Result<()> {
    let buffer_ids = rebased_ids(&lod.buffers, offsets.buffers);
    let view_ids = rebased_ids(&lod.buffer_views, offsets.buffer_views);
    let accessor_ids = rebased_ids(&lod.accessors, offsets.accessors);
    let image_ids = rebased_ids(&lod.images, offsets.images);

    let lookup = |ids: &HashMap<String, String>, id: &str, kind: &str| {
        ids.get(id)
            .cloned()
            .ok_or_else(|| GltfError::format(format!("LOD references missing {kind} '{id}'")))
    };

    let mut buffers: Collection<Buffer> = Collection::new();
    for mut buffer in std::mem::take(&mut lod.buffers).into_vec() {
        buffer.id = lookup(&buffer_ids, &buffer.id, "buffer")?;
        buffer.uri = buffer.uri.map(|uri| prefix_relative(relative_path, uri));
        buffers.append(buffer)?;
    }
    lod.buffers = buffers;

    let mut views: Collection<BufferView> = Collection::new();
    for mut view in std::mem::take(&mut lod.buffer_views).into_vec() {
        view.id = lookup(&view_ids, &view.id, "bufferView")?;
        view.buffer = lookup(&buffer_ids, &view.buffer, "buffer")?;
        views.append(view)?;
    }
    lod.buffer_views = views;

    let mut accessors: Collection<Accessor> = Collection::new();
    for mut accessor in std::mem::take(&mut lod.accessors).into_vec() {
        accessor.id = lookup(&accessor_ids, &accessor.id, "accessor")?;
        if let Some(view) = &accessor.buffer_view {
            accessor.buffer_view = Some(lookup(&view_ids, view, "bufferView")?);
        }
        if let Some(sparse) = &mut accessor.sparse {
            sparse.indices_buffer_view = lookup(&view_ids, &sparse.indices_buffer_view, "bufferView")?;
            sparse.values_buffer_view = lookup(&view_ids, &sparse.values_buffer_view, "bufferView")?;
        }
        accessors.append(accessor)?;
    }
    lod.accessors = accessors;

    let mut images: Collection<Image> = Collection::new();
    for mut image in std::mem::take(&mut lod.images).into_vec() {
        image.id = lookup(&image_ids, &image.id, "image")?;
        if let Some(view) = &image.buffer_view {
            image.buffer_view = Some(lookup(&view_ids, view, "bufferView")?);
        }
        image.uri = image.uri.map(|uri| prefix_relative(relative_path, uri));
        images.append(image)?;
    }
    lod.images = images;

    Ok(())
}

fn rebased_ids<T: Element>(collection: &Collection<T>, offset: usize) -> HashMap<String, String> {
    collection
        .iter()
        .enumerate()
        .map(|(i, element)| (element.id().to_string(), (i + offset).to_string()))
        .collect()
}

fn prefix_relative(prefix: &str, uri: String) -> String {
    let is_relative = !uri.starts_with("data:")
        && !uri.contains("://")
        && !uri.starts_with('/')
        && !Path::new(&uri).is_absolute();
    if prefix.is_empty() || !is_relative {
        uri
    } else {
        format!("{prefix}{uri}")
    }
}

fn add_offset(object: &mut Map<String, Value>, key: &str, offset: usize) {
    if let Some(index) = index_member(object, key) {
        object.insert(key.to_string(), Value::from(index + offset));
    }
}

fn add_offset_all(value: Option<&mut Value>, offset: usize) {
    let Some(Value::Array(items)) = value else {
        return;
    };
    for item in items {
        if let Some(index) = item.as_u64() {
            *item = Value::from(index + offset as u64);
        }
    }
}

/// Visit every texture-info object (`normalTexture`,
/// `pbrMetallicRoughness.baseColorTexture`, extension textures, ...)
fn visit_texture_infos<F>(value: &mut Value, f: &mut F)
where
    F: FnMut(&mut Map<String, Value>),
{
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                if key.ends_with("Texture") {
                    if let Some(info) = child.as_object_mut() {
                        f(info);
                    }
                }
                visit_texture_infos(child, f);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_texture_infos(item, f);
            }
        }
        _ => {}
    }
}

/// A material with its texture indices removed, for matching across LODs
fn material_key(material: &Value) -> Value {
    let mut key = material.clone();
    visit_texture_infos(&mut key, &mut |info| {
        info.remove("index");
    });
    key
}

/// Point LOD primitives at the matching primary materials and drop the LOD's own
/// samplers, images, textures and materials
fn share_primary_materials(merged: &Document, lod: &mut Document) -> Result<()> {
    let primary_keys: Vec<Value> = merged.materials.iter().map(material_key).collect();
    let lod_keys: Vec<Value> = lod.materials.iter().map(material_key).collect();

    let primitives = lod
        .meshes
        .iter_mut()
        .filter_map(|mesh| mesh.get_mut("primitives"))
        .filter_map(Value::as_array_mut)
        .flatten()
        .filter_map(Value::as_object_mut);
    for primitive in primitives {
        let Some(local) = index_member(primitive, "material") else {
            continue;
        };
        let key = lod_keys.get(local).ok_or_else(|| {
            GltfError::format(format!("LOD primitive references missing material {local}"))
        })?;
        let shared = primary_keys.iter().position(|k| k == key).ok_or_else(|| {
            GltfError::format(format!(
                "shared material {} is missing from the primary",
                key.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
            ))
        })?;
        primitive.insert("material".to_string(), Value::from(shared));
    }

    lod.samplers.clear();
    lod.images.clear();
    lod.textures.clear();
    lod.materials.clear();
    Ok(())
}

fn suffix_name(element: &mut Value, label: &str) {
    if let Some(Value::String(name)) = element.get_mut("name") {
        name.push_str(label);
    }
}

/// Merge LOD animations into the primary animation with the same index; extra ones are appended
fn merge_animations(primary: &mut Vec<Value>, lod: Vec<Value>) {
    for (i, mut animation) in lod.into_iter().enumerate() {
        let Some(base) = primary.get_mut(i) else {
            primary.push(animation);
            continue;
        };

        let sampler_offset = base
            .get("samplers")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let channels = animation
            .get_mut("channels")
            .and_then(Value::as_array_mut)
            .map(std::mem::take)
            .unwrap_or_default();
        let samplers = animation
            .get_mut("samplers")
            .and_then(Value::as_array_mut)
            .map(std::mem::take)
            .unwrap_or_default();

        let Some(base) = base.as_object_mut() else {
            continue;
        };
        let base_samplers = base
            .entry("samplers")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(base_samplers) = base_samplers.as_array_mut() {
            base_samplers.extend(samplers);
        }
        let base_channels = base
            .entry("channels")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(base_channels) = base_channels.as_array_mut() {
            base_channels.extend(channels.into_iter().map(|mut channel| {
                if let Some(channel) = channel.as_object_mut() {
                    add_offset(channel, "sampler", sampler_offset);
                }
                channel
            }));
        }
    }
}

/// Merge LOD files into one output. Inputs are packed first so `.glb` and `.gltf`
/// sources mix freely; the output is a `.glb` when its extension says so and a
/// `.gltf` with an external buffer otherwise.
pub fn merge_lod_files(
    inputs: &[PathBuf],
    output: &Path,
    screen_coverage: &[f64],
    shared_materials: bool,
) -> Result<PackSummary> {
    let mut streams = MemoryStreamReader::new();
    let mut documents = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let (document, mut reader) = open_document(input)?;
        let (mut packed, _) = pack_document(&document, &mut reader, &PackOptions::default())?;

        let uri = format!("lod{i}.bin");
        if let Some(buffer) = packed.document.buffers.iter_mut().next() {
            buffer.uri = Some(uri.clone());
        }
        streams.insert(uri, packed.bin);
        tracing::debug!("Loaded LOD {} from {}", i, input.display());
        documents.push(packed.document);
    }

    let options = LodOptions {
        screen_coverage: screen_coverage.to_vec(),
        shared_materials,
        ..Default::default()
    };
    let merged = merge_documents_as_lods(&documents, &options)?;

    let mut reader = ResourceReader::new(streams);
    let is_glb = output
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("glb"));
    let summary = if is_glb {
        let mut glb = Vec::new();
        let summary = pack_to_writer(&merged, &mut reader, &mut glb, &PackOptions::default())?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, glb)?;
        summary
    } else {
        write_gltf_file(&merged, &mut reader, output, &PackOptions::default())?
    };

    tracing::info!(
        "Merged {} LODs into {} ({} levels)",
        inputs.len(),
        output.display(),
        node_lod_levels(&merged)
    );
    Ok(summary)
}
