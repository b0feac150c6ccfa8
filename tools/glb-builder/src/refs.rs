//! Generic walkers over index references held in opaque JSON
//!
//! Extension schemas are open-ended, so binary references inside them are found
//! structurally: any object with an integer `bufferView` (or a string `uri`) member.
//! Accessor indices held by meshes, skins and animations are rewritten through
//! [`remap_accessor_refs`].

use crate::document::{Document, Extensions};
use serde_json::{Map, Value};

/// Key marking an embedded binary reference
pub const BUFFER_VIEW_KEY: &str = "bufferView";
/// Key marking an external binary reference
pub const URI_KEY: &str = "uri";
/// Member name reported for a reference held directly by an extension payload
pub const PAYLOAD_MEMBER: &str = "data";

/// Integer index stored under `key`, if the member is a non-negative integer
pub fn index_member(object: &Map<String, Value>, key: &str) -> Option<usize> {
    object
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|index| usize::try_from(index).ok())
}

fn is_reference(object: &Map<String, Value>, key: &str) -> bool {
    match key {
        BUFFER_VIEW_KEY => index_member(object, key).is_some(),
        _ => object.get(key).is_some_and(Value::is_string),
    }
}

fn walk_objects<F>(value: &mut Value, member: &str, key: &str, f: &mut F)
where
    F: FnMut(&str, &mut Map<String, Value>),
{
    match value {
        Value::Object(object) => {
            if is_reference(object, key) {
                f(member, object);
            }
            for (child_key, child) in object.iter_mut() {
                walk_objects(child, child_key, key, f);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_objects(item, member, key, f);
            }
        }
        _ => {}
    }
}

/// Visit every object inside `value` (itself included) that references binary data
/// through `key`. The callback receives the member name holding the object: its key,
/// the key of the enclosing array, or `member` for `value` itself.
pub fn visit_references<F>(value: &mut Value, member: &str, key: &str, mut f: F)
where
    F: FnMut(&str, &mut Map<String, Value>),
{
    walk_objects(value, member, key, &mut f);
}

/// Visit binary references inside root-level extension payloads.
///
/// The callback receives `(extension name, member name, object)`.
pub fn visit_root_references<F>(extensions: &mut Extensions, key: &str, mut f: F)
where
    F: FnMut(&str, &str, &mut Map<String, Value>),
{
    for (name, payload) in extensions.iter_mut() {
        walk_objects(payload, PAYLOAD_MEMBER, key, &mut |member, object| {
            f(name, member, object)
        });
    }
}

fn walk_extension_maps<F>(value: &mut Value, f: &mut F)
where
    F: FnMut(&mut Map<String, Value>),
{
    match value {
        Value::Object(object) => {
            for (child_key, child) in object.iter_mut() {
                if child_key == "extensions" {
                    walk_objects(child, child_key, BUFFER_VIEW_KEY, &mut |_, object| f(object));
                } else {
                    walk_extension_maps(child, f);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_extension_maps(item, f);
            }
        }
        _ => {}
    }
}

/// Visit every `bufferView` reference held by element-level extensions
/// (compressed geometry and similar), anywhere below the document root.
pub fn visit_element_view_references<F>(document: &mut Document, mut f: F)
where
    F: FnMut(&mut Map<String, Value>),
{
    let members = [
        &mut document.meshes,
        &mut document.nodes,
        &mut document.materials,
        &mut document.textures,
        &mut document.samplers,
        &mut document.scenes,
        &mut document.skins,
        &mut document.animations,
        &mut document.cameras,
    ];
    for elements in members {
        for element in elements.iter_mut() {
            walk_extension_maps(element, &mut f);
        }
    }

    let typed = document
        .buffers
        .iter_mut()
        .map(|b| &mut b.extensions)
        .chain(document.buffer_views.iter_mut().map(|v| &mut v.extensions))
        .chain(document.accessors.iter_mut().map(|a| &mut a.extensions))
        .chain(document.images.iter_mut().map(|i| &mut i.extensions));
    for extensions in typed {
        for payload in extensions.values_mut() {
            walk_objects(payload, PAYLOAD_MEMBER, BUFFER_VIEW_KEY, &mut |_, object| {
                f(object)
            });
        }
    }
}

/// Rewrite the index under `key`; returns `true` when the reference was removed
fn remap_member<F>(object: &mut Map<String, Value>, key: &str, remap: &F) -> bool
where
    F: Fn(usize) -> Option<usize>,
{
    let Some(index) = index_member(object, key) else {
        return false;
    };
    match remap(index) {
        Some(new_index) => {
            object.insert(key.to_string(), Value::from(new_index));
            false
        }
        None => {
            object.remove(key);
            true
        }
    }
}

/// Rewrite every value of an attribute map (`{"POSITION": 0, ...}`)
fn remap_attribute_map<F>(value: Option<&mut Value>, remap: &F) -> usize
where
    F: Fn(usize) -> Option<usize>,
{
    let Some(Value::Object(attributes)) = value else {
        return 0;
    };
    let keys: Vec<String> = attributes.keys().cloned().collect();
    keys.iter()
        .filter(|key| remap_member(attributes, key, remap))
        .count()
}

/// Rewrite every accessor index held by meshes (attributes, indices, morph targets),
/// instanced nodes (`EXT_mesh_gpu_instancing` attributes), skins (inverseBindMatrices)
/// and animation samplers (input, output).
///
/// `remap` returns the new index, or `None` to drop the reference. Returns the number
/// of references dropped.
pub fn remap_accessor_refs<F>(document: &mut Document, remap: F) -> usize
where
    F: Fn(usize) -> Option<usize>,
{
    let mut dropped = 0;

    for mesh in &mut document.meshes {
        let Some(primitives) = mesh.get_mut("primitives").and_then(Value::as_array_mut) else {
            continue;
        };
        for primitive in primitives {
            let Some(primitive) = primitive.as_object_mut() else {
                continue;
            };
            dropped += remap_attribute_map(primitive.get_mut("attributes"), &remap);
            if remap_member(primitive, "indices", &remap) {
                dropped += 1;
            }
            if let Some(targets) = primitive.get_mut("targets").and_then(Value::as_array_mut) {
                for target in targets {
                    dropped += remap_attribute_map(Some(target), &remap);
                }
            }
        }
    }

    for node in &mut document.nodes {
        let attributes = node.pointer_mut("/extensions/EXT_mesh_gpu_instancing/attributes");
        dropped += remap_attribute_map(attributes, &remap);
    }

    for skin in &mut document.skins {
        if let Some(skin) = skin.as_object_mut() {
            if remap_member(skin, "inverseBindMatrices", &remap) {
                dropped += 1;
            }
        }
    }

    for animation in &mut document.animations {
        let Some(samplers) = animation.get_mut("samplers").and_then(Value::as_array_mut) else {
            continue;
        };
        for sampler in samplers.iter_mut().filter_map(Value::as_object_mut) {
            for key in ["input", "output"] {
                if remap_member(sampler, key, &remap) {
                    dropped += 1;
                }
            }
        }
    }

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_names() {
        let mut payload = json!({
            "bufferView": 1,
            "textures": [{ "bufferView": 2 }, { "bufferView": "bad" }],
            "nested": { "lut": { "bufferView": 3, "mimeType": "image/png" } }
        });
        let mut found = Vec::new();
        visit_references(&mut payload, PAYLOAD_MEMBER, BUFFER_VIEW_KEY, |member, object| {
            found.push((member.to_string(), index_member(object, BUFFER_VIEW_KEY).unwrap()));
        });
        found.sort();
        assert_eq!(
            found,
            vec![
                ("data".to_string(), 1),
                ("lut".to_string(), 3),
                ("textures".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_root_references_report_extension() {
        let mut extensions = Extensions::new();
        extensions.insert("EXT_lights_image_based".into(), json!({ "lights": [{ "uri": "a.bin" }] }));
        extensions.insert("EXT_flag".into(), json!(true));

        let mut found = Vec::new();
        visit_root_references(&mut extensions, URI_KEY, |name, member, object| {
            found.push(format!("{name}/{member}"));
            object.insert("seen".into(), json!(true));
        });
        assert_eq!(found, vec!["EXT_lights_image_based/lights"]);
        assert_eq!(extensions["EXT_lights_image_based"]["lights"][0]["seen"], json!(true));
    }

    #[test]
    fn test_element_level_references() {
        let mut doc = Document::new();
        doc.meshes.push(json!({
            "primitives": [{
                "attributes": { "POSITION": 0 },
                "extensions": {
                    "KHR_draco_mesh_compression": { "bufferView": 4, "attributes": { "POSITION": 0 } }
                }
            }]
        }));
        // Only extension payloads count, not plain members named bufferView
        doc.nodes.push(json!({ "bufferView": 9 }));

        let mut seen = Vec::new();
        visit_element_view_references(&mut doc, |object| {
            seen.push(index_member(object, BUFFER_VIEW_KEY).unwrap());
            object.insert(BUFFER_VIEW_KEY.into(), json!(1));
        });
        assert_eq!(seen, vec![4]);
        assert_eq!(
            doc.meshes[0]["primitives"][0]["extensions"]["KHR_draco_mesh_compression"]["bufferView"],
            json!(1)
        );
    }

    #[test]
    fn test_remap_accessor_refs() {
        let mut doc = Document::new();
        doc.meshes.push(json!({
            "primitives": [{
                "attributes": { "POSITION": 0, "NORMAL": 1 },
                "indices": 2,
                "targets": [{ "POSITION": 3 }]
            }]
        }));
        doc.nodes.push(json!({
            "mesh": 0,
            "extensions": {
                "EXT_mesh_gpu_instancing": { "attributes": { "TRANSLATION": 6, "SCALE": 1 } }
            }
        }));
        doc.skins.push(json!({ "joints": [0], "inverseBindMatrices": 4 }));
        doc.animations.push(json!({
            "channels": [],
            "samplers": [{ "input": 5, "output": 1 }]
        }));

        // Accessor 1 was dropped; everything above it shifts down by one
        let dropped = remap_accessor_refs(&mut doc, |i| match i {
            1 => None,
            0 => Some(0),
            i => Some(i - 1),
        });
        assert_eq!(dropped, 3);

        let primitive = &doc.meshes[0]["primitives"][0];
        assert_eq!(primitive["attributes"], json!({ "POSITION": 0 }));
        assert_eq!(primitive["indices"], json!(1));
        assert_eq!(primitive["targets"][0]["POSITION"], json!(2));
        assert_eq!(
            doc.nodes[0]["extensions"]["EXT_mesh_gpu_instancing"]["attributes"],
            json!({ "TRANSLATION": 5 })
        );
        assert_eq!(doc.skins[0]["inverseBindMatrices"], json!(3));
        assert_eq!(doc.animations[0]["samplers"][0], json!({ "input": 4 }));
    }
}
