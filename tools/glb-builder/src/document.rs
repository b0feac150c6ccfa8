//! In-memory glTF document model
//!
//! Buffers, buffer views, accessors and images are typed records addressed by string ids.
//! Everything the binary layout never touches (meshes, nodes, materials, ...) is carried
//! as opaque JSON so it survives a parse/serialize cycle unchanged.

use crate::error::{GltfError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Named extension payloads attached to an element
pub type Extensions = BTreeMap<String, Value>;

/// Numeric width of a single accessor component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    U32,
    F32,
}

impl ComponentType {
    /// Map a GL enum (5120..=5126) to a component type
    pub fn from_gl(code: u32) -> Result<Self> {
        match code {
            5120 => Ok(Self::I8),
            5121 => Ok(Self::U8),
            5122 => Ok(Self::I16),
            5123 => Ok(Self::U16),
            5125 => Ok(Self::U32),
            5126 => Ok(Self::F32),
            other => Err(GltfError::unsupported_type("componentType", other)),
        }
    }

    pub fn gl_code(self) -> u32 {
        match self {
            Self::I8 => 5120,
            Self::U8 => 5121,
            Self::I16 => 5122,
            Self::U16 => 5123,
            Self::U32 => 5125,
            Self::F32 => 5126,
        }
    }

    /// Size of one component in bytes
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::U32 | Self::F32 => 4,
        }
    }
}

/// Shape of one accessor element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorType {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl AccessorType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "SCALAR" => Ok(Self::Scalar),
            "VEC2" => Ok(Self::Vec2),
            "VEC3" => Ok(Self::Vec3),
            "VEC4" => Ok(Self::Vec4),
            "MAT2" => Ok(Self::Mat2),
            "MAT3" => Ok(Self::Mat3),
            "MAT4" => Ok(Self::Mat4),
            other => Err(GltfError::unsupported_type("accessor type", other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scalar => "SCALAR",
            Self::Vec2 => "VEC2",
            Self::Vec3 => "VEC3",
            Self::Vec4 => "VEC4",
            Self::Mat2 => "MAT2",
            Self::Mat3 => "MAT3",
            Self::Mat4 => "MAT4",
        }
    }

    /// Number of components in one element
    pub fn component_count(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 | Self::Mat2 => 4,
            Self::Mat3 => 9,
            Self::Mat4 => 16,
        }
    }
}

/// GPU usage hint for a buffer view. Absent means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferViewTarget {
    /// Vertex attribute data (ARRAY_BUFFER)
    Vertex,
    /// Index data (ELEMENT_ARRAY_BUFFER)
    Index,
}

impl BufferViewTarget {
    pub fn from_gl(code: u32) -> Result<Self> {
        match code {
            34962 => Ok(Self::Vertex),
            34963 => Ok(Self::Index),
            other => Err(GltfError::unsupported_type("bufferView target", other)),
        }
    }

    pub fn gl_code(self) -> u32 {
        match self {
            Self::Vertex => 34962,
            Self::Index => 34963,
        }
    }
}

/// Anything stored in a [`Collection`]
pub trait Element {
    fn id(&self) -> &str;
}

/// Insertion-ordered, id-addressed container of document records
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Element> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn elements(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    /// Position of the record with `id`; this is the index used in the JSON manifest
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    /// Most recently appended record
    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.items.last_mut()
    }

    /// Append a record. Duplicate ids are rejected.
    pub fn append(&mut self, item: T) -> Result<&T> {
        if self.contains(item.id()) {
            return Err(GltfError::format(format!(
                "duplicate id '{}' in collection",
                item.id()
            )));
        }
        self.items.push(item);
        Ok(&self.items[self.items.len() - 1])
    }

    /// Replace the record that has the same id as `item`
    pub fn replace(&mut self, item: T) -> Result<()> {
        match self.index_of(item.id()) {
            Some(index) => {
                self.items[index] = item;
                Ok(())
            }
            None => Err(GltfError::format(format!(
                "cannot replace missing id '{}'",
                item.id()
            ))),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<'a, T> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// A binary blob, either external (`uri`) or the embedded GLB chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buffer {
    pub id: String,
    pub byte_length: usize,
    pub uri: Option<String>,
    pub name: Option<String>,
    pub extensions: Extensions,
    pub extras: Option<Value>,
}

/// A byte range within a buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferView {
    pub id: String,
    pub buffer: String,
    pub byte_offset: usize,
    pub byte_length: usize,
    pub byte_stride: Option<usize>,
    pub target: Option<BufferViewTarget>,
    pub name: Option<String>,
    pub extensions: Extensions,
    pub extras: Option<Value>,
}

/// Typed interpretation of a byte range as an array of elements
#[derive(Debug, Clone, PartialEq)]
pub struct Accessor {
    pub id: String,
    /// Absent for accessors that are all zeros (optionally patched by `sparse`)
    pub buffer_view: Option<String>,
    /// Offset relative to the start of the buffer view
    pub byte_offset: usize,
    pub count: usize,
    pub component_type: ComponentType,
    pub accessor_type: AccessorType,
    pub normalized: bool,
    /// Per-component bounds; empty when not declared
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub sparse: Option<Sparse>,
    pub name: Option<String>,
    pub extensions: Extensions,
    pub extras: Option<Value>,
}

impl Accessor {
    /// Create an accessor with no data reference and no bounds
    pub fn new(
        id: impl Into<String>,
        count: usize,
        component_type: ComponentType,
        accessor_type: AccessorType,
    ) -> Self {
        Self {
            id: id.into(),
            buffer_view: None,
            byte_offset: 0,
            count,
            component_type,
            accessor_type,
            normalized: false,
            min: Vec::new(),
            max: Vec::new(),
            sparse: None,
            name: None,
            extensions: Extensions::new(),
            extras: None,
        }
    }

    /// Size of one element in bytes
    pub fn element_size(&self) -> usize {
        self.component_type.size() * self.accessor_type.component_count()
    }

    /// Tightly packed byte length of all elements
    pub fn byte_length(&self) -> usize {
        self.element_size() * self.count
    }
}

/// Sparse substitution block of an accessor
#[derive(Debug, Clone, PartialEq)]
pub struct Sparse {
    pub count: usize,
    pub indices_buffer_view: String,
    pub indices_byte_offset: usize,
    pub indices_component_type: ComponentType,
    pub values_buffer_view: String,
    pub values_byte_offset: usize,
}

/// Image payload, referenced either by `uri` or by `buffer_view`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    pub id: String,
    pub uri: Option<String>,
    pub buffer_view: Option<String>,
    pub mime_type: Option<String>,
    pub name: Option<String>,
    pub extensions: Extensions,
    pub extras: Option<Value>,
}

impl Element for Buffer {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Element for BufferView {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Element for Accessor {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Element for Image {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A complete glTF document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub asset: Value,
    pub scene: Option<usize>,
    pub buffers: Collection<Buffer>,
    pub buffer_views: Collection<BufferView>,
    pub accessors: Collection<Accessor>,
    pub images: Collection<Image>,
    pub meshes: Vec<Value>,
    pub nodes: Vec<Value>,
    pub materials: Vec<Value>,
    pub textures: Vec<Value>,
    pub samplers: Vec<Value>,
    pub scenes: Vec<Value>,
    pub skins: Vec<Value>,
    pub animations: Vec<Value>,
    pub cameras: Vec<Value>,
    pub extensions_used: Vec<String>,
    pub extensions_required: Vec<String>,
    pub extensions: Extensions,
    pub extras: Option<Value>,
    /// Unrecognised top-level members, kept verbatim
    pub other: Map<String, Value>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            asset: default_asset(),
            scene: None,
            buffers: Collection::new(),
            buffer_views: Collection::new(),
            accessors: Collection::new(),
            images: Collection::new(),
            meshes: Vec::new(),
            nodes: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
            samplers: Vec::new(),
            scenes: Vec::new(),
            skins: Vec::new(),
            animations: Vec::new(),
            cameras: Vec::new(),
            extensions_used: Vec::new(),
            extensions_required: Vec::new(),
            extensions: Extensions::new(),
            extras: None,
            other: Map::new(),
        }
    }
}

pub(crate) fn default_asset() -> Value {
    serde_json::json!({ "version": "2.0" })
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an extension name in `extensionsUsed` once
    pub fn add_extension_used(&mut self, name: &str) {
        if !self.extensions_used.iter().any(|used| used == name) {
            self.extensions_used.push(name.to_string());
        }
    }

    /// The buffer view an accessor reads from, if any
    pub fn accessor_view(&self, accessor: &Accessor) -> Result<Option<&BufferView>> {
        match &accessor.buffer_view {
            Some(id) => self.buffer_views.get(id).map(Some).ok_or_else(|| {
                GltfError::format(format!(
                    "accessor '{}' references missing bufferView '{}'",
                    accessor.id, id
                ))
            }),
            None => Ok(None),
        }
    }

    /// Check that every view range lies inside its buffer
    pub fn validate_view_ranges(&self) -> Result<()> {
        for view in &self.buffer_views {
            let buffer = self.buffers.get(&view.buffer).ok_or_else(|| {
                GltfError::format(format!(
                    "bufferView '{}' references missing buffer '{}'",
                    view.id, view.buffer
                ))
            })?;
            let in_range = view
                .byte_offset
                .checked_add(view.byte_length)
                .is_some_and(|end| end <= buffer.byte_length);
            if !in_range {
                return Err(GltfError::format(format!(
                    "bufferView '{}' ({} bytes at {}) exceeds buffer '{}' length {}",
                    view.id, view.byte_length, view.byte_offset, buffer.id, buffer.byte_length
                )));
            }
        }
        Ok(())
    }
}
