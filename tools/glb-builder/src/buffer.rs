//! Append-only buffer layout with automatic alignment and accessor validation
//!
//! The builder stages new buffers, views and accessors, hands every byte range to a
//! [`ResourceWriter`] and only merges the staged records into a [`Document`] on
//! [`BufferBuilder::output`].

use crate::component::{Component, compute_min_max};
use crate::document::{
    Accessor, AccessorType, Buffer, BufferView, BufferViewTarget, Collection, ComponentType,
    Document,
};
use crate::error::{GltfError, Result};
use crate::writer::ResourceWriter;

/// Number of records staged in a builder, the sole input of an [`IdGenerator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementCounts {
    pub buffers: usize,
    pub buffer_views: usize,
    pub accessors: usize,
}

/// Produces the id of the next record from the current counts
pub type IdGenerator = Box<dyn Fn(&ElementCounts) -> String + Send + Sync>;

/// Id strategies for each record kind
pub struct IdGenerators {
    pub buffer: IdGenerator,
    pub buffer_view: IdGenerator,
    pub accessor: IdGenerator,
}

impl Default for IdGenerators {
    /// Monotonic decimal ids: the n-th staged record gets `"n"`
    fn default() -> Self {
        Self {
            buffer: Box::new(|counts| counts.buffers.to_string()),
            buffer_view: Box::new(|counts| counts.buffer_views.to_string()),
            accessor: Box::new(|counts| counts.accessors.to_string()),
        }
    }
}

impl IdGenerators {
    /// Decimal ids that continue after the records `document` already owns
    pub fn continuing(document: &Document) -> Self {
        let buffers = document.buffers.len();
        let views = document.buffer_views.len();
        let accessors = document.accessors.len();
        Self {
            buffer: Box::new(move |counts| (buffers + counts.buffers).to_string()),
            buffer_view: Box::new(move |counts| (views + counts.buffer_views).to_string()),
            accessor: Box::new(move |counts| (accessors + counts.accessors).to_string()),
        }
    }
}

/// Layout options for a view created with [`BufferBuilder::add_buffer_view_data`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOptions {
    pub id: Option<String>,
    pub byte_stride: Option<usize>,
    pub target: Option<BufferViewTarget>,
    /// Required alignment of the view start within its buffer
    pub alignment: usize,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            id: None,
            byte_stride: None,
            target: None,
            alignment: 1,
        }
    }
}

impl ViewOptions {
    /// Unaligned, untargeted view with a generated id
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `id` instead of the generated one
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Distance between element starts for interleaved data
    pub fn byte_stride(mut self, stride: usize) -> Self {
        self.byte_stride = Some(stride);
        self
    }

    /// GPU usage hint (vertex or index data)
    pub fn target(mut self, target: BufferViewTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Pad the view start to a multiple of `alignment`
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Shape of an accessor to be added through the builder
#[derive(Debug, Clone, PartialEq)]
pub struct AccessorDesc {
    pub count: usize,
    pub component_type: ComponentType,
    pub accessor_type: AccessorType,
    /// Offset within the view; only used by [`BufferBuilder::add_accessors`]
    /// and [`BufferBuilder::add_accessor_desc`]
    pub byte_offset: usize,
    pub normalized: bool,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl AccessorDesc {
    /// Tightly packed accessor at the start of its view, without bounds
    pub fn new(count: usize, component_type: ComponentType, accessor_type: AccessorType) -> Self {
        Self {
            count,
            component_type,
            accessor_type,
            byte_offset: 0,
            normalized: false,
            min: Vec::new(),
            max: Vec::new(),
        }
    }

    /// Place the accessor `byte_offset` bytes into its view
    pub fn with_offset(mut self, byte_offset: usize) -> Self {
        self.byte_offset = byte_offset;
        self
    }

    /// Per-component min/max, one entry per component
    pub fn with_bounds(mut self, min: Vec<f64>, max: Vec<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn normalized(mut self, normalized: bool) -> Self {
        self.normalized = normalized;
        self
    }

    /// Size of one element in bytes
    pub fn element_size(&self) -> usize {
        self.component_type.size() * self.accessor_type.component_count()
    }

    /// Bytes covered by this accessor when its elements are `stride` apart
    pub fn extent(&self, stride: Option<usize>) -> usize {
        match stride {
            Some(stride) if self.count > 0 => {
                self.byte_offset + stride * (self.count - 1) + self.element_size()
            }
            _ => self.byte_offset + self.element_size() * self.count,
        }
    }
}

/// Round `offset` up to the next multiple of `alignment`
pub fn align_offset(offset: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return offset;
    }
    match offset % alignment {
        0 => offset,
        rem => offset + alignment - rem,
    }
}

/// Incremental allocator of buffers, views and accessors
pub struct BufferBuilder<W: ResourceWriter> {
    writer: W,
    ids: IdGenerators,
    buffers: Collection<Buffer>,
    buffer_views: Collection<BufferView>,
    accessors: Collection<Accessor>,
}

impl<W: ResourceWriter> BufferBuilder<W> {
    /// Create a builder with decimal ids
    pub fn new(writer: W) -> Self {
        Self::with_ids(writer, IdGenerators::default())
    }

    /// Create a builder whose ids come from `ids`, e.g. [`IdGenerators::continuing`]
    /// when the output is merged into a document that already has elements
    pub fn with_ids(writer: W, ids: IdGenerators) -> Self {
        Self {
            writer,
            ids,
            buffers: Collection::new(),
            buffer_views: Collection::new(),
            accessors: Collection::new(),
        }
    }

    /// Staged element counts, as passed to the id generators
    pub fn counts(&self) -> ElementCounts {
        ElementCounts {
            buffers: self.buffers.len(),
            buffer_views: self.buffer_views.len(),
            accessors: self.accessors.len(),
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_view_count(&self) -> usize {
        self.buffer_views.len()
    }

    pub fn accessor_count(&self) -> usize {
        self.accessors.len()
    }

    pub fn current_buffer(&self) -> Option<&Buffer> {
        self.buffers.last()
    }

    pub fn current_buffer_view(&self) -> Option<&BufferView> {
        self.buffer_views.last()
    }

    pub fn current_accessor(&self) -> Option<&Accessor> {
        self.accessors.last()
    }

    /// Staged records, in insertion order
    pub fn buffers(&self) -> &[Buffer] {
        self.buffers.elements()
    }

    pub fn buffer_views(&self) -> &[BufferView] {
        self.buffer_views.elements()
    }

    pub fn accessors(&self) -> &[Accessor] {
        self.accessors.elements()
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Open a new empty buffer. It becomes the target of every following view.
    pub fn add_buffer(&mut self, id: Option<&str>) -> Result<&Buffer> {
        let id = match id {
            Some(id) => id.to_string(),
            None => (self.ids.buffer)(&self.counts()),
        };
        let uri = self.writer.buffer_uri(&id);
        self.buffers.append(Buffer {
            id,
            uri,
            ..Default::default()
        })
    }

    /// Open an empty view at the end of the current buffer for subsequent accessor writes
    pub fn add_buffer_view(
        &mut self,
        target: Option<BufferViewTarget>,
        id: Option<String>,
    ) -> Result<&BufferView> {
        let buffer = self.require_buffer()?;
        let view = BufferView {
            id: id.unwrap_or_else(|| (self.ids.buffer_view)(&self.counts())),
            buffer: buffer.id.clone(),
            byte_offset: buffer.byte_length,
            target,
            ..Default::default()
        };
        self.buffer_views.append(view)
    }

    /// Append a view holding `data`, written immediately
    pub fn add_buffer_view_data(&mut self, data: &[u8], options: ViewOptions) -> Result<&BufferView> {
        if options.byte_stride == Some(0) {
            return Err(GltfError::format("byteStride must be greater than zero"));
        }

        let buffer = self.require_buffer()?;
        let buffer_id = buffer.id.clone();
        let byte_offset = align_offset(buffer.byte_length, options.alignment);
        let id = options
            .id
            .unwrap_or_else(|| (self.ids.buffer_view)(&self.counts()));
        if self.buffer_views.contains(&id) {
            return Err(GltfError::format(format!("duplicate bufferView id '{id}'")));
        }

        self.writer.write(&buffer_id, byte_offset, data)?;
        tracing::debug!(
            "bufferView {} at {}..{} of buffer {}",
            id,
            byte_offset,
            byte_offset + data.len(),
            buffer_id
        );

        self.require_buffer_mut()?.byte_length = byte_offset + data.len();
        self.buffer_views.append(BufferView {
            id,
            buffer: buffer_id,
            byte_offset,
            byte_length: data.len(),
            byte_stride: options.byte_stride,
            target: options.target,
            ..Default::default()
        })
    }

    /// Append one tightly packed accessor to the end of the open view.
    ///
    /// `data` must hold exactly `count` elements. If the view is still empty its start is
    /// first padded to the component size. `desc.byte_offset` is ignored.
    pub fn add_accessor(&mut self, data: &[u8], desc: AccessorDesc) -> Result<&Accessor> {
        let expected = desc.element_size() * desc.count;
        if data.len() != expected {
            return Err(GltfError::format(format!(
                "accessor data is {} bytes, expected {} ({} elements of {} bytes)",
                data.len(),
                expected,
                desc.count,
                desc.element_size()
            )));
        }

        let (buffer_id, view_offset, byte_offset) = {
            let view = self.require_view()?;
            let view_offset = if view.byte_length == 0 {
                align_offset(view.byte_offset, desc.component_type.size())
            } else {
                view.byte_offset
            };
            (view.buffer.clone(), view_offset, view.byte_length)
        };

        let desc = desc.with_offset(byte_offset);
        let accessor = self.create_accessor(&desc, view_offset, 0)?;
        self.writer
            .write(&buffer_id, view_offset + byte_offset, data)?;

        let view = self.require_view_mut()?;
        view.byte_offset = view_offset;
        view.byte_length += expected;
        let buffer_length = view.byte_offset + view.byte_length;
        self.require_buffer_mut()?.byte_length = buffer_length;

        self.accessors.append(accessor)
    }

    /// Append typed `values`, computing min/max when none are given
    pub fn add_accessor_data<T: Component>(
        &mut self,
        values: &[T],
        accessor_type: AccessorType,
        bounds: Option<(Vec<f64>, Vec<f64>)>,
    ) -> Result<&Accessor> {
        let components = accessor_type.component_count();
        if values.len() % components != 0 {
            return Err(GltfError::format(format!(
                "{} values do not form whole {} elements",
                values.len(),
                accessor_type.name()
            )));
        }
        let (min, max) = bounds.unwrap_or_else(|| compute_min_max(values, components));
        let desc = AccessorDesc::new(values.len() / components, T::COMPONENT_TYPE, accessor_type)
            .with_bounds(min, max);
        self.add_accessor(bytemuck::cast_slice(values), desc)
    }

    /// Register an accessor over bytes the open view already holds
    pub fn add_accessor_desc(&mut self, desc: AccessorDesc) -> Result<&Accessor> {
        let view = self.require_view()?;
        let extent = desc.extent(view.byte_stride);
        if extent > view.byte_length {
            return Err(GltfError::format(format!(
                "accessor extent {} exceeds bufferView '{}' length {}",
                extent, view.id, view.byte_length
            )));
        }
        let accessor = self.create_accessor(&desc, view.byte_offset, 0)?;
        self.accessors.append(accessor)
    }

    /// Write one interleaved block into the empty open view and register each accessor
    /// at its offset within the block. Returns the new accessor ids in `descs` order.
    pub fn add_accessors(
        &mut self,
        data: &[u8],
        byte_stride: Option<usize>,
        descs: &[AccessorDesc],
    ) -> Result<Vec<String>> {
        let (buffer_id, view_offset) = {
            let view = self.require_view()?;
            if view.byte_length != 0 {
                return Err(GltfError::format(format!(
                    "bufferView '{}' already holds data and cannot be appended to",
                    view.id
                )));
            }
            let alignment = descs
                .iter()
                .map(|desc| desc.component_type.size())
                .max()
                .unwrap_or(1);
            (view.buffer.clone(), align_offset(view.byte_offset, alignment))
        };

        let mut extent = 0;
        let mut accessors = Vec::with_capacity(descs.len());
        for (i, desc) in descs.iter().enumerate() {
            if let Some(stride) = byte_stride {
                if desc.byte_offset + desc.element_size() > stride {
                    return Err(GltfError::format(format!(
                        "interleaved element at offset {} does not fit stride {}",
                        desc.byte_offset, stride
                    )));
                }
            }
            extent = extent.max(desc.extent(byte_stride));
            accessors.push(self.create_accessor(desc, view_offset, i)?);
        }
        if data.len() < extent {
            return Err(GltfError::format(format!(
                "interleaved data is {} bytes but the accessors span {}",
                data.len(),
                extent
            )));
        }

        self.writer.write(&buffer_id, view_offset, &data[..extent])?;
        tracing::debug!(
            "{} interleaved accessors in {} bytes at offset {}",
            descs.len(),
            extent,
            view_offset
        );

        let view = self.require_view_mut()?;
        view.byte_offset = view_offset;
        view.byte_length = extent;
        view.byte_stride = byte_stride;
        self.require_buffer_mut()?.byte_length = view_offset + extent;

        let mut ids = Vec::with_capacity(accessors.len());
        for accessor in accessors {
            ids.push(self.accessors.append(accessor)?.id.clone());
        }
        Ok(ids)
    }

    /// Move every staged record into `document` and clear the staging lists.
    ///
    /// Fails without moving anything if a staged id already exists in the document.
    pub fn output(&mut self, document: &mut Document) -> Result<()> {
        let collision = self
            .buffers
            .iter()
            .find(|b| document.buffers.contains(&b.id))
            .map(|b| ("buffer", b.id.clone()))
            .or_else(|| {
                self.buffer_views
                    .iter()
                    .find(|v| document.buffer_views.contains(&v.id))
                    .map(|v| ("bufferView", v.id.clone()))
            })
            .or_else(|| {
                self.accessors
                    .iter()
                    .find(|a| document.accessors.contains(&a.id))
                    .map(|a| ("accessor", a.id.clone()))
            });
        if let Some((kind, id)) = collision {
            return Err(GltfError::format(format!(
                "{kind} id '{id}' already exists in the target document"
            )));
        }

        for buffer in std::mem::take(&mut self.buffers).into_vec() {
            document.buffers.append(buffer)?;
        }
        for view in std::mem::take(&mut self.buffer_views).into_vec() {
            document.buffer_views.append(view)?;
        }
        for accessor in std::mem::take(&mut self.accessors).into_vec() {
            document.accessors.append(accessor)?;
        }
        Ok(())
    }

    /// Validate `desc` against the open buffer and view, producing the accessor record.
    /// `pending` is the number of accessors created but not yet appended.
    fn create_accessor(
        &self,
        desc: &AccessorDesc,
        view_offset: usize,
        pending: usize,
    ) -> Result<Accessor> {
        let buffer = self.require_buffer()?;
        let view = self.require_view()?;

        if view.buffer != buffer.id {
            return Err(GltfError::format(format!(
                "bufferView '{}' belongs to buffer '{}', not the current buffer '{}'",
                view.id, view.buffer, buffer.id
            )));
        }
        if desc.count == 0 {
            return Err(GltfError::format("accessor count must be greater than zero"));
        }

        let components = desc.accessor_type.component_count();
        if (!desc.min.is_empty() || !desc.max.is_empty())
            && (desc.min.len() != components || desc.max.len() != components)
        {
            return Err(GltfError::format(format!(
                "{} accessor needs {} min and max values, got {} and {}",
                desc.accessor_type.name(),
                components,
                desc.min.len(),
                desc.max.len()
            )));
        }

        let size = desc.component_type.size();
        if desc.byte_offset % size != 0 {
            return Err(GltfError::format(format!(
                "accessor byteOffset {} is not a multiple of the component size {}",
                desc.byte_offset, size
            )));
        }
        if (view_offset + desc.byte_offset) % size != 0 {
            return Err(GltfError::format(format!(
                "accessor offset {} within the buffer is not a multiple of the component size {}",
                view_offset + desc.byte_offset,
                size
            )));
        }

        let mut counts = self.counts();
        counts.accessors += pending;
        let id = (self.ids.accessor)(&counts);
        if self.accessors.contains(&id) {
            return Err(GltfError::format(format!("duplicate accessor id '{id}'")));
        }

        let mut accessor = Accessor::new(id, desc.count, desc.component_type, desc.accessor_type);
        accessor.buffer_view = Some(view.id.clone());
        accessor.byte_offset = desc.byte_offset;
        accessor.normalized = desc.normalized;
        accessor.min = desc.min.clone();
        accessor.max = desc.max.clone();
        Ok(accessor)
    }

    fn require_buffer(&self) -> Result<&Buffer> {
        self.buffers
            .last()
            .ok_or_else(|| GltfError::format("no buffer has been added to the builder"))
    }

    fn require_buffer_mut(&mut self) -> Result<&mut Buffer> {
        self.buffers
            .last_mut()
            .ok_or_else(|| GltfError::format("no buffer has been added to the builder"))
    }

    fn require_view(&self) -> Result<&BufferView> {
        self.buffer_views
            .last()
            .ok_or_else(|| GltfError::format("no bufferView has been added to the builder"))
    }

    fn require_view_mut(&mut self) -> Result<&mut BufferView> {
        self.buffer_views
            .last_mut()
            .ok_or_else(|| GltfError::format("no bufferView has been added to the builder"))
    }
}
