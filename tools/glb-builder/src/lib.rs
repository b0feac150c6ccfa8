//! glTF document model and binary layout engine
//!
//! This library provides the pieces shared by the packing and unpacking tools:
//! - Document: typed buffers, views, accessors and images addressed by string ids
//! - BufferBuilder: append binary data with automatic alignment and validation
//! - GLB container reading and writing
//! - Generic walkers for index references held in opaque JSON
//!
//! # Example
//!
//! ```no_run
//! use glb_builder::*;
//!
//! let mut builder = BufferBuilder::new(GlbBufferWriter::new());
//! builder.add_buffer(None)?;
//! builder.add_buffer_view(Some(BufferViewTarget::Vertex), None)?;
//! builder.add_accessor_data(
//!     &[0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.5, 1.0, 0.0],
//!     AccessorType::Vec3,
//!     None,
//! )?;
//!
//! let mut doc = Document::new();
//! builder.output(&mut doc)?;
//!
//! let json = doc.to_json_string(false)?;
//! let glb_bytes = assemble_glb(json.as_bytes(), builder.writer().data())?;
//! # Ok::<(), GltfError>(())
//! ```

pub mod buffer;
pub mod component;
pub mod container;
pub mod document;
pub mod error;
pub mod manifest;
pub mod refs;
pub mod writer;

pub use buffer::{
    AccessorDesc, BufferBuilder, ElementCounts, IdGenerator, IdGenerators, ViewOptions,
    align_offset,
};
pub use component::{AccessorData, Component, compute_min_max, read_elements};
pub use container::{GlbLayout, GlbReader, assemble_glb, read_glb, write_glb};
pub use document::{
    Accessor, AccessorType, Buffer, BufferView, BufferViewTarget, Collection, ComponentType,
    Document, Element, Extensions, Image, Sparse,
};
pub use error::{GltfError, Result};
pub use writer::{ExternalBufferWriter, GlbBufferWriter, ResourceWriter};
