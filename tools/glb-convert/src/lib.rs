//! glTF container conversion
//!
//! - [`pack`]: gather a document's external buffers and images into one GLB buffer
//! - [`unpack`]: externalize images and extension blobs of a GLB and compact the rest
//! - [`lod`]: merge documents as `MSFT_lod` node levels
//! - [`config`]: batch jobs described by `glb-convert.toml`

pub mod config;
pub mod lod;
pub mod mime;
pub mod pack;
pub mod resource;
pub mod stream;
pub mod unpack;

pub use lod::{LodOptions, merge_documents_as_lods, merge_lod_files, node_lod_levels, parse_node_lods};
pub use pack::{PackOptions, PackSummary, PackedGlb, pack_document, pack_file, pack_to_writer};
pub use resource::{ResourceReader, open_document};
pub use stream::{
    ContainerSource, FileStreamReader, FileStreamWriter, MemoryStreamReader, MemoryStreamWriter,
    StreamReader, StreamWriter,
};
pub use unpack::{UnpackPlan, UnpackSummary, create_unpacked_document, unpack_file, unpack_source};
