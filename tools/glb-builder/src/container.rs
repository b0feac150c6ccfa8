//! GLB container codec: 12-byte header, JSON chunk, optional BIN chunk

use crate::error::{GltfError, Result};
use std::io::{Read, Seek, SeekFrom, Write};

pub const GLB_MAGIC: &[u8; 4] = b"glTF";
pub const GLB_VERSION: u32 = 2;
pub const HEADER_LENGTH: usize = 12;
pub const CHUNK_HEADER_LENGTH: usize = 8;
/// "JSON"
pub const CHUNK_JSON: u32 = 0x4E4F534A;
/// "BIN\0"
pub const CHUNK_BIN: u32 = 0x004E4942;

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn length_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| GltfError::Container(format!("{what} length {len} does not fit in 32 bits")))
}

/// Write a GLB container. The binary chunk is omitted when `bin` is empty.
pub fn write_glb<W: Write>(out: &mut W, json: &[u8], bin: &[u8]) -> Result<()> {
    let json_padding = padding(json.len());
    let json_chunk_length = json.len() + json_padding;

    let bin_padding = padding(bin.len());
    let bin_chunk_length = bin.len() + bin_padding;
    let bin_total = if bin.is_empty() {
        0
    } else {
        CHUNK_HEADER_LENGTH + bin_chunk_length
    };

    let total_length = HEADER_LENGTH + CHUNK_HEADER_LENGTH + json_chunk_length + bin_total;

    // Header
    out.write_all(GLB_MAGIC)?;
    out.write_all(&GLB_VERSION.to_le_bytes())?;
    out.write_all(&length_u32(total_length, "container")?.to_le_bytes())?;

    // JSON chunk
    out.write_all(&length_u32(json_chunk_length, "JSON chunk")?.to_le_bytes())?;
    out.write_all(&CHUNK_JSON.to_le_bytes())?;
    out.write_all(json)?;
    out.write_all(&[0x20; 3][..json_padding])?;

    // Binary chunk
    if !bin.is_empty() {
        out.write_all(&length_u32(bin_chunk_length, "BIN chunk")?.to_le_bytes())?;
        out.write_all(&CHUNK_BIN.to_le_bytes())?;
        out.write_all(bin)?;
        out.write_all(&[0u8; 3][..bin_padding])?;
    }

    Ok(())
}

/// Assemble a GLB container in memory
pub fn assemble_glb(json: &[u8], bin: &[u8]) -> Result<Vec<u8>> {
    let mut glb = Vec::with_capacity(HEADER_LENGTH + 2 * CHUNK_HEADER_LENGTH + json.len() + bin.len() + 6);
    write_glb(&mut glb, json, bin)?;
    Ok(glb)
}

/// Chunk positions within a GLB container, in bytes from the start of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlbLayout {
    pub total_length: u64,
    pub json_offset: u64,
    pub json_length: u64,
    /// Start of the binary chunk's data, if the container has one
    pub bin_offset: Option<u64>,
    pub bin_length: u64,
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => GltfError::Container("truncated header".into()),
        _ => GltfError::Io(e),
    })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Random-access reader over a GLB container
pub struct GlbReader<R> {
    reader: R,
    layout: GlbLayout,
}

impl<R: Read + Seek> GlbReader<R> {
    /// Parse the header and chunk table
    pub fn new(mut reader: R) -> Result<Self> {
        let stream_length = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => GltfError::Container("file too short".into()),
            _ => GltfError::Io(e),
        })?;
        if &magic != GLB_MAGIC {
            return Err(GltfError::Container("missing glTF magic".into()));
        }

        let version = read_u32(&mut reader)?;
        if version != GLB_VERSION {
            return Err(GltfError::Container(format!("unsupported version {version}")));
        }

        let total_length = u64::from(read_u32(&mut reader)?);
        if total_length > stream_length {
            return Err(GltfError::Container(format!(
                "header declares {total_length} bytes but the file has {stream_length}"
            )));
        }

        let json_length = u64::from(read_u32(&mut reader)?);
        if read_u32(&mut reader)? != CHUNK_JSON {
            return Err(GltfError::Container("first chunk is not JSON".into()));
        }
        let json_offset = (HEADER_LENGTH + CHUNK_HEADER_LENGTH) as u64;
        let json_end = json_offset + json_length;
        if json_end > total_length {
            return Err(GltfError::Container(format!(
                "JSON chunk ends at {json_end}, past the container end {total_length}"
            )));
        }

        let mut bin_offset = None;
        let mut bin_length = 0;
        if json_end + CHUNK_HEADER_LENGTH as u64 <= total_length {
            reader.seek(SeekFrom::Start(json_end))?;
            let length = u64::from(read_u32(&mut reader)?);
            let chunk_type = read_u32(&mut reader)?;
            let data_offset = json_end + CHUNK_HEADER_LENGTH as u64;
            if chunk_type == CHUNK_BIN {
                if data_offset + length > total_length {
                    return Err(GltfError::Container(format!(
                        "BIN chunk of {length} bytes at {data_offset} exceeds the container"
                    )));
                }
                bin_offset = Some(data_offset);
                bin_length = length;
            }
        }

        Ok(Self {
            reader,
            layout: GlbLayout {
                total_length,
                json_offset,
                json_length,
                bin_offset,
                bin_length,
            },
        })
    }

    pub fn layout(&self) -> &GlbLayout {
        &self.layout
    }

    /// Raw manifest bytes, trailing padding included
    pub fn read_json(&mut self) -> Result<Vec<u8>> {
        let offset = self.layout.json_offset;
        let length = self.layout.json_length;
        self.read_at(offset, length)
    }

    /// Read `byte_length` bytes at `byte_offset` within the binary chunk
    pub fn read_bin(&mut self, byte_offset: u64, byte_length: u64) -> Result<Vec<u8>> {
        let bin_offset = self
            .layout
            .bin_offset
            .ok_or_else(|| GltfError::Container("container has no BIN chunk".into()))?;
        let in_range = byte_offset
            .checked_add(byte_length)
            .is_some_and(|end| end <= self.layout.bin_length);
        if !in_range {
            return Err(GltfError::Container(format!(
                "{} bytes at {} are outside the {}-byte BIN chunk",
                byte_length, byte_offset, self.layout.bin_length
            )));
        }
        self.read_at(bin_offset + byte_offset, byte_length)
    }

    /// Read `length` bytes at absolute container offset `offset`
    pub fn read_at(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let length = usize::try_from(length)
            .map_err(|_| GltfError::Container(format!("read of {length} bytes is too large")))?;
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Split an in-memory container into manifest and binary chunk data
pub fn read_glb(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut reader = GlbReader::new(std::io::Cursor::new(bytes))?;
    let json = reader.read_json()?;
    let bin_length = reader.layout().bin_length;
    let bin = match reader.layout().bin_offset {
        Some(_) => reader.read_bin(0, bin_length)?,
        None => Vec::new(),
    };
    Ok((json, bin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_padding() {
        let glb = assemble_glb(b"{\"a\":1}", &[1, 2, 3, 4, 5]).unwrap();
        // 12 + (8 + 8) + (8 + 8)
        assert_eq!(glb.len(), 44);
        assert_eq!(&glb[0..4], b"glTF");
        assert_eq!(u32::from_le_bytes(glb[8..12].try_into().unwrap()), 44);
        assert_eq!(&glb[20..28], b"{\"a\":1} ");
        assert_eq!(&glb[36..44], &[1, 2, 3, 4, 5, 0, 0, 0]);

        let reader = GlbReader::new(std::io::Cursor::new(&glb)).unwrap();
        assert_eq!(reader.layout().bin_offset, Some(36));
        assert_eq!(reader.layout().bin_length, 8);
    }

    #[test]
    fn test_empty_bin_chunk_omitted() {
        let glb = assemble_glb(b"{}", &[]).unwrap();
        assert_eq!(glb.len(), 24);
        let (json, bin) = read_glb(&glb).unwrap();
        assert_eq!(json, b"{}  ");
        assert!(bin.is_empty());
    }

    #[test]
    fn test_read_bin_range() {
        let glb = assemble_glb(b"{}", &[10, 11, 12, 13]).unwrap();
        let mut reader = GlbReader::new(std::io::Cursor::new(glb)).unwrap();
        assert_eq!(reader.read_bin(1, 2).unwrap(), vec![11, 12]);
        assert!(matches!(
            reader.read_bin(2, 4),
            Err(GltfError::Container(_))
        ));
        assert!(matches!(
            reader.read_bin(u64::MAX, 2),
            Err(GltfError::Container(_))
        ));
    }

    #[test]
    fn test_malformed_containers() {
        assert!(matches!(read_glb(b"glT"), Err(GltfError::Container(_))));
        assert!(matches!(
            read_glb(b"GLTF\x02\0\0\0\x0c\0\0\0"),
            Err(GltfError::Container(_))
        ));

        let mut glb = assemble_glb(b"{}", &[1, 2, 3, 4]).unwrap();
        // Claim a JSON chunk far larger than the file
        glb[12..16].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(read_glb(&glb), Err(GltfError::Container(_))));

        let mut truncated = assemble_glb(b"{}", &[1, 2, 3, 4]).unwrap();
        truncated.truncate(30);
        assert!(matches!(read_glb(&truncated), Err(GltfError::Container(_))));
    }

    #[test]
    fn test_readable_by_gltf_crate() {
        let json = br#"{"asset":{"version":"2.0"},"buffers":[{"byteLength":3}]}"#;
        let glb = assemble_glb(json, &[7, 8, 9]).unwrap();
        let parsed = gltf::Glb::from_slice(&glb).unwrap();
        assert_eq!(parsed.header.length as usize, glb.len());
        let bin = parsed.bin.unwrap();
        assert_eq!(&bin[..3], &[7u8, 8, 9]);
    }
}
