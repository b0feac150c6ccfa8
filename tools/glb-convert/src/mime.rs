//! mimeType and file extension tables

pub const MIMETYPE_PNG: &str = "image/png";
pub const MIMETYPE_JPEG: &str = "image/jpeg";
pub const MIMETYPE_DDS: &str = "image/vnd-ms.dds";
pub const MIMETYPE_KTX2: &str = "image/ktx2";
pub const MIMETYPE_WEBP: &str = "image/webp";

/// mimeType recorded when a packed resource has an unrecognised extension
pub const FALLBACK_MIMETYPE: &str = "text/plain";
/// Extension used when unpacking a resource with an unrecognised mimeType
pub const FALLBACK_EXTENSION: &str = "bin";

/// Infer a mimeType from the extension of `uri`
pub fn mime_type_from_uri(uri: &str) -> &'static str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "png" => MIMETYPE_PNG,
        "jpg" | "jpeg" => MIMETYPE_JPEG,
        "dds" => MIMETYPE_DDS,
        "ktx2" => MIMETYPE_KTX2,
        "webp" => MIMETYPE_WEBP,
        _ => FALLBACK_MIMETYPE,
    }
}

/// File extension for a resource of `mime_type`
pub fn extension_from_mime_type(mime_type: Option<&str>) -> &'static str {
    match mime_type {
        Some(MIMETYPE_PNG) => "png",
        Some(MIMETYPE_JPEG) => "jpg",
        Some(MIMETYPE_DDS) => "dds",
        Some(MIMETYPE_KTX2) => "ktx2",
        Some(MIMETYPE_WEBP) => "webp",
        _ => FALLBACK_EXTENSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_uri() {
        assert_eq!(mime_type_from_uri("textures/albedo.PNG"), MIMETYPE_PNG);
        assert_eq!(mime_type_from_uri("a.jpeg"), MIMETYPE_JPEG);
        assert_eq!(mime_type_from_uri("a.jpg?v=2"), MIMETYPE_JPEG);
        assert_eq!(mime_type_from_uri("lut.dds"), MIMETYPE_DDS);
        assert_eq!(mime_type_from_uri("noext"), FALLBACK_MIMETYPE);
        assert_eq!(mime_type_from_uri("blob.bin"), FALLBACK_MIMETYPE);
    }

    #[test]
    fn test_extension_from_mime() {
        assert_eq!(extension_from_mime_type(Some("image/jpeg")), "jpg");
        assert_eq!(extension_from_mime_type(Some("image/ktx2")), "ktx2");
        assert_eq!(extension_from_mime_type(Some("application/x-thing")), "bin");
        assert_eq!(extension_from_mime_type(None), "bin");
    }
}
