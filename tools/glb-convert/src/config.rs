//! Batch manifest parsing and build orchestration
//!
//! Parses glb-convert.toml and runs every pack, unpack and LOD job it lists.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lod::merge_lod_files;
use crate::pack::{PackOptions, pack_file};
use crate::unpack::unpack_file;

/// Default manifest file name
pub const MANIFEST_FILE_NAME: &str = "glb-convert.toml";

/// Root manifest structure
#[derive(Debug, Default, Deserialize)]
pub struct BatchManifest {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub pack: Vec<PackJob>,
    #[serde(default)]
    pub unpack: Vec<UnpackJob>,
    #[serde(default)]
    pub lod: Vec<LodJob>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputConfig {
    /// Output directory, relative to the manifest
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PackJob {
    pub input: PathBuf,
    /// Defaults to `<output dir>/<input stem>.glb`
    pub output: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct UnpackJob {
    pub input: PathBuf,
    /// Base name of the written files; defaults to the input stem
    pub name: Option<String>,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LodJob {
    /// Primary document first, then each LOD from most to least detailed
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    #[serde(default)]
    pub screen_coverage: Vec<f64>,
    /// Reuse the primary's materials for every LOD
    #[serde(default)]
    pub shared_materials: bool,
}

/// Jobs completed by [`build_all`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    pub packed: usize,
    pub unpacked: usize,
    pub merged: usize,
}

impl BatchManifest {
    pub fn is_empty(&self) -> bool {
        self.pack.is_empty() && self.unpack.is_empty() && self.lod.is_empty()
    }

    fn inputs(&self) -> impl Iterator<Item = &Path> {
        self.pack
            .iter()
            .map(|job| job.input.as_path())
            .chain(self.unpack.iter().map(|job| job.input.as_path()))
            .chain(self.lod.iter().flat_map(|job| job.inputs.iter().map(PathBuf::as_path)))
    }
}

/// Parse manifest text
pub fn parse_manifest(content: &str) -> Result<BatchManifest> {
    toml::from_str(content).context("Failed to parse manifest")
}

/// Load and parse a manifest file
pub fn load_manifest(path: &Path) -> Result<BatchManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {:?}", path))?;
    parse_manifest(&content).with_context(|| format!("Invalid manifest: {:?}", path))
}

/// Directory that relative manifest paths resolve against
pub fn manifest_dir(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new(""))
}

/// Validate a manifest without building
pub fn validate(manifest: &BatchManifest, base_dir: &Path) -> Result<()> {
    if manifest.is_empty() {
        anyhow::bail!("Manifest has no pack, unpack or lod jobs");
    }

    for (i, job) in manifest.lod.iter().enumerate() {
        if job.inputs.len() < 2 {
            anyhow::bail!(
                "LOD job {} needs a primary and at least one LOD, got {} input(s)",
                i,
                job.inputs.len()
            );
        }
    }

    // Check that all source files exist
    for input in manifest.inputs() {
        let path = base_dir.join(input);
        if !path.exists() {
            anyhow::bail!("Input not found: {:?}", path);
        }
    }
    Ok(())
}

/// Run every job of a manifest
pub fn build_all(
    manifest: &BatchManifest,
    base_dir: &Path,
    output_override: Option<&Path>,
) -> Result<BuildReport> {
    let output_dir = match (output_override, &manifest.output.dir) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(dir)) => base_dir.join(dir),
        (None, None) => base_dir.to_path_buf(),
    };
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let mut report = BuildReport::default();
    let options = PackOptions::default();

    for job in &manifest.pack {
        let input = base_dir.join(&job.input);
        let output = match &job.output {
            Some(output) => output_dir.join(output),
            None => output_dir.join(format!("{}.glb", file_stem(&input)?)),
        };
        if output == input {
            anyhow::bail!("Pack job would overwrite its input: {:?}", input);
        }
        tracing::info!("Packing {:?} -> {:?}", input, output);
        pack_file(&input, &output, &options)
            .with_context(|| format!("Failed to pack {:?}", input))?;
        report.packed += 1;
    }

    for job in &manifest.unpack {
        let input = base_dir.join(&job.input);
        let dir = match &job.dir {
            Some(dir) => output_dir.join(dir),
            None => output_dir.clone(),
        };
        tracing::info!("Unpacking {:?} -> {:?}", input, dir);
        unpack_file(&input, &dir, job.name.as_deref())
            .with_context(|| format!("Failed to unpack {:?}", input))?;
        report.unpacked += 1;
    }

    for job in &manifest.lod {
        let inputs: Vec<PathBuf> = job.inputs.iter().map(|p| base_dir.join(p)).collect();
        let output = output_dir.join(&job.output);
        tracing::info!("Merging {} LODs -> {:?}", inputs.len(), output);
        merge_lod_files(&inputs, &output, &job.screen_coverage, job.shared_materials)
            .with_context(|| format!("Failed to merge LODs into {:?}", output))?;
        report.merged += 1;
    }

    Ok(report)
}

fn file_stem(path: &Path) -> Result<&str> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("Input has no usable file name: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let manifest = parse_manifest(
            r#"
            [output]
            dir = "out"

            [[pack]]
            input = "models/ship.gltf"

            [[pack]]
            input = "models/rock.gltf"
            output = "rock_packed.glb"

            [[unpack]]
            input = "ship.glb"
            name = "ship_src"

            [[lod]]
            inputs = ["ship.gltf", "ship_lod1.gltf"]
            output = "ship_lods.glb"
            screen_coverage = [0.5, 0.1]
            shared_materials = true
            "#,
        )
        .unwrap();

        assert_eq!(manifest.output.dir, Some(PathBuf::from("out")));
        assert_eq!(manifest.pack.len(), 2);
        assert!(manifest.pack[0].output.is_none());
        assert_eq!(manifest.unpack[0].name.as_deref(), Some("ship_src"));
        assert!(manifest.unpack[0].dir.is_none());
        assert_eq!(manifest.lod[0].screen_coverage, vec![0.5, 0.1]);
        assert!(manifest.lod[0].shared_materials);
    }

    #[test]
    fn test_load_manifest_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&path, "[[lod]]\ninputs = [\"a.gltf\", \"b.gltf\"]\noutput = \"c.glb\"\n").unwrap();
        let manifest = load_manifest(&path).unwrap();
        assert!(!manifest.lod[0].shared_materials);

        std::fs::write(&path, "[[lod]]\ninputs = 3\n").unwrap();
        let err = load_manifest(&path).unwrap_err();
        assert!(format!("{err:#}").contains(MANIFEST_FILE_NAME));
    }

    #[test]
    fn test_unknown_shape_rejected() {
        assert!(parse_manifest("[[pack]]\noutput = \"x.glb\"").is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gltf"), "{}").unwrap();

        let empty = BatchManifest::default();
        assert!(validate(&empty, dir.path()).is_err());

        let missing = parse_manifest("[[pack]]\ninput = \"missing.gltf\"").unwrap();
        let err = validate(&missing, dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing.gltf"));

        let short_lod =
            parse_manifest("[[lod]]\ninputs = [\"a.gltf\"]\noutput = \"o.glb\"").unwrap();
        assert!(validate(&short_lod, dir.path()).is_err());

        let ok = parse_manifest("[[pack]]\ninput = \"a.gltf\"").unwrap();
        validate(&ok, dir.path()).unwrap();
    }

    #[test]
    fn test_build_pack_job() {
        let dir = tempfile::tempdir().unwrap();
        let gltf = r#"{
            "asset": { "version": "2.0" },
            "buffers": [{ "byteLength": 4, "uri": "data:application/octet-stream;base64,AQACAA==" }],
            "bufferViews": [{ "buffer": 0, "byteLength": 4 }],
            "accessors": [{ "bufferView": 0, "componentType": 5123, "count": 2, "type": "SCALAR" }]
        }"#;
        std::fs::write(dir.path().join("tiny.gltf"), gltf).unwrap();

        let manifest = parse_manifest("[output]\ndir = \"out\"\n[[pack]]\ninput = \"tiny.gltf\"").unwrap();
        let report = build_all(&manifest, dir.path(), None).unwrap();

        assert_eq!(report.packed, 1);
        let glb = std::fs::read(dir.path().join("out/tiny.glb")).unwrap();
        assert_eq!(&glb[0..4], b"glTF");
    }
}
