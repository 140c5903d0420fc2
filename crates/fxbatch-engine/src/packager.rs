use std::io::{Cursor, Write};
use std::path::Path;

use anyhow::Context;
use fxbatch_contracts::runs::{BatchReport, FailureReason};
use serde::Serialize;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::PackagingError;

pub const DEFAULT_TITLE: &str = "images";
pub const MANIFEST_NAME: &str = "manifest.json";
pub const FAILED_PROMPTS_NAME: &str = "failed_prompts.txt";
const MAX_TITLE_CHARS: usize = 50;

/// One image file inside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// 1-based batch position of the prompt that produced the image.
    pub item: usize,
    /// 1-based position within that prompt's images.
    pub image: u32,
    pub seed: i64,
    pub sha256: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// A prompt that produced nothing, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureManifest {
    pub item: usize,
    pub prompt: String,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Serialize)]
struct ManifestDocument<'a> {
    title: &'a str,
    run_id: &'a str,
    images: &'a [ArchiveEntry],
    failures: &'a [FailureManifest],
}

/// Packaged batch output. Layout is a pure function of the report and the
/// title, so equal inputs give byte-identical archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    title: String,
    run_id: String,
    entries: Vec<ArchiveEntry>,
    failures: Vec<FailureManifest>,
}

impl Archive {
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn failures(&self) -> &[FailureManifest] {
        &self.failures
    }

    pub fn file_name(&self) -> String {
        format!("{}.zip", self.title)
    }

    pub fn manifest_json(&self) -> Result<String, PackagingError> {
        let document = ManifestDocument {
            title: &self.title,
            run_id: &self.run_id,
            images: &self.entries,
            failures: &self.failures,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// One failed prompt per line, newlines inside prompts flattened.
    pub fn failed_prompts_text(&self) -> String {
        self.failures
            .iter()
            .map(|failure| format!("{}\n", failure.prompt.replace(['\r', '\n'], " ")))
            .collect()
    }

    /// Stored (uncompressed) zip with fixed timestamps. Images go in as
    /// received, followed by the manifest and, if any prompt failed, the
    /// failed-prompt list.
    pub fn to_zip_bytes(&self) -> Result<Vec<u8>, PackagingError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default());
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for entry in &self.entries {
            writer.start_file(entry.name.as_str(), options)?;
            writer.write_all(&entry.bytes)?;
        }
        writer.start_file(MANIFEST_NAME, options)?;
        writer.write_all(self.manifest_json()?.as_bytes())?;
        if !self.failures.is_empty() {
            writer.start_file(FAILED_PROMPTS_NAME, options)?;
            writer.write_all(self.failed_prompts_text().as_bytes())?;
        }

        Ok(writer.finish()?.into_inner())
    }

    pub fn write_zip(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = self.to_zip_bytes()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write archive {}", path.display()))
    }
}

/// Turns a finished batch report into an [`Archive`].
#[derive(Debug, Clone)]
pub struct ResultPackager {
    title: String,
}

impl Default for ResultPackager {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

impl ResultPackager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = sanitize_title(title);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Entries are named `<title>_<item>_<image>.<ext>`. A prompt tagged
    /// with a project uses the project as its title; the item number is the
    /// batch-wide position, so names stay unique across projects.
    pub fn package(&self, report: &BatchReport) -> Result<Archive, PackagingError> {
        let mut entries = Vec::new();
        for item in report.items() {
            let project = item.request.project.as_deref();
            let title = project.map_or_else(|| self.title.clone(), sanitize_title);
            for (position, image) in item.images().iter().enumerate() {
                let image_number = position as u32 + 1;
                entries.push(ArchiveEntry {
                    name: format!(
                        "{}_{:03}_{:02}.{}",
                        title,
                        item.index + 1,
                        image_number,
                        image.format
                    ),
                    project: project.map(str::to_string),
                    item: item.index + 1,
                    image: image_number,
                    seed: image.seed,
                    sha256: hex::encode(Sha256::digest(&image.bytes)),
                    bytes: image.bytes.clone(),
                });
            }
        }
        if entries.is_empty() {
            return Err(PackagingError::EmptyArchive);
        }

        let failures = report
            .failures()
            .map(|(item, failure)| FailureManifest {
                item: item.index + 1,
                prompt: item.request.prompt.clone(),
                reason: failure.reason,
                message: failure.message.clone(),
            })
            .collect();

        Ok(Archive {
            title: self.title.clone(),
            run_id: report.run_id().to_string(),
            entries,
            failures,
        })
    }
}

/// Keeps alphanumerics, spaces, `-` and `_`, turns spaces into `_` and caps
/// the length. Falls back to [`DEFAULT_TITLE`] when nothing survives.
pub fn sanitize_title(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let title: String = kept
        .trim()
        .replace(' ', "_")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Cursor, Read};

    use fxbatch_contracts::runs::{
        BatchItem, BatchReport, FailureReason, GeneratedImage, GenerationRequest, GenerationResult,
    };

    use super::{sanitize_title, ResultPackager, FAILED_PROMPTS_NAME, MANIFEST_NAME};
    use crate::error::PackagingError;

    fn image(index: u32, format: &str, bytes: &[u8]) -> GeneratedImage {
        GeneratedImage {
            index,
            seed: 100 + i64::from(index),
            format: format.to_string(),
            bytes: bytes.to_vec(),
            media_generation_id: None,
            workflow_id: None,
            model_name_type: None,
        }
    }

    fn settled(index: usize, prompt: &str, result: GenerationResult) -> BatchItem {
        settled_request(index, GenerationRequest::new(prompt), result)
    }

    fn settled_request(
        index: usize,
        request: GenerationRequest,
        result: GenerationResult,
    ) -> BatchItem {
        let mut item = BatchItem::pending(index, request);
        item.submit().unwrap();
        item.record_attempt();
        item.settle(result).unwrap();
        item
    }

    fn sample_report() -> BatchReport {
        let items = vec![
            settled(
                0,
                "a red fox",
                GenerationResult::Success {
                    images: vec![image(0, "png", b"fox-0"), image(1, "jpg", b"fox-1")],
                },
            ),
            settled(
                1,
                "forbidden\nthing",
                GenerationResult::failure(FailureReason::ContentPolicyRejected, "moderated"),
            ),
            settled(
                2,
                "a blue heron",
                GenerationResult::Success {
                    images: vec![image(0, "png", b"heron-0")],
                },
            ),
        ];
        BatchReport::new(
            "run-1",
            "2026-01-01T00:00:00Z",
            "2026-01-01T00:01:00Z",
            items,
            BTreeMap::new(),
        )
    }

    #[test]
    fn entry_names_follow_item_and_image_positions() {
        let archive = ResultPackager::new()
            .with_title("Spring Birds!")
            .package(&sample_report())
            .unwrap();
        let names: Vec<&str> = archive.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Spring_Birds_001_01.png",
                "Spring_Birds_001_02.jpg",
                "Spring_Birds_003_01.png",
            ]
        );
        assert_eq!(archive.entries()[1].bytes, b"fox-1");
        assert_eq!(archive.entries()[2].item, 3);
        assert_eq!(archive.file_name(), "Spring_Birds.zip");

        assert_eq!(archive.failures().len(), 1);
        assert_eq!(archive.failures()[0].item, 2);
        assert_eq!(
            archive.failures()[0].reason,
            FailureReason::ContentPolicyRejected
        );
        assert_eq!(archive.failed_prompts_text(), "forbidden thing\n");
    }

    #[test]
    fn packaging_is_byte_deterministic() {
        let packager = ResultPackager::new();
        let first = packager.package(&sample_report()).unwrap();
        let second = packager.package(&sample_report()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.manifest_json().unwrap(), second.manifest_json().unwrap());
        assert_eq!(first.to_zip_bytes().unwrap(), second.to_zip_bytes().unwrap());
    }

    #[test]
    fn zip_holds_images_unmodified_plus_manifest() {
        let archive = ResultPackager::new().package(&sample_report()).unwrap();
        let bytes = archive.to_zip_bytes().unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();

        let names: Vec<String> = zip.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 5);
        assert!(names.iter().any(|name| name == MANIFEST_NAME));
        assert!(names.iter().any(|name| name == FAILED_PROMPTS_NAME));

        let mut heron = Vec::new();
        zip.by_name("images_003_01.png")
            .unwrap()
            .read_to_end(&mut heron)
            .unwrap();
        assert_eq!(heron, b"heron-0");

        let mut manifest = String::new();
        zip.by_name(MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["run_id"], "run-1");
        assert_eq!(manifest["images"][0]["name"], "images_001_01.png");
        assert_eq!(manifest["images"][0]["seed"], 100);
        assert_eq!(
            manifest["images"][0]["sha256"].as_str().map(str::len),
            Some(64)
        );
        assert_eq!(manifest["failures"][0]["reason"], "content_policy_rejected");
    }

    #[test]
    fn report_without_images_is_an_empty_archive() {
        let report = BatchReport::new(
            "run-2",
            "start",
            "end",
            vec![settled(
                0,
                "nothing",
                GenerationResult::failure(FailureReason::EmptyResult, "no images"),
            )],
            BTreeMap::new(),
        );
        let err = ResultPackager::new().package(&report).unwrap_err();
        assert!(matches!(err, PackagingError::EmptyArchive));
    }

    #[test]
    fn projects_title_their_own_images() {
        let one = |bytes: &[u8]| GenerationResult::Success {
            images: vec![image(0, "png", bytes)],
        };
        let items = vec![
            settled_request(
                0,
                GenerationRequest::new("a cat").with_project("Cats & Dogs"),
                one(b"cat"),
            ),
            settled_request(
                1,
                GenerationRequest::new("a dog").with_project("Cats & Dogs"),
                one(b"dog"),
            ),
            settled_request(2, GenerationRequest::new("a fox"), one(b"fox")),
            settled_request(
                3,
                GenerationRequest::new("a gull").with_project("Sea Birds"),
                one(b"gull"),
            ),
        ];
        let report = BatchReport::new("run-3", "start", "end", items, BTreeMap::new());

        let archive = ResultPackager::new()
            .with_title("Batch")
            .package(&report)
            .unwrap();

        let names: Vec<&str> = archive.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Cats__Dogs_001_01.png",
                "Cats__Dogs_002_01.png",
                "Batch_003_01.png",
                "Sea_Birds_004_01.png",
            ]
        );
        assert_eq!(archive.entries()[0].project.as_deref(), Some("Cats & Dogs"));
        assert_eq!(archive.entries()[2].project, None);
        assert_eq!(archive.file_name(), "Batch.zip");

        let manifest: serde_json::Value =
            serde_json::from_str(&archive.manifest_json().unwrap()).unwrap();
        assert_eq!(manifest["images"][3]["project"], "Sea Birds");
        assert!(manifest["images"][2].get("project").is_none());

        let bytes = archive.to_zip_bytes().unwrap();
        let zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 5);
    }

    #[test]
    fn write_errors_name_the_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("taken");
        std::fs::write(&blocker, b"file, not a directory")?;
        let archive = ResultPackager::new().package(&sample_report())?;

        let err = archive
            .write_zip(&blocker.join("out.zip"))
            .expect_err("parent is a file");
        assert!(format!("{err:#}").contains("failed to create"));
        assert!(format!("{err:#}").contains("taken"));
        Ok(())
    }

    #[test]
    fn titles_are_sanitised() {
        assert_eq!(sanitize_title("My Project: v2/final"), "My_Project_v2final");
        assert_eq!(sanitize_title("  ***  "), "images");
        assert_eq!(sanitize_title(&"x".repeat(80)).len(), 50);
    }
}
