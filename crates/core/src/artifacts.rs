//! Artifact extraction from history records.
//!
//! The server reports outputs per node, e.g.
//!
//! ```json
//! { "9": { "images": [{ "filename": "out_00001_.png", "subfolder": "", "type": "output" }] } }
//! ```
//!
//! Image and video descriptors become `/view?...` artifact paths; every other
//! value is kept verbatim in a raw-output bag.

use serde::Serialize;
use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::error::CoreError;
use crate::workflow::compare_node_ids;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Server route that serves artifact bytes.
pub const VIEW_ROUTE: &str = "/view";

/// Output keys holding image descriptors.
pub const IMAGE_OUTPUT_KEYS: &[&str] = &["images"];

/// Output keys holding video descriptors (animated outputs included).
pub const VIDEO_OUTPUT_KEYS: &[&str] = &["videos", "gifs"];

/// Artifact `type` used when a descriptor omits it.
pub const DEFAULT_ARTIFACT_TYPE: &str = "output";

pub const DEFAULT_IMAGE_EXTENSION: &str = "png";
pub const DEFAULT_VIDEO_EXTENSION: &str = "mp4";
pub const DEFAULT_IMAGE_MIME: &str = "image/png";
pub const DEFAULT_VIDEO_MIME: &str = "video/mp4";

/// Extension used for images by artifact `type` when the filename has none.
const IMAGE_TYPE_EXTENSIONS: &[(&str, &str)] = &[("input", "png"), ("output", "png"), ("temp", "png")];

/// Extension to MIME type.
const MIME_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
];

/// Image extensions accepted as-is when naming uploads.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "bmp", "tif", "tiff"];

// ---------------------------------------------------------------------------
// Artifact model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Video,
}

/// A produced file, described by its artifact path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub filename: String,
    pub subfolder: String,
    pub file_type: String,
    pub extension: String,
    pub mime_type: String,
    /// Server-relative path used to fetch the bytes.
    pub path: String,
}

impl Artifact {
    /// Parse an artifact path produced by [`view_path`].
    pub fn from_path(path: &str, kind: ArtifactKind) -> Result<Self, CoreError> {
        let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
        let mut filename = None;
        let mut subfolder = String::new();
        let mut file_type = DEFAULT_ARTIFACT_TYPE.to_string();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "filename" => filename = Some(value.into_owned()),
                "subfolder" => subfolder = value.into_owned(),
                "type" => file_type = value.into_owned(),
                _ => {}
            }
        }

        let filename = filename
            .filter(|f| !f.is_empty())
            .ok_or_else(|| CoreError::Data(format!("Artifact path '{path}' has no filename")))?;
        let extension = infer_extension(&filename, &file_type, kind);
        let mime_type = mime_for_extension(&extension, kind).to_string();

        Ok(Self {
            kind,
            filename,
            subfolder,
            file_type,
            extension,
            mime_type,
            path: path.to_string(),
        })
    }
}

/// Build the artifact path for a file on the server.
pub fn view_path(filename: &str, subfolder: &str, file_type: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("filename", filename)
        .append_pair("subfolder", subfolder)
        .append_pair("type", file_type)
        .finish();
    format!("{VIEW_ROUTE}?{query}")
}

/// Lowercased extension of a filename, if it has a plausible one.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Extension from the filename, else from the artifact type/kind defaults.
pub fn infer_extension(filename: &str, file_type: &str, kind: ArtifactKind) -> String {
    if let Some(ext) = extension_of(filename) {
        return ext;
    }
    match kind {
        ArtifactKind::Image => IMAGE_TYPE_EXTENSIONS
            .iter()
            .find(|(t, _)| *t == file_type)
            .map(|(_, ext)| *ext)
            .unwrap_or(DEFAULT_IMAGE_EXTENSION)
            .to_string(),
        ArtifactKind::Video => DEFAULT_VIDEO_EXTENSION.to_string(),
    }
}

/// MIME type for an extension, defaulting by artifact kind.
pub fn mime_for_extension(extension: &str, kind: ArtifactKind) -> &'static str {
    let ext = extension.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(match kind {
            ArtifactKind::Image => DEFAULT_IMAGE_MIME,
            ArtifactKind::Video => DEFAULT_VIDEO_MIME,
        })
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Artifacts and leftovers collected from one history record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedOutputs {
    pub images: Vec<String>,
    pub videos: Vec<String>,
    /// `node_id -> { output_key -> value }` for everything not recognized.
    pub raw_output: Map<String, Value>,
}

/// Walk per-node outputs and collect artifact paths.
pub fn extract_outputs(outputs_by_node: &Value) -> ExtractedOutputs {
    let mut extracted = ExtractedOutputs::default();
    let Some(nodes) = outputs_by_node.as_object() else {
        return extracted;
    };

    let mut node_ids: Vec<&String> = nodes.keys().collect();
    node_ids.sort_by(|a, b| compare_node_ids(a, b));

    for node_id in node_ids {
        let node_output = &nodes[node_id.as_str()];
        let Some(entries) = node_output.as_object() else {
            extracted
                .raw_output
                .insert(node_id.clone(), node_output.clone());
            continue;
        };

        let mut leftovers = Map::new();
        for (key, value) in entries {
            let target = if IMAGE_OUTPUT_KEYS.contains(&key.as_str()) {
                Some(&mut extracted.images)
            } else if VIDEO_OUTPUT_KEYS.contains(&key.as_str()) {
                Some(&mut extracted.videos)
            } else {
                None
            };

            match (target, value.as_array()) {
                (Some(paths), Some(descriptors)) => {
                    let unrecognized = collect_descriptors(descriptors, paths);
                    if !unrecognized.is_empty() {
                        leftovers.insert(key.clone(), Value::Array(unrecognized));
                    }
                }
                _ => {
                    leftovers.insert(key.clone(), value.clone());
                }
            }
        }

        if !leftovers.is_empty() {
            extracted
                .raw_output
                .insert(node_id.clone(), Value::Object(leftovers));
        }
    }

    extracted
}

/// Push a path for each descriptor with a filename; return the rest.
fn collect_descriptors(descriptors: &[Value], paths: &mut Vec<String>) -> Vec<Value> {
    let mut unrecognized = Vec::new();
    for descriptor in descriptors {
        match descriptor.get("filename").and_then(Value::as_str) {
            Some(filename) if !filename.is_empty() => {
                let subfolder = descriptor
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let file_type = descriptor
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_ARTIFACT_TYPE);
                paths.push(view_path(filename, subfolder, file_type));
            }
            _ => unrecognized.push(descriptor.clone()),
        }
    }
    unrecognized
}

// ---------------------------------------------------------------------------
// Output key policy
// ---------------------------------------------------------------------------

/// An artifact path paired with the caller output key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSlot {
    pub key: String,
    pub kind: ArtifactKind,
    pub path: String,
}

/// Assign output keys to artifacts.
///
/// The first image takes `primary_key`, later images `image_{index}`. With no
/// images the first video takes `primary_key`; otherwise videos use
/// `video_{index}`.
pub fn assign_output_keys(images: &[String], videos: &[String], primary_key: &str) -> Vec<OutputSlot> {
    let mut slots = Vec::with_capacity(images.len() + videos.len());

    for (index, path) in images.iter().enumerate() {
        let key = if index == 0 {
            primary_key.to_string()
        } else {
            format!("image_{index}")
        };
        slots.push(OutputSlot {
            key,
            kind: ArtifactKind::Image,
            path: path.clone(),
        });
    }

    for (index, path) in videos.iter().enumerate() {
        let key = if index == 0 && images.is_empty() {
            primary_key.to_string()
        } else {
            format!("video_{index}")
        };
        slots.push(OutputSlot {
            key,
            kind: ArtifactKind::Video,
            path: path.clone(),
        });
    }

    slots
}
