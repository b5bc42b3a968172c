//! Turning image parameters into server-side input filenames.
//!
//! A URL that already points at the server is reduced to its `filename`
//! parameter. Anything else is fetched (external URL) or decoded (inline
//! base64) and uploaded, and the server-assigned name is used instead.

use genrelay_core::artifacts::{extension_of, mime_for_extension, ArtifactKind, IMAGE_EXTENSIONS, VIEW_ROUTE};
use genrelay_core::codec::decode_base64;
use genrelay_core::hashing::content_name_stem;
use genrelay_core::overrides::ImageReference;
use url::Url;

use crate::api::ComfyUIApi;
use crate::error::ComfyUIError;
use crate::observer::ExecutionEvent;
use crate::retry::RetryContext;

/// Largest external image accepted for upload.
pub const MAX_IMAGE_DOWNLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Headers sent with external downloads. Several image hosts reject
/// clients that do not look like a browser.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    ),
    (
        "Accept",
        "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
    ),
];

const DEFAULT_UPLOAD_EXTENSION: &str = "png";

/// Resolves [`ImageReference`]s against one server.
pub struct ImageResolver<'a> {
    api: &'a ComfyUIApi,
    retry: RetryContext<'a>,
    server: Url,
    overwrite: bool,
}

impl<'a> ImageResolver<'a> {
    pub fn new(api: &'a ComfyUIApi, retry: RetryContext<'a>, server: Url, overwrite: bool) -> Self {
        Self {
            api,
            retry,
            server,
            overwrite,
        }
    }

    /// Server-side filename to place in the node input.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<String, ComfyUIError> {
        match reference {
            ImageReference::RemoteUrl(raw) => {
                let url = Url::parse(raw.trim())
                    .map_err(|e| ComfyUIError::Validation(format!("Invalid image URL '{raw}': {e}")))?;
                if is_server_image_url(&url, &self.server) {
                    server_filename(&url)
                } else {
                    self.fetch_and_upload(&url).await
                }
            }
            ImageReference::InlineBinary {
                name,
                mime_type,
                data,
            } => {
                let bytes = decode_base64(data)?;
                let (file_name, mime) = inline_name(&bytes, name.as_deref(), mime_type.as_deref());
                self.upload(bytes, &file_name, &mime).await
            }
        }
    }

    async fn fetch_and_upload(&self, url: &Url) -> Result<String, ComfyUIError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ComfyUIError::Validation(format!(
                "Image URL must use http or https, got '{}'",
                url.scheme()
            )));
        }

        tracing::debug!(url = %url, "Downloading external image");
        let response = self
            .retry
            .run("Image download", || {
                self.api
                    .fetch_url(url.as_str(), BROWSER_HEADERS, MAX_IMAGE_DOWNLOAD_BYTES)
            })
            .await
            .map_err(with_download_hint)?;

        let bytes = response.body;
        if bytes.is_empty() {
            return Err(ComfyUIError::Data(format!("Image at {url} is empty")));
        }
        if bytes.len() > MAX_IMAGE_DOWNLOAD_BYTES {
            return Err(ComfyUIError::Data(format!(
                "Image at {url} is {} bytes, over the {} MB limit",
                bytes.len(),
                MAX_IMAGE_DOWNLOAD_BYTES / (1024 * 1024)
            )));
        }

        let file_name = download_name(url, &bytes);
        let extension = extension_of(&file_name).unwrap_or_else(|| DEFAULT_UPLOAD_EXTENSION.into());
        let mime = mime_for_extension(&extension, ArtifactKind::Image);
        self.upload(bytes, &file_name, mime).await
    }

    /// Uploads are never retried; they race the cancellation token only.
    async fn upload(&self, bytes: Vec<u8>, file_name: &str, mime: &str) -> Result<String, ComfyUIError> {
        let upload = tokio::select! {
            _ = self.retry.cancel.cancelled() => return Err(ComfyUIError::Cancelled),
            result = self.api.upload_image(bytes, file_name, mime, self.overwrite) => result,
        };
        let upload = upload.map_err(|e| ComfyUIError::from(e).with_prefix("Image upload failed"))?;

        tracing::info!(requested = file_name, stored = %upload.name, "Uploaded image");
        self.retry.observer.on_event(&ExecutionEvent::ImageUploaded {
            filename: upload.name.clone(),
        });
        Ok(upload.name)
    }
}

/// Same scheme, host, and port as the server, or a path on the view route.
pub fn is_server_image_url(url: &Url, server: &Url) -> bool {
    let same_origin = url.scheme() == server.scheme()
        && url.host_str() == server.host_str()
        && url.port_or_known_default() == server.port_or_known_default();
    let view_path = url.path().ends_with(VIEW_ROUTE) || url.path().ends_with("/api/view");
    same_origin || view_path
}

fn server_filename(url: &Url) -> Result<String, ComfyUIError> {
    url.query_pairs()
        .find(|(key, _)| key == "filename")
        .map(|(_, value)| value.into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ComfyUIError::Validation("URL must contain a filename parameter".into()))
}

/// Last path segment when it names an image, else a content-derived name.
fn download_name(url: &Url, bytes: &[u8]) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    match extension_of(segment) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => segment.to_string(),
        _ => format!("{}.{}", content_name_stem(bytes), sniff_extension(bytes)),
    }
}

fn sniff_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or(DEFAULT_UPLOAD_EXTENSION)
}

fn inline_name(bytes: &[u8], name: Option<&str>, mime_type: Option<&str>) -> (String, String) {
    let subtype = mime_type
        .and_then(|m| m.strip_prefix("image/"))
        .map(|s| s.split(';').next().unwrap_or(s).trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_UPLOAD_EXTENSION);

    let file_name = match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => format!("{}.{subtype}", content_name_stem(bytes)),
    };
    let mime = match mime_type {
        Some(m) if !m.trim().is_empty() => m.trim().to_string(),
        _ => {
            let ext = extension_of(&file_name).unwrap_or_else(|| subtype.to_string());
            mime_for_extension(&ext, ArtifactKind::Image).to_string()
        }
    };
    (file_name, mime)
}

fn with_download_hint(err: ComfyUIError) -> ComfyUIError {
    let hint = match err.status() {
        Some(403) => {
            "The image host refused the download (403), probably anti-bot protection. \
             Download the image yourself and pass it as binary data instead"
        }
        Some(404) => "No image found at the URL (404)",
        Some(400) => "The image host rejected the request as malformed (400). Check the URL",
        _ => return err,
    };
    err.with_prefix(hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    // ---- origin detection ----

    #[test]
    fn same_origin_requires_scheme_host_and_port() {
        let server = url("http://127.0.0.1:8188");
        assert!(is_server_image_url(&url("http://127.0.0.1:8188/anything?filename=a.png"), &server));
        assert!(!is_server_image_url(&url("http://127.0.0.1:9000/a.png"), &server));
        assert!(!is_server_image_url(&url("https://127.0.0.1:8188/a.png"), &server));
    }

    #[test]
    fn default_ports_compare_equal() {
        let server = url("https://comfy.example.com");
        assert!(is_server_image_url(&url("https://comfy.example.com:443/x"), &server));
    }

    #[test]
    fn view_route_counts_as_server_url() {
        let server = url("http://127.0.0.1:8188");
        assert!(is_server_image_url(&url("https://proxy.example.com/view?filename=a.png"), &server));
        assert!(is_server_image_url(&url("https://proxy.example.com/api/view?filename=a.png"), &server));
        assert!(!is_server_image_url(&url("https://cdn.example.com/images/a.png"), &server));
    }

    #[test]
    fn server_filename_ignores_subfolder() {
        let name = server_filename(&url("http://h/view?filename=cat.png&subfolder=pets&type=input")).unwrap();
        assert_eq!(name, "cat.png");
    }

    #[test]
    fn server_filename_is_required() {
        assert_eq!(
            server_filename(&url("http://h/view?type=output")),
            Err(ComfyUIError::Validation("URL must contain a filename parameter".into()))
        );
    }

    // ---- naming ----

    #[test]
    fn download_name_keeps_image_segment() {
        assert_eq!(download_name(&url("https://cdn.example.com/a/b/photo.JPG?x=1"), PNG_MAGIC), "photo.JPG");
    }

    #[test]
    fn download_name_sniffs_when_extension_missing() {
        let name = download_name(&url("https://cdn.example.com/image?id=4"), PNG_MAGIC);
        assert!(name.starts_with("genrelay_"));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn sniff_defaults_to_png() {
        assert_eq!(sniff_extension(b"not an image"), "png");
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "jpg");
    }

    #[test]
    fn inline_name_uses_declared_values() {
        let (name, mime) = inline_name(b"x", Some("input.webp"), Some("image/webp"));
        assert_eq!(name, "input.webp");
        assert_eq!(mime, "image/webp");
    }

    #[test]
    fn inline_name_generates_from_mime_subtype() {
        let (name, mime) = inline_name(b"x", None, Some("image/jpeg"));
        assert!(name.starts_with("genrelay_") && name.ends_with(".jpeg"));
        assert_eq!(mime, "image/jpeg");

        let (name, mime) = inline_name(b"x", Some("  "), None);
        assert!(name.ends_with(".png"));
        assert_eq!(mime, "image/png");
    }

    // ---- hints ----

    #[test]
    fn forbidden_download_suggests_binary_mode() {
        let err = with_download_hint(ComfyUIError::Network {
            message: "Image download failed after 3 attempts: denied".into(),
            status: Some(403),
        });
        assert!(err.to_string().contains("binary data"));
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn other_statuses_pass_through() {
        let err = ComfyUIError::Network {
            message: "boom".into(),
            status: Some(500),
        };
        assert_eq!(with_download_hint(err.clone()), err);
    }
}
