//! Generated-image detection and download for image-bearing reply turns.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use crate::error::AssetDownloadError;
use crate::session::{FetchedBytes, Session};
use crate::turn::TurnSignature;

/// How an image element was recognised inside a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Carries the explicit "generated image" marker.
    GeneratedMarker,
    /// Sits inside a generated-image container.
    Container,
    /// Any other image in the turn.
    Other,
}

/// Raw image element reported by the session for one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub src: String,
    #[serde(default)]
    pub alt: String,
    pub source: CandidateSource,
    #[serde(default)]
    pub width: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub remote_locator: String,
    pub descriptive_title: String,
    pub alt_text: String,
    pub content_type: Option<String>,
    /// `None` when every download path failed.
    pub local_path: Option<PathBuf>,
}

const MIN_BACKEND_WIDTH: u32 = 200;

/// Pick the images to keep: explicit markers win, then containers, then large
/// images served by the application backend. Duplicated sources collapse.
pub fn select_candidates(candidates: &[ImageCandidate], backend_origin: &str) -> Vec<ImageCandidate> {
    let of = |source: CandidateSource| {
        candidates
            .iter()
            .filter(move |c| c.source == source)
            .collect::<Vec<_>>()
    };
    let mut picked = of(CandidateSource::GeneratedMarker);
    if picked.is_empty() {
        picked = of(CandidateSource::Container);
    }
    if picked.is_empty() {
        picked = of(CandidateSource::Other)
            .into_iter()
            .filter(|c| c.width > MIN_BACKEND_WIDTH && is_backend_source(&c.src, backend_origin))
            .collect();
    }

    let mut seen = HashSet::new();
    picked
        .into_iter()
        .filter(|c| !c.src.is_empty() && seen.insert(c.src.clone()))
        .cloned()
        .collect()
}

fn is_backend_source(src: &str, backend_origin: &str) -> bool {
    if src.contains("backend-api/estuary") {
        return true;
    }
    let host = backend_origin
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    !host.is_empty() && src.contains(host)
}

/// Title shown next to a generated image, e.g. "Creating image • Orange tabby".
pub fn derive_title(captions: &[String]) -> String {
    for caption in captions {
        if let Some((_, title)) = caption.split_once('•') {
            let title = title.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    captions
        .iter()
        .map(|c| c.trim())
        .find(|c| {
            let n = c.chars().count();
            n > 5 && n < 200
        })
        .unwrap_or_default()
        .to_string()
}

/// Content type from magic bytes, then the transport header, then PNG.
pub fn sniff_content_type(bytes: &[u8], reported: Option<&str>) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "image/webp";
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return "image/gif";
    }
    match reported.map(|r| r.to_ascii_lowercase()) {
        Some(r) if r.contains("jpeg") || r.contains("jpg") => "image/jpeg",
        Some(r) if r.contains("webp") => "image/webp",
        Some(r) if r.contains("gif") => "image/gif",
        _ => "image/png",
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// `<sha256 prefix>_<unix millis>.<ext>`
pub fn asset_file_name(bytes: &[u8], content_type: &str, millis: u128) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{hex}_{millis}.{}", extension_for(content_type))
}

// ========================= Handler =========================

#[derive(Clone)]
pub struct ImageAssetHandler {
    images_dir: PathBuf,
    backend_origin: String,
    http: reqwest::Client,
}

impl ImageAssetHandler {
    pub fn new<P: AsRef<Path>>(images_dir: P, backend_origin: impl Into<String>) -> Self {
        Self {
            images_dir: images_dir.as_ref().to_path_buf(),
            backend_origin: backend_origin.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Detect, download and describe every generated image in the turn.
    pub async fn collect<S: Session + ?Sized>(&self, session: &S, signature: &TurnSignature) -> Vec<ImageAsset> {
        let candidates = match session.image_candidates(signature).await {
            Ok(c) => c,
            Err(e) => {
                warn!(%signature, error = %e, "image candidate query failed");
                return Vec::new();
            }
        };
        let picked = select_candidates(&candidates, &self.backend_origin);
        if picked.is_empty() {
            debug!(%signature, "no generated images in turn");
            return Vec::new();
        }
        let captions = session.turn_captions(signature).await.unwrap_or_default();
        let title = derive_title(&captions);
        info!(%signature, count = picked.len(), "generated images detected");

        let mut assets = Vec::with_capacity(picked.len());
        for candidate in picked {
            let (local_path, content_type) = match self.download(session, &candidate.src).await {
                Ok((path, content_type)) => (Some(path), Some(content_type.to_string())),
                Err(e) => {
                    warn!(error = %e, "image download failed");
                    (None, None)
                }
            };
            assets.push(ImageAsset {
                remote_locator: candidate.src,
                descriptive_title: if title.is_empty() { candidate.alt.clone() } else { title.clone() },
                alt_text: candidate.alt,
                content_type,
                local_path,
            });
        }
        assets
    }

    async fn download<S: Session + ?Sized>(
        &self,
        session: &S,
        url: &str,
    ) -> Result<(PathBuf, &'static str), AssetDownloadError> {
        let fetched = match session.fetch_with_session_auth(url).await {
            Ok(f) if !f.bytes.is_empty() => f,
            Ok(_) => {
                debug!(url, "session fetch returned nothing, trying direct");
                self.fetch_direct(url).await?
            }
            Err(e) => {
                debug!(url, error = %e, "session fetch failed, trying direct");
                self.fetch_direct(url).await.map_err(|direct| match direct {
                    AssetDownloadError::DirectFetch { .. } => AssetDownloadError::SessionFetch {
                        url: url.to_string(),
                        reason: format!("{e}; {direct}"),
                    },
                    other => other,
                })?
            }
        };

        let content_type = sniff_content_type(&fetched.bytes, fetched.content_type.as_deref());
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = self.images_dir.join(asset_file_name(&fetched.bytes, content_type, millis));
        let write_err = |source| AssetDownloadError::Write { url: url.to_string(), source };
        async_fs::create_dir_all(&self.images_dir).await.map_err(write_err)?;
        async_fs::write(&path, &fetched.bytes).await.map_err(write_err)?;
        info!(path = %path.display(), kb = fetched.bytes.len() / 1024, "image saved");
        Ok((path, content_type))
    }

    /// Anonymous retrieval, only for plain http(s) locators.
    async fn fetch_direct(&self, url: &str) -> Result<FetchedBytes, AssetDownloadError> {
        let fail = |reason: String| AssetDownloadError::DirectFetch { url: url.to_string(), reason };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(fail("not an http(s) locator".into()));
        }
        let resp = self.http.get(url).send().await.map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("status {status}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
        if bytes.is_empty() {
            return Err(AssetDownloadError::Empty { url: url.to_string() });
        }
        Ok(FetchedBytes { bytes: bytes.to_vec(), content_type })
    }
}
