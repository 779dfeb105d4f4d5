//! Image provider: resolves a media descriptor to raw image bytes (spec
//! §6), preferring the optimised rendition with a greyscale fallback, and
//! enforcing size/resolution/format constraints before the bytes reach a
//! worker.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::job_registry::MediaRef;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_DIMENSION: u32 = 224;
pub const SUPPORTED_FORMATS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error)]
pub enum ImageProviderError {
    #[error("http error: {0}")]
    Http(String),
    #[error("both optimised and greyscale fetches failed for media {0}")]
    BothSourcesFailed(String),
    #[error("image exceeds max size: {0} bytes > {1}")]
    TooLarge(usize, usize),
    #[error("image below minimum resolution: {0}x{1} < {2}x{2}")]
    TooSmall(u32, u32, u32),
    #[error("unsupported format '{0}', expected one of {SUPPORTED_FORMATS:?}")]
    UnsupportedFormat(String),
}

impl From<reqwest::Error> for ImageProviderError {
    fn from(err: reqwest::Error) -> Self {
        ImageProviderError::Http(err.to_string())
    }
}

fn extension_of(path: &str) -> Option<String> {
    path.rsplit('.').next().map(|e| e.to_lowercase())
}

fn validate_format(path: &str) -> Result<(), ImageProviderError> {
    let ext = extension_of(path).unwrap_or_default();
    if SUPPORTED_FORMATS.contains(&ext.as_str()) {
        Ok(())
    } else {
        Err(ImageProviderError::UnsupportedFormat(ext))
    }
}

fn validate_bytes(bytes: &[u8], dimensions: (u32, u32)) -> Result<(), ImageProviderError> {
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ImageProviderError::TooLarge(bytes.len(), MAX_IMAGE_BYTES));
    }
    if dimensions.0 < MIN_DIMENSION || dimensions.1 < MIN_DIMENSION {
        return Err(ImageProviderError::TooSmall(dimensions.0, dimensions.1, MIN_DIMENSION));
    }
    Ok(())
}

/// Resolves a [`MediaRef`] to validated raw bytes, preferring
/// `optimised_path` with fallback to `greyscale_path`.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn fetch(&self, media: &MediaRef) -> Result<Vec<u8>, ImageProviderError>;
}

pub struct HttpImageProvider {
    client: reqwest::Client,
}

impl HttpImageProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, ImageProviderError> {
        validate_format(url)?;
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ImageProviderError::Http(format!("status {}", resp.status())));
        }
        let bytes = resp.bytes().await?.to_vec();
        // Actual dimension probing is delegated to the decoder at the call
        // site; the provider only enforces the byte-size ceiling here.
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(ImageProviderError::TooLarge(bytes.len(), MAX_IMAGE_BYTES));
        }
        Ok(bytes)
    }
}

impl Default for HttpImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn fetch(&self, media: &MediaRef) -> Result<Vec<u8>, ImageProviderError> {
        match self.fetch_url(&media.optimised_path).await {
            Ok(bytes) => Ok(bytes),
            Err(_) => self
                .fetch_url(&media.greyscale_path)
                .await
                .map_err(|_| ImageProviderError::BothSourcesFailed(media.id.clone())),
        }
    }
}

/// Test double keyed by media id, with pre-registered bytes/dimensions or a
/// forced error, and a record of which path (`optimised` / `greyscale`) was
/// used to satisfy each fetch.
#[derive(Default)]
pub struct MockImageProvider {
    optimised_bytes: Mutex<HashMap<String, Result<(Vec<u8>, (u32, u32)), ()>>>,
    greyscale_bytes: Mutex<HashMap<String, (Vec<u8>, (u32, u32))>>,
    fetches: Mutex<Vec<(String, &'static str)>>,
}

impl MockImageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimised(self, media_id: &str, bytes: Vec<u8>, dims: (u32, u32)) -> Self {
        self.optimised_bytes.lock().unwrap().insert(media_id.to_string(), Ok((bytes, dims)));
        self
    }

    pub fn with_optimised_failure(self, media_id: &str) -> Self {
        self.optimised_bytes.lock().unwrap().insert(media_id.to_string(), Err(()));
        self
    }

    pub fn with_greyscale(self, media_id: &str, bytes: Vec<u8>, dims: (u32, u32)) -> Self {
        self.greyscale_bytes.lock().unwrap().insert(media_id.to_string(), (bytes, dims));
        self
    }

    pub fn fetch_log(&self) -> Vec<(String, &'static str)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageProvider for MockImageProvider {
    async fn fetch(&self, media: &MediaRef) -> Result<Vec<u8>, ImageProviderError> {
        validate_format(&media.optimised_path).ok();

        if let Some(Ok((bytes, dims))) = self.optimised_bytes.lock().unwrap().get(&media.id) {
            validate_bytes(bytes, *dims)?;
            self.fetches.lock().unwrap().push((media.id.clone(), "optimised"));
            return Ok(bytes.clone());
        }

        if let Some((bytes, dims)) = self.greyscale_bytes.lock().unwrap().get(&media.id) {
            validate_bytes(bytes, *dims)?;
            self.fetches.lock().unwrap().push((media.id.clone(), "greyscale"));
            return Ok(bytes.clone());
        }

        Err(ImageProviderError::BothSourcesFailed(media.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: &str) -> MediaRef {
        MediaRef {
            id: id.to_string(),
            filename: "photo.jpg".to_string(),
            optimised_path: "https://cdn/photo-opt.jpg".to_string(),
            greyscale_path: "https://cdn/photo-gray.jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn prefers_optimised_over_greyscale() {
        let provider = MockImageProvider::new()
            .with_optimised("m1", vec![1, 2, 3], (512, 512))
            .with_greyscale("m1", vec![9, 9, 9], (512, 512));
        let bytes = provider.fetch(&media("m1")).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(provider.fetch_log(), vec![("m1".to_string(), "optimised")]);
    }

    #[tokio::test]
    async fn falls_back_to_greyscale_when_optimised_fails() {
        let provider = MockImageProvider::new()
            .with_optimised_failure("m1")
            .with_greyscale("m1", vec![4, 5, 6], (512, 512));
        let bytes = provider.fetch(&media("m1")).await.unwrap();
        assert_eq!(bytes, vec![4, 5, 6]);
        assert_eq!(provider.fetch_log(), vec![("m1".to_string(), "greyscale")]);
    }

    #[tokio::test]
    async fn both_sources_failing_is_an_error() {
        let provider = MockImageProvider::new().with_optimised_failure("m1");
        let err = provider.fetch(&media("m1")).await.unwrap_err();
        assert!(matches!(err, ImageProviderError::BothSourcesFailed(_)));
    }

    #[tokio::test]
    async fn below_minimum_resolution_rejected() {
        let provider = MockImageProvider::new().with_optimised("m1", vec![1], (100, 100));
        let err = provider.fetch(&media("m1")).await.unwrap_err();
        assert!(matches!(err, ImageProviderError::TooSmall(100, 100, MIN_DIMENSION)));
    }

    #[tokio::test]
    async fn oversized_image_rejected() {
        let big = vec![0u8; MAX_IMAGE_BYTES + 1];
        let provider = MockImageProvider::new().with_optimised("m1", big, (512, 512));
        let err = provider.fetch(&media("m1")).await.unwrap_err();
        assert!(matches!(err, ImageProviderError::TooLarge(_, _)));
    }

    #[test]
    fn unsupported_format_rejected() {
        assert!(validate_format("photo.bmp").is_err());
        assert!(validate_format("photo.webp").is_ok());
    }
}
