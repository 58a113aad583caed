use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Content type assumed when the server omits one.
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// A single fetch failure, page-local by design: the caller keeps the
/// resource's original reference and moves on.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: StatusCode },
}

/// Raw bytes of a fetched resource plus its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FetchedResource {
    /// Render the resource as an inline `data:` URI.
    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            STANDARD.encode(&self.bytes)
        )
    }
}

/// HTTP GET wrapper used to pull page resources for inlining.
pub struct ResourceFetcher {
    client: Client,
}

impl ResourceFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self { client })
    }

    /// GET the resource at `url`, returning its bytes and content type.
    /// Transport errors and non-success statuses are reported as
    /// `FetchError` values, never as process-level faults.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedResource, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        Ok(FetchedResource {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> ResourceFetcher {
        ResourceFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn returns_bytes_and_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/logo.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(&[0x89u8, 0x50, 0x4e, 0x47][..])
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/logo.png", server.url())).unwrap();
        let resource = fetcher().fetch(&url).await.unwrap();

        assert_eq!(resource.content_type, "image/png");
        assert_eq!(resource.bytes, vec![0x89, 0x50, 0x4e, 0x47]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_content_type_defaults_to_jpeg() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/photo")
            .with_status(200)
            .with_body("bytes")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/photo", server.url())).unwrap();
        let resource = fetcher().fetch(&url).await.unwrap();

        assert_eq!(resource.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.png")
            .with_status(404)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/missing.png", server.url())).unwrap();
        let err = fetcher().fetch(&url).await.unwrap_err();

        match err {
            FetchError::Status { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn data_uri_embeds_type_and_payload() {
        let resource = FetchedResource {
            content_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(resource.to_data_uri(), "data:image/png;base64,AQID");
    }
}
