//! Versioned key-document store holding the station record.
//!
//! The production backend is a GitHub repository file: the blob sha is the
//! version token and a PUT carrying a stale sha is refused by the server.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::types::RemoteDocument;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Found {
        version: String,
        document: RemoteDocument,
    },
    /// No document yet; the next write creates it.
    Absent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("write rejected as stale (status {0})")]
    Conflict(u16),
    #[error("store answered status {0}")]
    Status(u16),
    #[error("malformed document: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether the failure means the network link itself is gone.
    pub fn is_link_down(&self) -> bool {
        match self {
            StoreError::Transport(e) => e.is_connect(),
            _ => false,
        }
    }
}

pub trait DocumentStore {
    async fn fetch(&self) -> Result<Fetched, StoreError>;

    /// Conditional write; `version` of `None` means "create".
    async fn write(
        &self,
        document: &RemoteDocument,
        version: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
    content: String,
}

#[derive(Serialize)]
struct PutContents<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

pub struct GitHubStore {
    client: Client,
    url: String,
    token: String,
    user_agent: String,
    branch: String,
}

impl GitHubStore {
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: config.document_url(),
            token: config.github_token.clone(),
            user_agent: format!("BhangmeterV2.{}", config.station_id),
            branch: config.branch.clone(),
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, &self.url)
            .header("Authorization", format!("token {}", self.token))
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/vnd.github+json")
    }
}

pub fn encode_document(document: &RemoteDocument) -> Result<String, StoreError> {
    let json = serde_json::to_string(document).map_err(|e| StoreError::Malformed(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

pub fn decode_document(content: &str) -> Result<RemoteDocument, StoreError> {
    // The contents API wraps base64 at 60 columns.
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| StoreError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed(e.to_string()))
}

impl DocumentStore for GitHubStore {
    async fn fetch(&self) -> Result<Fetched, StoreError> {
        let response = self.request(reqwest::Method::GET).send().await?;
        let status = response.status();
        info!(status = status.as_u16(), url = %self.url, "Fetched station document");

        match status {
            StatusCode::OK => {
                let body: ContentsResponse = response.json().await?;
                let document = decode_document(&body.content)?;
                Ok(Fetched::Found {
                    version: body.sha,
                    document,
                })
            }
            StatusCode::NOT_FOUND => {
                info!(url = %self.url, "Station document does not exist yet");
                Ok(Fetched::Absent)
            }
            other => Err(StoreError::Status(other.as_u16())),
        }
    }

    async fn write(
        &self,
        document: &RemoteDocument,
        version: Option<&str>,
    ) -> Result<(), StoreError> {
        let body = PutContents {
            message: format!(
                "Update from {} at {}",
                document.station_id, document.last_report_time
            ),
            content: encode_document(document)?,
            branch: &self.branch,
            sha: version,
        };

        let response = self.request(reqwest::Method::PUT).json(&body).send().await?;
        let status = response.status();
        match status.as_u16() {
            200 | 201 => {
                info!(
                    status = status.as_u16(),
                    total = document.monitor_minutes_total,
                    "Station document uploaded"
                );
                Ok(())
            }
            // 409: sha no longer current. 422: sha missing for an existing file.
            code @ (409 | 422) => {
                warn!(status = code, "Station document write rejected as stale");
                Err(StoreError::Conflict(code))
            }
            code => {
                warn!(status = code, "Failed to upload station document");
                Err(StoreError::Status(code))
            }
        }
    }
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Slot {
        revision: u64,
        document: Option<RemoteDocument>,
        writes: Vec<RemoteDocument>,
        fail_fetches: u32,
    }

    /// In-process store with the same optimistic-concurrency rules as the real one.
    #[derive(Default)]
    pub struct MemoryStore {
        slot: Mutex<Slot>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn current(&self) -> Option<RemoteDocument> {
            self.slot.lock().unwrap().document.clone()
        }

        /// Successful writes, oldest first.
        pub fn writes(&self) -> Vec<RemoteDocument> {
            self.slot.lock().unwrap().writes.clone()
        }

        /// Simulates another writer landing between our fetch and write.
        pub fn bump_revision(&self) {
            self.slot.lock().unwrap().revision += 1;
        }

        pub fn fail_next_fetches(&self, count: u32) {
            self.slot.lock().unwrap().fail_fetches = count;
        }
    }

    impl DocumentStore for MemoryStore {
        async fn fetch(&self) -> Result<Fetched, StoreError> {
            let mut slot = self.slot.lock().unwrap();
            if slot.fail_fetches > 0 {
                slot.fail_fetches -= 1;
                return Err(StoreError::Status(503));
            }
            Ok(match &slot.document {
                Some(document) => Fetched::Found {
                    version: format!("v{}", slot.revision),
                    document: document.clone(),
                },
                None => Fetched::Absent,
            })
        }

        async fn write(
            &self,
            document: &RemoteDocument,
            version: Option<&str>,
        ) -> Result<(), StoreError> {
            let mut slot = self.slot.lock().unwrap();
            match (&slot.document, version) {
                (None, None) => {}
                (Some(_), Some(v)) if v == format!("v{}", slot.revision) => {}
                (Some(_), None) => return Err(StoreError::Conflict(422)),
                _ => return Err(StoreError::Conflict(409)),
            }
            slot.revision += 1;
            slot.document = Some(document.clone());
            slot.writes.push(document.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOC_PATH: &str = "/repos/octo/stations/contents/data/st-01.json";

    fn sample_document() -> RemoteDocument {
        RemoteDocument {
            station_id: "ST-01".to_string(),
            event_occurred: false,
            last_report_time: "2024-05-01 12:00:00".to_string(),
            event_time: None,
            monitor_minutes_total: 7,
            location: Location {
                lat: 51.5,
                long: -0.12,
            },
        }
    }

    async fn store_for(server: &MockServer) -> GitHubStore {
        GitHubStore::new(&Config::for_tests(&server.uri())).unwrap()
    }

    #[tokio::test]
    async fn fetch_decodes_wrapped_content() {
        let server = MockServer::start().await;
        let encoded = encode_document(&sample_document()).unwrap();
        let (head, tail) = encoded.split_at(20);
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .and(header("Authorization", "token ghp_test"))
            .and(header("User-Agent", "BhangmeterV2.ST-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123",
                "content": format!("{head}\n{tail}\n"),
            })))
            .mount(&server)
            .await;

        let fetched = store_for(&server).await.fetch().await.unwrap();
        assert_eq!(
            fetched,
            Fetched::Found {
                version: "abc123".to_string(),
                document: sample_document(),
            }
        );
    }

    #[tokio::test]
    async fn fetch_not_found_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(store_for(&server).await.fetch().await.unwrap(), Fetched::Absent);
    }

    #[tokio::test]
    async fn fetch_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = store_for(&server).await.fetch().await.unwrap_err();
        assert!(matches!(err, StoreError::Status(502)));
        assert!(!err.is_link_down());
    }

    #[tokio::test]
    async fn fetch_garbage_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123",
                "content": STANDARD.encode("not json"),
            })))
            .mount(&server)
            .await;

        let err = store_for(&server).await.fetch().await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn write_sends_base64_payload_with_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .await
            .write(&sample_document(), Some("abc123"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["sha"], "abc123");
        assert_eq!(body["branch"], "main");
        assert_eq!(body["message"], "Update from ST-01 at 2024-05-01 12:00:00");
        let content = body["content"].as_str().unwrap();
        assert_eq!(decode_document(content).unwrap(), sample_document());
    }

    #[tokio::test]
    async fn create_omits_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        store_for(&server).await.write(&sample_document(), None).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("sha").is_none());
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let err = store_for(&server)
            .await
            .write(&sample_document(), Some("old"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(409)));
    }

    #[tokio::test]
    async fn unreachable_host_means_link_down() {
        // Nothing listens on the discard port.
        let store = GitHubStore::new(&Config::for_tests("http://127.0.0.1:9")).unwrap();
        let err = store.fetch().await.unwrap_err();
        assert!(err.is_link_down());
    }
}
