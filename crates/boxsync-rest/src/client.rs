//! Sync server REST client
//!
//! Provides a typed HTTP client for the sync server's `/1/sync` API.
//! Handles authentication headers, endpoint construction, JSON
//! (de)serialization and the mapping of HTTP failures onto [`RestError`].
//!
//! ## Endpoints
//!
//! ```text
//!   POST /1/sync/file/add        POST /1/sync/folder/add
//!   POST /1/sync/file/modify
//!   POST /1/sync/file/delete     POST /1/sync/folder/delete
//!   POST /1/sync/file/move       POST /1/sync/folder/move
//!   GET  /1/sync/metadata?path=
//!   GET  /1/sync/changes?cursor=
//!   GET  /1/sync/quota
//!   PUT  /1/sync/content/{uid}   (Content-Range)
//!   GET  /1/sync/content/{uid}   (Range)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use boxsync_rest::client::RestClient;
//!
//! # fn example() -> anyhow::Result<()> {
//! let client = RestClient::new("https://sync.example.com", Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    header::{CONTENT_RANGE, RANGE, RETRY_AFTER},
    Client, Method, RequestBuilder, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use boxsync_core::domain::{newtypes::ServerUid, Credentials};
use boxsync_core::ports::{
    ChangePage, IRestClient, QuotaReading, RequestContext, RestError, RestRequest, RestResponse,
    ServerItem, UploadChunk,
};

use crate::dto::{
    to_wire_path, ChangesDto, DeleteBody, ErrorBody, FileAddBody, FileModifyBody, FolderAddBody,
    ItemDto, MoveBody, QuotaDto,
};

/// Default per-request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry-after when a 429 carries no usable header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Header naming the device that issued a request
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Header naming the syncbox a request applies to
pub const SYNCBOX_ID_HEADER: &str = "X-Syncbox-Id";

/// Header that lets the server drop replayed creates
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

// ============================================================================
// Status mapping
// ============================================================================

/// Parses a `Retry-After` header value
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2025 23:59:59 GMT"), taken as seconds
///   from now and capped at one hour
///
/// Falls back to the default duration if parsing fails.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target > now {
            if let Some(secs) = (target - now)
                .num_seconds()
                .try_into()
                .ok()
                .filter(|&s: &u64| s <= 3600)
            {
                return Duration::from_secs(secs);
            }
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}

/// Maps a non-success status onto the error taxonomy
///
/// | Status      | Error            |
/// |-------------|------------------|
/// | 401         | `Unauthorized`   |
/// | 404         | `NotFound`       |
/// | 409, 412    | `Conflict`       |
/// | 429         | `RateLimited`    |
/// | 5xx         | `Transport`      |
/// | other 4xx   | `Rejected`       |
pub(crate) fn classify_status(
    status: StatusCode,
    body: ErrorBody,
    retry_after: Option<Duration>,
) -> RestError {
    let message = body
        .error
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    match status {
        StatusCode::UNAUTHORIZED => RestError::Unauthorized(message),
        StatusCode::NOT_FOUND => RestError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RestError::Conflict {
            message,
            current_revision: body.current_revision,
        },
        StatusCode::TOO_MANY_REQUESTS => RestError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER).as_secs(),
        },
        s if s.is_server_error() => RestError::Transport(format!("{}: {}", s.as_u16(), message)),
        s => RestError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Maps a reqwest failure that happened before a status was available
fn classify_send_error(e: reqwest::Error) -> RestError {
    if e.is_decode() {
        RestError::InvalidResponse(e.to_string())
    } else {
        RestError::Transport(e.to_string())
    }
}

// ============================================================================
// RestClient
// ============================================================================

/// HTTP client for the sync server
///
/// Wraps `reqwest::Client` with bearer authentication, identity headers
/// and base URL construction. Credentials are passed per call so the
/// credential guard can swap them without touching the client.
#[derive(Clone)]
pub struct RestClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL without a trailing slash
    base_url: String,
}

impl RestClient {
    /// Creates a client for `base_url` with the given per-request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let parsed = Url::parse(base_url).with_context(|| format!("Invalid base URL {base_url}"))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "Base URL must use http or https: {base_url}"
        );

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Creates a client with the default timeout (useful for testing)
    ///
    /// # Errors
    ///
    /// See [`RestClient::new`].
    pub fn with_base_url(base_url: impl AsRef<str>) -> anyhow::Result<Self> {
        Self::new(base_url.as_ref(), DEFAULT_TIMEOUT)
    }

    /// Returns the base URL for API requests
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates an authenticated request builder for `path`
    ///
    /// Prepends the base URL and adds the Authorization and identity
    /// headers.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        credentials: &Credentials,
        ctx: &RequestContext,
    ) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(credentials.bearer())
            .header(DEVICE_ID_HEADER, ctx.device_id.as_str())
            .header(SYNCBOX_ID_HEADER, ctx.syncbox_id.to_string())
    }

    /// Sends a request and maps every non-2xx status onto [`RestError`]
    pub(crate) async fn send(&self, builder: RequestBuilder) -> Result<Response, RestError> {
        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER));
        let body = response
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<ErrorBody>(&b).ok())
            .unwrap_or_default();

        let err = classify_status(status, body, retry_after);
        debug!(status = status.as_u16(), error = %err, "Request failed");
        Err(err)
    }

    /// Reads and decodes a JSON body
    pub(crate) async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RestError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RestError::Transport(format!("Failed to read body: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| RestError::InvalidResponse(e.to_string()))
    }

    async fn post_item<B: serde::Serialize>(
        &self,
        path: &str,
        credentials: &Credentials,
        ctx: &RequestContext,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<RestResponse, RestError> {
        let mut builder = self
            .request(Method::POST, path, credentials, ctx)
            .json(body);
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        let response = self.send(builder).await?;
        let dto: ItemDto = Self::json(response).await?;
        Ok(RestResponse::Item(ServerItem::try_from(dto)?))
    }

    fn kind_segment(is_folder: bool) -> &'static str {
        if is_folder {
            "folder"
        } else {
            "file"
        }
    }
}

// ============================================================================
// IRestClient implementation
// ============================================================================

#[async_trait]
impl IRestClient for RestClient {
    #[instrument(skip(self, credentials, ctx, request), fields(op = request.name()))]
    async fn execute(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        request: &RestRequest,
    ) -> Result<RestResponse, RestError> {
        match request {
            RestRequest::CreateFile {
                path,
                metadata,
                idempotency_key,
            } => {
                let body = FileAddBody::new(path, metadata);
                self.post_item(
                    "/1/sync/file/add",
                    credentials,
                    ctx,
                    &body,
                    Some(idempotency_key),
                )
                .await
            }
            RestRequest::CreateFolder {
                path,
                idempotency_key,
            } => {
                let body = FolderAddBody {
                    path: to_wire_path(path),
                };
                self.post_item(
                    "/1/sync/folder/add",
                    credentials,
                    ctx,
                    &body,
                    Some(idempotency_key),
                )
                .await
            }
            RestRequest::ModifyFile {
                server_uid,
                path,
                metadata,
                revision,
            } => {
                let body = FileModifyBody {
                    uid: server_uid.to_string(),
                    path: to_wire_path(path),
                    hash: metadata.hash.to_hex(),
                    size: metadata.size,
                    modified_at: metadata.modified_at,
                    revision: revision.clone(),
                };
                self.post_item("/1/sync/file/modify", credentials, ctx, &body, None)
                    .await
            }
            RestRequest::Delete {
                server_uid,
                path,
                is_folder,
                revision,
            } => {
                let body = DeleteBody {
                    uid: server_uid.to_string(),
                    path: to_wire_path(path),
                    revision: revision.clone(),
                };
                let endpoint = format!("/1/sync/{}/delete", Self::kind_segment(*is_folder));
                let builder = self
                    .request(Method::POST, &endpoint, credentials, ctx)
                    .json(&body);
                self.send(builder).await?;
                Ok(RestResponse::Removed)
            }
            RestRequest::Move {
                server_uid,
                from,
                to,
                is_folder,
                revision,
            } => {
                let body = MoveBody {
                    uid: server_uid.to_string(),
                    from: to_wire_path(from),
                    to: to_wire_path(to),
                    revision: revision.clone(),
                };
                let endpoint = format!("/1/sync/{}/move", Self::kind_segment(*is_folder));
                self.post_item(&endpoint, credentials, ctx, &body, None)
                    .await
            }
            RestRequest::GetMetadata { path } => {
                let builder = self
                    .request(Method::GET, "/1/sync/metadata", credentials, ctx)
                    .query(&[("path", to_wire_path(path))]);
                let response = self.send(builder).await?;
                let dto: ItemDto = Self::json(response).await?;
                Ok(RestResponse::Item(ServerItem::try_from(dto)?))
            }
            RestRequest::ChangesSince { cursor } => {
                let mut builder = self.request(Method::GET, "/1/sync/changes", credentials, ctx);
                if let Some(cursor) = cursor {
                    builder = builder.query(&[("cursor", cursor.as_str())]);
                }
                let response = self.send(builder).await?;
                let dto: ChangesDto = Self::json(response).await?;
                let page = ChangePage::try_from(dto)?;
                debug!(
                    items = page.items.len(),
                    has_more = page.has_more,
                    "Fetched change page"
                );
                Ok(RestResponse::Changes(page))
            }
            RestRequest::GetQuota => {
                let builder = self.request(Method::GET, "/1/sync/quota", credentials, ctx);
                let response = self.send(builder).await?;
                let dto: QuotaDto = Self::json(response).await?;
                Ok(RestResponse::Quota(QuotaReading::from(dto)))
            }
        }
    }

    #[instrument(
        skip(self, credentials, ctx, chunk),
        fields(uid = %chunk.server_uid, offset = chunk.offset, len = chunk.data.len())
    )]
    async fn upload_chunk(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        chunk: &UploadChunk,
    ) -> Result<(), RestError> {
        let content_range = if chunk.data.is_empty() {
            format!("bytes */{}", chunk.total_size)
        } else {
            format!(
                "bytes {}-{}/{}",
                chunk.offset,
                chunk.offset + chunk.data.len() as u64 - 1,
                chunk.total_size
            )
        };

        let path = format!("/1/sync/content/{}", chunk.server_uid.as_str());
        let builder = self
            .request(Method::PUT, &path, credentials, ctx)
            .header(CONTENT_RANGE, content_range)
            .body(chunk.data.clone());
        self.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self, credentials, ctx), fields(uid = %server_uid))]
    async fn download_chunk(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        server_uid: &ServerUid,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, RestError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let path = format!("/1/sync/content/{}", server_uid.as_str());
        let builder = self
            .request(Method::GET, &path, credentials, ctx)
            .header(RANGE, format!("bytes={}-{}", offset, offset + len - 1));

        let response = match self.send(builder).await {
            Ok(r) => r,
            Err(RestError::Rejected { status: 416, .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| RestError::Transport(format!("Failed to read body: {e}")))?;
            return Ok(bytes.to_vec());
        }

        // Full body: the server ignored the Range header
        let mut skip = offset;
        let mut out = Vec::with_capacity(len.min(1 << 20) as usize);
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| RestError::Transport(format!("Failed to read body: {e}")))?;
            let mut slice: &[u8] = &piece;
            if skip > 0 {
                let dropped = (skip as usize).min(slice.len());
                slice = &slice[dropped..];
                skip -= dropped as u64;
            }
            let wanted = (len as usize).saturating_sub(out.len());
            out.extend_from_slice(&slice[..wanted.min(slice.len())]);
            if out.len() as u64 >= len {
                break;
            }
        }
        Ok(out)
    }
}
