use std::ops::Range;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use reqwest::{header::RANGE, Client, Url};

use crate::{error::TransportError, ContentHash};

/// One request to the remote chunk store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Address of the chunk in the remote store.
    pub hash: ContentHash,
    /// Byte range to fetch. The whole chunk when unset.
    pub range: Option<Range<u64>>,
}

/// Source of chunk bytes.
pub trait ChunkTransport: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Bytes, TransportError>>;
}

/// Fetches chunks over HTTP as `GET {base_url}/{hash hex}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, TransportError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;

        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(base_url.to_string()));
        }

        // Url::join replaces the last path segment unless the path ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    pub fn chunk_url(&self, hash: &ContentHash) -> Result<Url, TransportError> {
        self.base_url
            .join(&hash.to_hex())
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))
    }

    #[tracing::instrument(skip(client), err(Debug))]
    async fn get(client: Client, url: Url, range: Option<Range<u64>>) -> Result<Bytes, TransportError> {
        let mut request = client.get(url);
        if let Some(range) = range.filter(|range| !range.is_empty()) {
            request = request.header(RANGE, format!("bytes={}-{}", range.start, range.end - 1));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok(response.bytes().await?)
    }
}

impl ChunkTransport for HttpTransport {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        match self.chunk_url(&request.hash) {
            Ok(url) => Self::get(self.client.clone(), url, request.range).boxed(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }
}
