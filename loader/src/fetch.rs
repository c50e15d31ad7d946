//! This module provides the byte-fetch primitives segments are retrieved with.

use std::future::Future;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, io};

pub use reqwest::Client;
pub use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Asynchronous byte-fetch interface.
///
/// A fetch has GET semantics and resolves exactly once, either with the whole binary response or with an error.
/// Addresses are taken as they are: no escaping nor validation is done before resolving them, so that malformed
/// addresses simply surface as a [`FetchError`].
pub trait Fetch: Send + Sync {
    /// Fetch the resource located at `address`.
    fn fetch(&self, address: &str) -> impl Future<Output = Result<Bytes, FetchError>> + Send;
}

impl<F: Fetch + ?Sized> Fetch for &F {
    #[inline]
    fn fetch(&self, address: &str) -> impl Future<Output = Result<Bytes, FetchError>> + Send {
        (**self).fetch(address)
    }
}

/// HTTP fetcher.
///
/// Addresses are resolved against an optional base URL, or parsed as absolute URLs when no base is set.
/// Any non-success status is reported as a failure.
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher {
    client: Client,
    base: Option<Url>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn with_base(self, base: Url) -> Self {
        Self {
            base: Some(base),
            ..self
        }
    }

    #[inline]
    pub fn base(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    fn resolve(&self, address: &str) -> Result<Url, FetchError> {
        match self.base {
            Some(ref base) => Ok(base.join(address)?),
            None => Ok(Url::parse(address)?),
        }
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, address: &str) -> Result<Bytes, FetchError> {
        let url = self.resolve(address)?;

        tracing::trace!("Fetching `{url}`...");

        let resp = self.client.get(url).send().await?.error_for_status()?;
        let url = resp.url().clone();

        // the advertised length is not trusted to size the buffer
        let bytes = resp.bytes().await?;

        tracing::trace!("Fetched {} bytes from `{url}`", bytes.len());

        Ok(bytes)
    }
}

/// Local storage fetcher.
///
/// Addresses are resolved as paths relative to a root directory, a leading `/` being ignored.
#[derive(Debug, Clone)]
pub struct FsFetcher {
    root: PathBuf,
}

impl FsFetcher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn resolve(&self, address: &str) -> PathBuf {
        self.root.join(address.trim_start_matches('/'))
    }
}

impl Fetch for FsFetcher {
    async fn fetch(&self, address: &str) -> Result<Bytes, FetchError> {
        let path = self.resolve(address);

        tracing::trace!("Reading `{}`...", path.display());

        Ok(fs::read(&path).await?.into())
    }
}
