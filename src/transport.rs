//! Abstracts over the method and protocol by which repository files are obtained. The trust
//! core never opens sockets itself; it only asks a [`Transport`] for the bytes at a URL.

use async_trait::async_trait;
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::{StreamExt, TryStreamExt};
use futures_core::stream::BoxStream;
use std::fmt::{self, Debug, Display};
use std::io::ErrorKind;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::urlpath::SafeUrlPath;

/// The stream of bytes produced by a [`Transport`] fetch.
pub type TransportStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A trait to abstract over the method/protocol by which files are obtained.
#[async_trait]
pub trait Transport: Debug + DynClone + Send + Sync {
    /// Opens a byte stream for the file at `url`.
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError>;
}

// Implement `Clone` for `Transport` trait objects.
dyn_clone::clone_trait_object!(Transport);

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The kind of error that a transport experienced during `fetch`.
///
/// `FileNotFound` is distinguished because some refresh decisions depend on whether a file
/// is absent as opposed to unfetchable.
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// The transport does not handle the URL scheme, e.g. `file://` or `http://`.
    UnsupportedUrlScheme,
    /// The file cannot be found.
    FileNotFound,
    /// The transport failed for any other reason, e.g. IO error, broken pipe, etc.
    Other,
}

/// The error type that [`Transport::fetch`] returns.
#[derive(Debug)]
pub struct TransportError {
    /// The kind of error that occurred.
    pub kind: TransportErrorKind,
    /// The URL that the transport was trying to fetch.
    pub url: String,
    /// The underlying error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TransportError {
    /// Creates a new [`TransportError`] without an underlying cause.
    pub fn new<S: AsRef<str>>(kind: TransportErrorKind, url: S) -> Self {
        Self {
            kind,
            url: url.as_ref().into(),
            source: None,
        }
    }

    /// Creates a new [`TransportError`] wrapping an underlying cause.
    pub fn new_with_cause<S, E>(kind: TransportErrorKind, url: S, source: E) -> Self
    where
        S: AsRef<str>,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            kind,
            url: url.as_ref().into(),
            source: Some(source.into()),
        }
    }

    /// Creates a [`TransportError`] for reporting an unhandled URL scheme.
    pub fn unsupported_scheme<S: AsRef<str>>(url: S) -> Self {
        Self::new(TransportErrorKind::UnsupportedUrlScheme, url)
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(
                f,
                "{:?} error fetching '{}': {}",
                self.kind, self.url, source
            ),
            None => write!(f, "{:?} error fetching '{}'", self.kind, self.url),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Collects a [`TransportStream`] into a `Vec<u8>`, stopping at the first stream error.
#[async_trait]
pub trait IntoVec {
    /// Consumes the stream.
    async fn into_vec(self) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl IntoVec for TransportStream {
    async fn into_vec(mut self) -> Result<Vec<u8>, TransportError> {
        let mut v = Vec::new();
        while let Some(chunk) = self.next().await {
            v.extend_from_slice(&chunk?);
        }
        Ok(v)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Provides a [`Transport`] for local files.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemTransport;

#[async_trait]
impl Transport for FilesystemTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        if url.scheme() != "file" {
            return Err(TransportError::unsupported_scheme(url));
        }

        let path = url.safe_url_filepath();
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::NotFound => TransportErrorKind::FileNotFound,
                _ => TransportErrorKind::Other,
            };
            TransportError::new_with_cause(kind, &url, e)
        })?;

        let stream_url = url.clone();
        Ok(ReaderStream::new(file)
            .map_err(move |e| {
                TransportError::new_with_cause(TransportErrorKind::Other, &stream_url, e)
            })
            .boxed())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A Transport that provides support for both local files and, if the `http` feature is
/// enabled, HTTP-transported files.
#[derive(Debug, Clone)]
pub struct DefaultTransport {
    file: FilesystemTransport,
    #[cfg(feature = "http")]
    http: crate::HttpTransport,
}

impl Default for DefaultTransport {
    fn default() -> Self {
        Self {
            file: FilesystemTransport,
            #[cfg(feature = "http")]
            http: crate::HttpTransport::default(),
        }
    }
}

impl DefaultTransport {
    /// Creates a new `DefaultTransport`. Same as `default()`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        match url.scheme() {
            "file" => self.file.fetch(url).await,
            "http" | "https" => self.handle_http(url).await,
            _ => Err(TransportError::unsupported_scheme(url)),
        }
    }
}

impl DefaultTransport {
    #[cfg(not(feature = "http"))]
    #[allow(clippy::unused_self)]
    async fn handle_http(&self, url: Url) -> Result<TransportStream, TransportError> {
        Err(TransportError::new_with_cause(
            TransportErrorKind::UnsupportedUrlScheme,
            url,
            "the library was not compiled with the http feature enabled",
        ))
    }

    #[cfg(feature = "http")]
    async fn handle_http(&self, url: Url) -> Result<TransportStream, TransportError> {
        self.http.fetch(url).await
    }
}
