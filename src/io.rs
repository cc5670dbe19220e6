//! A stream wrapper applying the cheap integrity checks while bytes arrive: a running size
//! limit, and (when a trusted digest is known up front) a SHA-256 check on the final item.
//! A caller that consumes the stream to completion has therefore already had both applied.

use crate::{error, transport::TransportStream, TransportError, TransportErrorKind};
use futures::StreamExt;
use futures_core::Stream;
use ring::digest::{Context, SHA256};
use std::pin::Pin;
use std::task::Poll;
use url::Url;

pub(crate) struct ChecksumStream {
    url: Url,
    inner: TransportStream,
    max_size: u64,
    specifier: &'static str,
    received: u64,
    digest: Option<(Context, Vec<u8>)>,
}

impl ChecksumStream {
    /// Wraps `inner` so that exceeding `max_size` total bytes, or finishing with a SHA-256
    /// digest other than `sha256`, surfaces as an error item. `specifier` names where the
    /// size limit came from.
    pub(crate) fn new(
        inner: TransportStream,
        url: Url,
        max_size: u64,
        specifier: &'static str,
        sha256: Option<&[u8]>,
    ) -> TransportStream {
        Self {
            url,
            inner,
            max_size,
            specifier,
            received: 0,
            digest: sha256.map(|expected| (Context::new(&SHA256), expected.to_owned())),
        }
        .boxed()
    }

    fn fail(&self, source: error::Error) -> TransportError {
        TransportError::new_with_cause(TransportErrorKind::Other, self.url.clone(), source)
    }
}

impl Stream for ChecksumStream {
    type Item = <TransportStream as Stream>::Item;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(next) => next,
        };
        match next {
            Some(Ok(bytes)) => {
                this.received = this.received.saturating_add(bytes.len() as u64);
                if this.received > this.max_size {
                    let over = error::MaxSizeExceededSnafu {
                        what: this.url.to_string(),
                        max_size: this.max_size,
                        specifier: this.specifier,
                    }
                    .build();
                    return Poll::Ready(Some(Err(this.fail(over))));
                }
                if let Some((context, _)) = &mut this.digest {
                    context.update(&bytes);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => {
                // The digest can only be judged once the last byte is in.
                if let Some((context, expected)) = this.digest.take() {
                    let calculated = context.finish();
                    if calculated.as_ref() != expected.as_slice() {
                        let mismatch = error::HashMismatchSnafu {
                            context: this.url.to_string(),
                            calculated: hex::encode(calculated),
                            expected: hex::encode(expected),
                        }
                        .build();
                        return Poll::Ready(Some(Err(this.fail(mismatch))));
                    }
                }
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{io::ChecksumStream, transport::IntoVec};
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use hex_literal::hex;
    use url::Url;

    fn chunked(input: &'static str) -> crate::TransportStream {
        stream::iter(input.as_bytes().chunks(2).map(Bytes::from).map(Ok)).boxed()
    }

    #[tokio::test]
    async fn size_limit_enforced() {
        let url = Url::parse("file:///").unwrap();

        let stream = ChecksumStream::new(chunked("hello"), url.clone(), 5, "test", None);
        let buf = stream.into_vec().await.expect("consuming entire stream");
        assert_eq!(buf, b"hello");

        let stream = ChecksumStream::new(chunked("hello"), url, 4, "test", None);
        assert!(stream.into_vec().await.is_err());
    }

    #[tokio::test]
    async fn digest_checked_at_end_of_stream() {
        let url = Url::parse("file:///").unwrap();
        let good = hex!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        let bad = hex!("0ebdc3317b75839f643387d783535adc360ca01f33c75f7c1e7373adcd675c0b");

        let stream = ChecksumStream::new(chunked("hello"), url.clone(), 5, "test", Some(&good));
        let buf = stream.into_vec().await.expect("consuming entire stream");
        assert_eq!(buf, b"hello");

        let stream = ChecksumStream::new(chunked("hello"), url, 5, "test", Some(&bad));
        assert!(stream.into_vec().await.is_err());
    }
}
