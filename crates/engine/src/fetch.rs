//! Remote fetch and integrity pipeline.
//!
//! A fetched archive flows through a small stage graph:
//!
//! ```text
//! response body -> gunzip (if gzipped) -> producer -+-> persist (temp file)
//!                                                   +-> digest  (sha512)
//! ```
//!
//! The producer hands each decompressed chunk to both consumers over their
//! own bounded channels, so persisting and hashing proceed independently and
//! report their failures independently. The mirror entry is only replaced if
//! every stage succeeded.

use crate::error::FetchError;
use bytes::Bytes;
use futures::TryStreamExt;
use lockmirror_core::{ClientCertificate, Credentials, Integrity, IntegrityHasher};
use lockmirror_storage::digest::STREAM_CHUNK_SIZE;
use lockmirror_storage::{MirrorStore, MirrorUpload, decompress_maybe};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::instrument;

/// Chunks buffered per consumer before the producer waits.
const CHANNEL_DEPTH: usize = 8;

/// HTTP fetcher for registry archives.
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl Fetcher {
    /// Create a fetcher without a request timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(None)
    }

    /// Create a fetcher whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self, FetchError> {
        let client = client_builder(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client, timeout })
    }

    /// Download `url` into the mirror entry at `path` and return the
    /// integrity of its decompressed content.
    #[instrument(skip(self, credentials, store), fields(auth = credentials.auth.header_value().is_some(), tls = credentials.tls.is_some()))]
    pub async fn fetch_into(
        &self,
        url: &str,
        credentials: &Credentials,
        store: &MirrorStore,
        path: &Path,
    ) -> Result<Integrity, FetchError> {
        let client = match &credentials.tls {
            Some(certificate) => self.client_with_identity(certificate).await?,
            None => self.client.clone(),
        };

        let mut request = client.get(url).header(ACCEPT, "application/octet-stream");
        if let Some(value) = credentials.auth.header_value() {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let decoded = decompress_maybe(StreamReader::new(body))
            .await
            .map_err(|source| classify_read_error(url, source))?;

        let upload = store
            .begin_write(path)
            .await
            .map_err(|source| FetchError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        persist_and_digest(decoded, upload, url, path).await
    }

    async fn client_with_identity(
        &self,
        certificate: &ClientCertificate,
    ) -> Result<reqwest::Client, FetchError> {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| FetchError::Tls { path, source })
            }
        };
        let mut pem = read(&certificate.key_file).await?;
        pem.push(b'\n');
        pem.extend(read(&certificate.cert_file).await?);

        let identity = reqwest::Identity::from_pem(&pem).map_err(FetchError::Identity)?;
        client_builder(self.timeout)
            .identity(identity)
            .build()
            .map_err(FetchError::Client)
    }
}

fn client_builder(timeout: Option<Duration>) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder()
        .user_agent(concat!("lockmirror/", env!("CARGO_PKG_VERSION")));
    match timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder,
    }
}

/// Body read failures wrap the transport error; anything else came from
/// decompression.
fn classify_read_error(url: &str, source: std::io::Error) -> FetchError {
    let from_transport = source
        .get_ref()
        .is_some_and(|inner| inner.is::<reqwest::Error>());
    if from_transport {
        FetchError::Download {
            url: url.to_string(),
            source,
        }
    } else {
        FetchError::Integrity {
            url: url.to_string(),
            source,
        }
    }
}

/// Feed a decompressed stream to the mirror upload and the hasher at once.
async fn persist_and_digest<R>(
    mut source: R,
    mut upload: MirrorUpload,
    url: &str,
    path: &Path,
) -> Result<Integrity, FetchError>
where
    R: AsyncRead + Unpin,
{
    let (persist_tx, mut persist_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (digest_tx, mut digest_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

    let produce = async move {
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            // A consumer that hung up has failed and reports its own error.
            let (persisted, digested) =
                tokio::join!(persist_tx.send(chunk.clone()), digest_tx.send(chunk));
            if persisted.is_err() || digested.is_err() {
                break;
            }
        }
        Ok::<u64, std::io::Error>(total)
    };

    let persist = async move {
        let mut result = Ok(());
        while let Some(chunk) = persist_rx.recv().await {
            if let Err(e) = upload.write(&chunk).await {
                result = Err(e);
                break;
            }
        }
        (upload, result)
    };

    let digest = async move {
        let mut hasher = IntegrityHasher::new();
        while let Some(chunk) = digest_rx.recv().await {
            hasher.update(&chunk);
        }
        hasher
    };

    let (produced, (upload, persisted), hasher) = tokio::join!(produce, persist, digest);

    let outcome = match (produced, persisted) {
        (_, Err(source)) => Err(FetchError::Write {
            path: path.to_path_buf(),
            source,
        }),
        (Err(source), Ok(())) => Err(classify_read_error(url, source)),
        (Ok(0), Ok(())) => Err(FetchError::EmptyResponse {
            url: url.to_string(),
        }),
        (Ok(total), Ok(())) => {
            tracing::debug!(bytes = total, hashed = hasher.bytes_hashed(), "archive received");
            Ok(hasher.finalize())
        }
    };

    match outcome {
        Ok(integrity) => {
            upload
                .finish()
                .await
                .map_err(|source| FetchError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(integrity)
        }
        Err(e) => {
            upload.abort().await;
            Err(e)
        }
    }
}
