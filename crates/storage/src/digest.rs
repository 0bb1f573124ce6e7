//! Integrity computation over decompressed archive streams.
//!
//! Archives may arrive gzipped (registry tarballs) or plain (mirror entries).
//! The digest is always taken over the decompressed bytes so that a fetched
//! archive and its mirror copy produce the same integrity.

use async_compression::tokio::bufread::GzipDecoder;
use lockmirror_core::{Integrity, IntegrityHasher};
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::instrument;

use crate::error::{StorageError, StorageResult};

/// Leading bytes of a gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Chunk size for streaming reads (64 KiB).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// A boxed decompressed byte stream.
pub type DecodedReader<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

/// Wrap `reader` in a gzip decoder if it starts with the gzip magic bytes,
/// otherwise pass it through unchanged.
///
/// The sniffed bytes are consumed from `reader` and put back in front of it,
/// so the decision does not depend on how the first chunk is split.
pub async fn decompress_maybe<'a, R>(mut reader: R) -> std::io::Result<DecodedReader<'a>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    let mut head = Vec::with_capacity(GZIP_MAGIC.len());
    while head.len() < GZIP_MAGIC.len() {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let take = buf.len().min(GZIP_MAGIC.len() - head.len());
        head.extend_from_slice(&buf[..take]);
        reader.consume(take);
    }

    let gzipped = head == GZIP_MAGIC;
    let rejoined = Cursor::new(head).chain(reader);
    if gzipped {
        let mut decoder = GzipDecoder::new(rejoined);
        decoder.multiple_members(true);
        Ok(Box::pin(decoder))
    } else {
        Ok(Box::pin(rejoined))
    }
}

/// Hash everything `reader` yields.
pub async fn digest_reader<R>(mut reader: R) -> std::io::Result<Integrity>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = IntegrityHasher::new();
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Compute the integrity of a local archive.
///
/// Returns `Ok(None)` if the file does not exist. A file that exists but
/// cannot be read or decompressed is an error.
#[instrument]
pub async fn digest_file(path: &Path) -> StorageResult<Option<Integrity>> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::Integrity {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let digest = async {
        let reader = decompress_maybe(BufReader::with_capacity(STREAM_CHUNK_SIZE, file)).await?;
        digest_reader(reader).await
    };

    digest
        .await
        .map(Some)
        .map_err(|source| StorageError::Integrity {
            path: path.to_path_buf(),
            source,
        })
}
