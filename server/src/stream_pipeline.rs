//! StreamPipeline: routes an upload body through a `Content-Type`-keyed
//! decoder chain (spec §4.5).
//!
//! Bytes arrive from [`data_received`](Pipeline::data_received) push-style
//! (one call per request-body chunk). They are pushed through any base64/AES
//! stages synchronously, then written into one end of a [`tokio::io::duplex`]
//! pipe; a task spawned in [`prepare`] reads the other end through an
//! (optionally gzip-decoding) `AsyncRead` chain and either streams it to a
//! destination file or, for tar content types, unpacks it directly into the
//! tenant directory. This mirrors `server/src/decompression.rs`'s
//! enum-of-codecs-behind-one-`AsyncRead` idiom while bridging the push-based
//! chunk API the rest of the server uses.

use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::GzipDecoder;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::aes::{AesCbcDecoder, AesKeySource};
use crate::error::{ServerError, ServerResult};

/// The decoder chain selected by a request's `Content-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Identity,
    Aes { base64_wrapped: bool },
    Gzip,
    GzipAes,
    Tar { gzip: bool },
    TarAes { gzip: bool },
}

impl ContentKind {
    pub fn dispatch(content_type: &str) -> ServerResult<Self> {
        match content_type {
            "" | "application/octet-stream" => Ok(Self::Identity),
            "application/aes" => Ok(Self::Aes { base64_wrapped: true }),
            "application/aes-octet-stream" => Ok(Self::Aes {
                base64_wrapped: false,
            }),
            "application/gz" => Ok(Self::Gzip),
            "application/gz.aes" => Ok(Self::GzipAes),
            "application/tar" => Ok(Self::Tar { gzip: false }),
            "application/tar.gz" => Ok(Self::Tar { gzip: true }),
            "application/tar.aes" => Ok(Self::TarAes { gzip: false }),
            "application/tar.gz.aes" => Ok(Self::TarAes { gzip: true }),
            other => Err(ServerError::PolicyRejected(format!(
                "unsupported Content-Type: {other}"
            ))),
        }
    }

    fn has_aes(self) -> bool {
        matches!(self, Self::Aes { .. } | Self::GzipAes | Self::TarAes { .. })
    }

    fn base64_wrapped(self) -> bool {
        matches!(self, Self::Aes { base64_wrapped: true })
    }

    fn has_gzip(self) -> bool {
        matches!(
            self,
            Self::Gzip | Self::GzipAes | Self::Tar { gzip: true } | Self::TarAes { gzip: true }
        )
    }

    pub fn is_tar(self) -> bool {
        matches!(self, Self::Tar { .. } | Self::TarAes { .. })
    }
}

/// Where a non-tar pipeline's decoded output lands, and what a tar pipeline
/// extracts into.
pub enum Destination {
    File(PathBuf),
    TarExtract(PathBuf),
}

struct Base64Stage {
    buffer: Vec<u8>,
}

impl Base64Stage {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn process(&mut self, data: &[u8]) -> ServerResult<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let whole = (self.buffer.len() / 4) * 4;
        let chunk: Vec<u8> = self.buffer.drain(..whole).collect();
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        BASE64
            .decode(&chunk)
            .map_err(|_| ServerError::PolicyRejected("malformed base64 in AES body".to_owned()))
    }

    fn finish(&mut self) -> ServerResult<Vec<u8>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        BASE64
            .decode(&self.buffer)
            .map_err(|_| ServerError::PolicyRejected("malformed base64 in AES body".to_owned()))
    }
}

/// A single upload request's decoder chain.
pub struct Pipeline {
    base64: Option<Base64Stage>,
    aes: Option<AesCbcDecoder>,
    writer: Option<tokio::io::DuplexStream>,
    sink: JoinHandle<ServerResult<()>>,
}

impl Pipeline {
    /// Builds the decoder chain and spawns the task that drains it into
    /// `destination`.
    pub fn prepare(kind: ContentKind, aes_key: Option<AesKeySource>, destination: Destination) -> ServerResult<Self> {
        if kind.has_aes() != aes_key.is_some() {
            return Err(ServerError::PolicyRejected(
                "Content-Type requires AES parameters but none were supplied".to_owned(),
            ));
        }

        const DUPLEX_BUF: usize = 64 * 1024;
        let (writer, reader) = tokio::io::duplex(DUPLEX_BUF);

        let sink = if kind.has_gzip() {
            let decoder = GzipDecoder::new(BufReader::new(reader));
            spawn_sink(decoder, destination)
        } else {
            spawn_sink(reader, destination)
        };

        Ok(Self {
            base64: kind.base64_wrapped().then(Base64Stage::new),
            aes: aes_key.map(AesCbcDecoder::new),
            writer: Some(writer),
            sink,
        })
    }

    /// Pushes one request-body chunk through the base64/AES stages and into
    /// the duplex pipe.
    pub async fn data_received(&mut self, chunk: &[u8]) -> ServerResult<()> {
        let mut bytes = chunk.to_vec();
        if let Some(stage) = &mut self.base64 {
            bytes = stage.process(&bytes)?;
        }
        if let Some(stage) = &mut self.aes {
            bytes = stage.process(&bytes)?;
        }
        self.write(&bytes).await
    }

    async fn write(&mut self, bytes: &[u8]) -> ServerResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(ServerError::InternalServerError)?;
        writer.write_all(bytes).await.map_err(ServerError::storage_error)
    }

    /// Flushes remaining buffered bytes, closes the pipe, and awaits the
    /// sink task's completion.
    pub async fn finalize(mut self) -> ServerResult<()> {
        let mut tail = Vec::new();
        if let Some(stage) = &mut self.base64 {
            tail.extend(stage.finish()?);
        }
        if let Some(stage) = &mut self.aes {
            tail.extend(stage.finish()?);
        }
        self.write(&tail).await?;

        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.map_err(ServerError::storage_error)?;
        }

        self.sink
            .await
            .map_err(|e| ServerError::storage_error(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        Ok(())
    }
}

fn spawn_sink<R>(reader: R, destination: Destination) -> JoinHandle<ServerResult<()>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        match destination {
            Destination::File(path) => copy_to_file(reader, &path).await,
            Destination::TarExtract(dir) => extract_tar(reader, dir).await,
        }
    })
}

async fn copy_to_file<R: AsyncRead + Unpin>(mut reader: R, path: &Path) -> ServerResult<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(ServerError::storage_error)?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(ServerError::storage_error)?;
    file.flush().await.map_err(ServerError::storage_error)
}

async fn extract_tar<R>(reader: R, dest_dir: PathBuf) -> ServerResult<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(reader);
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(bridge);
        archive.unpack(&dest_dir)
    })
    .await
    .map_err(|e| ServerError::storage_error(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    .map_err(ServerError::storage_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch() {
        assert_eq!(ContentKind::dispatch("").unwrap(), ContentKind::Identity);
        assert_eq!(
            ContentKind::dispatch("application/tar.gz.aes").unwrap(),
            ContentKind::TarAes { gzip: true }
        );
        ContentKind::dispatch("application/unknown").unwrap_err();
    }

    #[tokio::test]
    async fn test_identity_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin.part");

        let mut pipeline = Pipeline::prepare(ContentKind::Identity, None, Destination::File(path.clone())).unwrap();
        pipeline.data_received(b"hello ").await.unwrap();
        pipeline.data_received(b"world").await.unwrap();
        pipeline.finalize().await.unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"hello world");
    }
}
