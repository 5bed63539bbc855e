use std::io;
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::codec::TextDecoder;
use crate::ReadError;

/// Byte data of known size that can be read by offset range.
///
/// The ingestor borrows a source for the duration of one run and never holds on to it afterwards.
pub trait IngestionSource: Send + Sync {
    /// Total size in bytes, known up front.
    fn size(&self) -> u64;

    /// Display name, used in logs and as the default file name when persisting.
    fn name(&self) -> &str;

    /// Append the bytes in `[offset, offset + len)`, clipped to the end of the source, to `buf`.
    fn read_into<'a>(
        &'a self,
        offset: u64,
        len: usize,
        buf: &'a mut BytesMut,
    ) -> BoxFuture<'a, io::Result<()>>;
}

fn clip(offset: u64, len: usize, size: u64) -> (u64, usize) {
    let start = offset.min(size);
    let end = offset.saturating_add(len as u64).min(size);
    (start, (end - start) as usize)
}

/// In-memory source, e.g. an upload body already buffered by the host.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: String,
    data: Bytes,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl IngestionSource for BytesSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_into<'a>(
        &'a self,
        offset: u64,
        len: usize,
        buf: &'a mut BytesMut,
    ) -> BoxFuture<'a, io::Result<()>> {
        let (start, len) = clip(offset, len, self.size());
        let start = start as usize;
        buf.extend_from_slice(&self.data[start..start + len]);
        futures::future::ready(Ok(())).boxed()
    }
}

/// Local file source. The size is captured when the file is opened.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    size: u64,
    file: tokio::sync::Mutex<File>,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            name,
            size,
            file: tokio::sync::Mutex::new(file),
        })
    }
}

impl IngestionSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_into<'a>(
        &'a self,
        offset: u64,
        len: usize,
        buf: &'a mut BytesMut,
    ) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let (start, len) = clip(offset, len, self.size);
            if len == 0 {
                return Ok(());
            }
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(start)).await?;
            let filled = buf.len();
            buf.resize(filled + len, 0);
            file.read_exact(&mut buf[filled..]).await?;
            Ok(())
        }
        .boxed()
    }
}

/// Open a local file as a source.
pub async fn source_from_path(path: &Path) -> io::Result<FileSource> {
    FileSource::open(path).await
}

/// Shared holder for the raw read buffer reused between chunk reads.
///
/// Its contents are derived data: they can be released at any point, including from a
/// memory-pressure callback while a read is in flight.
#[derive(Debug, Clone, Default)]
pub struct ScratchBuffer {
    slot: Arc<Mutex<Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    buf: BytesMut,
    released: bool,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the retained allocation. A buffer currently checked out is discarded when returned.
    pub fn release(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.buf = BytesMut::new();
        slot.released = true;
    }

    /// Bytes of capacity currently retained.
    pub fn retained(&self) -> usize {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buf
            .capacity()
    }

    fn checkout(&self) -> BytesMut {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.released = false;
        let mut buf = mem::take(&mut slot.buf);
        buf.clear();
        buf
    }

    fn restore(&self, buf: BytesMut) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.released {
            slot.buf = buf;
        }
    }
}

/// Reads fixed-width windows of a source as text, strictly in order.
///
/// The decoder is stateful, so a multi-byte character split across two windows is emitted
/// whole with the later window.
pub struct ChunkReader {
    decoder: TextDecoder,
    scratch: ScratchBuffer,
}

impl ChunkReader {
    pub fn new(decoder: TextDecoder, scratch: ScratchBuffer) -> Self {
        Self { decoder, scratch }
    }

    /// Decode `[offset, offset + width)` clipped to the end of `source`.
    pub async fn read_chunk<S>(
        &mut self,
        source: &S,
        offset: u64,
        width: usize,
    ) -> Result<String, ReadError>
    where
        S: IngestionSource + ?Sized,
    {
        let mut buf = self.scratch.checkout();
        buf.reserve(width);
        let read = source.read_into(offset, width, &mut buf).await;
        let decoded = match read {
            Ok(()) => {
                let last = offset.saturating_add(width as u64) >= source.size();
                self.decoder.decode(&buf, offset, last)
            }
            Err(e) => Err(ReadError::Io(e)),
        };
        self.scratch.restore(buf);
        decoded
    }
}

/// One-shot read of `[offset, offset + width)` with a fresh decoder.
pub async fn read_text<S>(
    source: &S,
    offset: u64,
    width: usize,
    charset: &str,
    lossy: bool,
) -> Result<String, ReadError>
where
    S: IngestionSource + ?Sized,
{
    let mut decoder = TextDecoder::for_label(charset, lossy)?;
    let mut buf = BytesMut::with_capacity(width.min(source.size() as usize));
    source.read_into(offset, width, &mut buf).await?;
    decoder.decode(&buf, offset, true)
}
