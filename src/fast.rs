use std::fs::File;
use std::io;
use std::path::Path;

use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::FutureExt;
use memmap2::{Mmap, MmapOptions};

use crate::io::IngestionSource;

/// Memory-mapped local file. Slices are copied straight out of the mapping, so reads never block
/// on the async runtime.
/// Assumption: the file is not truncated while mapped.
pub struct MmapSource {
    name: String,
    mmap: Option<Mmap>,
}

impl MmapSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        // zero-length files cannot be mapped on every platform
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file)? })
        };
        Ok(Self { name, mmap })
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or_default()
    }
}

impl IngestionSource for MmapSource {
    fn size(&self) -> u64 {
        self.data().len() as u64
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
        let data = self.data();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        buf.extend_from_slice(&data[start..end]);
        futures::future::ready(Ok(())).boxed()
    }
}
