use stage_vfs::{FileHandle, FsResult, LocalFs, Metadata, OpenFlags};
use tracing::trace;

use crate::fetcher::RemoteFetcher;
use crate::materializer::{MaterializeStatus, Materializer, OverlayEntry};
use crate::resolver::{PathResolver, Resolution};

/// Filesystem decorator that materializes content-root paths on first touch.
///
/// `open` with the plain read word and `stat` pull the path in before
/// delegating; every other call goes straight to `inner`. The wrapper keeps no
/// state of its own beyond the materializer, so it survives a reset of the
/// tree underneath it unchanged.
pub struct OverlayFs<F: LocalFs> {
    inner: F,
    resolver: PathResolver,
    materializer: Materializer,
}

impl<F: LocalFs> OverlayFs<F> {
    pub fn new(inner: F, resolver: PathResolver, fetcher: Box<dyn RemoteFetcher>) -> Self {
        Self {
            inner,
            resolver,
            materializer: Materializer::new(fetcher),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn entries(&self) -> Vec<OverlayEntry> {
        self.materializer.entries()
    }

    pub fn fetch_count(&self) -> usize {
        self.materializer.fetch_count()
    }

    pub fn purge_session(&self) -> usize {
        self.materializer.purge()
    }

    /// Resolves and, if eligible, materializes `path`. Never fails: anything
    /// that goes wrong leaves the path absent for the delegated call to report.
    pub fn materialize(&self, path: &str) -> Option<MaterializeStatus> {
        match self.resolver.resolve(path, &self.inner.cwd()) {
            Resolution::Eligible(resolved) => Some(self.materializer.ensure(&self.inner, &resolved)),
            Resolution::Excluded(reason) => {
                trace!(path = %path, ?reason, "path excluded from overlay");
                None
            }
        }
    }
}

impl<F: LocalFs> LocalFs for OverlayFs<F> {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<FileHandle> {
        if flags.is_plain_read() {
            self.materialize(path);
        }
        self.inner.open(path, flags, mode)
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        self.materialize(path);
        self.inner.stat(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.inner.mkdir(path, mode)
    }

    /// Existence checks are answered through `stat`.
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> FsResult<()> {
        self.inner.write_file(path, bytes)
    }

    /// Whole-file reads behave like a plain read-open followed by a read.
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.materialize(path);
        self.inner.read_file(path)
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        self.inner.chdir(path)
    }

    fn cwd(&self) -> String {
        self.inner.cwd()
    }

    fn remove_tree(&self, path: &str) -> FsResult<()> {
        self.inner.remove_tree(path)
    }
}
