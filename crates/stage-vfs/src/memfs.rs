//! In-memory tree filesystem.
//!
//! Stands in for the runtime's in-browser filesystem: nothing survives the
//! process, and the whole tree sits behind one mutex.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use stage_core::{file_name, normalize_path, parent_path};

use crate::{
    FileHandle, FileKind, FsError, FsResult, LocalFs, Metadata, OpenFlags, DEFAULT_DIR_MODE,
    DEFAULT_FILE_MODE,
};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { children: BTreeMap<String, Node>, mode: u32 },
}

impl Node {
    fn empty_dir(mode: u32) -> Self {
        Node::Dir {
            children: BTreeMap::new(),
            mode,
        }
    }

    fn kind(&self) -> FileKind {
        match self {
            Node::File { .. } => FileKind::File,
            Node::Dir { .. } => FileKind::Directory,
        }
    }

    fn metadata(&self) -> Metadata {
        match self {
            Node::File { data, mode } => Metadata {
                kind: FileKind::File,
                size: data.len() as u64,
                mode: *mode,
            },
            Node::Dir { children, mode } => Metadata {
                kind: FileKind::Directory,
                size: children.len() as u64,
                mode: *mode,
            },
        }
    }
}

#[derive(Debug)]
struct MemState {
    root: Node,
    cwd: String,
}

impl MemState {
    fn resolve(&self, path: &str) -> FsResult<String> {
        if path.is_empty() {
            return Err(FsError::NotFound(path.to_string()));
        }
        if path.contains('\0') {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        Ok(normalize_path(path, &self.cwd))
    }

    fn node(&self, abs: &str) -> Option<&Node> {
        let mut current = &self.root;
        for segment in abs.split('/').filter(|s| !s.is_empty()) {
            current = match current {
                Node::Dir { children, .. } => children.get(segment)?,
                Node::File { .. } => return None,
            };
        }
        Some(current)
    }

    fn node_mut(&mut self, abs: &str) -> Option<&mut Node> {
        let mut current = &mut self.root;
        for segment in abs.split('/').filter(|s| !s.is_empty()) {
            current = match current {
                Node::Dir { children, .. } => children.get_mut(segment)?,
                Node::File { .. } => return None,
            };
        }
        Some(current)
    }

    /// Children of the directory that would hold `abs`, plus the entry name.
    fn parent_children_mut(
        &mut self,
        abs: &str,
    ) -> FsResult<(&mut BTreeMap<String, Node>, String)> {
        let parent = parent_path(abs).ok_or_else(|| FsError::InvalidPath(abs.to_string()))?;
        let name = file_name(abs).to_string();
        match self.node_mut(parent) {
            Some(Node::Dir { children, .. }) => Ok((children, name)),
            Some(Node::File { .. }) => Err(FsError::NotADirectory(parent.to_string())),
            None => Err(FsError::NotFound(parent.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct MemFs {
    state: Mutex<MemState>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                root: Node::empty_dir(DEFAULT_DIR_MODE),
                cwd: "/".to_string(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names directly below `path`, sorted.
    pub fn list_dir(&self, path: &str) -> FsResult<Vec<String>> {
        let state = self.lock();
        let abs = state.resolve(path)?;
        match state.node(&abs) {
            Some(Node::Dir { children, .. }) => Ok(children.keys().cloned().collect()),
            Some(Node::File { .. }) => Err(FsError::NotADirectory(abs)),
            None => Err(FsError::NotFound(abs)),
        }
    }
}

impl LocalFs for MemFs {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<FileHandle> {
        let mut state = self.lock();
        let abs = state.resolve(path)?;
        let exclusive = flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE);
        match state.node_mut(&abs) {
            Some(_) if exclusive => Err(FsError::AlreadyExists(abs)),
            Some(Node::Dir { .. }) if flags.writes() => Err(FsError::IsADirectory(abs)),
            Some(node) => {
                if let Node::File { data, .. } = node {
                    if flags.writes() && flags.contains(OpenFlags::TRUNCATE) {
                        data.clear();
                    }
                }
                let meta = node.metadata();
                Ok(FileHandle {
                    path: abs,
                    flags,
                    kind: meta.kind,
                    size: meta.size,
                })
            }
            None if flags.contains(OpenFlags::CREATE) => {
                let (children, name) = state.parent_children_mut(&abs)?;
                children.insert(
                    name,
                    Node::File {
                        data: Vec::new(),
                        mode,
                    },
                );
                Ok(FileHandle {
                    path: abs,
                    flags,
                    kind: FileKind::File,
                    size: 0,
                })
            }
            None => Err(FsError::NotFound(abs)),
        }
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        let state = self.lock();
        let abs = state.resolve(path)?;
        state
            .node(&abs)
            .map(Node::metadata)
            .ok_or(FsError::NotFound(abs))
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut state = self.lock();
        let abs = state.resolve(path)?;
        if state.node(&abs).is_some() {
            return Err(FsError::AlreadyExists(abs));
        }
        let (children, name) = state.parent_children_mut(&abs)?;
        children.insert(name, Node::empty_dir(mode));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let state = self.lock();
        match state.resolve(path) {
            Ok(abs) => state.node(&abs).is_some(),
            Err(_) => false,
        }
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> FsResult<()> {
        let mut state = self.lock();
        let abs = state.resolve(path)?;
        let mode = match state.node(&abs) {
            Some(Node::Dir { .. }) => return Err(FsError::IsADirectory(abs)),
            Some(Node::File { mode, .. }) => *mode,
            None => DEFAULT_FILE_MODE,
        };
        let (children, name) = state.parent_children_mut(&abs)?;
        children.insert(
            name,
            Node::File {
                data: bytes.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let state = self.lock();
        let abs = state.resolve(path)?;
        match state.node(&abs) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(FsError::IsADirectory(abs)),
            None => Err(FsError::NotFound(abs)),
        }
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        let abs = state.resolve(path)?;
        match state.node(&abs).map(Node::kind) {
            Some(FileKind::Directory) => {
                state.cwd = abs;
                Ok(())
            }
            Some(FileKind::File) => Err(FsError::NotADirectory(abs)),
            None => Err(FsError::NotFound(abs)),
        }
    }

    fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    fn remove_tree(&self, path: &str) -> FsResult<()> {
        let mut state = self.lock();
        let abs = state.resolve(path)?;
        if abs == "/" {
            return Err(FsError::InvalidPath(abs));
        }
        let (children, name) = state.parent_children_mut(&abs)?;
        match children.remove(&name) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(abs)),
        }
    }
}
