use sha2::{Digest, Sha256};

mod config;
pub use config::{
    parse_optional_positive_u64_env, StageConfig, STAGE_ENV_AUDIO_QUIESCE_MS,
    STAGE_ENV_CONTENT_ROOT, STAGE_ENV_ERROR_FLUSH_MS, STAGE_ENV_FETCH_CONNECT_TIMEOUT_MS,
    STAGE_ENV_FETCH_TIMEOUT_MS, STAGE_ENV_SCRATCH_DIR, STAGE_ENV_WORKING_ROOT,
};

pub const STAGE_WORKING_ROOT: &str = "/stage_working_directory";
pub const STAGE_SCRATCH_DIR: &str = "/tmp";
pub const STAGE_CONTENT_ROOT: &str = ".";
pub const STAGE_WATCH_INFO_FILE: &str = ".stage_watch_info";
pub const STAGE_SENTINEL_PREFIX: &str = "<";
pub const STAGE_ENTRY_MODULE: &str = "__main__";

/// Interpreter-internal module names that reach the filesystem hooks but never
/// exist on the content root.
pub const STAGE_RESERVED_MODULE_NAMES: &[&str] = &["frozen", "_hashlib", "ssl"];

pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FETCH_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AUDIO_QUIESCE_MS: u64 = 50;
pub const DEFAULT_ERROR_FLUSH_MS: u64 = 100;

/// Joins `path` onto `cwd` when relative and folds `.`, `..` and repeated
/// separators. `..` never climbs above `/`.
pub fn normalize_path(path: &str, cwd: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    format!("/{}", parts.join("/"))
}

/// Suffix of `path` below `root`, or `None` when `path` is outside it.
/// Both arguments must already be normalized.
pub fn relative_to<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every proper ancestor of an absolute path, shallowest first. `/` itself is
/// not included.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
