use serde::Serialize;
use stage_core::{
    normalize_path, relative_to, STAGE_RESERVED_MODULE_NAMES, STAGE_SENTINEL_PREFIX,
    STAGE_WATCH_INFO_FILE,
};
use std::fmt;

/// Location of a path on the content root: the root as configured plus the
/// suffix below the working root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePath {
    pub root: String,
    pub relative: String,
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root.trim_end_matches('/'), self.relative)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPath {
    pub local: String,
    pub remote: RemotePath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    Sentinel,
    ControlFile,
    ReservedModule,
    OutsideWorkingRoot,
    WorkingRoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Eligible(ResolvedPath),
    Excluded(Exclusion),
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    working_root: String,
    content_root: String,
}

impl PathResolver {
    pub fn new(working_root: &str, content_root: &str) -> Self {
        Self {
            working_root: normalize_path(working_root, "/"),
            content_root: content_root.to_string(),
        }
    }

    pub fn working_root(&self) -> &str {
        &self.working_root
    }

    pub fn content_root(&self) -> &str {
        &self.content_root
    }

    pub fn resolve(&self, raw: &str, cwd: &str) -> Resolution {
        if raw.starts_with(STAGE_SENTINEL_PREFIX) {
            return Resolution::Excluded(Exclusion::Sentinel);
        }
        if raw.ends_with(STAGE_WATCH_INFO_FILE) {
            return Resolution::Excluded(Exclusion::ControlFile);
        }
        if STAGE_RESERVED_MODULE_NAMES.contains(&raw) {
            return Resolution::Excluded(Exclusion::ReservedModule);
        }
        let local = normalize_path(raw, cwd);
        let relative = match relative_to(&self.working_root, &local) {
            Some("") => return Resolution::Excluded(Exclusion::WorkingRoot),
            Some(rel) => rel.to_string(),
            None => return Resolution::Excluded(Exclusion::OutsideWorkingRoot),
        };
        Resolution::Eligible(ResolvedPath {
            local,
            remote: RemotePath {
                root: self.content_root.clone(),
                relative,
            },
        })
    }
}
