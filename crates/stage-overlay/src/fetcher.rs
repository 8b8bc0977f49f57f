use anyhow::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use stage_core::StageConfig;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::resolver::RemotePath;

pub const DIRECTORY_LISTING_CONTENT_TYPE: &str = "text/html";

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found { bytes: Vec<u8>, content_type: String },
    NotFound,
    TransportError(String),
}

impl FetchOutcome {
    pub fn found(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        FetchOutcome::Found {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

/// Blocking retrieval from the content root. Implementations must not return
/// before the outcome is final: the filesystem call waiting on it is
/// synchronous.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, remote: &RemotePath) -> FetchOutcome;
}

impl<T: RemoteFetcher + ?Sized> RemoteFetcher for Box<T> {
    fn fetch(&self, remote: &RemotePath) -> FetchOutcome {
        (**self).fetch(remote)
    }
}

/// Picks the fetcher matching the configured content root: HTTP(S) URLs go
/// over the network, anything else is read as a local directory.
pub fn fetcher_for_root(config: &StageConfig) -> Result<Box<dyn RemoteFetcher>> {
    let root = config.content_root.trim();
    if root.starts_with("http://") || root.starts_with("https://") {
        return Ok(Box::new(HttpFetcher::new(config)?));
    }
    Ok(Box::new(DirFetcher::new(root)))
}

pub struct HttpFetcher {
    client: HttpClient,
}

impl HttpFetcher {
    pub fn new(config: &StageConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_millis(config.fetch_connect_timeout_ms))
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()?;
        Ok(Self { client })
    }

    pub fn url_for(remote: &RemotePath) -> String {
        let encoded: Vec<String> = remote
            .relative
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect();
        format!(
            "{}/{}",
            remote.root.trim_end_matches('/'),
            encoded.join("/")
        )
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, remote: &RemotePath) -> FetchOutcome {
        let url = Self::url_for(remote);
        let response = match self.client.get(&url).send() {
            Ok(response) => response,
            Err(err) => {
                debug!(url = %url, error = %err, "remote GET transport error");
                return FetchOutcome::TransportError(err.to_string());
            }
        };
        let status = response.status().as_u16();
        if status != 200 {
            debug!(url = %url, status, "remote GET returned non-200");
            return FetchOutcome::NotFound;
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        match response.bytes() {
            Ok(body) => FetchOutcome::Found {
                bytes: body.to_vec(),
                content_type,
            },
            Err(err) => {
                debug!(url = %url, error = %err, "remote GET body read failed");
                FetchOutcome::TransportError(err.to_string())
            }
        }
    }
}

/// Content root backed by a directory on the host. Directories answer the way
/// a static file server answers with a listing page.
pub struct DirFetcher {
    root: PathBuf,
}

impl DirFetcher {
    pub fn new(root: &str) -> Self {
        let root = root.strip_prefix("file://").unwrap_or(root);
        Self {
            root: PathBuf::from(root),
        }
    }
}

impl RemoteFetcher for DirFetcher {
    fn fetch(&self, remote: &RemotePath) -> FetchOutcome {
        let path = remote
            .relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |acc, segment| acc.join(segment));
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return FetchOutcome::NotFound,
            Err(err) => return FetchOutcome::TransportError(err.to_string()),
        };
        if meta.is_dir() {
            return FetchOutcome::found(Vec::new(), DIRECTORY_LISTING_CONTENT_TYPE);
        }
        match fs::read(&path) {
            Ok(bytes) => FetchOutcome::found(bytes, guess_content_type(&remote.relative)),
            Err(err) => FetchOutcome::TransportError(err.to_string()),
        }
    }
}

/// Fixed map of relative paths to responses; used when the embedding
/// pre-populates everything the session may touch.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    entries: HashMap<String, (Vec<u8>, String)>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, relative: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let content_type = guess_content_type(relative).to_string();
        self.entries
            .insert(relative.to_string(), (bytes.into(), content_type));
        self
    }

    pub fn response(
        mut self,
        relative: &str,
        bytes: impl Into<Vec<u8>>,
        content_type: &str,
    ) -> Self {
        self.entries
            .insert(relative.to_string(), (bytes.into(), content_type.to_string()));
        self
    }

    pub fn dir(self, relative: &str) -> Self {
        self.response(relative, Vec::new(), DIRECTORY_LISTING_CONTENT_TYPE)
    }
}

impl RemoteFetcher for StaticFetcher {
    fn fetch(&self, remote: &RemotePath) -> FetchOutcome {
        match self.entries.get(&remote.relative) {
            Some((bytes, content_type)) => FetchOutcome::found(bytes.clone(), content_type.clone()),
            None => FetchOutcome::NotFound,
        }
    }
}

pub fn guess_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "py" => "text/x-python; charset=utf-8",
        "json" => "application/json",
        "js" => "text/javascript",
        "css" => "text/css",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "whl" | "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
