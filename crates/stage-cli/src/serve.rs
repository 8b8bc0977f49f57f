use anyhow::{anyhow, Result};
use percent_encoding::percent_decode_str;
use stage_overlay::guess_content_type;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Response, Server};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const LISTING_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ContentResponse {
    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: b"not found".to_vec(),
        }
    }
}

/// Serves a directory as a content root: files with an extension-derived
/// type, directories as an HTML listing.
pub struct ContentServer {
    pub endpoint: String,
    server: Arc<Server>,
    server_thread: Option<thread::JoinHandle<()>>,
}

impl ContentServer {
    pub fn start(bind: &str, port: u16, dir: PathBuf) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("content directory not found: {}", dir.display()));
        }
        let listener = TcpListener::bind((bind, port))?;
        let addr = listener.local_addr()?;
        let server = Arc::new(
            Server::from_listener(listener, None).map_err(|e| anyhow!(e.to_string()))?,
        );
        let endpoint = format!("http://{}:{}", addr.ip(), addr.port());

        let worker = server.clone();
        let handle = thread::spawn(move || {
            for request in worker.incoming_requests() {
                let response = content_response(&dir, request.url());
                debug!(url = %request.url(), status = response.status, "served");
                let mut reply = Response::from_data(response.body).with_status_code(response.status);
                if let Ok(header) =
                    Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes())
                {
                    reply = reply.with_header(header);
                }
                if let Err(err) = request.respond(reply) {
                    warn!(error = %err, "failed to send response");
                }
            }
        });

        Ok(Self {
            endpoint,
            server,
            server_thread: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.server.unblock();
        if let Some(handle) = self.server_thread.take() {
            let _ = handle.join();
        }
    }
}

pub fn content_response(root: &Path, url: &str) -> ContentResponse {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let decoded = match percent_decode_str(path).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return ContentResponse::not_found(),
    };
    let segments: Vec<&str> = decoded
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.iter().any(|s| *s == ".." || s.contains('\\')) {
        return ContentResponse::not_found();
    }

    let target = segments.iter().fold(root.to_path_buf(), |acc, s| acc.join(s));
    if target.is_dir() {
        return ContentResponse {
            status: 200,
            content_type: LISTING_CONTENT_TYPE.to_string(),
            body: render_listing(&target, &segments.join("/")).into_bytes(),
        };
    }
    match fs::read(&target) {
        Ok(body) => ContentResponse {
            status: 200,
            content_type: guess_content_type(&decoded).to_string(),
            body,
        },
        Err(_) => ContentResponse::not_found(),
    }
}

fn render_listing(dir: &Path, relative: &str) -> String {
    let mut names: Vec<String> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                format!("{}/", name)
            } else {
                name
            }
        })
        .collect();
    names.sort();

    let title = format!("Index of /{}", relative);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{0}</title></head>\n<body>\n<h1>{0}</h1>\n<ul>\n",
        escape_html(&title)
    );
    for name in names {
        let escaped = escape_html(&name);
        html.push_str(&format!("<li><a href=\"{0}\">{0}</a></li>\n", escaped));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
