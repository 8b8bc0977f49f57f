use serde::Serialize;
use stage_vfs::{FsResult, LocalFs};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFile {
    pub file_name: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Reads `path` for download. Goes through whatever filesystem is passed, so
/// an overlay materializes a remote-only file first.
pub fn export_file(fs: &dyn LocalFs, path: &str) -> FsResult<ExportedFile> {
    let bytes = fs.read_file(path)?;
    let file_name = path
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
        .to_string();
    Ok(ExportedFile { file_name, bytes })
}
