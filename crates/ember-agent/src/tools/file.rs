//! File tools: read_file, write_file, list_dir

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult, required_str};
use crate::process::WorkingDir;

const MAX_READ_BYTES: usize = 256 * 1024;
const MAX_LIST_ENTRIES: usize = 500;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Filesystem capability used by the file tools.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Write `content`, creating parent directories as needed.
    async fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Entries sorted directories first, then by name.
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>>;
}

/// The local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path).await
    }

    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content).await
    }

    async fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let mut reader = fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }
}

/// Tool for reading file contents
pub struct ReadFileTool {
    fs: Arc<dyn Filesystem>,
    cwd: WorkingDir,
}

impl ReadFileTool {
    pub fn new(fs: Arc<dyn Filesystem>, cwd: WorkingDir) -> Self {
        Self { fs, cwd }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. Relative paths are resolved against the current working directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative or absolute)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let path_str = match required_str(&arguments, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = self.cwd.resolve(path_str);

        let content = match self.fs.read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", path_str, e)),
        };

        if content.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            return ToolResult::text(format!(
                "{}\n\n[File truncated: showing {} of {} bytes]",
                &content[..end],
                end,
                content.len()
            ));
        }
        ToolResult::text(content)
    }
}

/// Tool for writing file contents
pub struct WriteFileTool {
    fs: Arc<dyn Filesystem>,
    cwd: WorkingDir,
}

impl WriteFileTool {
    pub fn new(fs: Arc<dyn Filesystem>, cwd: WorkingDir) -> Self {
        Self { fs, cwd }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does. Automatically creates parent directories."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write (relative or absolute)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let (path_str, content) = match (
            required_str(&arguments, "path"),
            required_str(&arguments, "content"),
        ) {
            (Ok(p), Ok(c)) => (p, c),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        if path_str.trim() == "~" {
            return ToolResult::error("Cannot write to home directory itself");
        }
        let path = self.cwd.resolve(path_str);

        match self.fs.write(&path, content).await {
            Ok(()) => ToolResult::text(format!(
                "Successfully wrote {} bytes to {}",
                content.len(),
                path_str
            )),
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", path_str, e)),
        }
    }
}

/// Tool for listing directory contents
pub struct ListDirTool {
    fs: Arc<dyn Filesystem>,
    cwd: WorkingDir,
}

impl ListDirTool {
    pub fn new(fs: Arc<dyn Filesystem>, cwd: WorkingDir) -> Self {
        Self { fs, cwd }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are marked with a trailing slash."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path to list (relative or absolute)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let path_str = match required_str(&arguments, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = self.cwd.resolve(path_str);

        let entries = match self.fs.list_dir(&path).await {
            Ok(entries) => entries,
            Err(e) => return ToolResult::error(format!("Failed to list {}: {}", path_str, e)),
        };
        if entries.is_empty() {
            return ToolResult::text(format!("{} is empty", path_str));
        }

        let mut lines: Vec<String> = entries
            .iter()
            .take(MAX_LIST_ENTRIES)
            .map(|e| {
                if e.is_dir {
                    format!("{}/", e.name)
                } else {
                    format!("{} ({} bytes)", e.name, e.size)
                }
            })
            .collect();
        if entries.len() > MAX_LIST_ENTRIES {
            lines.push(format!(
                "[{} more entries not shown]",
                entries.len() - MAX_LIST_ENTRIES
            ));
        }
        ToolResult::text(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tools(dir: &TempDir) -> (ReadFileTool, WriteFileTool, ListDirTool) {
        let fs: Arc<dyn Filesystem> = Arc::new(LocalFilesystem);
        let cwd = WorkingDir::new(dir.path());
        (
            ReadFileTool::new(fs.clone(), cwd.clone()),
            WriteFileTool::new(fs.clone(), cwd.clone()),
            ListDirTool::new(fs, cwd),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_relative_path() {
        let dir = TempDir::new().unwrap();
        let (read, write, _) = tools(&dir);

        let result = write
            .execute(
                "c1",
                json!({"path": "src/lib.rs", "content": "pub fn x() {}"}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        assert_eq!(result.content, "Successfully wrote 13 bytes to src/lib.rs");
        assert!(dir.path().join("src/lib.rs").exists());

        let result = read
            .execute("c2", json!({"path": "src/lib.rs"}), CancellationToken::new())
            .await;
        assert_eq!(result, ToolResult::text("pub fn x() {}"));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_result() {
        let dir = TempDir::new().unwrap();
        let (read, _, _) = tools(&dir);
        let result = read
            .execute("c", json!({"path": "nope.txt"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Failed to read nope.txt"));
    }

    #[tokio::test]
    async fn test_write_missing_content() {
        let dir = TempDir::new().unwrap();
        let (_, write, _) = tools(&dir);
        let result = write
            .execute("c", json!({"path": "a.txt"}), CancellationToken::new())
            .await;
        assert_eq!(result, ToolResult::error("Missing 'content' argument"));
    }

    #[tokio::test]
    async fn test_list_dir_sorted_dirs_first() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        std::fs::write(dir.path().join("alpha.txt"), "abc").unwrap();
        let (_, _, list) = tools(&dir);

        let result = list
            .execute("c", json!({"path": "."}), CancellationToken::new())
            .await;
        assert_eq!(result.content, "zeta/\nalpha.txt (3 bytes)");
    }

    #[tokio::test]
    async fn test_tools_follow_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/f.txt"), "inner").unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(LocalFilesystem);
        let cwd = WorkingDir::new(dir.path());
        let read = ReadFileTool::new(fs, cwd.clone());

        cwd.set(dir.path().join("sub"));
        let result = read
            .execute("c", json!({"path": "f.txt"}), CancellationToken::new())
            .await;
        assert_eq!(result.content, "inner");
    }
}
