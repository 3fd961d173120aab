//! System prompt loading.

use std::io::ErrorKind;
use std::path::Path;
use tracing::warn;

/// Read the system prompt, or an empty string when the file is absent.
///
/// Read on every request so edits apply without a restart. Unreadable files
/// are logged and treated as empty rather than failing the request.
pub async fn load_system_prompt(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(prompt) => prompt,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!("Failed to read system prompt {:?}: {e}", path);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_prompt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system_prompt.txt");
        std::fs::write(&path, "You are helpful.\nBe brief.").unwrap();
        assert_eq!(load_system_prompt(&path).await, "You are helpful.\nBe brief.");
    }

    #[tokio::test]
    async fn test_missing_prompt_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_system_prompt(&dir.path().join("nope.txt")).await, "");
    }

    #[tokio::test]
    async fn test_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_system_prompt(dir.path()).await, "");
    }
}
