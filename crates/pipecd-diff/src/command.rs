use pipecd_common::{Error, Result};
use std::io::Write;
use tokio::process::Command;
use tracing::debug;

fn temp_file(content: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut f = tempfile::NamedTempFile::new()?;
    f.write_all(content)?;
    f.flush()?;
    Ok(f)
}

/// Unified diff of two documents produced by the `command` binary (`diff`)
///
/// The file header lines are dropped; identical inputs give an empty string.
pub async fn render_by_command(command: &str, old: &[u8], new: &[u8]) -> Result<String> {
    let old_file = temp_file(old)?;
    let new_file = temp_file(new)?;

    let output = Command::new(command)
        .arg("-u")
        .arg("-N")
        .arg(old_file.path())
        .arg(new_file.path())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::internal(format!("failed to run {command}: {e}")))?;

    // diff exits 1 when the inputs differ
    match output.status.code() {
        Some(0 | 1) => {}
        code => {
            return Err(Error::internal(format!(
                "{command} exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
    }
    let text = String::from_utf8_lossy(&output.stdout);
    debug!(bytes = text.len(), "rendered diff by command");
    Ok(text
        .lines()
        .skip_while(|l| l.starts_with("--- ") || l.starts_with("+++ "))
        .map(|l| format!("{l}\n"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_by_command() {
        let out = render_by_command("diff", b"a: 1\nb: 2\n", b"a: 1\nb: 3\n").await.unwrap();
        assert!(out.starts_with("@@"));
        assert!(out.contains("-b: 2\n"));
        assert!(out.contains("+b: 3\n"));
    }

    #[tokio::test]
    async fn test_identical_inputs_render_nothing() {
        assert_eq!(render_by_command("diff", b"x\n", b"x\n").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        assert!(render_by_command("/nonexistent/diff", b"", b"").await.is_err());
    }
}
