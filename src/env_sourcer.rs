//! Environment Sourcer — sources a shell script and reports the
//! environment it leaves behind.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::PowError;

/// Marker line printed to stdout right before the post-script environment
/// dump, so we can split "whatever the script itself printed" from the
/// machine-readable envelope.
const MARKER: &str = "__PORTKEEPER_ENV_START__";

#[derive(Debug, Default, Clone)]
pub struct SourceOptions {
    /// Shell snippet run before `. scriptPath` (e.g. to load rvm first).
    pub before: Option<String>,
}

/// Spawn a shell subprocess seeded with `base_env`, source `script_path`
/// into it, and return the resulting environment map. The returned map
/// fully replaces `base_env` — variables the script unset are dropped
/// rather than carried forward.
pub async fn source(
    script_path: &Path,
    base_env: &HashMap<String, String>,
    options: SourceOptions,
) -> Result<HashMap<String, String>, PowError> {
    let mut script = String::new();
    if let Some(before) = &options.before {
        script.push_str(before);
        script.push('\n');
    }
    script.push_str(&format!(". {}\n", shell_quote(script_path)));
    script.push_str(&format!("printf '%s\\n' {}\n", MARKER));
    script.push_str("env -0\n");

    let mut cmd = Command::new("sh");
    cmd.arg("-s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .envs(base_env);

    let mut child = cmd.spawn().map_err(|e| PowError::ScriptError {
        stdout: String::new(),
        stderr: format!("failed to spawn shell: {e}"),
    })?;

    {
        let stdin = child.stdin.as_mut().expect("stdin was piped");
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| PowError::ScriptError {
                stdout: String::new(),
                stderr: format!("failed to write script to shell stdin: {e}"),
            })?;
    }

    let output = child.wait_with_output().await.map_err(|e| PowError::ScriptError {
        stdout: String::new(),
        stderr: format!("failed to wait on shell: {e}"),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(PowError::ScriptError { stdout, stderr });
    }

    Ok(parse_envelope(&stdout))
}

/// Parse the `MARKER\n<NUL-separated KEY=VALUE pairs>` envelope emitted by
/// the terminator snippet above.
fn parse_envelope(stdout: &str) -> HashMap<String, String> {
    let marker_pos = match stdout.find(MARKER) {
        Some(pos) => pos,
        None => return HashMap::new(),
    };
    let after_marker = &stdout[marker_pos + MARKER.len()..];
    // Skip the newline that `printf '%s\n'` appended after the marker.
    let envelope = after_marker.strip_prefix('\n').unwrap_or(after_marker);

    envelope
        .split('\0')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nul_separated_envelope() {
        let stdout = format!("{MARKER}\nFOO=bar\0BAZ=qux\0");
        let env = parse_envelope(&stdout);
        assert_eq!(env.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(env.get("BAZ"), Some(&"qux".to_string()));
    }

    #[test]
    fn missing_marker_yields_empty_map() {
        assert!(parse_envelope("nothing here").is_empty());
    }

    #[tokio::test]
    async fn sourcing_a_script_that_sets_a_var_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("setenv.sh");
        tokio::fs::write(&script, "export X=1\n").await.unwrap();

        let env = source(&script, &HashMap::new(), SourceOptions::default())
            .await
            .expect("sourcing should succeed");
        assert_eq!(env.get("X"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn later_source_overrides_earlier_one() {
        let dir = tempfile::tempdir().unwrap();
        let powrc = dir.path().join(".powrc");
        tokio::fs::write(&powrc, "export X=1\n").await.unwrap();

        let mut env = source(&powrc, &HashMap::new(), SourceOptions::default())
            .await
            .unwrap();

        let powenv = dir.path().join(".powenv");
        tokio::fs::write(&powenv, "export X=2\n").await.unwrap();
        env = source(&powenv, &env, SourceOptions::default()).await.unwrap();

        assert_eq!(env.get("X"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_script_error_with_captured_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fails.sh");
        tokio::fs::write(&script, "echo oops 1>&2\nexit 3\n")
            .await
            .unwrap();

        let err = source(&script, &HashMap::new(), SourceOptions::default())
            .await
            .unwrap_err();
        match err {
            PowError::ScriptError { stderr, .. } => assert!(stderr.contains("oops")),
            other => panic!("expected ScriptError, got {other:?}"),
        }
    }
}
