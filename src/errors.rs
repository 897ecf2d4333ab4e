//! Error types shared across the lifecycle manager and dispatcher.

use std::fmt;

/// Errors produced while sourcing, booting, or restarting an application, or
/// while resolving a host to an application root.
#[derive(Debug, thiserror::Error, Clone)]
pub enum PowError {
    /// An environment script (`.powrc`, `.powenv`, `.rvmrc`) exited non-zero.
    #[error("environment script failed: {stderr}")]
    ScriptError { stdout: String, stderr: String },

    /// `.rvmrc` is present but the configured rvm loader script does not exist.
    #[error("rvm loader not found at {rvm_path} (required by {rvmrc})")]
    RvmMissing { rvmrc: String, rvm_path: String },

    /// The host resolver failed to answer a lookup.
    #[error("host resolver error: {0}")]
    ResolverError(String),

    /// The worker pool reported an error handling or spawning a request.
    #[error("worker pool error: {0}")]
    PoolError(String),
}

impl PowError {
    /// `err.stdout`/`err.stderr` only ever carry real content for
    /// `ScriptError`; other variants render as blank here rather than
    /// undefined/garbage.
    pub fn stdout(&self) -> &str {
        match self {
            PowError::ScriptError { stdout, .. } => stdout,
            _ => "",
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            PowError::ScriptError { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// HTML-escape the handful of characters that matter for embedding raw
/// strings (root paths, error messages) into the error pages.
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `X-Pow-Handler` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerName {
    NonexistentDomain,
    ApplicationException,
}

impl HandlerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerName::NonexistentDomain => "NonexistentDomain",
            HandlerName::ApplicationException => "ApplicationException",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_error_exposes_captured_streams() {
        let err = PowError::ScriptError {
            stdout: "out".into(),
            stderr: "boom".into(),
        };
        assert_eq!(err.stdout(), "out");
        assert_eq!(err.stderr(), "boom");
    }

    #[test]
    fn non_script_errors_have_blank_streams() {
        let err = PowError::ResolverError("nope".into());
        assert_eq!(err.stdout(), "");
        assert_eq!(err.stderr(), "");
    }

    #[test]
    fn escapes_html_special_characters() {
        assert_eq!(html_escape("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }
}
