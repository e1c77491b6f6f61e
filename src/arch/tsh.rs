use crate::terminal::TerminalError;

/// Resolve the `tsh` binary in a portable way.
///
/// An explicit override (from `OPSPAD_TSH`) wins over PATH lookup.
pub fn tsh_program(override_program: Option<&str>) -> String {
    if let Some(p) = override_program.map(str::trim).filter(|p| !p.is_empty()) {
        return p.to_string();
    }

    if let Ok(p) = which::which("tsh") {
        return p.to_string_lossy().to_string();
    }

    // Fallback: bundled GUI apps can have a different PATH than a terminal.
    #[cfg(windows)]
    {
        use std::path::Path;
        if let Ok(pf) = std::env::var("ProgramFiles") {
            let tsh = Path::new(&pf).join("Teleport").join("tsh.exe");
            if tsh.exists() {
                return tsh.to_string_lossy().to_string();
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let tsh = std::path::Path::new("/usr/local/bin/tsh");
        if tsh.exists() {
            return tsh.to_string_lossy().to_string();
        }
    }

    "tsh".to_string()
}

/// Resolve tsh and return a user-friendly error if it's not available.
pub fn tsh_program_checked(override_program: Option<&str>) -> Result<String, TerminalError> {
    let p = tsh_program(override_program);

    // If it's an absolute/relative path, ensure it exists. Otherwise, it is assumed to be on PATH.
    if p.contains('\\') || p.contains('/') {
        if std::path::Path::new(&p).exists() {
            return Ok(p);
        }
        return Err(TerminalError::ProgramNotFound(format!(
            "tsh binary not found at path: {p}"
        )));
    }

    if which::which(&p).is_ok() {
        return Ok(p);
    }

    Err(TerminalError::ProgramNotFound(
        "tsh binary not found. Install the Teleport client or set OPSPAD_TSH to a full path."
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_override_path_is_used() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert_eq!(tsh_program_checked(Some(&path)).unwrap(), path);
    }

    #[test]
    fn missing_override_path_is_reported() {
        let err = tsh_program_checked(Some("/nonexistent/opspad/tsh")).unwrap_err();
        assert!(matches!(err, TerminalError::ProgramNotFound(msg) if msg.contains("/nonexistent/opspad/tsh")));
    }

    #[test]
    fn blank_override_is_ignored() {
        assert_ne!(tsh_program(Some("  ")), "  ");
    }
}
