use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellProgram {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellProgram {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// POSIX shells accept `-l -c` and can be probed for their login environment.
    pub fn is_posix(&self) -> bool {
        let name = std::path::Path::new(&self.program)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        matches!(name.as_str(), "sh" | "bash" | "zsh" | "dash" | "ksh" | "fish")
    }
}

fn find_in_path(program: &str) -> Option<String> {
    // Avoid hardcoding absolute paths; rely on PATH lookup.
    which::which(program)
        .ok()
        .map(|p: PathBuf| p.to_string_lossy().to_string())
}

#[cfg(windows)]
fn try_known_windows_locations() -> Vec<String> {
    use std::path::Path;

    let mut out = Vec::new();

    // Prefer PowerShell 7 if installed.
    if let Ok(pf) = std::env::var("ProgramFiles") {
        let p = Path::new(&pf).join("PowerShell").join("7").join("pwsh.exe");
        if p.exists() {
            out.push(p.to_string_lossy().to_string());
        }
    }

    if let Ok(root) = std::env::var("SystemRoot") {
        let p = Path::new(&root)
            .join("System32")
            .join("WindowsPowerShell")
            .join("v1.0")
            .join("powershell.exe");
        if p.exists() {
            out.push(p.to_string_lossy().to_string());
        }
    }

    out
}

/// Shell for a new local terminal session.
///
/// `override_program` (from `OPSPAD_SHELL`) wins. Otherwise Windows prefers `pwsh`, then
/// `powershell`; everything else uses `$SHELL`, then `zsh`, then `sh`.
pub fn default_shell_command(override_program: Option<&str>) -> ShellProgram {
    if let Some(p) = override_program.map(str::trim).filter(|p| !p.is_empty()) {
        return ShellProgram::new(p, vec![]);
    }

    #[cfg(windows)]
    {
        if let Some(p) = find_in_path("pwsh") {
            return ShellProgram::new(p, vec![]);
        }
        if let Some(p) = find_in_path("powershell") {
            return ShellProgram::new(p, vec![]);
        }
        if let Some(candidate) = try_known_windows_locations().into_iter().next() {
            return ShellProgram::new(candidate, vec![]);
        }
        return ShellProgram::new("powershell", vec![]);
    }

    #[cfg(not(windows))]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.trim().is_empty() {
                return ShellProgram::new(shell, vec![]);
            }
        }
        if let Some(p) = find_in_path("zsh") {
            return ShellProgram::new(p, vec![]);
        }
        find_in_path("sh")
            .map(|p| ShellProgram::new(p, vec![]))
            .unwrap_or_else(|| ShellProgram::new("sh", vec![]))
    }
}
