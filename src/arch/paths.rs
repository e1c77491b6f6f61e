use std::path::PathBuf;

/// Per-user application data directory.
///
/// Falls back to the temp dir on platforms without a data dir so callers always get a path.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("opspad")
}

/// Base directory that kube documents' `kubeConfigRelativePath` is resolved against.
pub fn kubeconfigs_dir() -> PathBuf {
    app_data_dir().join("kube")
}
