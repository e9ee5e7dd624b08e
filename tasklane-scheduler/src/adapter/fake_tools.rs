//! Shell scripts standing in for cluster tools in tests

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

/// Temporary directory of executable fake tools
///
/// Each script sees `$LOG_DIR`, the directory itself, so it can read canned
/// output files and append its invocation to `calls.log`.
pub(crate) struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Path of a tool as a config string
    pub(crate) fn bin(&self, name: &str) -> String {
        self.path(name).to_string_lossy().to_string()
    }

    /// Writes (or replaces) an executable script named `name`
    pub(crate) fn tool(&self, name: &str, body: &str) {
        let path = self.path(name);
        let script = format!(
            "#!/bin/sh\nLOG_DIR='{}'\n{}\n",
            self.dir.path().display(),
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A tool that only records how it was called
    pub(crate) fn recording_tool(&self, name: &str) {
        self.tool(name, &format!("echo \"{} $*\" >> \"$LOG_DIR/calls.log\"", name));
    }

    /// A tool that prints the contents of `file` (nothing if absent)
    pub(crate) fn output_tool(&self, name: &str, file: &str) {
        self.tool(name, &format!("cat \"$LOG_DIR/{}\" 2>/dev/null || true", file));
    }

    pub(crate) fn set_output(&self, file: &str, contents: &str) {
        std::fs::write(self.path(file), contents).unwrap();
    }

    pub(crate) fn read(&self, file: &str) -> String {
        std::fs::read_to_string(self.path(file)).unwrap_or_default()
    }

    pub(crate) fn calls(&self) -> String {
        self.read("calls.log")
    }
}
