use std::path::{Path, PathBuf};

use log::warn;

use crate::ports::DeviceIdentifier;

/// PortMemory remembers the most recently connected device across runs.
/// The state file holds the bare identifier, nothing else.
pub struct PortMemory {
    path: PathBuf,
}

impl PortMemory {
    pub fn new(path: impl Into<PathBuf>) -> PortMemory {
        PortMemory { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the remembered identifier, if any. Unreadable or empty files
    /// are treated the same as a missing file.
    pub fn load(&self) -> Option<DeviceIdentifier> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    "Ignoring unreadable port memory {}: {e}",
                    self.path.display()
                );
                return None;
            }
        };
        let id = contents.trim();
        if id.is_empty() {
            return None;
        }
        Some(id.to_string())
    }

    /// Overwrites the remembered identifier.
    pub fn save(&self, id: &str) -> std::io::Result<()> {
        std::fs::write(&self.path, id)
    }
}
