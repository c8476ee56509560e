//! A directory tree implementation of the [`Backend`][super::Backend] trait.
//!
//! The layout is one subdirectory per [`Kind`]:
//!
//! ```text
//! <root>/zones/example.jp          master file, named after the zone origin
//! <root>/services/service1.yaml    service definition
//! <root>/monitors/web.yaml         monitor definition
//! ```
//!
//! Modification times come from the file system, so editing a file in place is enough for the
//! next reconciliation pass to pick it up.

use crate::backend::{Backend, Kind, Listing};
use crate::error::Error;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const YAML_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// A backend reading definitions from a directory tree.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryBackend { root: root.into() }
    }

    fn directory(&self, kind: Kind) -> PathBuf {
        self.root.join(match kind {
            Kind::Zone => "zones",
            Kind::Service => "services",
            Kind::Monitor => "monitors",
        })
    }

    /// The item name for a file, or `None` if the file should be ignored.
    fn item_name(kind: Kind, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        if file_name.starts_with('.') {
            return None;
        }
        match kind {
            Kind::Zone => Some(file_name.to_string()),
            Kind::Service | Kind::Monitor => {
                let extension = path.extension()?.to_str()?;
                if !YAML_EXTENSIONS.contains(&extension) {
                    return None;
                }
                Some(path.file_stem()?.to_str()?.to_string())
            }
        }
    }

    fn candidates(&self, kind: Kind, name: &str) -> Vec<PathBuf> {
        let directory = self.directory(kind);
        match kind {
            Kind::Zone => vec![directory.join(name)],
            Kind::Service | Kind::Monitor => YAML_EXTENSIONS
                .iter()
                .map(|extension| directory.join(format!("{name}.{extension}")))
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for DirectoryBackend {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Listing>, Error> {
        let mut entries = match fs::read_dir(self.directory(kind)).await {
            Ok(entries) => entries,
            // A missing kind directory is an empty listing, not a failed one.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::IO(err)),
        };

        let mut listings = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = Self::item_name(kind, &entry.path()) else {
                continue;
            };
            listings.push(Listing {
                name,
                last_modified: metadata.modified()?,
            });
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    async fn get(&self, kind: Kind, name: &str) -> Result<Vec<u8>, Error> {
        let not_found = || Error::NotFound {
            kind: kind.as_str(),
            name: name.to_string(),
        };
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(not_found());
        }
        for path in self.candidates(kind, name) {
            match fs::read(&path).await {
                Ok(content) => return Ok(content),
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::IO(err)),
            }
        }
        Err(not_found())
    }
}
