use crate::backend::{Backend, Kind, Listing};
use crate::error::Error;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Item {
    content: Vec<u8>,
    last_modified: SystemTime,
}

#[derive(Debug, Default)]
struct Items {
    items: BTreeMap<(Kind, String), Item>,
    clock: Option<SystemTime>,
}

impl Items {
    /// Modification times handed out are strictly increasing, so two quick writes of the same
    /// item are never mistaken for no change.
    fn tick(&mut self) -> SystemTime {
        let now = SystemTime::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::from_micros(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }
}

/// A backend holding definitions in memory. Not durable across restarts.
#[derive(Debug, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct InMemoryBackend {
    items: RwLock<Items>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an item, bumping its modification time.
    pub async fn put(&self, kind: Kind, name: &str, content: impl Into<Vec<u8>>) {
        let mut items = self.items.write().await;
        let last_modified = items.tick();
        items.items.insert(
            (kind, name.to_string()),
            Item {
                content: content.into(),
                last_modified,
            },
        );
    }

    /// Remove an item, returning whether it existed.
    pub async fn remove(&self, kind: Kind, name: &str) -> bool {
        self.items
            .write()
            .await
            .items
            .remove(&(kind, name.to_string()))
            .is_some()
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Listing>, Error> {
        Ok(self
            .items
            .read()
            .await
            .items
            .iter()
            .filter(|((item_kind, _), _)| *item_kind == kind)
            .map(|((_, name), item)| Listing {
                name: name.clone(),
                last_modified: item.last_modified,
            })
            .collect())
    }

    async fn get(&self, kind: Kind, name: &str) -> Result<Vec<u8>, Error> {
        self.items
            .read()
            .await
            .items
            .get(&(kind, name.to_string()))
            .map(|item| item.content.clone())
            .ok_or_else(|| Error::NotFound {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }
}
