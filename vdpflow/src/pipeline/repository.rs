//! Item storage behind an injected interface.

use async_trait::async_trait;
use dashmap::DashMap;

use super::item::PipelineItem;
use crate::errors::Result;

/// Storage for pipeline items.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Loads an item.
    async fn get(&self, content_key: &str) -> Result<Option<PipelineItem>>;

    /// Inserts or replaces an item.
    async fn put(&self, item: PipelineItem) -> Result<()>;

    /// Lists every item, ordered by content key.
    async fn list(&self) -> Result<Vec<PipelineItem>>;
}

/// In-memory repository.
#[derive(Debug, Default)]
pub struct InMemoryItemRepository {
    items: DashMap<String, PipelineItem>,
}

impl InMemoryItemRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn get(&self, content_key: &str) -> Result<Option<PipelineItem>> {
        Ok(self.items.get(content_key).map(|item| item.clone()))
    }

    async fn put(&self, item: PipelineItem) -> Result<()> {
        self.items.insert(item.content_key.clone(), item);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PipelineItem>> {
        let mut items: Vec<_> = self.items.iter().map(|entry| entry.value().clone()).collect();
        items.sort_by(|a, b| a.content_key.cmp(&b.content_key));
        Ok(items)
    }
}
