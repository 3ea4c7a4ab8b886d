//! Client address exclusion list.

use std::sync::Arc;

use tracing::info;

use crate::error::StoreResult;
use crate::model::ExclusionEntry;
use crate::store::ExclusionStore;

/// Thin management layer over [`ExclusionStore`]. Holds no cache of its own,
/// so readers always see the stored state.
#[derive(Clone)]
pub struct ExclusionList {
    store: Arc<dyn ExclusionStore>,
}

impl ExclusionList {
    pub fn new(store: Arc<dyn ExclusionStore>) -> Self {
        Self { store }
    }

    /// Add an address. A duplicate is a conflict.
    pub async fn add(&self, address: &str) -> StoreResult<ExclusionEntry> {
        let entry = self.store.insert_exclusion(address).await?;
        info!(target: "cachescope::exclusions", address = %entry.address, "Address excluded");
        Ok(entry)
    }

    /// Remove an address. A missing address is not-found.
    pub async fn remove(&self, address: &str) -> StoreResult<()> {
        self.store.delete_exclusion(address).await?;
        info!(target: "cachescope::exclusions", address = address.trim(), "Address re-included");
        Ok(())
    }

    /// Current entries, sorted by address.
    pub async fn list(&self) -> StoreResult<Vec<ExclusionEntry>> {
        self.store.exclusions().await
    }

    pub async fn contains(&self, address: &str) -> StoreResult<bool> {
        let address = address.trim();
        Ok(self
            .store
            .exclusions()
            .await?
            .iter()
            .any(|e| e.address == address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_add_list_remove() {
        let list = ExclusionList::new(Arc::new(MemoryStore::new()));

        list.add("10.0.0.9").await.unwrap();
        list.add("10.0.0.1").await.unwrap();

        let addresses: Vec<_> = list.list().await.unwrap().into_iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec!["10.0.0.1".to_string(), "10.0.0.9".to_string()]);
        assert!(list.contains(" 10.0.0.9").await.unwrap());

        list.remove("10.0.0.9").await.unwrap();
        assert!(!list.contains("10.0.0.9").await.unwrap());
    }

    #[tokio::test]
    async fn test_outcomes_are_surfaced() {
        let list = ExclusionList::new(Arc::new(MemoryStore::new()));
        list.add("10.0.0.5").await.unwrap();

        assert!(matches!(list.add("10.0.0.5").await, Err(StoreError::Conflict { .. })));
        assert!(matches!(list.remove("10.0.0.6").await, Err(StoreError::NotFound { .. })));
    }
}
