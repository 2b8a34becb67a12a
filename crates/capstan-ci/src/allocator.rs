//! Persistent per-variant executor allocation.

use capstan_core::{BuildObserver, Executor, NodeHandle, ProviderResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Maps variant names to executor handles, populated lazily on first
/// allocation and reused for the variant's lifetime within one build.
///
/// Concurrent requests for distinct variants proceed independently; a
/// chained continuation of the same variant resolves to the identical
/// handle without re-requesting allocation.
pub struct NodeAllocator {
    executor: Arc<dyn Executor>,
    nodes: Mutex<HashMap<String, NodeHandle>>,
}

impl NodeAllocator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        NodeAllocator {
            executor,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Executor handle for a variant, allocating on first use.
    pub async fn allocate(
        &self,
        variant: &str,
        label: Option<&str>,
        observer: &dyn BuildObserver,
    ) -> ProviderResult<NodeHandle> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get(variant) {
            debug!(variant = %variant, node = %node.id, "reusing allocated executor");
            return Ok(node.clone());
        }

        let node = self.executor.allocate(variant, label).await?;
        capstan_core::obs::emit_node_allocated(variant, &node.id);
        observer.on_node_allocated(variant, &node);
        nodes.insert(variant.to_string(), node.clone());
        Ok(node)
    }

    /// Release every allocated executor. Called once at build end.
    pub async fn release_all(&self) -> ProviderResult<()> {
        let mut nodes = self.nodes.lock().await;
        for (_, node) in nodes.drain() {
            self.executor.release(node).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::fakes::FakeExecutor;
    use capstan_core::NullObserver;

    #[tokio::test]
    async fn test_allocation_is_reused_per_variant() {
        let exec = Arc::new(FakeExecutor::new());
        let allocator = NodeAllocator::new(exec.clone());

        let first = allocator
            .allocate("linux", None, &NullObserver)
            .await
            .unwrap();
        let second = allocator
            .allocate("linux", None, &NullObserver)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(exec.allocations(), vec!["linux"]);
    }

    #[tokio::test]
    async fn test_distinct_variants_get_distinct_nodes() {
        let exec = Arc::new(FakeExecutor::new());
        let allocator = NodeAllocator::new(exec.clone());

        let linux = allocator
            .allocate("linux", Some("docker"), &NullObserver)
            .await
            .unwrap();
        let windows = allocator
            .allocate("windows", None, &NullObserver)
            .await
            .unwrap();
        assert_ne!(linux.id, windows.id);
        assert_eq!(linux.label.as_deref(), Some("docker"));
        assert_eq!(exec.allocations().len(), 2);
    }
}
