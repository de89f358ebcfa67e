//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use super::{PlanStatusRecord, Storage, StorageError, StackStatus};
use crate::core::stack::Stack;
use crate::core::types::{PlanId, RunId, StackId};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    stacks: RwLock<HashMap<StackId, Stack>>,
    statuses: RwLock<HashMap<StackId, StackStatus>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_stack(&self, stack: Stack) -> Result<(), StorageError> {
        let mut stacks = self.stacks.write().map_err(|_| StorageError::LockPoisoned)?;
        if stacks.contains_key(&stack.id) {
            return Err(StorageError::DuplicateKey(format!("stack: {}", stack.id)));
        }
        stacks.insert(stack.id.clone(), stack);
        Ok(())
    }

    async fn update_stack(&self, stack: Stack) -> Result<(), StorageError> {
        let mut stacks = self.stacks.write().map_err(|_| StorageError::LockPoisoned)?;
        match stacks.get_mut(&stack.id) {
            Some(existing) => {
                *existing = stack;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("stack: {}", stack.id))),
        }
    }

    async fn get_stack(&self, id: &StackId) -> Result<Stack, StorageError> {
        let stacks = self.stacks.read().map_err(|_| StorageError::LockPoisoned)?;
        stacks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("stack: {}", id)))
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>, StorageError> {
        let stacks = self.stacks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = stacks.values().cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn delete_stack(&self, id: &StackId) -> Result<(), StorageError> {
        let mut stacks = self.stacks.write().map_err(|_| StorageError::LockPoisoned)?;
        stacks
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("stack: {}", id)))?;
        drop(stacks);

        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        statuses.remove(id);
        Ok(())
    }

    async fn get_status(&self, id: &StackId) -> Result<StackStatus, StorageError> {
        let statuses = self
            .statuses
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(statuses
            .get(id)
            .cloned()
            .unwrap_or_else(|| StackStatus::new(id.clone())))
    }

    async fn save_plan_status(
        &self,
        id: &StackId,
        plan_id: &PlanId,
        record: PlanStatusRecord,
    ) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        statuses
            .entry(id.clone())
            .or_insert_with(|| StackStatus::new(id.clone()))
            .plans
            .insert(plan_id.clone(), record);
        Ok(())
    }

    async fn remove_plan_statuses(
        &self,
        id: &StackId,
        plan_ids: &[PlanId],
    ) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if let Some(status) = statuses.get_mut(id) {
            for plan_id in plan_ids {
                status.plans.remove(plan_id);
            }
        }
        Ok(())
    }

    async fn reset_status(&self, id: &StackId) -> Result<(), StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        statuses.remove(id);
        Ok(())
    }

    async fn try_acquire_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let status = statuses
            .entry(id.clone())
            .or_insert_with(|| StackStatus::new(id.clone()));

        if status.run.is_running {
            return Ok(false);
        }
        status.run.is_running = true;
        status.run.lease = Some(lease);
        status.run.lease_acquired_at = Some(SystemTime::now());
        Ok(true)
    }

    async fn release_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let Some(status) = statuses.get_mut(id) else {
            return Ok(false);
        };
        if status.run.lease != Some(lease) {
            return Ok(false);
        }
        status.run.is_running = false;
        status.run.lease = None;
        status.run.lease_acquired_at = None;
        status.run.last_run_at = Some(SystemTime::now());
        Ok(true)
    }

    async fn force_release_run(&self, id: &StackId) -> Result<Option<RunId>, StorageError> {
        let mut statuses = self
            .statuses
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let Some(status) = statuses.get_mut(id) else {
            return Ok(None);
        };
        if !status.run.is_running {
            return Ok(None);
        }
        let previous = status.run.lease.take();
        status.run.is_running = false;
        status.run.lease_acquired_at = None;
        status.run.last_run_at = Some(SystemTime::now());
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PlanStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn stack(name: &str, plans: &[&str]) -> Stack {
        Stack::new(
            name,
            plans.iter().map(|p| (PlanId::new(*p), Vec::new())).collect(),
        )
    }

    fn completed() -> PlanStatusRecord {
        let mut record = PlanStatusRecord::pending();
        record.mark_running();
        record.mark_completed(Duration::from_millis(3), Some(0));
        record
    }

    #[tokio::test]
    async fn test_save_and_get_stack() {
        let storage = InMemoryStorage::new();
        storage.save_stack(stack("s", &["a", "b"])).await.unwrap();

        let retrieved = storage.get_stack(&StackId::new("s")).await.unwrap();
        assert_eq!(retrieved.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_stack_fails() {
        let storage = InMemoryStorage::new();
        storage.save_stack(stack("s", &["a"])).await.unwrap();

        let result = storage.save_stack(stack("s", &["b"])).await;
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_update_missing_stack_fails() {
        let storage = InMemoryStorage::new();
        let result = storage.update_stack(stack("s", &["a"])).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_stacks_oldest_first() {
        let storage = InMemoryStorage::new();
        storage.save_stack(stack("first", &["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        storage.save_stack(stack("second", &["a"])).await.unwrap();

        let stacks = storage.list_stacks().await.unwrap();
        let names: Vec<_> = stacks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_delete_stack_drops_status() {
        let storage = InMemoryStorage::new();
        let id = StackId::new("s");
        storage.save_stack(stack("s", &["a"])).await.unwrap();
        storage
            .save_plan_status(&id, &PlanId::new("a"), completed())
            .await
            .unwrap();

        storage.delete_stack(&id).await.unwrap();

        assert!(matches!(
            storage.get_stack(&id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.get_status(&id).await.unwrap().plans.is_empty());
        assert!(matches!(
            storage.delete_stack(&id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_stack_has_empty_status() {
        let storage = InMemoryStorage::new();
        let status = storage.get_status(&StackId::new("nope")).await.unwrap();
        assert!(status.plans.is_empty());
        assert!(!status.run.is_running);
    }

    #[tokio::test]
    async fn test_plan_status_overwrite_and_remove() {
        let storage = InMemoryStorage::new();
        let id = StackId::new("s");
        let a = PlanId::new("a");

        storage
            .save_plan_status(&id, &a, PlanStatusRecord::pending())
            .await
            .unwrap();
        storage.save_plan_status(&id, &a, completed()).await.unwrap();
        assert_eq!(
            storage.get_status(&id).await.unwrap().status_of(&a),
            PlanStatus::Completed
        );

        storage.remove_plan_statuses(&id, &[a.clone()]).await.unwrap();
        assert!(storage.get_status(&id).await.unwrap().plans.is_empty());
    }

    #[tokio::test]
    async fn test_run_lease_is_exclusive() {
        let storage = InMemoryStorage::new();
        let id = StackId::new("s");
        let first = RunId::new();
        let second = RunId::new();

        assert!(storage.try_acquire_run(&id, first).await.unwrap());
        assert!(!storage.try_acquire_run(&id, second).await.unwrap());

        assert!(!storage.release_run(&id, second).await.unwrap());
        assert!(storage.release_run(&id, first).await.unwrap());

        let status = storage.get_status(&id).await.unwrap();
        assert!(!status.run.is_running);
        assert!(status.run.last_run_at.is_some());
        assert!(storage.try_acquire_run(&id, second).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut handles = vec![];

        for _ in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage
                    .try_acquire_run(&StackId::new("s"), RunId::new())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_force_release_returns_previous_lease() {
        let storage = InMemoryStorage::new();
        let id = StackId::new("s");
        let lease = RunId::new();

        assert_eq!(storage.force_release_run(&id).await.unwrap(), None);
        storage.try_acquire_run(&id, lease).await.unwrap();

        assert_eq!(storage.force_release_run(&id).await.unwrap(), Some(lease));
        assert!(!storage.get_status(&id).await.unwrap().run.is_running);
        assert!(!storage.release_run(&id, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_clears_lease_and_records() {
        let storage = InMemoryStorage::new();
        let id = StackId::new("s");
        storage.try_acquire_run(&id, RunId::new()).await.unwrap();
        storage
            .save_plan_status(&id, &PlanId::new("a"), completed())
            .await
            .unwrap();

        storage.reset_status(&id).await.unwrap();

        let status = storage.get_status(&id).await.unwrap();
        assert!(status.plans.is_empty());
        assert!(!status.run.is_running);
        assert!(status.run.last_run_at.is_none());
    }
}
