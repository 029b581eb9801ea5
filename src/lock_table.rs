//! Operation lock table: per-VM mutual exclusion so that at most one
//! lifecycle operation runs against a given VM identity at a time.

use crate::error::EngineError;
use crate::types::OperationKind;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct OperationLockTable {
    locks: Mutex<HashMap<String, OperationKind>>,
}

/// RAII guard returned by a successful `try_lock`. Dropping it (including
/// via an early `?` return in a handler) releases the lock, so a handler
/// can never forget to unlock on an error path.
pub struct LockGuard<'a> {
    table: &'a OperationLockTable,
    vm_id: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(&self.vm_id);
    }
}

impl OperationLockTable {
    pub fn new() -> Self {
        OperationLockTable {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to acquire the lock for `vm_id`. Non-blocking: returns
    /// `EngineError::Busy` immediately rather than waiting, since a queued
    /// retry is the RPC client's decision to make.
    pub fn try_lock<'a>(
        &'a self,
        vm_id: &str,
        op: OperationKind,
    ) -> Result<LockGuard<'a>, EngineError> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(conflicting) = locks.get(vm_id) {
            return Err(EngineError::Busy {
                vm_id: vm_id.to_string(),
                conflicting: *conflicting,
            });
        }
        locks.insert(vm_id.to_string(), op);
        Ok(LockGuard {
            table: self,
            vm_id: vm_id.to_string(),
        })
    }

    fn unlock(&self, vm_id: &str) {
        self.locks.lock().unwrap().remove(vm_id);
    }

    pub fn current_operation(&self, vm_id: &str) -> Option<OperationKind> {
        self.locks.lock().unwrap().get(vm_id).copied()
    }
}

impl Default for OperationLockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_vm_is_busy() {
        let table = OperationLockTable::new();
        let _guard = table.try_lock("vm-a", OperationKind::Starting).unwrap();
        let err = table.try_lock("vm-a", OperationKind::Stopping).unwrap_err();
        match err {
            EngineError::Busy { vm_id, conflicting } => {
                assert_eq!(vm_id, "vm-a");
                assert_eq!(conflicting, OperationKind::Starting);
            }
            other => panic!("expected Busy, got {:?}", other),
        }
    }

    #[test]
    fn different_vms_do_not_conflict() {
        let table = OperationLockTable::new();
        let _a = table.try_lock("vm-a", OperationKind::Starting).unwrap();
        let _b = table.try_lock("vm-b", OperationKind::Starting).unwrap();
    }

    #[test]
    fn dropping_guard_releases_lock() {
        let table = OperationLockTable::new();
        {
            let _guard = table.try_lock("vm-a", OperationKind::Creating).unwrap();
            assert_eq!(
                table.current_operation("vm-a"),
                Some(OperationKind::Creating)
            );
        }
        assert_eq!(table.current_operation("vm-a"), None);
        let _guard2 = table.try_lock("vm-a", OperationKind::Deleting).unwrap();
    }
}
