//! In-process provisioner for tests and dry runs.

use super::{Declaration, ResourceProvisioner};
use crate::error::{HavenError, Result};
use crate::types::StackId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Records every call and returns canned outputs.
#[derive(Default)]
pub struct MockProvisioner {
    applied: Mutex<Vec<Declaration>>,
    destroyed: Mutex<Vec<StackId>>,
    commands: Mutex<Vec<(StackId, String)>>,
    failures: Mutex<HashMap<StackId, String>>,
    apply_delay: Mutex<Option<Duration>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `stack_id` fail with `reason` until cleared.
    pub fn fail_stack(&self, stack_id: &StackId, reason: &str) {
        self.lock_failures().insert(stack_id.clone(), reason.to_string());
    }

    pub fn clear_failure(&self, stack_id: &StackId) {
        self.lock_failures().remove(stack_id);
    }

    /// Delay every apply, to exercise cancellation.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Declarations passed to apply, in call order.
    pub fn applied(&self) -> Vec<Declaration> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn destroyed(&self) -> Vec<StackId> {
        self.destroyed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn commands(&self) -> Vec<(StackId, String)> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<StackId, String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failure(&self, stack_id: &StackId) -> Option<String> {
        self.lock_failures().get(stack_id).cloned()
    }
}

#[async_trait]
impl ResourceProvisioner for MockProvisioner {
    async fn apply(&self, stack_id: &StackId, declaration: &Declaration) -> Result<BTreeMap<String, String>> {
        debug!(stack_id = %stack_id, "Mock: apply");
        let delay = *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.applied.lock().unwrap_or_else(|e| e.into_inner()).push(declaration.clone());
        if let Some(reason) = self.failure(stack_id) {
            return Err(HavenError::Provision { stack_id: stack_id.to_string(), reason });
        }

        let mut outputs = BTreeMap::from([
            ("stack_id".to_string(), stack_id.to_string()),
            ("resource_group".to_string(), declaration.context.resource_group_name.clone()),
        ]);
        for allocation in &declaration.address_plan.subnets {
            outputs.insert(format!("subnet_{}", allocation.purpose), allocation.subnet.to_string());
        }
        Ok(outputs)
    }

    async fn destroy(&self, stack_id: &StackId) -> Result<()> {
        debug!(stack_id = %stack_id, "Mock: destroy");
        if let Some(reason) = self.failure(stack_id) {
            return Err(HavenError::Provision { stack_id: stack_id.to_string(), reason });
        }
        self.destroyed.lock().unwrap_or_else(|e| e.into_inner()).push(stack_id.clone());
        Ok(())
    }

    async fn raw_command(&self, stack_id: &StackId, command_line: &str) -> Result<String> {
        debug!(stack_id = %stack_id, command_line, "Mock: raw command");
        if let Some(reason) = self.failure(stack_id) {
            return Err(HavenError::Command { stack_id: stack_id.to_string(), reason });
        }
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((stack_id.clone(), command_line.to_string()));
        Ok(format!("{}: {}\n", stack_id, command_line))
    }
}
