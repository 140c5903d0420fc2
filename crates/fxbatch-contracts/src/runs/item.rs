use serde::{Deserialize, Serialize};

use super::request::GenerationRequest;
use super::result::{GeneratedImage, GenerationFailure, GenerationResult};

/// Lifecycle of one batch item. Items only move forward:
/// `Pending -> Submitted -> Succeeded | Failed`, or `Pending -> Failed` for
/// items that never reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
}

impl ItemStatus {
    pub fn allowed_transitions(self) -> &'static [ItemStatus] {
        use ItemStatus::*;
        match self {
            Pending => &[Submitted, Failed],
            Submitted => &[Succeeded, Failed],
            Succeeded | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal item transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ItemStatus,
    pub to: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Zero-based submission position.
    pub index: usize,
    pub request: GenerationRequest,
    status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<GenerationResult>,
    #[serde(default)]
    attempts: u32,
}

impl BatchItem {
    pub fn pending(index: usize, request: GenerationRequest) -> Self {
        Self {
            index,
            request,
            status: ItemStatus::Pending,
            result: None,
            attempts: 0,
        }
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn result(&self) -> Option<&GenerationResult> {
        self.result.as_ref()
    }

    /// Network attempts made for this item, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn images(&self) -> &[GeneratedImage] {
        self.result
            .as_ref()
            .map(GenerationResult::images)
            .unwrap_or_default()
    }

    pub fn failure(&self) -> Option<&GenerationFailure> {
        match self.result.as_ref()? {
            GenerationResult::Failure(failure) => Some(failure),
            GenerationResult::Success { .. } => None,
        }
    }

    pub fn submit(&mut self) -> Result<(), IllegalTransition> {
        self.transition(ItemStatus::Submitted)
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Moves a submitted item to its terminal state according to `result`.
    pub fn settle(&mut self, result: GenerationResult) -> Result<(), IllegalTransition> {
        let next = if result.is_success() {
            ItemStatus::Succeeded
        } else {
            ItemStatus::Failed
        };
        self.transition(next)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, failure: GenerationFailure) -> Result<(), IllegalTransition> {
        self.settle(GenerationResult::Failure(failure))
    }

    fn transition(&mut self, next: ItemStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchItem, IllegalTransition, ItemStatus};
    use crate::runs::request::GenerationRequest;
    use crate::runs::result::{FailureReason, GenerationFailure, GenerationResult};

    fn item() -> BatchItem {
        BatchItem::pending(0, GenerationRequest::new("a cat"))
    }

    #[test]
    fn terminal_states_allow_nothing() {
        assert!(ItemStatus::Succeeded.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(ItemStatus::Pending.can_transition_to(ItemStatus::Failed));
        assert!(!ItemStatus::Pending.can_transition_to(ItemStatus::Succeeded));
        assert!(!ItemStatus::Submitted.can_transition_to(ItemStatus::Pending));
    }

    #[test]
    fn submitted_item_settles_once() {
        let mut item = item();
        item.submit().unwrap();
        item.record_attempt();
        item.settle(GenerationResult::Success { images: Vec::new() })
            .unwrap();
        assert_eq!(item.status(), ItemStatus::Succeeded);
        assert_eq!(item.attempts(), 1);

        let err = item
            .fail(GenerationFailure::new(FailureReason::Timeout, "late"))
            .unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: ItemStatus::Succeeded,
                to: ItemStatus::Failed,
            }
        );
        assert!(item.failure().is_none());
    }

    #[test]
    fn pending_item_can_fail_without_submission() {
        let mut item = item();
        item.fail(GenerationFailure::new(FailureReason::Cancelled, "stopped"))
            .unwrap();
        assert_eq!(item.status(), ItemStatus::Failed);
        assert_eq!(
            item.failure().map(|failure| failure.reason),
            Some(FailureReason::Cancelled)
        );
        assert_eq!(item.attempts(), 0);
    }

    #[test]
    fn pending_item_cannot_succeed_without_submission() {
        let mut item = item();
        assert!(item
            .settle(GenerationResult::Success { images: Vec::new() })
            .is_err());
        assert_eq!(item.status(), ItemStatus::Pending);
        assert!(item.result().is_none());
    }
}
