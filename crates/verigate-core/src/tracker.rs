//! Deadline bookkeeping for one dispatched verification.
//!
//! The tracker holds no timer of its own. The controller reads it when its
//! timer fires and re-arms for whatever remains.

use crate::types::UserId;

/// Result of an extension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// Milliseconds actually added. Less than requested when the cap was hit.
    pub granted_ms: u64,
    /// Deadline after the extension, epoch ms.
    pub deadline_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SessionStatusTracker {
    user_id: UserId,
    dispatched_at_ms: u64,
    deadline_ms: u64,
    max_deadline_ms: u64,
}

impl SessionStatusTracker {
    pub fn new(
        user_id: UserId,
        now_ms: u64,
        default_timeout_ms: u64,
        max_extended_timeout_ms: u64,
    ) -> Self {
        let max_deadline_ms = now_ms.saturating_add(max_extended_timeout_ms);
        Self {
            user_id,
            dispatched_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(default_timeout_ms).min(max_deadline_ms),
            max_deadline_ms,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn dispatched_at_ms(&self) -> u64 {
        self.dispatched_at_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.deadline_ms.saturating_sub(now_ms)
    }

    /// Push the deadline out by `additional_ms`, never past `dispatched_at + max`.
    pub fn extend(&mut self, additional_ms: u64) -> Extension {
        let target = self
            .deadline_ms
            .saturating_add(additional_ms)
            .min(self.max_deadline_ms);
        let granted_ms = target.saturating_sub(self.deadline_ms);
        self.deadline_ms = self.deadline_ms.max(target);
        Extension {
            granted_ms,
            deadline_ms: self.deadline_ms,
        }
    }
}
