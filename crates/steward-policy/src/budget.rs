use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use steward_protocol::{StreamError, StreamResult};

/// Deployment-wide default for how many tool invocations one task may start.
///
/// Read-only once configured. Each execution gets its own
/// [`InvocationBudget`] from [`SessionBudget::start_invocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBudget {
    tool_call_limit: NonZeroU32,
}

impl SessionBudget {
    pub const DEFAULT_TOOL_CALL_LIMIT: u32 = 10;

    pub fn new(tool_call_limit: NonZeroU32) -> Self {
        Self { tool_call_limit }
    }

    pub fn try_from_limit(limit: u32) -> StreamResult<Self> {
        NonZeroU32::new(limit)
            .map(Self::new)
            .ok_or_else(|| StreamError::Validation("tool_call_limit must be >= 1".to_owned()))
    }

    pub fn tool_call_limit(&self) -> NonZeroU32 {
        self.tool_call_limit
    }

    pub fn start_invocation(&self) -> InvocationBudget {
        InvocationBudget::new(self.tool_call_limit)
    }
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self {
            tool_call_limit: NonZeroU32::new(Self::DEFAULT_TOOL_CALL_LIMIT)
                .unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Outcome of asking the budget for one more tool start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward the start. `limit_reached` is true when this start consumed
    /// the last unit of budget.
    Allowed { count: u32, limit_reached: bool },
    /// Refuse the start and terminate the execution.
    Blocked { count: u32 },
}

/// Accounting for one task execution.
///
/// `limit_reached` and `terminated` are each set at most once and never
/// cleared; `count` never exceeds `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationBudget {
    limit: NonZeroU32,
    count: u32,
    limit_reached: bool,
    terminated: bool,
}

impl InvocationBudget {
    pub fn new(limit: NonZeroU32) -> Self {
        Self {
            limit,
            count: 0,
            limit_reached: false,
            terminated: false,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.get()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// The Nth start is allowed and marks the limit reached; the (N+1)th
    /// start is blocked.
    pub fn admit_tool_start(&mut self) -> Admission {
        if self.terminated || self.count >= self.limit.get() {
            self.terminated = true;
            return Admission::Blocked { count: self.count };
        }

        self.count += 1;
        if self.count == self.limit.get() {
            self.limit_reached = true;
        }
        Admission::Allowed {
            count: self.count,
            limit_reached: self.limit_reached,
        }
    }
}
