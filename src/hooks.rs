//! Migration hooks
//!
//! Callbacks fired around the DDL and history-recording phases of each
//! migration. Hooks run in priority order (higher first, ties in
//! registration order); a failing or panicking hook never stops the others.

use crate::types::{ChangeType, RiskLevel};
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    BeforeDdl,
    AfterDdl,
    BeforeDml,
    AfterDml,
}

impl HookTrigger {
    /// Only hooks that run before an action may stop it
    pub fn can_veto(&self) -> bool {
        matches!(self, HookTrigger::BeforeDdl | HookTrigger::BeforeDml)
    }
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookTrigger::BeforeDdl => "before_ddl",
            HookTrigger::AfterDdl => "after_ddl",
            HookTrigger::BeforeDml => "before_dml",
            HookTrigger::AfterDml => "after_dml",
        };
        f.write_str(s)
    }
}

/// What a hook sees about the migration in flight
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub trigger: HookTrigger,
    pub version: String,
    pub change_type: ChangeType,
    pub table: String,
    pub column: Option<String>,
    pub sql: String,
    pub risk_level: RiskLevel,
    /// Set for `after_ddl` when the statement failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Veto(String),
}

pub type HookFn = Arc<dyn Fn(&HookContext) -> Result<HookOutcome, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub hook: String,
    pub trigger: HookTrigger,
    pub result: Result<HookOutcome, String>,
}

impl HookResult {
    /// The veto reason, if this result stops the action
    pub fn veto_reason(&self) -> Option<&str> {
        match &self.result {
            Ok(HookOutcome::Veto(reason)) if self.trigger.can_veto() => Some(reason),
            _ => None,
        }
    }
}

struct RegisteredHook {
    name: String,
    trigger: HookTrigger,
    priority: i32,
    callback: HookFn,
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<RegisteredHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, trigger: HookTrigger, priority: i32, callback: F)
    where
        F: Fn(&HookContext) -> Result<HookOutcome, String> + Send + Sync + 'static,
    {
        self.hooks.push(RegisteredHook {
            name: name.into(),
            trigger,
            priority,
            callback: Arc::new(callback),
        });
        // stable sort keeps registration order among equal priorities
        self.hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook registered for the context's trigger
    pub fn run(&self, ctx: &HookContext) -> Vec<HookResult> {
        self.hooks
            .iter()
            .filter(|h| h.trigger == ctx.trigger)
            .map(|hook| {
                let result = match catch_unwind(AssertUnwindSafe(|| (hook.callback)(ctx))) {
                    Ok(result) => result,
                    Err(panic) => Err(format!("hook panicked: {}", panic_message(&*panic))),
                };
                if let Err(e) = &result {
                    warn!("Hook '{}' ({}) failed for {}: {}", hook.name, ctx.trigger, ctx.version, e);
                }
                HookResult {
                    hook: hook.name.clone(),
                    trigger: ctx.trigger,
                    result,
                }
            })
            .collect()
    }
}

/// First honoured veto among hook results
pub fn find_veto(results: &[HookResult]) -> Option<&HookResult> {
    results.iter().find(|r| r.veto_reason().is_some())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
