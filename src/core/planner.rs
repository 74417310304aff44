//! CF-008: Stack plan. Diff rendered stacks against live stacks.
//!
//! A stack whose template hash matches the hash recorded on the live stack
//! is skipped; live stacks the config no longer renders are deleted.

use std::collections::BTreeMap;
use std::fmt;

/// What to do with one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAction {
    Create,
    Update,
    Skip,
    Delete,
}

impl fmt::Display for StackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Skip => "skip",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A stack the config renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredStack {
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStack {
    pub stack: String,
    pub action: StackAction,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackPlan {
    pub cluster: String,
    pub changes: Vec<PlannedStack>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl StackPlan {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_delete > 0
    }
}

/// Plan `desired` (in deployment order) against `live` (stack name → recorded hash).
pub fn plan(
    cluster: &str,
    desired: &[DesiredStack],
    live: &BTreeMap<String, Option<String>>,
) -> StackPlan {
    let mut result = StackPlan {
        cluster: cluster.to_string(),
        ..StackPlan::default()
    };

    for stack in desired {
        let action = match live.get(&stack.name) {
            None => StackAction::Create,
            Some(Some(hash)) if *hash == stack.hash => StackAction::Skip,
            Some(_) => StackAction::Update,
        };
        result.push(&stack.name, action);
    }

    // BTreeMap order keeps deletions deterministic
    for name in live.keys() {
        if !desired.iter().any(|d| &d.name == name) {
            result.push(name, StackAction::Delete);
        }
    }
    result
}

impl StackPlan {
    fn push(&mut self, stack: &str, action: StackAction) {
        match action {
            StackAction::Create => self.to_create += 1,
            StackAction::Update => self.to_update += 1,
            StackAction::Delete => self.to_delete += 1,
            StackAction::Skip => self.unchanged += 1,
        }
        self.changes.push(PlannedStack {
            stack: stack.to_string(),
            action,
            description: describe_action(stack, action),
        });
    }
}

fn describe_action(stack: &str, action: StackAction) -> String {
    match action {
        StackAction::Create => format!("{}: create", stack),
        StackAction::Update => format!("{}: update (template changed)", stack),
        StackAction::Skip => format!("{}: no changes", stack),
        StackAction::Delete => format!("{}: delete (no longer in config)", stack),
    }
}
