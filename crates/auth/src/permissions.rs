use loopd_types::methods;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A capability: an action on an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub entity: String,
    pub action: String,
}

impl Permission {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.action)
    }
}

/// Required capabilities per fully qualified operation name
///
/// Operations must be listed explicitly. An entry with no permissions is
/// callable without any capability; a missing entry is never callable.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    rules: HashMap<String, Vec<Permission>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, method: impl Into<String>, required: Vec<Permission>) -> Self {
        self.rules.insert(method.into(), required);
        self
    }

    /// Add rules from another table, replacing existing entries
    pub fn extend(&mut self, other: PermissionTable) {
        self.rules.extend(other.rules);
    }

    pub fn required(&self, method: &str) -> Option<&[Permission]> {
        self.rules.get(method).map(Vec::as_slice)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.rules.contains_key(method)
    }

    /// Every distinct permission in the table, sorted
    pub fn all_permissions(&self) -> Vec<Permission> {
        let mut all: Vec<Permission> = self.rules.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

/// Permission table for the swap client service
pub fn required_permissions() -> PermissionTable {
    let swap_execute = Permission::new("swap", "execute");
    let swap_read = Permission::new("swap", "read");

    PermissionTable::new()
        .with_rule(
            methods::LOOP_OUT,
            vec![swap_execute.clone(), Permission::new("loop", "out")],
        )
        .with_rule(
            methods::LOOP_IN,
            vec![swap_execute, Permission::new("loop", "in")],
        )
        .with_rule(methods::MONITOR, vec![swap_read.clone()])
        .with_rule(methods::LIST_SWAPS, vec![swap_read.clone()])
        .with_rule(methods::SWAP_INFO, vec![swap_read.clone()])
        .with_rule(methods::GET_INFO, vec![swap_read])
}

/// Extra rules for the debug service
#[cfg(feature = "debug")]
pub fn debug_permissions() -> PermissionTable {
    PermissionTable::new().with_rule(
        methods::FORCE_AUTOLOOP,
        vec![Permission::new("swap", "execute"), Permission::new("loop", "out")],
    )
}
