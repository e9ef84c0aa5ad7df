//! Tab dependency scheduling.
//!
//! Report tabs form a forest: each tab may name a parent, and parents must
//! be processed before their children (a child's plots reuse states and
//! channels its parent resolved). Parent references are weak (a name, not
//! a pointer) and are resolved to indices into the owned tab list at
//! schedule-build time. The produced order is deterministic: parents
//! first, siblings by priority, ties broken by declaration order.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One report section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    /// Unique tab name
    pub name: String,
    /// Optional parent tab, by name
    #[serde(default)]
    pub parent: Option<String>,
    /// Sibling ordering key; lower runs earlier
    #[serde(default)]
    pub priority: i32,
    /// Channels this tab needs cached
    #[serde(default)]
    pub channels: Vec<String>,
    /// Named states this tab processes over
    #[serde(default)]
    pub states: Vec<String>,
}

/// A validated, ordered schedule over a tab list.
#[derive(Debug, Clone)]
pub struct TabSchedule {
    tabs: Vec<Tab>,
    /// Indices into `tabs`, in processing order
    order: Vec<usize>,
    /// Parent index per tab, resolved from the name references
    parents: Vec<Option<usize>>,
}

impl TabSchedule {
    /// Build a schedule from declared tabs.
    ///
    /// Fails fast on duplicate names, unresolved parent names, and parent
    /// cycles (impossible in a well-formed forest, but malformed input
    /// must be caught, not looped on).
    pub fn build(tabs: Vec<Tab>) -> Result<Self, ConfigError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(tabs.len());
        for (i, tab) in tabs.iter().enumerate() {
            if index.insert(tab.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateTab(tab.name.clone()));
            }
        }

        let mut parents = Vec::with_capacity(tabs.len());
        for tab in &tabs {
            match &tab.parent {
                Some(parent) => match index.get(parent.as_str()) {
                    Some(&p) => parents.push(Some(p)),
                    None => {
                        return Err(ConfigError::UnknownParent {
                            tab: tab.name.clone(),
                            parent: parent.clone(),
                        });
                    }
                },
                None => parents.push(None),
            }
        }

        // Walk parent links from every tab; revisiting a tab already on the
        // current walk means a cycle.
        for start in 0..tabs.len() {
            let mut seen = vec![false; tabs.len()];
            let mut cursor = Some(start);
            while let Some(i) = cursor {
                if seen[i] {
                    return Err(ConfigError::Cycle(tabs[i].name.clone()));
                }
                seen[i] = true;
                cursor = parents[i];
            }
        }

        // Children lists in (priority, declaration order); stable sort
        // keeps declaration order for equal priorities.
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); tabs.len()];
        let mut roots: Vec<usize> = Vec::new();
        for (i, parent) in parents.iter().enumerate() {
            match parent {
                Some(p) => children[*p].push(i),
                None => roots.push(i),
            }
        }
        roots.sort_by_key(|&i| tabs[i].priority);
        for list in &mut children {
            list.sort_by_key(|&i| tabs[i].priority);
        }

        // Depth-first preorder: every tab appears after its parent.
        let mut order = Vec::with_capacity(tabs.len());
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(children[i].iter().rev());
        }

        Ok(Self { tabs, order, parents })
    }

    /// Tabs in processing order.
    pub fn iter(&self) -> impl Iterator<Item = &Tab> {
        self.order.iter().map(|&i| &self.tabs[i])
    }

    /// The owned tab list, in declaration order.
    #[must_use]
    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    /// A tab's resolved parent, if any.
    #[must_use]
    pub fn parent_of(&self, name: &str) -> Option<&Tab> {
        let i = self.tabs.iter().position(|t| t.name == name)?;
        self.parents[i].map(|p| &self.tabs[p])
    }

    /// Number of scheduled tabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if no tabs were declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
