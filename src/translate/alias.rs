//! Alias arena
//!
//! Every FROM item of a statement (sub-queries included) gets one entry.
//! Relationship hops reached through expressions are registered under their
//! canonical path so that the same chain always yields the same alias.

use fxhash::{FxHashMap, FxHashSet};

use super::config::AliasStyle;

pub type AliasId = usize;
pub type ScopeId = usize;

/// Canonical path of a relationship hop: (scope, parent alias, attribute)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub scope: ScopeId,
    pub parent: AliasId,
    pub attribute: String,
}

#[derive(Debug, Clone)]
pub struct AliasEntry {
    pub name: String,
    /// Entity type, `None` for link tables
    pub entity: Option<String>,
    pub table: String,
    pub scope: ScopeId,
    /// Traversal path that produced the alias (`d.groups`)
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<AliasEntry>,
    paths: FxHashMap<PathKey, AliasId>,
    used: FxHashSet<String>,
    counters: FxHashMap<String, usize>,
    style: AliasStyle,
}

impl AliasTable {
    pub fn new(style: AliasStyle) -> Self {
        Self {
            entries: Vec::new(),
            paths: FxHashMap::default(),
            used: FxHashSet::default(),
            counters: FxHashMap::default(),
            style,
        }
    }

    pub fn get(&self, id: AliasId) -> &AliasEntry {
        &self.entries[id]
    }

    pub fn name(&self, id: AliasId) -> &str {
        &self.entries[id].name
    }

    pub fn scope(&self, id: AliasId) -> ScopeId {
        self.entries[id].scope
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &PathKey) -> Option<AliasId> {
        self.paths.get(key).copied()
    }

    /// Alias for an iteration variable: the variable's own name when free
    pub fn bind_var(
        &mut self,
        scope: ScopeId,
        var: &str,
        entity: &str,
        table: &str,
    ) -> AliasId {
        let name = if self.used.contains(var) {
            self.numbered(var)
        } else {
            var.to_string()
        };
        self.push(name, Some(entity.to_string()), table, scope, var)
    }

    /// Alias for a relationship hop, registered under its canonical path
    pub fn bind_path(
        &mut self,
        key: PathKey,
        entity: Option<&str>,
        table: &str,
        path: &str,
    ) -> AliasId {
        if let Some(existing) = self.paths.get(&key) {
            return *existing;
        }
        let scope = key.scope;
        let id = self.fresh(scope, entity, table, path);
        self.paths.insert(key, id);
        id
    }

    /// Unregistered alias: never shared with another path
    pub fn fresh(
        &mut self,
        scope: ScopeId,
        entity: Option<&str>,
        table: &str,
        path: &str,
    ) -> AliasId {
        let name = match self.style {
            AliasStyle::Simple => {
                let base = entity.map(|e| e.to_lowercase()).unwrap_or_else(|| "t".to_string());
                self.numbered(&base)
            }
            AliasStyle::Path => {
                let base = path.replace('.', "-");
                if self.used.contains(&base) {
                    self.numbered(&base)
                } else {
                    base
                }
            }
        };
        self.push(name, entity.map(str::to_string), table, scope, path)
    }

    fn numbered(&mut self, base: &str) -> String {
        let counter = self.counters.entry(base.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}-{}", base, counter);
            if !self.used.contains(&candidate) {
                return candidate;
            }
        }
    }

    fn push(
        &mut self,
        name: String,
        entity: Option<String>,
        table: &str,
        scope: ScopeId,
        path: &str,
    ) -> AliasId {
        self.used.insert(name.clone());
        self.entries.push(AliasEntry {
            name,
            entity,
            table: table.to_string(),
            scope,
            path: path.to_string(),
        });
        self.entries.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_alias() {
        let mut aliases = AliasTable::new(AliasStyle::Simple);
        let s = aliases.bind_var(0, "s", "Student", "Student");
        let key = PathKey {
            scope: 0,
            parent: s,
            attribute: "group".to_string(),
        };
        let a = aliases.bind_path(key.clone(), Some("Group"), "Group", "s.group");
        let b = aliases.bind_path(key, Some("Group"), "Group", "s.group");
        assert_eq!(a, b);
        assert_eq!(aliases.name(a), "group-1");
        assert_eq!(aliases.len(), 2);
    }

    #[test]
    fn test_distinct_paths_distinct_aliases() {
        let mut aliases = AliasTable::new(AliasStyle::Simple);
        let s = aliases.bind_var(0, "s", "Student", "Student");
        let a = aliases.bind_path(
            PathKey { scope: 0, parent: s, attribute: "group".to_string() },
            Some("Group"),
            "Group",
            "s.group",
        );
        let b = aliases.bind_path(
            PathKey { scope: 1, parent: s, attribute: "group".to_string() },
            Some("Group"),
            "Group",
            "s.group",
        );
        assert_ne!(a, b);
        assert_ne!(aliases.name(a), aliases.name(b));
    }

    #[test]
    fn test_var_names_unique_across_scopes() {
        let mut aliases = AliasTable::new(AliasStyle::Simple);
        let outer = aliases.bind_var(0, "s", "Student", "Student");
        let inner = aliases.bind_var(1, "s", "Student", "Student");
        assert_eq!(aliases.name(outer), "s");
        assert_eq!(aliases.name(inner), "s-1");
    }

    #[test]
    fn test_path_style() {
        let mut aliases = AliasTable::new(AliasStyle::Path);
        let d = aliases.bind_var(0, "d", "Department", "Department");
        let g = aliases.fresh(0, Some("Group"), "Group", "d.groups");
        let t = aliases.fresh(0, None, "Course_Student", "d.groups");
        assert_eq!(aliases.name(d), "d");
        assert_eq!(aliases.name(g), "d-groups");
        assert_eq!(aliases.name(t), "d-groups-1");
        assert_eq!(aliases.get(g).path, "d.groups");
    }
}
