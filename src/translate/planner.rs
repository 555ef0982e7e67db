//! Join planning
//!
//! A [`Scope`] is one SELECT under construction: its FROM items in discovery
//! order, its WHERE conjuncts and the iteration variables it binds. Every FROM
//! item records how it was reached ([`Link`]), which is what the uniqueness
//! analysis runs on.

use fxhash::FxHashSet;

use super::alias::{AliasId, AliasTable, ScopeId};
use super::sql::{FromItem, Join, OrderItem, Select, SqlExpr, TableRef};

/// Parent of a hop whose key comes from outside the statement (a parameter
/// or a foreign key value): never part of any scope, so always fixed
pub const FIXED: AliasId = AliasId::MAX;

/// How a FROM item was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Generator over an entity extent
    Root,
    /// To-one hop: at most one row per parent row
    ToOne { parent: AliasId },
    /// To-many hop where the item holds the foreign key to `parent`
    OneToMany { parent: AliasId },
    /// Link-table row of a many-to-many hop out of `parent`
    LinkRow { parent: AliasId },
    /// Target of a many-to-many hop through `link`
    ViaLink { link: AliasId, parent: AliasId },
}

#[derive(Debug, Clone)]
pub struct ScopeItem {
    pub alias: AliasId,
    pub table: String,
    pub join: Join,
    pub link: Link,
    /// Reached through a LEFT JOIN somewhere along the path
    pub outer: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub items: Vec<ScopeItem>,
    pub conditions: Vec<SqlExpr>,
    /// Iteration variables bound in this scope, in declaration order
    pub vars: Vec<(String, AliasId)>,
}

impl Scope {
    pub fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            ..Default::default()
        }
    }

    pub fn item(&self, alias: AliasId) -> Option<&ScopeItem> {
        self.items.iter().find(|i| i.alias == alias)
    }

    /// Assemble the SELECT for this scope
    pub fn to_select(
        &self,
        aliases: &AliasTable,
        columns: Vec<SqlExpr>,
        distinct: bool,
        order_by: Vec<OrderItem>,
    ) -> Select {
        let from = self
            .items
            .iter()
            .map(|item| FromItem {
                table: TableRef::Named(item.table.clone()),
                alias: aliases.name(item.alias).to_string(),
                join: item.join.clone(),
            })
            .collect();
        Select {
            distinct,
            columns,
            from,
            selection: self.conditions.clone(),
            order_by,
            limit: None,
            offset: None,
        }
    }
}

/// Join kind for a to-one hop
pub fn to_one_join(on: Vec<SqlExpr>, nullable: bool, parent_outer: bool) -> (Join, bool) {
    if nullable || parent_outer {
        (Join::Left(on), true)
    } else {
        (Join::Inner(on), false)
    }
}

/// Whether the rows of `scope` are unique given the items whose key the output contains
///
/// Coverage propagates along functional dependencies: a parent determines its
/// to-one children, a one-to-many child determines its parent, a link row
/// determines both ends and both ends determine the link row. Aliases outside
/// the scope (correlated outer aliases) are fixed and count as covered.
pub fn is_unique(scope: &Scope, seeds: &[AliasId]) -> bool {
    let in_scope: FxHashSet<AliasId> = scope.items.iter().map(|i| i.alias).collect();
    let mut covered: FxHashSet<AliasId> = seeds
        .iter()
        .copied()
        .filter(|a| in_scope.contains(a))
        .collect();
    let fixed = |covered: &FxHashSet<AliasId>, alias: AliasId| {
        covered.contains(&alias) || !in_scope.contains(&alias)
    };

    loop {
        let mut newly = Vec::new();
        for item in &scope.items {
            match item.link {
                Link::Root => {}
                Link::ToOne { parent } => {
                    if fixed(&covered, parent) {
                        newly.push(item.alias);
                    }
                }
                Link::OneToMany { parent } => {
                    if covered.contains(&item.alias) {
                        newly.push(parent);
                    }
                }
                Link::LinkRow { parent } => {
                    if covered.contains(&item.alias) {
                        newly.push(parent);
                    }
                }
                Link::ViaLink { link, parent } => {
                    if covered.contains(&link) {
                        newly.push(item.alias);
                    }
                    if covered.contains(&item.alias) && fixed(&covered, parent) {
                        newly.push(link);
                    }
                }
            }
        }

        let mut changed = false;
        for alias in newly {
            if in_scope.contains(&alias) && covered.insert(alias) {
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    scope.items.iter().all(|item| covered.contains(&item.alias))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(alias: AliasId, link: Link) -> ScopeItem {
        ScopeItem {
            alias,
            table: format!("t{}", alias),
            join: Join::Root,
            link,
            outer: false,
        }
    }

    #[test]
    fn test_single_root() {
        let mut scope = Scope::new(None);
        scope.items.push(item(0, Link::Root));
        assert!(is_unique(&scope, &[0]));
        assert!(!is_unique(&scope, &[]));
    }

    #[test]
    fn test_to_one_is_covered_by_parent() {
        let mut scope = Scope::new(None);
        scope.items.push(item(0, Link::Root));
        scope.items.push(item(1, Link::ToOne { parent: 0 }));
        assert!(is_unique(&scope, &[0]));
        assert!(!is_unique(&scope, &[1]));
    }

    #[test]
    fn test_one_to_many_chain() {
        // d -> groups -> students, projecting students
        let mut scope = Scope::new(None);
        scope.items.push(item(0, Link::Root));
        scope.items.push(item(1, Link::OneToMany { parent: 0 }));
        scope.items.push(item(2, Link::OneToMany { parent: 1 }));
        assert!(is_unique(&scope, &[2]));
        assert!(!is_unique(&scope, &[0]));
    }

    #[test]
    fn test_many_to_many_projection_needs_distinct() {
        // c -> link -> students, projecting students
        let mut scope = Scope::new(None);
        scope.items.push(item(0, Link::Root));
        scope.items.push(item(1, Link::LinkRow { parent: 0 }));
        scope.items.push(item(2, Link::ViaLink { link: 1, parent: 0 }));
        assert!(!is_unique(&scope, &[2]));
        assert!(is_unique(&scope, &[0, 2]));
    }

    #[test]
    fn test_correlated_outer_alias_is_fixed() {
        // Sub-query over outer `d` (alias 9): courses -> link -> students
        let mut scope = Scope::new(Some(0));
        scope.items.push(item(3, Link::OneToMany { parent: 9 }));
        scope.items.push(item(4, Link::LinkRow { parent: 3 }));
        scope.items.push(item(5, Link::ViaLink { link: 4, parent: 3 }));
        assert!(!is_unique(&scope, &[5]));

        // Sub-query over outer `c` directly: link -> students
        let mut scope = Scope::new(Some(0));
        scope.items.push(item(6, Link::LinkRow { parent: 9 }));
        scope.items.push(item(7, Link::ViaLink { link: 6, parent: 9 }));
        assert!(is_unique(&scope, &[7]));
    }
}
