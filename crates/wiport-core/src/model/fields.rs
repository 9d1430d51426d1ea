//! Reserved field reference names and the mutable per-revision field list.

use super::revision::{FieldChange, FieldValue};

pub const AREA_PATH: &str = "System.AreaPath";
pub const ITERATION_PATH: &str = "System.IterationPath";
pub const ASSIGNED_TO: &str = "System.AssignedTo";
pub const CREATED_BY: &str = "System.CreatedBy";
pub const CHANGED_BY: &str = "System.ChangedBy";
pub const CREATED_DATE: &str = "System.CreatedDate";
pub const CHANGED_DATE: &str = "System.ChangedDate";
pub const HISTORY: &str = "System.History";
pub const TITLE: &str = "System.Title";
pub const DESCRIPTION: &str = "System.Description";
pub const REPRO_STEPS: &str = "Microsoft.VSTS.TCM.ReproSteps";

/// Reference names are compared case-insensitively, the way the destination
/// resolves them.
#[must_use]
pub fn same_reference(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Ordered, mutable copy of a revision's field changes.
///
/// Normalization injects and overrides entries here; the source revision
/// itself is never touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    entries: Vec<FieldChange>,
}

impl FieldSet {
    #[must_use]
    pub const fn new(entries: Vec<FieldChange>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn contains(&self, reference: &str) -> bool {
        self.entries
            .iter()
            .any(|f| same_reference(&f.reference_name, reference))
    }

    /// First entry for `reference`, if any.
    #[must_use]
    pub fn get(&self, reference: &str) -> Option<&FieldChange> {
        self.entries
            .iter()
            .find(|f| same_reference(&f.reference_name, reference))
    }

    /// Append an entry only when no entry for `reference` exists yet.
    pub fn insert_if_absent(&mut self, reference: &str, value: Option<FieldValue>) -> bool {
        if self.contains(reference) {
            return false;
        }
        self.push(reference, value);
        true
    }

    /// Remove every entry for `reference` and append a single new one.
    pub fn replace(&mut self, reference: &str, value: Option<FieldValue>) {
        self.remove(reference);
        self.push(reference, value);
    }

    /// Remove every entry for `reference`, returning the first removed value.
    pub fn remove(&mut self, reference: &str) -> Option<FieldChange> {
        let first = self.get(reference).cloned();
        self.entries
            .retain(|f| !same_reference(&f.reference_name, reference));
        first
    }

    pub fn push(&mut self, reference: &str, value: Option<FieldValue>) {
        self.entries.push(FieldChange {
            reference_name: reference.to_string(),
            value,
        });
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Option<FieldValue> {
        Some(FieldValue::String(s.to_string()))
    }

    fn value(set: &FieldSet, reference: &str) -> Option<FieldValue> {
        set.get(reference).and_then(|f| f.value.clone())
    }

    #[test]
    fn lookups_ignore_case() {
        let set = FieldSet::new(vec![FieldChange {
            reference_name: "system.areapath".into(),
            value: text("A"),
        }]);
        assert!(set.contains(AREA_PATH));
        assert_eq!(value(&set, AREA_PATH), text("A"));
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let mut set = FieldSet::default();
        assert!(set.insert_if_absent(CHANGED_BY, text("alice")));
        assert!(!set.insert_if_absent(CHANGED_BY, text("bob")));
        assert_eq!(set.len(), 1);
        assert_eq!(value(&set, CHANGED_BY), text("alice"));
    }

    #[test]
    fn replace_collapses_duplicates() {
        let mut set = FieldSet::default();
        set.push(ASSIGNED_TO, text("a"));
        set.push("SYSTEM.ASSIGNEDTO", text("b"));
        set.replace(ASSIGNED_TO, text("c"));
        assert_eq!(set.len(), 1);
        assert_eq!(value(&set, ASSIGNED_TO), text("c"));
    }
}
