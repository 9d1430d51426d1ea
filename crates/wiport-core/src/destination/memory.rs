//! In-memory destination backend.
//!
//! Implements every destination trait over a mutex-guarded map so replay can
//! be exercised without a live work-tracking server: unit and integration
//! tests use it directly, and `wiport rehearse` replays an export into it to
//! surface mapping problems before a real run.
//!
//! Fault injection knobs mirror the failure classes replay must handle:
//! rejected attachments, fatal save failures, and failing node creation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    Attachment, AttachmentKey, ClassificationNode, Destination, DestinationError, FieldIssue,
    LinkGraph, LinkType, LinkTypeEnd, OperationId, OperationState, PersistedAttachment,
    ProjectAdmin, ProjectInfo, ProjectRequest, RelatedLink, TreeKind, WorkItemHandle,
};
use crate::model::fields;
use crate::model::{FieldValue, WorkItemId};

/// Link types registered by [`InMemoryDestination::new`].
#[must_use]
pub fn default_link_types() -> Vec<LinkType> {
    vec![
        LinkType::new("System.LinkTypes.Hierarchy", true, true),
        LinkType::new("System.LinkTypes.Dependency", true, true),
        LinkType::new("System.LinkTypes.Duplicate", true, false),
        LinkType::new("System.LinkTypes.Related", false, false),
    ]
}

/// Persisted state of one work item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub id: WorkItemId,
    pub work_item_type: String,
    /// Keyed by lower-cased reference name.
    pub fields: BTreeMap<String, FieldValue>,
    pub links: Vec<RelatedLink>,
    pub attachments: Vec<Attachment>,
    /// Number of successful saves.
    pub revision: u32,
}

impl StoredItem {
    #[must_use]
    pub fn field(&self, reference: &str) -> Option<&FieldValue> {
        self.fields.get(&reference.to_ascii_lowercase())
    }

    #[must_use]
    pub fn text(&self, reference: &str) -> Option<&str> {
        self.field(reference).and_then(FieldValue::as_text)
    }
}

#[derive(Debug)]
struct PendingProject {
    project: ProjectInfo,
    polls_remaining: u32,
    failure: Option<String>,
}

#[derive(Debug)]
struct MemoryState {
    items: BTreeMap<WorkItemId, StoredItem>,
    next_item_id: WorkItemId,
    next_attachment_id: i64,
    next_node_id: i64,
    iterations: ClassificationNode,
    areas: ClassificationNode,
    link_types: Vec<LinkType>,
    rejected_attachments: HashSet<String>,
    failing_nodes: HashSet<String>,
    fatal_saves: bool,
    node_creations: usize,
    saves: usize,
    metadata_refreshes: usize,
    projects: BTreeMap<String, ProjectInfo>,
    operations: BTreeMap<u64, PendingProject>,
    next_operation_id: u64,
    creation_polls: u32,
    creation_failure: Option<String>,
}

impl MemoryState {
    const fn tree(&self, tree: TreeKind) -> &ClassificationNode {
        match tree {
            TreeKind::Iteration => &self.iterations,
            TreeKind::Area => &self.areas,
        }
    }

    const fn tree_mut(&mut self, tree: TreeKind) -> &mut ClassificationNode {
        match tree {
            TreeKind::Iteration => &mut self.iterations,
            TreeKind::Area => &mut self.areas,
        }
    }
}

/// Shared in-memory destination. Cloning yields another handle to the same
/// state.
#[derive(Debug, Clone)]
pub struct InMemoryDestination {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for InMemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDestination {
    /// Empty destination with [`default_link_types`] and empty trees whose
    /// roots are node 1 (iterations) and node 2 (areas).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                items: BTreeMap::new(),
                next_item_id: 1,
                next_attachment_id: 1,
                next_node_id: 3,
                iterations: ClassificationNode::leaf(1, "Iteration"),
                areas: ClassificationNode::leaf(2, "Area"),
                link_types: default_link_types(),
                rejected_attachments: HashSet::new(),
                failing_nodes: HashSet::new(),
                fatal_saves: false,
                node_creations: 0,
                saves: 0,
                metadata_refreshes: 0,
                projects: BTreeMap::new(),
                operations: BTreeMap::new(),
                next_operation_id: 1,
                creation_polls: 1,
                creation_failure: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Replace the registered link types.
    #[must_use]
    pub fn with_link_types(self, link_types: Vec<LinkType>) -> Self {
        self.lock().link_types = link_types;
        self
    }

    /// Register an existing project.
    #[must_use]
    pub fn with_project(self, name: &str) -> Self {
        self.lock().projects.insert(
            name.to_string(),
            ProjectInfo {
                id: format!("project-{name}"),
                name: name.to_string(),
            },
        );
        self
    }

    /// Saves fail with [`DestinationError::AttachmentRejected`] while an
    /// unsaved attachment has this file name.
    pub fn reject_attachment(&self, file_name: &str) {
        self.lock()
            .rejected_attachments
            .insert(file_name.to_string());
    }

    /// Every save fails with [`DestinationError::Fatal`].
    pub fn fail_saves_fatally(&self, enabled: bool) {
        self.lock().fatal_saves = enabled;
    }

    /// Creating a node with this name fails.
    pub fn fail_node_creation(&self, name: &str) {
        self.lock().failing_nodes.insert(name.to_string());
    }

    /// Number of polls a queued project creation stays in progress.
    pub fn set_project_creation_polls(&self, polls: u32) {
        self.lock().creation_polls = polls;
    }

    /// Queued project creations complete with this failure message.
    pub fn fail_project_creation(&self, message: &str) {
        self.lock().creation_failure = Some(message.to_string());
    }

    /// Seed a pre-existing classification path, creating missing segments.
    pub fn seed_classification(&self, tree: TreeKind, path: &str) {
        let mut state = self.lock();
        let mut next_id = state.next_node_id;
        let mut node = state.tree_mut(tree);
        for segment in path.split('/') {
            let position = node.children.iter().position(|c| c.name == segment);
            let index = if let Some(index) = position {
                index
            } else {
                let leaf = ClassificationNode::leaf(next_id, segment);
                node.children.push(leaf);
                next_id += 1;
                node.children.len() - 1
            };
            node = &mut node.children[index];
        }
        state.next_node_id = next_id;
    }

    /// Persist a work item directly, bypassing replay. Returns its id.
    pub fn seed_item(&self, work_item_type: &str, links: Vec<RelatedLink>) -> WorkItemId {
        let mut state = self.lock();
        let id = state.next_item_id;
        state.next_item_id += 1;
        state.items.insert(
            id,
            StoredItem {
                id,
                work_item_type: work_item_type.to_string(),
                fields: BTreeMap::new(),
                links,
                attachments: Vec::new(),
                revision: 1,
            },
        );
        drop(state);
        id
    }

    /// Append a persisted relation to an existing item.
    pub fn seed_link(&self, from: WorkItemId, link: RelatedLink) -> Result<(), DestinationError> {
        let mut state = self.lock();
        let stored = state
            .items
            .get_mut(&from)
            .ok_or(DestinationError::NotFound(from))?;
        stored.links.push(link);
        drop(state);
        Ok(())
    }

    #[must_use]
    pub fn item(&self, id: WorkItemId) -> Option<StoredItem> {
        self.lock().items.get(&id).cloned()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn node_creation_count(&self) -> usize {
        self.lock().node_creations
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    #[must_use]
    pub fn metadata_refresh_count(&self) -> usize {
        self.lock().metadata_refreshes
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
fn find_node<'a>(root: &'a ClassificationNode, path: &str) -> Option<&'a ClassificationNode> {
    path.split('/').try_fold(root, |node, segment| {
        node.children.iter().find(|c| c.name == segment)
    })
}

fn find_node_mut<'a>(
    root: &'a mut ClassificationNode,
    path: &str,
) -> Option<&'a mut ClassificationNode> {
    path.split('/').try_fold(root, |node, segment| {
        node.children.iter_mut().find(|c| c.name == segment)
    })
}

impl LinkGraph for InMemoryDestination {
    fn next_linked(
        &self,
        item: WorkItemId,
        end: &LinkTypeEnd,
    ) -> Result<Option<WorkItemId>, DestinationError> {
        let state = self.lock();
        let stored = state
            .items
            .get(&item)
            .ok_or(DestinationError::NotFound(item))?;
        let next = stored
            .links
            .iter()
            .find(|link| link.end == *end)
            .map(|link| link.target);
        drop(state);
        Ok(next)
    }
}

impl Destination for InMemoryDestination {
    type Item = MemoryWorkItem;

    fn create_work_item(&self, work_item_type: &str) -> Result<MemoryWorkItem, DestinationError> {
        Ok(MemoryWorkItem {
            state: Arc::clone(&self.state),
            id: None,
            work_item_type: work_item_type.to_string(),
            fields: BTreeMap::new(),
            links: Vec::new(),
            attachments: Vec::new(),
            next_key: 1,
            open: true,
        })
    }

    fn get_work_item(&self, id: WorkItemId) -> Result<MemoryWorkItem, DestinationError> {
        let state = self.lock();
        let stored = state.items.get(&id).ok_or(DestinationError::NotFound(id))?;
        let next_key = stored
            .attachments
            .iter()
            .map(|a| a.key.0)
            .max()
            .unwrap_or(0)
            + 1;
        let item = MemoryWorkItem {
            state: Arc::clone(&self.state),
            id: Some(id),
            work_item_type: stored.work_item_type.clone(),
            fields: stored.fields.clone(),
            links: stored.links.clone(),
            attachments: stored.attachments.clone(),
            next_key,
            open: false,
        };
        drop(state);
        Ok(item)
    }

    fn link_types(&self) -> Result<Vec<LinkType>, DestinationError> {
        Ok(self.lock().link_types.clone())
    }

    fn classification_tree(&self, tree: TreeKind) -> Result<ClassificationNode, DestinationError> {
        Ok(self.lock().tree(tree).clone())
    }

    fn create_classification_node(
        &self,
        tree: TreeKind,
        parent_path: Option<&str>,
        name: &str,
    ) -> Result<ClassificationNode, DestinationError> {
        let mut state = self.lock();
        if state.failing_nodes.contains(name) {
            return Err(DestinationError::Request(format!(
                "{tree} node '{name}' rejected"
            )));
        }

        let id = state.next_node_id;
        let root = state.tree_mut(tree);
        let parent = match parent_path {
            Some(path) => find_node_mut(root, path).ok_or_else(|| {
                DestinationError::Request(format!("{tree} parent path '{path}' does not exist"))
            })?,
            None => root,
        };

        if let Some(existing) = parent.children.iter().find(|c| c.name == name) {
            return Ok(existing.clone());
        }

        let node = ClassificationNode::leaf(id, name);
        parent.children.push(node.clone());
        state.next_node_id += 1;
        state.node_creations += 1;
        drop(state);
        Ok(node)
    }

    fn refresh_metadata(&self) {
        self.lock().metadata_refreshes += 1;
    }
}

impl ProjectAdmin for InMemoryDestination {
    fn get_project(&self, name: &str) -> Result<Option<ProjectInfo>, DestinationError> {
        Ok(self.lock().projects.get(name).cloned())
    }

    fn queue_create_project(
        &self,
        request: &ProjectRequest,
    ) -> Result<OperationId, DestinationError> {
        let mut state = self.lock();
        let id = state.next_operation_id;
        state.next_operation_id += 1;
        let pending = PendingProject {
            project: ProjectInfo {
                id: format!("project-{}", request.name),
                name: request.name.clone(),
            },
            polls_remaining: state.creation_polls,
            failure: state.creation_failure.clone(),
        };
        state.operations.insert(id, pending);
        drop(state);
        Ok(OperationId(id))
    }

    fn operation(&self, id: OperationId) -> Result<OperationState, DestinationError> {
        let mut state = self.lock();
        let pending = state
            .operations
            .get_mut(&id.0)
            .ok_or_else(|| DestinationError::Request(format!("unknown operation {}", id.0)))?;

        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            return Ok(OperationState::InProgress);
        }
        if let Some(message) = pending.failure.clone() {
            return Ok(OperationState::Failed(message));
        }

        let project = pending.project.clone();
        state.projects.insert(project.name.clone(), project);
        drop(state);
        Ok(OperationState::Succeeded)
    }
}

/// Edit session over an [`InMemoryDestination`] item.
#[derive(Debug)]
pub struct MemoryWorkItem {
    state: Arc<Mutex<MemoryState>>,
    id: Option<WorkItemId>,
    work_item_type: String,
    fields: BTreeMap<String, FieldValue>,
    links: Vec<RelatedLink>,
    attachments: Vec<Attachment>,
    next_key: u64,
    open: bool,
}

impl MemoryWorkItem {
    const fn ensure_open(&self) -> Result<(), DestinationError> {
        if self.open {
            Ok(())
        } else {
            Err(DestinationError::SessionClosed)
        }
    }
}

impl WorkItemHandle for MemoryWorkItem {
    fn id(&self) -> Option<WorkItemId> {
        self.id
    }

    fn work_item_type(&self) -> &str {
        &self.work_item_type
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), DestinationError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn field(&self, reference: &str) -> Option<FieldValue> {
        self.fields.get(&reference.to_ascii_lowercase()).cloned()
    }

    fn set_field(&mut self, reference: &str, value: FieldValue) -> Result<(), DestinationError> {
        self.ensure_open()?;
        if reference.trim().is_empty() {
            return Err(DestinationError::FieldRejected {
                field: reference.to_string(),
                reason: "empty reference name".into(),
            });
        }
        self.fields.insert(reference.to_ascii_lowercase(), value);
        Ok(())
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn add_attachment(
        &mut self,
        file_path: &str,
        comment: &str,
    ) -> Result<AttachmentKey, DestinationError> {
        self.ensure_open()?;
        let key = AttachmentKey(self.next_key);
        self.next_key += 1;
        self.attachments.push(Attachment {
            key,
            file_path: file_path.to_string(),
            comment: comment.to_string(),
            persisted: None,
        });
        Ok(key)
    }

    fn remove_attachment(&mut self, key: AttachmentKey) -> bool {
        let before = self.attachments.len();
        self.attachments.retain(|a| a.key != key);
        self.attachments.len() != before
    }

    fn links(&self) -> &[RelatedLink] {
        &self.links
    }

    fn add_link(&mut self, link: RelatedLink) -> Result<bool, DestinationError> {
        self.ensure_open()?;
        if self.links.contains(&link) {
            return Ok(false);
        }
        self.links.push(link);
        Ok(true)
    }

    fn remove_link(&mut self, link: &RelatedLink) -> bool {
        let before = self.links.len();
        self.links.retain(|l| l != link);
        self.links.len() != before
    }

    fn validate(&self) -> Vec<FieldIssue> {
        let title = self.field(fields::TITLE);
        if title.as_ref().is_none_or(FieldValue::is_blank) {
            return vec![FieldIssue {
                name: fields::TITLE.to_string(),
                status: "InvalidEmpty".to_string(),
                value: title,
            }];
        }
        Vec::new()
    }

    fn save(&mut self) -> Result<(), DestinationError> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state);
        if state.fatal_saves {
            return Err(DestinationError::Fatal("destination session lost".into()));
        }

        for attachment in self.attachments.iter().filter(|a| a.persisted.is_none()) {
            let name = file_name(&attachment.file_path);
            if state.rejected_attachments.contains(name) {
                return Err(DestinationError::AttachmentRejected {
                    key: attachment.key,
                    name: name.to_string(),
                    reason: "file exceeds the maximum attachment size".into(),
                });
            }
        }

        let id = if let Some(id) = self.id {
            id
        } else {
            let id = state.next_item_id;
            state.next_item_id += 1;
            id
        };

        for attachment in &mut self.attachments {
            if attachment.persisted.is_none() {
                let attachment_id = state.next_attachment_id;
                state.next_attachment_id += 1;
                attachment.persisted = Some(PersistedAttachment {
                    id: attachment_id,
                    uri: format!(
                        "memory://attachments/{attachment_id}/{}",
                        file_name(&attachment.file_path)
                    ),
                });
            }
        }

        let revision = state.items.get(&id).map_or(0, |item| item.revision) + 1;
        state.items.insert(
            id,
            StoredItem {
                id,
                work_item_type: self.work_item_type.clone(),
                fields: self.fields.clone(),
                links: self.links.clone(),
                attachments: self.attachments.clone(),
                revision,
            },
        );
        state.saves += 1;
        drop(state);
        self.id = Some(id);
        Ok(())
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_assigns_ids_and_persists_fields() -> Result<(), DestinationError> {
        let dest = InMemoryDestination::new();
        let mut item = dest.create_work_item("Task")?;
        item.set_field(fields::TITLE, FieldValue::String("First".into()))?;
        let key = item.add_attachment("/export/log.txt", "build log")?;
        item.save()?;

        let id = item.id().expect("id after save");
        let stored = dest.item(id).expect("stored item");
        assert_eq!(stored.text("system.title"), Some("First"));
        assert_eq!(stored.revision, 1);
        let attachment = &stored.attachments[0];
        assert_eq!(attachment.key, key);
        assert!(
            attachment
                .persisted
                .as_ref()
                .is_some_and(|p| p.uri.ends_with("/log.txt"))
        );
        Ok(())
    }

    #[test]
    fn fetched_items_start_closed() -> Result<(), DestinationError> {
        let dest = InMemoryDestination::new();
        let id = dest.seed_item("Task", Vec::new());
        let mut item = dest.get_work_item(id)?;
        assert!(!item.is_open());
        assert_eq!(
            item.set_field(fields::TITLE, FieldValue::String("x".into())),
            Err(DestinationError::SessionClosed)
        );
        item.open()?;
        item.set_field(fields::TITLE, FieldValue::String("x".into()))?;
        Ok(())
    }

    #[test]
    fn rejected_attachment_blocks_save() -> Result<(), DestinationError> {
        let dest = InMemoryDestination::new();
        dest.reject_attachment("huge.iso");
        let mut item = dest.create_work_item("Task")?;
        let key = item.add_attachment("C:\\export\\huge.iso", "")?;
        let err = item.save().expect_err("save must fail");
        let DestinationError::AttachmentRejected { key: rejected, .. } = &err else {
            panic!("expected a rejected attachment, got {err:?}");
        };
        assert_eq!(*rejected, key);
        assert!(item.remove_attachment(key));
        item.save()?;
        Ok(())
    }

    #[test]
    fn node_creation_is_create_or_update() -> Result<(), DestinationError> {
        let dest = InMemoryDestination::new();
        let first = dest.create_classification_node(TreeKind::Area, None, "Web")?;
        let again = dest.create_classification_node(TreeKind::Area, None, "Web")?;
        assert_eq!(first, again);
        assert_eq!(dest.node_creation_count(), 1);

        let child = dest.create_classification_node(TreeKind::Area, Some("Web"), "Auth")?;
        let tree = dest.classification_tree(TreeKind::Area)?;
        assert_eq!(find_node(&tree, "Web/Auth").map(|n| n.id), Some(child.id));
        assert!(
            dest.create_classification_node(TreeKind::Area, Some("Missing"), "X")
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn project_creation_completes_after_polls() -> Result<(), DestinationError> {
        let dest = InMemoryDestination::new();
        dest.set_project_creation_polls(2);
        let op = dest.queue_create_project(&ProjectRequest {
            name: "Migrated".into(),
            description: String::new(),
            process_template: "Scrum".into(),
            version_control: "Git".into(),
        })?;
        assert_eq!(dest.operation(op)?, OperationState::InProgress);
        assert_eq!(dest.operation(op)?, OperationState::InProgress);
        assert_eq!(dest.operation(op)?, OperationState::Succeeded);
        assert!(dest.get_project("Migrated")?.is_some());
        Ok(())
    }
}
