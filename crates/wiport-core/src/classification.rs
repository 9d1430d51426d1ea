//! Classification path resolution with lazy node creation.
//!
//! # Overview
//!
//! Area and iteration trees are addressed by `/`-delimited paths that exclude
//! the tree root (`Web/Auth`, `Release 1/Sprint 3`). The resolver keeps one
//! `path → node id` cache per tree and creates any missing segment in the
//! destination on demand.
//!
//! # Invariants
//!
//! - Every cached path refers to a node that exists in the destination.
//! - Cached paths are prefix-closed: ancestors are resolved (and created if
//!   necessary) before their children, so `a/b/c` present implies `a/b` and
//!   `a` present.
//!
//! # Concurrency
//!
//! Each tree cache sits behind its own mutex, held across the creation
//! request. Workers racing on the same new path therefore issue exactly one
//! create call; the losers observe the winner's cache entry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::destination::{ClassificationNode, Destination, DestinationError, TreeKind};
use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("empty value provided for {tree} node name/path")]
    EmptyPath { tree: TreeKind },

    #[error("{tree} path '{path}' contains an empty segment")]
    BlankSegment { tree: TreeKind, path: String },

    #[error("error while adding {tree} '{path}' to the destination: {source}")]
    Create {
        tree: TreeKind,
        path: String,
        #[source]
        source: DestinationError,
    },

    #[error("error while building {tree} cache: {source}")]
    Load {
        tree: TreeKind,
        #[source]
        source: DestinationError,
    },
}

impl ClassificationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyPath { .. } | Self::BlankSegment { .. } => {
                ErrorCode::EmptyClassificationPath
            }
            Self::Create { .. } | Self::Load { .. } => ErrorCode::ClassificationCreateFailed,
        }
    }

    /// The underlying destination failure is unrecoverable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Create { source, .. } | Self::Load { source, .. } => source.is_fatal(),
            Self::EmptyPath { .. } | Self::BlankSegment { .. } => false,
        }
    }
}

/// `path → node id` cache for one tree.
#[derive(Debug)]
struct TreeCache {
    tree: TreeKind,
    root_id: i64,
    paths: Mutex<HashMap<String, i64>>,
}

impl TreeCache {
    fn new(tree: TreeKind, root_id: i64) -> Self {
        Self {
            tree,
            root_id,
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Depth-first walk of `root`, recording every descendant's full path.
    fn from_tree(tree: TreeKind, root: &ClassificationNode) -> Self {
        let cache = Self::new(tree, root.id);
        let mut paths = HashMap::new();
        let mut stack: Vec<(&ClassificationNode, String)> = root
            .children
            .iter()
            .rev()
            .map(|child| (child, child.name.clone()))
            .collect();

        while let Some((node, path)) = stack.pop() {
            for child in node.children.iter().rev() {
                stack.push((child, format!("{path}/{}", child.name)));
            }
            if paths.contains_key(&path) {
                warn!("{tree} '{path}' appears twice in the destination tree, keeping the first");
                continue;
            }
            debug!("{tree} '{path}' added to cache");
            paths.insert(path, node.id);
        }

        *cache.lock() = paths;
        cache
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve one path whose parent is already present, creating the node
    /// under the lock on a miss.
    fn resolve_segment<D: Destination + ?Sized>(
        &self,
        destination: &D,
        path: &str,
        parent: Option<&str>,
        name: &str,
    ) -> Result<i64, ClassificationError> {
        let mut paths = self.lock();
        if let Some(&id) = paths.get(path) {
            return Ok(id);
        }

        let created = destination.create_classification_node(self.tree, parent, name);
        if let Ok(node) = &created {
            paths.insert(path.to_string(), node.id);
        }
        drop(paths);

        match created {
            Ok(node) => {
                debug!("{} '{path}' added to the destination", self.tree);
                destination.refresh_metadata();
                Ok(node.id)
            }
            Err(source) => {
                error!(
                    "error while adding {} '{path}' to the destination: {source}",
                    self.tree
                );
                Err(ClassificationError::Create {
                    tree: self.tree,
                    path: path.to_string(),
                    source,
                })
            }
        }
    }
}

/// Resolver for the iteration and area trees.
#[derive(Debug)]
pub struct ClassificationResolver {
    iterations: TreeCache,
    areas: TreeCache,
}

impl ClassificationResolver {
    /// Resolver with empty caches under the given roots.
    #[must_use]
    pub fn new(iteration_root: i64, area_root: i64) -> Self {
        Self {
            iterations: TreeCache::new(TreeKind::Iteration, iteration_root),
            areas: TreeCache::new(TreeKind::Area, area_root),
        }
    }

    /// Resolver pre-populated from already fetched trees.
    #[must_use]
    pub fn from_trees(iterations: &ClassificationNode, areas: &ClassificationNode) -> Self {
        Self {
            iterations: TreeCache::from_tree(TreeKind::Iteration, iterations),
            areas: TreeCache::from_tree(TreeKind::Area, areas),
        }
    }

    /// Fetch both trees from the destination and build the caches.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::Load`] if either tree cannot be read.
    pub fn initialize<D: Destination + ?Sized>(
        destination: &D,
    ) -> Result<Self, ClassificationError> {
        let fetch = |tree: TreeKind| {
            tracing::info!("Building {tree} cache...");
            destination.classification_tree(tree).map_err(|source| {
                error!("error while building {tree} cache: {source}");
                ClassificationError::Load { tree, source }
            })
        };
        let iterations = fetch(TreeKind::Iteration)?;
        let areas = fetch(TreeKind::Area)?;
        Ok(Self::from_trees(&iterations, &areas))
    }

    const fn cache(&self, tree: TreeKind) -> &TreeCache {
        match tree {
            TreeKind::Iteration => &self.iterations,
            TreeKind::Area => &self.areas,
        }
    }

    #[must_use]
    pub const fn root_id(&self, tree: TreeKind) -> i64 {
        self.cache(tree).root_id
    }

    /// Cached node id for `path`, without touching the destination.
    #[must_use]
    pub fn cached(&self, tree: TreeKind, path: &str) -> Option<i64> {
        self.cache(tree).lock().get(path).copied()
    }

    /// Number of cached paths in `tree`.
    #[must_use]
    pub fn len(&self, tree: TreeKind) -> usize {
        self.cache(tree).lock().len()
    }

    /// Resolve `full_path` in `tree` to a node id, creating every missing
    /// segment from the top down.
    ///
    /// # Errors
    ///
    /// - [`ClassificationError::EmptyPath`] for an empty or blank path.
    /// - [`ClassificationError::BlankSegment`] for paths like `a//b`.
    /// - [`ClassificationError::Create`] when the destination rejects a node;
    ///   nothing is cached for that segment or below it.
    pub fn ensure<D: Destination + ?Sized>(
        &self,
        destination: &D,
        full_path: &str,
        tree: TreeKind,
    ) -> Result<i64, ClassificationError> {
        if full_path.trim().is_empty() {
            error!("Empty value provided for node name/path.");
            return Err(ClassificationError::EmptyPath { tree });
        }

        let segments: Vec<&str> = full_path.split('/').collect();
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(ClassificationError::BlankSegment {
                tree,
                path: full_path.to_string(),
            });
        }

        let cache = self.cache(tree);
        let mut id = cache.root_id;
        for depth in 1..=segments.len() {
            let path = segments[..depth].join("/");
            let parent = (depth > 1).then(|| segments[..depth - 1].join("/"));
            let name = segments[depth - 1];
            id = cache.resolve_segment(destination, &path, parent.as_deref(), name)?;
        }
        Ok(id)
    }
}
