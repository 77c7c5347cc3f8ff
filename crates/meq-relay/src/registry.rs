use meq_core::snapshot::{ChildEdge, MalformedSnapshotError, NodeListSnapshot, SnapshotRow};
use meq_core::status::{self, Status, StatusWord};
use meq_core::{NodeIndex, RequestId};
use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no node with index {0}")]
    UnknownIndex(NodeIndex),
    #[error("no node named '{0}'")]
    UnknownName(String),
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Upper bound on node indices, when the kernel's index space is known.
    pub max_node_index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub index: NodeIndex,
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub processor: Option<usize>,
    pub children: Vec<ChildEdge>,
    pub step_children: Vec<NodeIndex>,
    /// Back-references rebuilt on every snapshot load. Not authoritative.
    pub parents: BTreeSet<NodeIndex>,
    pub status_word: StatusWord,
    pub request_id: Option<RequestId>,
    pub profiling_stats: Option<Vec<f64>>,
    pub cache_stats: Option<Vec<f64>>,
}

impl Node {
    fn placeholder(index: NodeIndex) -> Self {
        Self {
            index,
            name: None,
            class_name: None,
            processor: None,
            children: Vec::new(),
            step_children: Vec::new(),
            parents: BTreeSet::new(),
            status_word: StatusWord::default(),
            request_id: None,
            profiling_stats: None,
            cache_stats: None,
        }
    }

    /// Known only through another node's child edge so far.
    pub fn is_placeholder(&self) -> bool {
        self.name.is_none() && self.class_name.is_none()
    }

    pub fn status(&self) -> Status {
        status::decode(self.status_word)
    }

    pub fn child_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.children
            .iter()
            .filter(|edge| edge.index >= 0)
            .map(|edge| NodeIndex(edge.index))
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.index.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestIdUpdate {
    #[default]
    Unchanged,
    Set(Option<RequestId>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub nodes: usize,
    pub edges: usize,
    pub roots: usize,
    pub placeholders: usize,
    pub duplicate_names: usize,
}

#[derive(Debug, Default)]
struct NodeTable {
    nodes: BTreeMap<NodeIndex, Node>,
    by_name: HashMap<String, NodeIndex>,
}

impl NodeTable {
    fn get_or_create(&mut self, index: NodeIndex) -> &mut Node {
        self.nodes
            .entry(index)
            .or_insert_with(|| Node::placeholder(index))
    }

    fn fill(&mut self, row: SnapshotRow, report: &mut LoadReport) {
        if let Some(name) = &row.name {
            if let Some(previous) = self.by_name.insert(name.clone(), row.index) {
                if previous != row.index {
                    report.duplicate_names += 1;
                    warn!(
                        event = "registry_duplicate_name",
                        name = %name,
                        previous = %previous,
                        replacement = %row.index
                    );
                }
            }
        }

        let node = self.get_or_create(row.index);
        node.name = row.name;
        node.class_name = row.class_name;
        node.processor = Some(row.processor);
        node.status_word = row.control_status;
        node.request_id = row.request_id;
        node.children = row.children;
        node.step_children = row
            .step_children
            .iter()
            .filter(|child| **child >= 0)
            .map(|child| NodeIndex(*child))
            .collect();
    }

    fn link(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.get_or_create(child).parents.insert(parent);
    }
}

/// Directory of the kernel's nodes, keyed by index with a secondary name map.
///
/// Name collisions are last-writer-wins. The serial mirrors the kernel's
/// node-list serial so callers can tell whether a fresh snapshot is needed.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    config: RegistryConfig,
    table: NodeTable,
    serial: u64,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            table: NodeTable::default(),
            serial: 0,
        }
    }

    pub fn clear(&mut self) {
        let dropped = self.table.nodes.len();
        self.table = NodeTable::default();
        self.serial = 0;
        info!(event = "registry_cleared", dropped);
    }

    /// Replaces the whole table with `snapshot`. On error the previous table
    /// is left untouched.
    pub fn load_snapshot(
        &mut self,
        snapshot: NodeListSnapshot,
    ) -> Result<LoadReport, MalformedSnapshotError> {
        let serial = snapshot.serial;
        let workers = snapshot.into_rows()?;

        let mut staging = NodeTable::default();
        let mut report = LoadReport::default();
        let mut seen = BTreeSet::new();
        for rows in workers {
            for row in rows {
                if !seen.insert(row.index) {
                    return Err(MalformedSnapshotError::DuplicateIndex {
                        worker: row.processor,
                        index: row.index.0,
                    });
                }
                self.check_bound(row.index.0)?;
                let parent = row.index;
                let edges = linked_indices(&row);
                for child in &edges {
                    self.check_edge(parent.0, *child)?;
                }
                staging.fill(row, &mut report);
                for child in edges {
                    staging.link(parent, NodeIndex(child));
                    report.edges += 1;
                }
            }
        }

        report.nodes = staging.nodes.len();
        report.roots = staging
            .nodes
            .values()
            .filter(|node| node.parents.is_empty())
            .count();
        report.placeholders = staging
            .nodes
            .values()
            .filter(|node| node.is_placeholder())
            .count();

        self.table = staging;
        if let Some(serial) = serial {
            self.serial = serial;
        }
        info!(
            event = "registry_snapshot_loaded",
            nodes = report.nodes,
            edges = report.edges,
            roots = report.roots,
            placeholders = report.placeholders,
            serial = self.serial
        );
        Ok(report)
    }

    fn check_bound(&self, index: i64) -> Result<(), MalformedSnapshotError> {
        match self.config.max_node_index {
            Some(max) if index > max => Err(MalformedSnapshotError::IndexOutOfRange { index, max }),
            _ => Ok(()),
        }
    }

    fn check_edge(&self, parent: i64, child: i64) -> Result<(), MalformedSnapshotError> {
        match self.config.max_node_index {
            Some(max) if child > max => Err(MalformedSnapshotError::EdgeOutOfRange {
                parent,
                child,
                max,
            }),
            _ => Ok(()),
        }
    }

    pub fn get_by_index(&self, index: NodeIndex) -> Result<&Node, RegistryError> {
        self.find_by_index(index)
            .ok_or(RegistryError::UnknownIndex(index))
    }

    pub fn get_by_name(&self, name: &str) -> Result<&Node, RegistryError> {
        self.find_by_name(name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))
    }

    pub fn find_by_index(&self, index: NodeIndex) -> Option<&Node> {
        self.table.nodes.get(&index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.table
            .by_name
            .get(name)
            .and_then(|index| self.table.nodes.get(index))
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        self.table.nodes.contains_key(&index)
    }

    pub fn roots(&self) -> Vec<&Node> {
        self.table
            .nodes
            .values()
            .filter(|node| node.parents.is_empty())
            .collect()
    }

    pub fn children_of(&self, index: NodeIndex) -> Vec<&Node> {
        self.find_by_index(index)
            .map(|node| {
                node.child_indices()
                    .filter_map(|child| self.table.nodes.get(&child))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> btree_map::Values<'_, NodeIndex, Node> {
        self.table.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.table.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.nodes.is_empty()
    }

    pub fn placeholder_count(&self) -> usize {
        self.iter().filter(|node| node.is_placeholder()).count()
    }

    /// Returns the previous status word; a node seen here first starts as a
    /// placeholder with an all-zero word.
    pub fn apply_status_update(
        &mut self,
        index: NodeIndex,
        word: StatusWord,
        request_id: RequestIdUpdate,
    ) -> StatusWord {
        let node = self.table.get_or_create(index);
        let previous = node.status_word;
        node.status_word = word;
        if let RequestIdUpdate::Set(request_id) = request_id {
            node.request_id = request_id;
        }
        debug!(
            event = "registry_status_update",
            node = %index,
            previous = %previous,
            current = %word
        );
        previous
    }

    pub fn set_stats(
        &mut self,
        index: NodeIndex,
        profiling_stats: Option<Vec<f64>>,
        cache_stats: Option<Vec<f64>>,
    ) {
        let node = self.table.get_or_create(index);
        if profiling_stats.is_some() {
            node.profiling_stats = profiling_stats;
        }
        if cache_stats.is_some() {
            node.cache_stats = cache_stats;
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }
}

/// Child and step-child indices of `row`, skipping unconnected slots.
fn linked_indices(row: &SnapshotRow) -> Vec<i64> {
    row.children
        .iter()
        .map(|edge| edge.index)
        .chain(row.step_children.iter().copied())
        .filter(|index| *index >= 0)
        .collect()
}
