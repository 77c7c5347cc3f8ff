//! Node-list snapshots in the shape the kernel publishes them.
//!
//! A snapshot is a record of parallel arrays (`nodeindex`, `name`, `class`,
//! `children`, `step_children`, `control_status`, `request_id`). Multi-worker
//! kernels wrap one such record per worker in a `proc` sequence. Field names
//! are fixed by the kernel and matched exactly.

use crate::status::StatusWord;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIndex(pub i64);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque request identifier, a dotted sequence of integers on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub Vec<i64>);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(i64::to_string).collect::<Vec<_>>();
        f.write_str(&parts.join("."))
    }
}

impl RequestId {
    /// Accepts an integer array, a single integer or a dotted string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(Value::as_i64)
                .collect::<Option<Vec<_>>>()
                .map(Self),
            Value::Number(n) => n.as_i64().map(|id| Self(vec![id])),
            Value::String(s) => s
                .split('.')
                .filter(|part| !part.is_empty())
                .map(|part| part.trim().parse::<i64>().ok())
                .collect::<Option<Vec<_>>>()
                .map(Self),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| de::Error::custom(format!("invalid request id: {value}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChildLabel {
    Position(usize),
    Name(String),
}

impl fmt::Display for ChildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(pos) => write!(f, "{pos}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEdge {
    pub label: ChildLabel,
    /// Negative for a child slot the kernel left unconnected.
    pub index: i64,
}

/// Ordered child edges of one node. The kernel sends either a positional
/// list or a label-to-index record; record order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildList(pub Vec<ChildEdge>);

impl ChildList {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let as_index = |value: &Value| -> Result<i64, String> {
            match value {
                Value::Null => Ok(-1),
                other => other
                    .as_i64()
                    .ok_or_else(|| format!("child index is not an integer: {other}")),
            }
        };
        match value {
            Value::Null => Ok(Self::default()),
            Value::Number(_) => Ok(Self(vec![ChildEdge {
                label: ChildLabel::Position(0),
                index: as_index(value)?,
            }])),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(pos, item)| {
                    Ok(ChildEdge {
                        label: ChildLabel::Position(pos),
                        index: as_index(item)?,
                    })
                })
                .collect::<Result<Vec<_>, String>>()
                .map(Self),
            Value::Object(map) => map
                .iter()
                .map(|(label, item)| {
                    Ok(ChildEdge {
                        label: ChildLabel::Name(label.clone()),
                        index: as_index(item)?,
                    })
                })
                .collect::<Result<Vec<_>, String>>()
                .map(Self),
            other => Err(format!("unsupported children entry: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for ChildList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedSnapshotError {
    #[error("snapshot decode failed: {0}")]
    Decode(String),
    #[error("worker {worker}: field '{field}' has {found} entries, nodeindex has {expected}")]
    LengthMismatch {
        worker: usize,
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("worker {worker}: field '{field}' present without nodeindex")]
    MissingIndex { worker: usize, field: &'static str },
    #[error("worker {worker}: negative node index {index}")]
    NegativeIndex { worker: usize, index: i64 },
    #[error("worker {worker}: node index {index} listed more than once")]
    DuplicateIndex { worker: usize, index: i64 },
    #[error("node {index} out of range (max {max})")]
    IndexOutOfRange { index: i64, max: i64 },
    #[error("edge {parent} -> {child} out of range (max {max})")]
    EdgeOutOfRange { parent: i64, child: i64, max: i64 },
}

/// One worker's parallel arrays. Absent arrays are filled with defaults;
/// present arrays must match `nodeindex` in length.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeListPart {
    #[serde(default)]
    pub nodeindex: Option<Vec<i64>>,
    #[serde(default)]
    pub name: Option<Vec<Option<String>>>,
    #[serde(default, rename = "class")]
    pub class_name: Option<Vec<Option<String>>>,
    #[serde(default)]
    pub children: Option<Vec<ChildList>>,
    #[serde(default)]
    pub step_children: Option<Vec<Option<Vec<i64>>>>,
    #[serde(default)]
    pub control_status: Option<Vec<u32>>,
    #[serde(default)]
    pub request_id: Option<Vec<Option<RequestId>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeListSnapshot {
    #[serde(default)]
    pub serial: Option<u64>,
    #[serde(default)]
    pub proc: Option<Vec<NodeListPart>>,
    #[serde(flatten)]
    pub local: NodeListPart,
}

/// One node's record after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub index: NodeIndex,
    pub processor: usize,
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub children: Vec<ChildEdge>,
    pub step_children: Vec<i64>,
    pub control_status: StatusWord,
    pub request_id: Option<RequestId>,
}

impl NodeListPart {
    fn is_empty(&self) -> bool {
        self.nodeindex.is_none()
            && self.name.is_none()
            && self.class_name.is_none()
            && self.children.is_none()
            && self.step_children.is_none()
            && self.control_status.is_none()
            && self.request_id.is_none()
    }

    fn check_len<T>(
        worker: usize,
        field: &'static str,
        column: &Option<Vec<T>>,
        expected: usize,
    ) -> Result<(), MalformedSnapshotError> {
        match column {
            Some(values) if values.len() != expected => {
                Err(MalformedSnapshotError::LengthMismatch {
                    worker,
                    field,
                    expected,
                    found: values.len(),
                })
            }
            _ => Ok(()),
        }
    }

    fn into_rows(self, worker: usize) -> Result<Vec<SnapshotRow>, MalformedSnapshotError> {
        let Some(indices) = self.nodeindex else {
            let present = [
                ("name", self.name.is_some()),
                ("class", self.class_name.is_some()),
                ("children", self.children.is_some()),
                ("step_children", self.step_children.is_some()),
                ("control_status", self.control_status.is_some()),
                ("request_id", self.request_id.is_some()),
            ];
            return match present.iter().find(|(_, set)| *set) {
                Some(&(field, _)) => Err(MalformedSnapshotError::MissingIndex { worker, field }),
                None => Ok(Vec::new()),
            };
        };

        let expected = indices.len();
        Self::check_len(worker, "name", &self.name, expected)?;
        Self::check_len(worker, "class", &self.class_name, expected)?;
        Self::check_len(worker, "children", &self.children, expected)?;
        Self::check_len(worker, "step_children", &self.step_children, expected)?;
        Self::check_len(worker, "control_status", &self.control_status, expected)?;
        Self::check_len(worker, "request_id", &self.request_id, expected)?;

        let mut names = self.name.map(Vec::into_iter);
        let mut classes = self.class_name.map(Vec::into_iter);
        let mut children = self.children.map(Vec::into_iter);
        let mut step_children = self.step_children.map(Vec::into_iter);
        let mut statuses = self.control_status.map(Vec::into_iter);
        let mut request_ids = self.request_id.map(Vec::into_iter);

        let mut rows = Vec::with_capacity(expected);
        for index in indices {
            if index < 0 {
                return Err(MalformedSnapshotError::NegativeIndex { worker, index });
            }
            rows.push(SnapshotRow {
                index: NodeIndex(index),
                processor: worker,
                name: names.as_mut().and_then(Iterator::next).flatten(),
                class_name: classes.as_mut().and_then(Iterator::next).flatten(),
                children: children
                    .as_mut()
                    .and_then(Iterator::next)
                    .map(|list| list.0)
                    .unwrap_or_default(),
                step_children: step_children
                    .as_mut()
                    .and_then(Iterator::next)
                    .flatten()
                    .unwrap_or_default(),
                control_status: StatusWord(
                    statuses.as_mut().and_then(Iterator::next).unwrap_or_default(),
                ),
                request_id: request_ids.as_mut().and_then(Iterator::next).flatten(),
            });
        }
        Ok(rows)
    }
}

impl NodeListSnapshot {
    pub fn from_value(value: &Value) -> Result<Self, MalformedSnapshotError> {
        Self::deserialize(value).map_err(|err| MalformedSnapshotError::Decode(err.to_string()))
    }

    /// True for a reply that only confirms the serial and carries no node data.
    pub fn is_unchanged_reply(&self) -> bool {
        self.local.is_empty() && self.proc.as_ref().map_or(true, |parts| parts.is_empty())
    }

    /// Validates every worker's arrays and flattens them into rows, worker by worker.
    pub fn into_rows(self) -> Result<Vec<Vec<SnapshotRow>>, MalformedSnapshotError> {
        let mut workers = Vec::new();
        match self.proc {
            Some(parts) => {
                if !self.local.is_empty() {
                    workers.push(self.local.into_rows(0)?);
                }
                let offset = workers.len();
                for (worker, part) in parts.into_iter().enumerate() {
                    workers.push(part.into_rows(worker + offset)?);
                }
            }
            None => workers.push(self.local.into_rows(0)?),
        }
        Ok(workers)
    }
}
