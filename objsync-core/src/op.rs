//! Opaque op model for synced object state.
//!
//! Ops are the unit of mutation carried by commands. The sync engine and the
//! dispatch service treat them as opaque payloads; only this module
//! interprets them against a JSON state value. Modeled as a tagged enum so
//! the wire stays self-describing and the server can apply ops it did not
//! originate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One segment of a path into a JSON value.
///
/// Serialized untagged: strings address object keys, integers address array
/// elements, matching the mixed string/int paths on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    Index(usize),
    Key(String),
}

/// Errors that can occur while applying an op to a state value.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("no value at {0}")]
    MissingSegment(String),

    #[error("expected an object at {0}")]
    NotAnObject(String),

    #[error("expected an array at {0}")]
    NotAnArray(String),

    #[error("array index {index} out of bounds at {path} (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },

    #[error("merge value must be an object")]
    MergeNotObject,
}

/// A single mutation of a synced object's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Op {
    /// Set the value at `path`, creating missing intermediate objects.
    /// An empty path replaces the whole state.
    Set { path: Vec<PathSeg>, value: Value },

    /// Remove the value at `path`. Removing an absent key is a no-op.
    Delete { path: Vec<PathSeg> },

    /// Shallow-merge an object into the object at `path`.
    Merge { path: Vec<PathSeg>, value: Value },

    /// Replace the whole state.
    Replace { value: Value },

    /// Array edit: remove `delete_count` elements at `index`, then insert
    /// `values` in their place.
    #[serde(rename_all = "camelCase")]
    Splice {
        path: Vec<PathSeg>,
        index: usize,
        #[serde(default)]
        delete_count: usize,
        #[serde(default)]
        values: Vec<Value>,
    },
}

impl Op {
    /// Apply this op to `state` in place.
    pub fn apply(&self, state: &mut Value) -> Result<(), OpError> {
        match self {
            Op::Replace { value } => {
                *state = value.clone();
                Ok(())
            }
            Op::Set { path, value } => {
                let Some((last, parent_path)) = path.split_last() else {
                    *state = value.clone();
                    return Ok(());
                };
                let parent = resolve_mut(state, parent_path, true)?;
                set_at(parent, last, value.clone(), parent_path)
            }
            Op::Delete { path } => {
                let Some((last, parent_path)) = path.split_last() else {
                    *state = Value::Object(Map::new());
                    return Ok(());
                };
                let parent = match resolve_mut(state, parent_path, false) {
                    Ok(parent) => parent,
                    Err(OpError::MissingSegment(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                delete_at(parent, last);
                Ok(())
            }
            Op::Merge { path, value } => {
                let patch = value.as_object().ok_or(OpError::MergeNotObject)?;
                let target = resolve_mut(state, path, true)?;
                if target.is_null() {
                    *target = Value::Object(Map::new());
                }
                let map = target
                    .as_object_mut()
                    .ok_or_else(|| OpError::NotAnObject(path_str(path)))?;
                for (key, val) in patch {
                    map.insert(key.clone(), val.clone());
                }
                Ok(())
            }
            Op::Splice {
                path,
                index,
                delete_count,
                values,
            } => {
                let target = resolve_mut(state, path, false)?;
                let arr = target
                    .as_array_mut()
                    .ok_or_else(|| OpError::NotAnArray(path_str(path)))?;
                let len = arr.len();
                if *index > len {
                    return Err(OpError::IndexOutOfBounds {
                        path: path_str(path),
                        index: *index,
                        len,
                    });
                }
                let end = (*index + *delete_count).min(len);
                arr.splice(*index..end, values.iter().cloned());
                Ok(())
            }
        }
    }
}

/// Walk `path` from `root`, returning the value it addresses.
///
/// With `create`, missing object keys are materialized as nulls (promoted to
/// objects when walked through). Arrays are never materialized implicitly.
fn resolve_mut<'a>(
    root: &'a mut Value,
    path: &[PathSeg],
    create: bool,
) -> Result<&'a mut Value, OpError> {
    let mut cur = root;
    for (depth, seg) in path.iter().enumerate() {
        match seg {
            PathSeg::Key(key) => {
                if create && cur.is_null() {
                    *cur = Value::Object(Map::new());
                }
                let map = cur
                    .as_object_mut()
                    .ok_or_else(|| OpError::NotAnObject(path_str(&path[..depth])))?;
                cur = if create {
                    map.entry(key.clone()).or_insert(Value::Null)
                } else {
                    map.get_mut(key)
                        .ok_or_else(|| OpError::MissingSegment(path_str(&path[..=depth])))?
                };
            }
            PathSeg::Index(i) => {
                let arr = cur
                    .as_array_mut()
                    .ok_or_else(|| OpError::NotAnArray(path_str(&path[..depth])))?;
                let len = arr.len();
                cur = arr.get_mut(*i).ok_or(OpError::IndexOutOfBounds {
                    path: path_str(&path[..depth]),
                    index: *i,
                    len,
                })?;
            }
        }
    }
    Ok(cur)
}

fn set_at(
    parent: &mut Value,
    seg: &PathSeg,
    value: Value,
    parent_path: &[PathSeg],
) -> Result<(), OpError> {
    match seg {
        PathSeg::Key(key) => {
            if parent.is_null() {
                *parent = Value::Object(Map::new());
            }
            let map = parent
                .as_object_mut()
                .ok_or_else(|| OpError::NotAnObject(path_str(parent_path)))?;
            map.insert(key.clone(), value);
            Ok(())
        }
        PathSeg::Index(i) => {
            let arr = parent
                .as_array_mut()
                .ok_or_else(|| OpError::NotAnArray(path_str(parent_path)))?;
            let len = arr.len();
            if *i < len {
                arr[*i] = value;
            } else if *i == len {
                arr.push(value);
            } else {
                return Err(OpError::IndexOutOfBounds {
                    path: path_str(parent_path),
                    index: *i,
                    len,
                });
            }
            Ok(())
        }
    }
}

fn delete_at(parent: &mut Value, seg: &PathSeg) {
    match seg {
        PathSeg::Key(key) => {
            if let Some(map) = parent.as_object_mut() {
                map.remove(key);
            }
        }
        PathSeg::Index(i) => {
            if let Some(arr) = parent.as_array_mut() {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
        }
    }
}

fn path_str(path: &[PathSeg]) -> String {
    let mut out = String::from("$");
    for seg in path {
        match seg {
            PathSeg::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            PathSeg::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}
