//! LiveView diff engine.

use serde::Serialize;

/// One line-oriented patch operation, applied in order against the previous
/// render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Replace everything; used when the client has no baseline yet.
    Replace { html: String },
    Keep { lines: usize },
    Remove { lines: usize },
    Insert { html: String },
}

/// Compute the patch turning `old` into `new`. Identical output yields an
/// empty patch.
pub fn compute_patch(old: Option<&str>, new: &str) -> Vec<PatchOp> {
    let Some(old) = old else {
        return vec![PatchOp::Replace {
            html: new.to_string(),
        }];
    };
    if old == new {
        return Vec::new();
    }

    let mut ops: Vec<PatchOp> = Vec::new();
    for change in diff::lines(old, new) {
        match change {
            diff::Result::Both(_, _) => match ops.last_mut() {
                Some(PatchOp::Keep { lines }) => *lines += 1,
                _ => ops.push(PatchOp::Keep { lines: 1 }),
            },
            diff::Result::Left(_) => match ops.last_mut() {
                Some(PatchOp::Remove { lines }) => *lines += 1,
                _ => ops.push(PatchOp::Remove { lines: 1 }),
            },
            diff::Result::Right(line) => match ops.last_mut() {
                Some(PatchOp::Insert { html }) => {
                    html.push('\n');
                    html.push_str(line);
                }
                _ => ops.push(PatchOp::Insert {
                    html: line.to_string(),
                }),
            },
        }
    }

    // A trailing keep carries no information for the client.
    if matches!(ops.last(), Some(PatchOp::Keep { .. })) {
        ops.pop();
    }
    if ops.is_empty() {
        // Only line terminators differ; fall back to a full replacement.
        ops.push(PatchOp::Replace {
            html: new.to_string(),
        });
    }
    ops
}
