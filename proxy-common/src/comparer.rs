//! Line and byte diff kernel for the comparer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Equal,
    Insert,
    Delete,
}

/// One contiguous run of the diff. `lines` holds the affected content from
/// the left side for deletions and equals, from the right side for inserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSpan {
    pub kind: DiffKind,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResult {
    pub spans: Vec<DiffSpan>,
    /// 2·matches / (len_a + len_b), 1.0 for identical inputs.
    pub similarity: f64,
    pub left_len: usize,
    pub right_len: usize,
}

/// Inputs larger than this are compared in truncated form. Keeps the
/// quadratic LCS table bounded.
const MAX_UNITS: usize = 10_000;

/// Line-oriented diff of two texts.
pub fn compare_text(left: &str, right: &str) -> CompareResult {
    let a: Vec<&str> = left.lines().take(MAX_UNITS).collect();
    let b: Vec<&str> = right.lines().take(MAX_UNITS).collect();
    diff_units(&a, &b, left.len(), right.len())
}

/// Byte diff rendered as 16-byte hex rows, then diffed row-wise.
pub fn compare_bytes(left: &[u8], right: &[u8]) -> CompareResult {
    let a = hex_rows(left);
    let b = hex_rows(right);
    let a_refs: Vec<&str> = a.iter().map(|s| s.as_str()).collect();
    let b_refs: Vec<&str> = b.iter().map(|s| s.as_str()).collect();
    diff_units(&a_refs, &b_refs, left.len(), right.len())
}

fn hex_rows(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .take(MAX_UNITS)
        .map(hex::encode)
        .collect()
}

fn diff_units(a: &[&str], b: &[&str], left_len: usize, right_len: usize) -> CompareResult {
    // Standard LCS dynamic program over the unit sequences.
    let n = a.len();
    let m = b.len();
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut spans: Vec<DiffSpan> = Vec::new();
    let mut matches = 0usize;
    let mut push = |kind: DiffKind, line: &str, spans: &mut Vec<DiffSpan>| {
        if let Some(last) = spans.last_mut() {
            if last.kind == kind {
                last.lines.push(line.to_string());
                return;
            }
        }
        spans.push(DiffSpan {
            kind,
            lines: vec![line.to_string()],
        });
    };

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            push(DiffKind::Equal, a[i], &mut spans);
            matches += 1;
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            push(DiffKind::Delete, a[i], &mut spans);
            i += 1;
        } else {
            push(DiffKind::Insert, b[j], &mut spans);
            j += 1;
        }
    }
    while i < n {
        push(DiffKind::Delete, a[i], &mut spans);
        i += 1;
    }
    while j < m {
        push(DiffKind::Insert, b[j], &mut spans);
        j += 1;
    }

    let similarity = if n + m == 0 {
        1.0
    } else {
        2.0 * matches as f64 / (n + m) as f64
    };

    CompareResult {
        spans,
        similarity,
        left_len,
        right_len,
    }
}
