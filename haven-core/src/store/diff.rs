//! Line diff between two canonical document serializations.
//!
//! Only used to show an operator what an upload will change. Lines are
//! matched by longest common subsequence; a removed line immediately
//! followed by an added line is reported as a single change, so editing one
//! field yields exactly one record.

/// One line-level difference, with 1-based line numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineChange {
    /// Present only in the old text
    Removed { line: usize, text: String },

    /// Present only in the new text
    Added { line: usize, text: String },

    /// Replaced in place
    Changed { old_line: usize, new_line: usize, from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

fn edit_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let (n, m) = (old.len(), new.len());

    // lcs[i][j] = length of the LCS of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal { old: i, new: j });
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Op::Delete { old: i });
            i += 1;
        } else {
            ops.push(Op::Insert { new: j });
            j += 1;
        }
    }
    ops.extend((i..n).map(|old| Op::Delete { old }));
    ops.extend((j..m).map(|new| Op::Insert { new }));
    ops
}

/// Ordered change records turning `old` into `new`. Empty when equal.
pub fn line_changes(old: &str, new: &str) -> Vec<LineChange> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    let mut changes = Vec::new();
    let mut deleted: Vec<usize> = Vec::new();
    let mut inserted: Vec<usize> = Vec::new();

    let flush = |deleted: &mut Vec<usize>, inserted: &mut Vec<usize>, changes: &mut Vec<LineChange>| {
        let paired = deleted.len().min(inserted.len());
        for (&o, &n) in deleted.iter().zip(inserted.iter()) {
            changes.push(LineChange::Changed {
                old_line: o + 1,
                new_line: n + 1,
                from: old_lines[o].to_string(),
                to: new_lines[n].to_string(),
            });
        }
        for &o in &deleted[paired..] {
            changes.push(LineChange::Removed { line: o + 1, text: old_lines[o].to_string() });
        }
        for &n in &inserted[paired..] {
            changes.push(LineChange::Added { line: n + 1, text: new_lines[n].to_string() });
        }
        deleted.clear();
        inserted.clear();
    };

    for op in ops {
        match op {
            Op::Equal { .. } => flush(&mut deleted, &mut inserted, &mut changes),
            Op::Delete { old } => deleted.push(old),
            Op::Insert { new } => inserted.push(new),
        }
    }
    flush(&mut deleted, &mut inserted, &mut changes);

    changes
}

/// Render a unified diff with `context` lines around each hunk.
///
/// Returns an empty string when the texts are equal line for line.
pub fn unified_diff(old: &str, new: &str, old_label: &str, new_label: &str, context: usize) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal { .. }))
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return String::new();
    }

    // Lines consumed from each side before op i
    let mut consumed = Vec::with_capacity(ops.len());
    let (mut a, mut b) = (0usize, 0usize);
    for op in &ops {
        consumed.push((a, b));
        match op {
            Op::Equal { .. } => {
                a += 1;
                b += 1;
            }
            Op::Delete { .. } => a += 1,
            Op::Insert { .. } => b += 1,
        }
    }

    // Group changes whose context windows touch
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &idx in &changed {
        match groups.last_mut() {
            Some((_, last)) if idx - *last <= 2 * context => *last = idx,
            _ => groups.push((idx, idx)),
        }
    }

    let mut out = format!("--- {}\n+++ {}\n", old_label, new_label);
    for (first, last) in groups {
        let lo = first.saturating_sub(context);
        let hi = (last + context).min(ops.len() - 1);
        let hunk = &ops[lo..=hi];

        let old_count = hunk.iter().filter(|op| !matches!(op, Op::Insert { .. })).count();
        let new_count = hunk.iter().filter(|op| !matches!(op, Op::Delete { .. })).count();
        let (a0, b0) = consumed[lo];
        let old_start = if old_count == 0 { a0 } else { a0 + 1 };
        let new_start = if new_count == 0 { b0 } else { b0 + 1 };

        out.push_str(&format!("@@ -{},{} +{},{} @@\n", old_start, old_count, new_start, new_count));
        for op in hunk {
            match *op {
                Op::Equal { old, .. } => out.push_str(&format!(" {}\n", old_lines[old])),
                Op::Delete { old } => out.push_str(&format!("-{}\n", old_lines[old])),
                Op::Insert { new } => out.push_str(&format!("+{}\n", new_lines[new])),
            }
        }
    }
    out
}
