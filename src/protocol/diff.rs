//! Row-level snapshot differ and its inverse. A diff is only valid against a
//! snapshot of identical dimensions; anything else forces a full snapshot.

use super::{Diff, DiffRow, Snapshot};

/// What the publisher should put on the wire for a new snapshot.
#[derive(Clone, Debug, PartialEq)]
pub enum DiffOutcome {
    /// No prior snapshot or the dimensions changed: send `next` in full.
    FullSnapshot,
    /// Send only the changed rows (metadata always included).
    Rows(Diff),
    /// Nothing changed at all: send no frame.
    Unchanged,
}

pub fn diff_snapshots(prev: Option<&Snapshot>, next: &Snapshot) -> DiffOutcome {
    let prev = match prev {
        Some(prev) if prev.cols == next.cols && prev.rows == next.rows => prev,
        _ => return DiffOutcome::FullSnapshot,
    };

    let cols = next.cols;
    let mut changed = Vec::new();
    for y in 0..next.rows {
        if row_changed(prev, next, y) {
            let start = y * cols;
            let end = start + cols;
            changed.push(DiffRow {
                y,
                runes: next.runes[start..end].to_vec(),
                modes: next.modes[start..end].to_vec(),
                fg: next.fg[start..end].to_vec(),
                bg: next.bg[start..end].to_vec(),
            });
        }
    }

    let meta_changed = prev.cursor != next.cursor
        || prev.cursor_visible != next.cursor_visible
        || prev.mode != next.mode
        || prev.title != next.title;

    if changed.is_empty() && !meta_changed {
        return DiffOutcome::Unchanged;
    }

    DiffOutcome::Rows(Diff {
        cols,
        rows: next.rows,
        changed,
        cursor: next.cursor,
        cursor_visible: next.cursor_visible,
        mode: next.mode,
        title: next.title.clone(),
    })
}

fn row_changed(prev: &Snapshot, next: &Snapshot, y: usize) -> bool {
    let start = y * next.cols;
    let end = start + next.cols;
    prev.runes[start..end] != next.runes[start..end]
        || prev.modes[start..end] != next.modes[start..end]
        || prev.fg[start..end] != next.fg[start..end]
        || prev.bg[start..end] != next.bg[start..end]
}

/// Apply a diff over `current`, replacing it when dimensions disagree. A diff
/// arriving with no baseline is applied over a blank grid of its own size.
pub fn apply_diff(current: Option<Snapshot>, diff: &Diff) -> Snapshot {
    let mut snap = match current {
        Some(snap) if snap.cols == diff.cols && snap.rows == diff.rows => snap,
        _ => Snapshot::blank(diff.cols, diff.rows),
    };

    let cols = snap.cols;
    for row in &diff.changed {
        if row.y >= snap.rows {
            continue;
        }
        let start = row.y * cols;
        for x in 0..cols {
            if let Some(&r) = row.runes.get(x) {
                snap.runes[start + x] = r;
            }
            if let Some(&m) = row.modes.get(x) {
                snap.modes[start + x] = m;
            }
            if let Some(&fg) = row.fg.get(x) {
                snap.fg[start + x] = fg;
            }
            if let Some(&bg) = row.bg.get(x) {
                snap.bg[start + x] = bg;
            }
        }
    }
    snap.cursor = diff.cursor;
    snap.cursor_visible = diff.cursor_visible;
    snap.mode = diff.mode;
    snap.title = diff.title.clone();
    snap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Cursor;

    fn sample(cols: usize, rows: usize, fill: char) -> Snapshot {
        let mut snap = Snapshot::blank(cols, rows);
        for r in snap.runes.iter_mut() {
            *r = fill as u32;
        }
        snap
    }

    #[test]
    fn identical_snapshots_emit_nothing() {
        let a = sample(4, 3, 'a');
        assert_eq!(diff_snapshots(Some(&a), &a.clone()), DiffOutcome::Unchanged);
    }

    #[test]
    fn missing_prev_forces_snapshot() {
        let next = sample(4, 3, 'a');
        assert_eq!(diff_snapshots(None, &next), DiffOutcome::FullSnapshot);
    }

    #[test]
    fn dimension_change_forces_snapshot() {
        let prev = sample(4, 3, 'a');
        let next = sample(5, 3, 'a');
        assert_eq!(diff_snapshots(Some(&prev), &next), DiffOutcome::FullSnapshot);
    }

    #[test]
    fn only_changed_rows_are_emitted() {
        let prev = sample(4, 3, 'a');
        let mut next = prev.clone();
        next.runes[4] = 'b' as u32;
        match diff_snapshots(Some(&prev), &next) {
            DiffOutcome::Rows(diff) => {
                assert_eq!(diff.changed.len(), 1);
                assert_eq!(diff.changed[0].y, 1);
                assert_eq!(diff.changed[0].runes.len(), 4);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn metadata_only_change_still_emits() {
        let prev = sample(4, 3, 'a');
        let mut next = prev.clone();
        next.cursor = Cursor { x: 1, y: 1 };
        match diff_snapshots(Some(&prev), &next) {
            DiffOutcome::Rows(diff) => {
                assert!(diff.changed.is_empty());
                assert_eq!(diff.cursor, next.cursor);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn attribute_change_marks_row() {
        let prev = sample(2, 2, 'a');
        let mut next = prev.clone();
        next.fg[3] = crate::term::Color::indexed256(42).raw();
        match diff_snapshots(Some(&prev), &next) {
            DiffOutcome::Rows(diff) => assert_eq!(diff.changed[0].y, 1),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn apply_round_trips() {
        let a = sample(5, 4, 'a');
        let mut b = a.clone();
        b.runes[7] = 'x' as u32;
        b.modes[7] = crate::term::MODE_BOLD;
        b.cursor = Cursor { x: 2, y: 1 };
        b.title = "t".into();
        match diff_snapshots(Some(&a), &b) {
            DiffOutcome::Rows(diff) => {
                let applied = apply_diff(Some(a), &diff);
                assert_eq!(applied, b);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn apply_without_baseline_uses_blank_grid() {
        let diff = Diff {
            cols: 2,
            rows: 2,
            changed: vec![DiffRow {
                y: 0,
                runes: vec!['h' as u32, 'i' as u32],
                modes: vec![0, 0],
                fg: vec![0, 0],
                bg: vec![0, 0],
            }],
            cursor: Cursor { x: 0, y: 1 },
            cursor_visible: true,
            mode: 0,
            title: String::new(),
        };
        let snap = apply_diff(None, &diff);
        assert_eq!(snap.rune_at(0, 0), 'h');
        assert_eq!(snap.rune_at(1, 1), ' ');
    }
}
