use crate::sequence_diff::EditOp;
use filecomp_common::{FileCompError, Result, Side};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

/// One change region: `length[Left]` elements deleted at `position[Left]`,
/// `length[Right]` elements inserted at `position[Right]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Change {
    pub position: [usize; 2],
    pub length: [usize; 2],
}

impl Change {
    pub fn new(position: [usize; 2], length: [usize; 2]) -> Self {
        Self { position, length }
    }

    pub fn end(&self, side: Side) -> usize {
        self.position[side.index()] + self.length[side.index()]
    }

    pub fn len(&self, side: Side) -> usize {
        self.length[side.index()]
    }

    pub fn pos(&self, side: Side) -> usize {
        self.position[side.index()]
    }
}

/// Ordered list of changes; the gaps between them are the matched runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditScript {
    changes: Vec<Change>,
}

impl EditScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements deleted plus inserted
    pub fn cost(&self) -> usize {
        self.changes.iter().map(|c| c.length[0] + c.length[1]).sum()
    }

    pub fn into_inner(self) -> Vec<Change> {
        self.changes
    }

    /// Check that changes are ordered and every gap has the same length on
    /// both sides
    pub fn validate(&self, lens: [usize; 2]) -> Result<()> {
        let mut cursor = [0usize; 2];
        for change in &self.changes {
            if change.position[0] < cursor[0] || change.position[1] < cursor[1] {
                return Err(FileCompError::InternalInvariant(
                    "edit script positions go backwards".to_string(),
                ));
            }
            if change.position[0] - cursor[0] != change.position[1] - cursor[1] {
                return Err(FileCompError::InternalInvariant(
                    "edit script gap lengths differ".to_string(),
                ));
            }
            cursor = [change.end(Side::Left), change.end(Side::Right)];
        }
        if cursor[0] > lens[0]
            || cursor[1] > lens[1]
            || lens[0] - cursor[0] != lens[1] - cursor[1]
        {
            return Err(FileCompError::InternalInvariant(
                "edit script does not cover both sequences".to_string(),
            ));
        }
        Ok(())
    }
}

impl Deref for EditScript {
    type Target = [Change];

    fn deref(&self) -> &Self::Target {
        &self.changes
    }
}

impl From<Vec<Change>> for EditScript {
    fn from(changes: Vec<Change>) -> Self {
        Self { changes }
    }
}

/// Collects `SequenceDiffEngine` edits into an `EditScript`, coalescing a
/// delete directly followed by an insert into one `Change`
#[derive(Debug, Default)]
pub struct EditScriptBuilder {
    changes: Vec<Change>,
    cursor: [usize; 2],
}

impl EditScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: EditOp, off: usize, len: usize) {
        match op {
            EditOp::Match => {
                self.cursor[0] = off + len;
                self.cursor[1] += len;
            }
            EditOp::Delete => {
                self.cursor[0] = off;
                self.open_change().length[0] += len;
                self.cursor[0] = off + len;
            }
            EditOp::Insert => {
                self.cursor[1] = off;
                self.open_change().length[1] += len;
                self.cursor[1] = off + len;
            }
        }
    }

    fn open_change(&mut self) -> &mut Change {
        let cursor = self.cursor;
        let extends_last = matches!(
            self.changes.last(),
            Some(last) if last.end(Side::Left) == cursor[0] && last.end(Side::Right) == cursor[1]
        );
        if !extends_last {
            self.changes.push(Change::new(cursor, [0, 0]));
        }
        let last = self.changes.len() - 1;
        &mut self.changes[last]
    }

    pub fn finish(self) -> EditScript {
        EditScript {
            changes: self.changes,
        }
    }
}

/// Slide every change region as far back, then as far forward, as element
/// equality allows, merging regions that collide. Both sides are processed
/// independently over "changed" flag arrays; the edit distance is unchanged.
///
/// `same(side, i, j)` compares two elements of the same side.
pub fn shift_boundaries<F>(
    script: &EditScript,
    lens: [usize; 2],
    same: F,
    cancel: Option<&AtomicBool>,
) -> Result<EditScript>
where
    F: Fn(Side, usize, usize) -> bool,
{
    let mut changed = [Vec::new(), Vec::new()];
    for side in Side::BOTH {
        let flags = &mut changed[side.index()];
        flags.try_reserve_exact(lens[side.index()])?;
        flags.resize(lens[side.index()], false);
        for change in script.iter() {
            for flag in &mut flags[change.pos(side)..change.end(side)] {
                *flag = true;
            }
        }
    }

    for side in Side::BOTH {
        let flags = &mut changed[side.index()];
        let len = flags.len();
        let eq = |i: usize, j: usize| same(side, i, j);
        let mut i = 0;

        loop {
            while i < len && !flags[i] {
                i += 1;
            }
            if i == len {
                break;
            }
            let mut start = i;
            while i < len && flags[i] {
                i += 1;
            }

            loop {
                let run_length = i - start;

                while start > 0 && eq(start - 1, i - 1) {
                    start -= 1;
                    flags[start] = true;
                    i -= 1;
                    flags[i] = false;
                    while start > 0 && flags[start - 1] {
                        start -= 1;
                    }
                }

                while i < len && eq(start, i) {
                    flags[start] = false;
                    start += 1;
                    flags[i] = true;
                    i += 1;
                    while i < len && flags[i] {
                        i += 1;
                    }
                }

                if run_length == i - start {
                    break;
                }
            }

            if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                return Err(FileCompError::Cancelled);
            }
        }
    }

    rebuild_from_flags(&changed)
}

/// Read the flag arrays back into an append-only script: unchanged elements
/// are paired in order, each maximal changed stretch becomes one `Change`
fn rebuild_from_flags(changed: &[Vec<bool>; 2]) -> Result<EditScript> {
    let lens = [changed[0].len(), changed[1].len()];
    let mut changes = Vec::new();
    let mut a = 0;
    let mut b = 0;

    while a < lens[0] || b < lens[1] {
        if a < lens[0] && b < lens[1] && !changed[0][a] && !changed[1][b] {
            a += 1;
            b += 1;
            continue;
        }

        let position = [a, b];
        while a < lens[0] && changed[0][a] {
            a += 1;
        }
        while b < lens[1] && changed[1][b] {
            b += 1;
        }
        if position == [a, b] {
            return Err(FileCompError::InternalInvariant(
                "unchanged element counts differ after boundary shift".to_string(),
            ));
        }
        changes.push(Change::new(position, [a - position[0], b - position[1]]));
    }

    Ok(EditScript { changes })
}

/// Element of a character stream that knows where it came from
pub trait SourceToken {
    /// Code-unit offset of the token in the decoded buffer
    fn offset(&self) -> usize;
    fn is_line_break(&self) -> bool;
}

/// Merge changes separated by a single matching token that covers exactly
/// one source code unit on both sides and is not a line break. The number of
/// changes never increases.
pub fn remove_single_char_matches<T: SourceToken>(
    script: EditScript,
    tokens: [&[T]; 2],
) -> EditScript {
    let mut changes = script.changes.into_iter().peekable();
    let mut out = Vec::new();

    while let Some(mut curr) = changes.next() {
        while let Some(next) = changes.peek() {
            let single = Side::BOTH.iter().all(|&side| {
                let s = side.index();
                let gap = curr.end(side);
                next.position[s] < tokens[s].len()
                    && tokens[s][next.position[s]].offset() == tokens[s][gap].offset() + 1
                    && !tokens[s][gap].is_line_break()
            });
            if !single {
                break;
            }
            curr.length[0] = next.end(Side::Left) - curr.position[0];
            curr.length[1] = next.end(Side::Right) - curr.position[1];
            changes.next();
        }
        out.push(curr);
    }

    EditScript { changes: out }
}
