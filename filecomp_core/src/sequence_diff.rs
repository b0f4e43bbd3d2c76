use filecomp_common::{FileCompError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Operation reported to the edit callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditOp {
    /// `len` elements of the first sequence starting at `off` are kept
    Match,
    /// `len` elements of the first sequence starting at `off` are removed
    Delete,
    /// `len` elements of the second sequence starting at `off` are inserted
    Insert,
}

/// Result of a diff run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditDistance {
    Exact(usize),
    /// The distance reached the configured bound; the reported edits are
    /// incomplete and must be discarded.
    Exceeded,
}

impl EditDistance {
    pub fn is_zero(self) -> bool {
        self == EditDistance::Exact(0)
    }
}

/// Frontier vectors shared by every diff run of one engine
#[derive(Debug, Default)]
pub struct DiffScratch {
    buf: Vec<isize>,
}

impl DiffScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// Shortest-edit-script engine over index-addressed sequences.
///
/// Myers' O(ND) search, split at the middle snake where the forward and
/// reverse frontiers meet (E. Myers, "An O(ND) Difference Algorithm and Its
/// Variations", Algorithmica 1, 2 (1986)).
#[derive(Debug)]
pub struct SequenceDiffEngine {
    scratch: DiffScratch,
    max_distance: usize,
}

impl SequenceDiffEngine {
    pub fn new() -> Self {
        Self {
            scratch: DiffScratch::new(),
            max_distance: usize::MAX,
        }
    }

    /// Give up once the edit distance reaches `max_distance`
    pub fn set_max_distance(&mut self, max_distance: usize) {
        self.max_distance = max_distance.max(1);
    }

    /// Compute the shortest edit script turning `0..n` into `0..m`.
    ///
    /// `equal(i, j)` tells whether element `i` of the first sequence equals
    /// element `j` of the second. Edits are reported from left to right;
    /// zero-length edits are never reported.
    pub fn diff<E, F>(
        &mut self,
        n: usize,
        m: usize,
        mut equal: E,
        mut on_edit: F,
        cancel: Option<&AtomicBool>,
    ) -> Result<EditDistance>
    where
        E: FnMut(usize, usize) -> bool,
        F: FnMut(EditOp, usize, usize),
    {
        let mut p = 0;
        while p < n && p < m && equal(p, p) {
            p += 1;
        }
        if p > 0 {
            on_edit(EditOp::Match, 0, p);
        }

        let mut s = 0;
        while s < n - p && s < m - p && equal(n - s - 1, m - s - 1) {
            s += 1;
        }

        let tn = n - p - s;
        let tm = m - p - s;
        let distance = if tn + tm > 0 {
            let vsize = tn + tm + 3;
            let buf = &mut self.scratch.buf;
            buf.clear();
            buf.try_reserve(2 * vsize)?;
            buf.resize(2 * vsize, 0);

            let mut myers = Myers {
                equal: &mut equal,
                edit: &mut on_edit,
                buf,
                fbase: tm as isize + 1,
                rbase: (vsize + tm + 1) as isize,
                max_distance: self.max_distance,
                cancel,
            };
            myers.solve(p, tn, p, tm)?
        } else {
            EditDistance::Exact(0)
        };

        if distance == EditDistance::Exceeded {
            return Ok(distance);
        }

        if s > 0 {
            on_edit(EditOp::Match, n - s, s);
        }
        Ok(distance)
    }

    /// Edit script of two slices
    pub fn diff_slices<T: PartialEq>(
        &mut self,
        a: &[T],
        b: &[T],
        cancel: Option<&AtomicBool>,
    ) -> Result<(EditDistance, crate::edit_script::EditScript)> {
        let mut builder = crate::edit_script::EditScriptBuilder::new();
        let distance = self.diff(
            a.len(),
            b.len(),
            |i, j| a[i] == b[j],
            |op, off, len| builder.push(op, off, len),
            cancel,
        )?;
        Ok((distance, builder.finish()))
    }
}

impl Default for SequenceDiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MiddleSnake {
    x: isize,
    y: isize,
    u: isize,
    v: isize,
}

enum Task {
    Solve {
        aoff: usize,
        n: usize,
        boff: usize,
        m: usize,
    },
    Match {
        off: usize,
        len: usize,
    },
}

struct Myers<'a, E, F> {
    equal: &'a mut E,
    edit: &'a mut F,
    buf: &'a mut Vec<isize>,
    fbase: isize,
    rbase: isize,
    max_distance: usize,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, E, F> Myers<'a, E, F>
where
    E: FnMut(usize, usize) -> bool,
    F: FnMut(EditOp, usize, usize),
{
    fn fv(&self, k: isize) -> isize {
        self.buf[(self.fbase + k) as usize]
    }

    fn set_fv(&mut self, k: isize, val: isize) {
        self.buf[(self.fbase + k) as usize] = val;
    }

    fn rv(&self, k: isize) -> isize {
        self.buf[(self.rbase + k) as usize]
    }

    fn set_rv(&mut self, k: isize, val: isize) {
        self.buf[(self.rbase + k) as usize] = val;
    }

    fn emit(&mut self, op: EditOp, off: usize, len: usize) {
        if len > 0 {
            (self.edit)(op, off, len);
        }
    }

    /// Solve the trimmed problem. Sub-problems are kept on an explicit stack
    /// in reverse emission order so edits still come out left to right.
    fn solve(&mut self, aoff: usize, n: usize, boff: usize, m: usize) -> Result<EditDistance> {
        let mut stack = vec![Task::Solve { aoff, n, boff, m }];
        let mut total = None;

        while let Some(task) = stack.pop() {
            match task {
                Task::Match { off, len } => self.emit(EditOp::Match, off, len),
                Task::Solve { aoff, n, boff, m } => {
                    let d = if n == 0 {
                        if total.is_none() && m >= self.max_distance {
                            return Ok(EditDistance::Exceeded);
                        }
                        self.emit(EditOp::Insert, boff, m);
                        m
                    } else if m == 0 {
                        if total.is_none() && n >= self.max_distance {
                            return Ok(EditDistance::Exceeded);
                        }
                        self.emit(EditOp::Delete, aoff, n);
                        n
                    } else {
                        let (d, ms) = match self.find_middle_snake(aoff, n, boff, m)? {
                            Some(found) => found,
                            None => return Ok(EditDistance::Exceeded),
                        };
                        let (x, y, u, v) = (ms.x as usize, ms.y as usize, ms.u as usize, ms.v as usize);
                        stack.push(Task::Solve {
                            aoff: aoff + u,
                            n: n - u,
                            boff: boff + v,
                            m: m - v,
                        });
                        stack.push(Task::Match {
                            off: aoff + x,
                            len: u - x,
                        });
                        stack.push(Task::Solve {
                            aoff,
                            n: x,
                            boff,
                            m: y,
                        });
                        d
                    };
                    total.get_or_insert(d);
                }
            }
        }

        Ok(EditDistance::Exact(total.unwrap_or(0)))
    }

    /// Returns the edit distance of the sub-problem and its middle snake, or
    /// `None` when the distance bound is reached.
    fn find_middle_snake(
        &mut self,
        aoff: usize,
        n: usize,
        boff: usize,
        m: usize,
    ) -> Result<Option<(usize, MiddleSnake)>> {
        let n = n as isize;
        let m = m as isize;
        // center diagonal of the reverse search
        let delta = n - m;
        let odd = delta & 1;
        let mid = (n + m) / 2 + odd;
        // valid diagonal limits of both searches
        let mut fkmin = -m;
        let mut rkmin = -m;
        let mut fkmax = n;
        let mut rkmax = n;
        let fkminmax = (delta - mid).max(fkmin);
        let fkmaxmin = (delta + mid).min(fkmax);
        let rkminmax = (-mid).max(rkmin);
        let rkmaxmin = mid.min(rkmax);
        // actual limits of both searches
        let mut fmin = 0;
        let mut fmax = 0;
        let mut rmin = delta;
        let mut rmax = delta;
        let mut ms = MiddleSnake::default();

        self.set_fv(0, 0);
        self.set_rv(delta, n);

        let mut d: isize = 1;
        loop {
            if (2 * d - 1) as usize >= self.max_distance {
                return Ok(None);
            }

            if self.cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                return Err(FileCompError::Cancelled);
            }

            // forward search, out of bound diagonals read as -1
            if fmin > fkmin {
                fmin -= 1;
                self.set_fv(fmin - 1, -1);
            } else if fkmin <= fkminmax {
                fmin += 1;
                fkmin += 1;
            } else {
                fmin -= 1;
                fkmin -= 1;
            }
            if fmax < fkmax {
                fmax += 1;
                self.set_fv(fmax + 1, -1);
            } else if fkmax >= fkmaxmin {
                fmax -= 1;
                fkmax -= 1;
            } else {
                fmax += 1;
                fkmax += 1;
            }

            let mut k = fmax;
            while k >= fmin {
                let xlo = self.fv(k - 1);
                let xhi = self.fv(k + 1);
                let mut x = if xlo < xhi { xhi } else { xlo + 1 };
                let mut y = x - k;
                ms.x = x;

                while x < n && y < m && (self.equal)(aoff + x as usize, boff + y as usize) {
                    x += 1;
                    y += 1;
                }
                self.set_fv(k, x);

                if odd != 0 && k >= rmin && k <= rmax && x >= self.rv(k) {
                    ms.y = ms.x - k;
                    ms.u = x;
                    ms.v = y;
                    return Ok(Some(((2 * d - 1) as usize, ms)));
                }
                k -= 2;
            }

            // reverse search, out of bound diagonals read as +inf
            if rmin > rkmin {
                rmin -= 1;
                self.set_rv(rmin - 1, isize::MAX);
            } else if rkmin <= rkminmax {
                rmin += 1;
                rkmin += 1;
            } else {
                rmin -= 1;
                rkmin -= 1;
            }
            if rmax < rkmax {
                rmax += 1;
                self.set_rv(rmax + 1, isize::MAX);
            } else if rkmax >= rkmaxmin {
                rmax -= 1;
                rkmax -= 1;
            } else {
                rmax += 1;
                rkmax += 1;
            }

            let mut k = rmax;
            while k >= rmin {
                let xlo = self.rv(k - 1);
                let xhi = self.rv(k + 1);
                let mut x = if xlo < xhi { xlo } else { xhi - 1 };
                let mut y = x - k;
                ms.u = x;

                while x > 0 && y > 0 && (self.equal)(aoff + (x - 1) as usize, boff + (y - 1) as usize) {
                    x -= 1;
                    y -= 1;
                }
                self.set_rv(k, x);

                if odd == 0 && k >= fmin && k <= fmax && x <= self.fv(k) {
                    ms.v = ms.u - k;
                    ms.x = x;
                    ms.y = y;
                    return Ok(Some(((2 * d) as usize, ms)));
                }
                k -= 2;
            }

            d += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn edits(a: &[u8], b: &[u8]) -> (EditDistance, Vec<(EditOp, usize, usize)>) {
        let mut engine = SequenceDiffEngine::new();
        let mut ops = Vec::new();
        let d = engine
            .diff(a.len(), b.len(), |i, j| a[i] == b[j], |op, off, len| ops.push((op, off, len)), None)
            .unwrap();
        (d, ops)
    }

    fn apply(a: &[u8], b: &[u8], ops: &[(EditOp, usize, usize)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(op, off, len) in ops {
            match op {
                EditOp::Match => out.extend_from_slice(&a[off..off + len]),
                EditOp::Delete => {}
                EditOp::Insert => out.extend_from_slice(&b[off..off + len]),
            }
        }
        out
    }

    fn cost(ops: &[(EditOp, usize, usize)]) -> usize {
        ops.iter()
            .filter(|(op, _, _)| *op != EditOp::Match)
            .map(|(_, _, len)| len)
            .sum()
    }

    #[test]
    fn test_classic_example() {
        let (d, ops) = edits(b"ABCABBA", b"CBABAC");
        assert_eq!(d, EditDistance::Exact(5));
        assert_eq!(cost(&ops), 5);
        assert_eq!(apply(b"ABCABBA", b"CBABAC", &ops), b"CBABAC");
    }

    #[test]
    fn test_empty_sides() {
        let (d, ops) = edits(b"", b"abc");
        assert_eq!(d, EditDistance::Exact(3));
        assert_eq!(ops, vec![(EditOp::Insert, 0, 3)]);

        let (d, ops) = edits(b"abc", b"");
        assert_eq!(d, EditDistance::Exact(3));
        assert_eq!(ops, vec![(EditOp::Delete, 0, 3)]);

        let (d, ops) = edits(b"", b"");
        assert_eq!(d, EditDistance::Exact(0));
        assert!(ops.is_empty());
    }

    #[test]
    fn test_prefix_and_suffix_are_matches() {
        let (d, ops) = edits(b"abXcd", b"abcd");
        assert_eq!(d, EditDistance::Exact(1));
        assert_eq!(
            ops,
            vec![(EditOp::Match, 0, 2), (EditOp::Delete, 2, 1), (EditOp::Match, 3, 2)]
        );
    }

    #[test]
    fn test_max_distance_exceeded() {
        let mut engine = SequenceDiffEngine::new();
        engine.set_max_distance(1);
        let a = b"abc";
        let b = b"abd";
        let d = engine
            .diff(a.len(), b.len(), |i, j| a[i] == b[j], |_, _, _| {}, None)
            .unwrap();
        assert_eq!(d, EditDistance::Exceeded);

        let d = engine
            .diff(a.len(), a.len(), |i, j| a[i] == a[j], |_, _, _| {}, None)
            .unwrap();
        assert_eq!(d, EditDistance::Exact(0));
    }

    #[test]
    fn test_cancel_stops_search() {
        let cancel = AtomicBool::new(true);
        let mut engine = SequenceDiffEngine::new();
        let a = b"abcdef";
        let b = b"fedcba";
        let result = engine.diff(a.len(), b.len(), |i, j| a[i] == b[j], |_, _, _| {}, Some(&cancel));
        assert!(matches!(result, Err(FileCompError::Cancelled)));
    }

    #[test]
    fn test_scratch_is_reused() {
        let mut engine = SequenceDiffEngine::new();
        let a: Vec<u32> = (0..200).collect();
        let b: Vec<u32> = (0..200).rev().collect();
        engine.diff_slices(&a, &b, None).unwrap();
        let capacity = engine.scratch.capacity();
        engine.diff_slices(&a[..100], &b[..100], None).unwrap();
        assert_eq!(engine.scratch.capacity(), capacity);
    }

    proptest! {
        #[test]
        fn prop_script_reproduces_second_sequence(
            a in proptest::collection::vec(0u8..4, 0..60),
            b in proptest::collection::vec(0u8..4, 0..60),
        ) {
            let (d, ops) = edits(&a, &b);
            prop_assert_eq!(apply(&a, &b, &ops), b.clone());
            prop_assert_eq!(d, EditDistance::Exact(cost(&ops)));
        }

        #[test]
        fn prop_offsets_are_left_to_right(
            a in proptest::collection::vec(0u8..3, 0..50),
            b in proptest::collection::vec(0u8..3, 0..50),
        ) {
            let (_, ops) = edits(&a, &b);
            let mut pos_a = 0;
            let mut pos_b = 0;
            for (op, off, len) in ops {
                prop_assert!(len > 0);
                match op {
                    EditOp::Match => {
                        prop_assert_eq!(off, pos_a);
                        pos_a += len;
                        pos_b += len;
                    }
                    EditOp::Delete => {
                        prop_assert_eq!(off, pos_a);
                        pos_a += len;
                    }
                    EditOp::Insert => {
                        prop_assert_eq!(off, pos_b);
                        pos_b += len;
                    }
                }
            }
            prop_assert_eq!(pos_a, a.len());
            prop_assert_eq!(pos_b, b.len());
        }

        #[test]
        fn prop_identity_has_no_edits(a in proptest::collection::vec(any::<u8>(), 0..80)) {
            let (d, ops) = edits(&a, &a);
            prop_assert_eq!(d, EditDistance::Exact(0));
            prop_assert!(ops.iter().all(|(op, _, _)| *op == EditOp::Match));
        }

        #[test]
        fn prop_cost_is_symmetric(
            a in proptest::collection::vec(0u8..4, 0..50),
            b in proptest::collection::vec(0u8..4, 0..50),
        ) {
            let (ab, _) = edits(&a, &b);
            let (ba, _) = edits(&b, &a);
            prop_assert_eq!(ab, ba);
        }
    }
}
