use crate::edit_script::{remove_single_char_matches, shift_boundaries, EditScript, EditScriptBuilder, SourceToken};
use crate::line_classifier::{is_space, tokenize, CharToken, LineClassifier, TextFilter};
use crate::sequence_diff::{EditDistance, SequenceDiffEngine};
use filecomp_common::{CompareOptions, FileCompError, LineScript, LineSpec, Result, Side, TextFileModel};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

pub struct LineScriptBuilder {
    filter: TextFilter,
    detailed: bool,
    engine: SequenceDiffEngine,
    tokens: [Vec<CharToken>; 2],
}

impl LineScriptBuilder {
    /// `options` are expected to be normalized
    pub fn new(options: &CompareOptions) -> Self {
        Self {
            filter: TextFilter::from_options(options),
            detailed: options.detailed_differences,
            engine: SequenceDiffEngine::new(),
            tokens: [Vec::new(), Vec::new()],
        }
    }

    /// Build row-aligned scripts for both files, or `None` when the files
    /// are equal under the active options
    pub fn build(&mut self, files: [&TextFileModel; 2], cancel: Option<&AtomicBool>) -> Result<Option<[LineScript; 2]>> {
        let counts = [files[0].line_count(), files[1].line_count()];

        let rows = if self.filter.ignore_line_breaks {
            self.strict_compare(files, [0, 0], counts, false, cancel)?
        } else {
            self.compare_lines(files, cancel)?
        };

        Ok(rows.map(|[left, right]| [LineScript::from(left), LineScript::from(right)]))
    }

    /// Whether the files differ at all under the active options. The diff
    /// stops at the first edit, so no script is built.
    pub fn differs(&mut self, files: [&TextFileModel; 2], cancel: Option<&AtomicBool>) -> Result<bool> {
        self.engine.set_max_distance(1);
        let result = self.any_difference(files, cancel);
        self.engine.set_max_distance(usize::MAX);
        result
    }

    fn any_difference(&mut self, files: [&TextFileModel; 2], cancel: Option<&AtomicBool>) -> Result<bool> {
        let distance = if self.filter.ignore_line_breaks {
            let mut tokens = std::mem::take(&mut self.tokens);
            for side in Side::BOTH {
                let s = side.index();
                tokenize(files[s], 0, files[s].line_count(), &self.filter, cancel, &mut tokens[s])?;
            }
            let distance = self.engine.diff(
                tokens[0].len(),
                tokens[1].len(),
                |i, j| tokens[0][i].value == tokens[1][j].value,
                |_, _, _| {},
                cancel,
            );
            self.tokens = tokens;
            distance?
        } else {
            let ids = LineClassifier::new(&self.filter).classify(files, cancel)?;
            self.engine
                .diff(ids[0].len(), ids[1].len(), |i, j| ids[0][i] == ids[1][j], |_, _, _| {}, cancel)?
        };
        Ok(!distance.is_zero())
    }

    fn compare_lines(
        &mut self,
        files: [&TextFileModel; 2],
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<[Vec<LineSpec>; 2]>> {
        let ids = LineClassifier::new(&self.filter).classify(files, cancel)?;
        let lens = [ids[0].len(), ids[1].len()];

        let script = run_diff(&mut self.engine, lens, |i, j| ids[0][i] == ids[1][j], cancel)?;
        if script.is_empty() {
            return Ok(None);
        }
        let script = shift_boundaries(
            &script,
            lens,
            |side, i, j| ids[side.index()][i] == ids[side.index()][j],
            cancel,
        )?;
        debug!("Line diff: {} change blocks, cost {}", script.len(), script.cost());

        let mut rows = [Vec::new(), Vec::new()];
        let mut cursor = [0usize; 2];
        for change in script.iter() {
            push_common(&mut rows, cursor, change.pos(Side::Left) - cursor[0]);

            if self.detailed && change.len(Side::Left) > 0 && change.len(Side::Right) > 0 {
                if let Some([left, right]) =
                    self.strict_compare(files, change.position, change.length, true, cancel)?
                {
                    rows[0].extend(left);
                    rows[1].extend(right);
                } else {
                    // equal as character streams, e.g. a line split differently
                    for side in Side::BOTH {
                        let s = side.index();
                        rows[s].extend((change.position[s]..change.end(side)).map(|l| LineSpec::change_with_ranges(l, Vec::new())));
                    }
                }
            } else {
                for side in Side::BOTH {
                    let s = side.index();
                    rows[s].extend((change.position[s]..change.end(side)).map(LineSpec::change));
                }
            }
            pad_rows(&mut rows);
            cursor = [change.end(Side::Left), change.end(Side::Right)];

            if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                return Err(FileCompError::Cancelled);
            }
        }
        push_common(&mut rows, cursor, lens[0] - cursor[0]);

        Ok(Some(rows))
    }

    /// Character-level comparison of lines `first[s]..first[s] + count[s]`.
    ///
    /// Lines untouched by any change are `Common`, or part of the change
    /// with an empty range list when `inside_block` is set. Returns `None`
    /// when the two character streams are equal.
    fn strict_compare(
        &mut self,
        files: [&TextFileModel; 2],
        first: [usize; 2],
        count: [usize; 2],
        inside_block: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<[Vec<LineSpec>; 2]>> {
        let mut tokens = std::mem::take(&mut self.tokens);
        let result = self.strict_compare_with(&mut tokens, files, first, count, inside_block, cancel);
        self.tokens = tokens;
        result
    }

    fn strict_compare_with(
        &mut self,
        tokens: &mut [Vec<CharToken>; 2],
        files: [&TextFileModel; 2],
        first: [usize; 2],
        count: [usize; 2],
        inside_block: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<[Vec<LineSpec>; 2]>> {
        for side in Side::BOTH {
            let s = side.index();
            tokenize(files[s], first[s], count[s], &self.filter, cancel, &mut tokens[s])?;
        }
        let tokens: [&[CharToken]; 2] = [&tokens[0], &tokens[1]];
        let lens = [tokens[0].len(), tokens[1].len()];

        let script = run_diff(
            &mut self.engine,
            lens,
            |i, j| tokens[0][i].value == tokens[1][j].value,
            cancel,
        )?;
        if script.is_empty() {
            return Ok(None);
        }
        let script = shift_boundaries(
            &script,
            lens,
            |side, i, j| tokens[side.index()][i].value == tokens[side.index()][j].value,
            cancel,
        )?;
        let script = remove_single_char_matches(script, tokens);
        trace!("Strict diff: {} changes over {:?} tokens", script.len(), lens);

        let marks = [
            LineMarks::collect(files[0], Side::Left, first[0], count[0], tokens[0], &script),
            LineMarks::collect(files[1], Side::Right, first[1], count[1], tokens[1], &script),
        ];
        let boundaries = sync_boundaries(tokens, &script, first, count);

        let mut rows = [Vec::new(), Vec::new()];
        for pair in boundaries.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            let group = [end[0] - start[0], end[1] - start[1]];
            for k in 0..group[0].max(group[1]) {
                for side in Side::BOTH {
                    let s = side.index();
                    let other_present = k < group[1 - s];
                    let spec = if k < group[s] {
                        marks[s].spec(start[s] + k, inside_block || !other_present)
                    } else {
                        LineSpec::Blank
                    };
                    rows[s].push(spec);
                }
            }
        }

        Ok(Some(rows))
    }
}

fn run_diff<E>(
    engine: &mut SequenceDiffEngine,
    lens: [usize; 2],
    equal: E,
    cancel: Option<&AtomicBool>,
) -> Result<EditScript>
where
    E: FnMut(usize, usize) -> bool,
{
    let mut builder = EditScriptBuilder::new();
    let distance = engine.diff(lens[0], lens[1], equal, |op, off, len| builder.push(op, off, len), cancel)?;
    match distance {
        EditDistance::Exact(d) => {
            trace!("Edit distance {}", d);
            let script = builder.finish();
            script.validate(lens)?;
            Ok(script)
        }
        EditDistance::Exceeded => Err(FileCompError::InternalInvariant(
            "unbounded diff reported an exceeded distance".to_string(),
        )),
    }
}

fn push_common(rows: &mut [Vec<LineSpec>; 2], cursor: [usize; 2], count: usize) {
    for side in Side::BOTH {
        let s = side.index();
        rows[s].extend((cursor[s]..cursor[s] + count).map(LineSpec::common));
    }
}

fn pad_rows(rows: &mut [Vec<LineSpec>; 2]) {
    let len = rows[0].len().max(rows[1].len());
    for side in rows.iter_mut() {
        side.resize(len, LineSpec::Blank);
    }
}

/// Changed state and intra-line ranges of the lines of one side
struct LineMarks {
    first: usize,
    changed: Vec<bool>,
    ranges: Vec<Vec<(usize, usize)>>,
}

impl LineMarks {
    fn collect(
        file: &TextFileModel,
        side: Side,
        first: usize,
        count: usize,
        tokens: &[CharToken],
        script: &EditScript,
    ) -> Self {
        let mut marks = Self {
            first,
            changed: vec![false; count],
            ranges: vec![Vec::new(); count],
        };
        let block_end = file.line_starts[first + count];

        for change in script.iter() {
            let pos = change.pos(side);
            let len = change.len(side);

            if len == 0 {
                // an insertion on the other side marks the line it lands in,
                // unless it falls between two whole lines
                if pos < tokens.len() && pos > 0 && tokens[pos - 1].line == tokens[pos].line {
                    marks.changed[tokens[pos].line - first] = true;
                } else if pos > 0 && pos == tokens.len() && !tokens[pos - 1].is_line_break() {
                    marks.changed[tokens[pos - 1].line - first] = true;
                }
                continue;
            }

            let start = tokens[pos].offset;
            let last = tokens[pos + len - 1];
            let end = if !is_space(file.text[last.offset]) {
                last.offset + 1
            } else if pos + len < tokens.len() {
                tokens[pos + len].offset
            } else {
                block_end
            };
            marks.mark_span(file, tokens[pos].line, start, end);
        }

        marks
    }

    fn mark_span(&mut self, file: &TextFileModel, mut line: usize, start: usize, end: usize) {
        let last_line = self.first + self.changed.len();
        while line < last_line && file.line_starts[line] < end {
            let line_start = file.line_starts[line];
            let content_end = line_start + file.line(line).len();
            let lo = start.max(line_start);
            let hi = end.min(content_end);

            self.changed[line - self.first] = true;
            if lo < hi {
                let ranges = &mut self.ranges[line - self.first];
                let range = (lo - line_start, hi - line_start);
                match ranges.last_mut() {
                    Some(prev) if prev.1 >= range.0 => prev.1 = prev.1.max(range.1),
                    _ => ranges.push(range),
                }
            }
            line += 1;
        }
    }

    fn spec(&self, line: usize, force_change: bool) -> LineSpec {
        let index = line - self.first;
        if self.changed[index] || force_change {
            LineSpec::change_with_ranges(line, self.ranges[index].clone())
        } else {
            LineSpec::common(line)
        }
    }
}

/// Line boundaries where both sides are in step: before a matched pair of
/// tokens that both start a line, and after a matched pair that both end one
fn sync_boundaries(
    tokens: [&[CharToken]; 2],
    script: &EditScript,
    first: [usize; 2],
    count: [usize; 2],
) -> Vec<[usize; 2]> {
    let end = [first[0] + count[0], first[1] + count[1]];
    let starts_line = |s: usize, i: usize| i == 0 || tokens[s][i - 1].line < tokens[s][i].line;
    let next_line = |s: usize, i: usize| tokens[s].get(i + 1).map_or(end[s], |t| t.line);

    let mut boundaries = vec![first];
    let mut push = |b: [usize; 2]| {
        if let Some(&last) = boundaries.last() {
            if b[0] >= last[0] && b[1] >= last[1] && b != last {
                boundaries.push(b);
            }
        }
    };

    let mut visit_matches = |from: [usize; 2], len: usize| {
        for k in 0..len {
            let (i, j) = (from[0] + k, from[1] + k);
            if starts_line(0, i) && starts_line(1, j) {
                push([tokens[0][i].line, tokens[1][j].line]);
            }
            let after = [next_line(0, i), next_line(1, j)];
            if after[0] > tokens[0][i].line && after[1] > tokens[1][j].line {
                push(after);
            }
        }
    };

    let mut cursor = [0usize; 2];
    for change in script.iter() {
        visit_matches(cursor, change.position[0] - cursor[0]);
        cursor = [change.end(Side::Left), change.end(Side::Right)];
    }
    visit_matches(cursor, tokens[0].len() - cursor[0]);

    push(end);
    boundaries
}

fn is_change_row(scripts: &[LineScript; 2], row: usize) -> bool {
    scripts.iter().any(|script| matches!(script[row], LineSpec::Change { .. } | LineSpec::Blank))
}

/// First row and row count of every change block: a maximal run of rows
/// where either side is not `Common`
pub fn change_blocks(scripts: &[LineScript; 2]) -> (Vec<usize>, Vec<usize>) {
    let rows = scripts[0].len().min(scripts[1].len());
    let mut index = Vec::new();
    let mut lengths = Vec::new();

    let mut row = 0;
    while row < rows {
        if is_change_row(scripts, row) {
            let start = row;
            while row < rows && is_change_row(scripts, row) {
                row += 1;
            }
            index.push(start);
            lengths.push(row - start);
        } else {
            row += 1;
        }
    }
    (index, lengths)
}

/// Replace common rows farther than `context` rows from any change by one
/// `Separator` row per elided run
pub fn collapse_context(scripts: &[LineScript; 2], context: usize) -> [LineScript; 2] {
    let rows = scripts[0].len().min(scripts[1].len());
    let mut keep = vec![false; rows];
    for row in (0..rows).filter(|&row| is_change_row(scripts, row)) {
        let lo = row.saturating_sub(context);
        let hi = (row + context).min(rows - 1);
        for flag in &mut keep[lo..=hi] {
            *flag = true;
        }
    }

    let mut out = [LineScript::new(), LineScript::new()];
    let mut eliding = false;
    for (row, &kept) in keep.iter().enumerate() {
        if kept {
            eliding = false;
            for side in 0..2 {
                out[side].push(scripts[side][row].clone());
            }
        } else if !eliding {
            eliding = true;
            for script in out.iter_mut() {
                script.push(LineSpec::Separator);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(s: &str) -> TextFileModel {
        TextFileModel::new("t", s.encode_utf16().collect(), String::new()).unwrap()
    }

    fn build(left: &str, right: &str, options: CompareOptions) -> Option<[LineScript; 2]> {
        let (l, r) = (model(left), model(right));
        LineScriptBuilder::new(&options.normalized())
            .build([&l, &r], None)
            .unwrap()
    }

    fn check_alignment(scripts: &[LineScript; 2], files: [&str; 2]) {
        assert_eq!(scripts[0].len(), scripts[1].len());
        for side in 0..2 {
            let lines: Vec<usize> = scripts[side].iter().filter_map(|s| s.line()).collect();
            let expected: Vec<usize> = (0..model(files[side]).line_count()).collect();
            assert_eq!(lines, expected, "every line appears once, in order");
        }
    }

    #[test]
    fn test_identical_files() {
        assert!(build("a\nb\n", "a\nb\n", CompareOptions::default()).is_none());
    }

    #[test]
    fn test_single_char_change_detail() {
        let scripts = build("abc\ndef\n", "abc\nxef\n", CompareOptions::default()).unwrap();
        check_alignment(&scripts, ["abc\ndef\n", "abc\nxef\n"]);
        assert_eq!(scripts[0][0], LineSpec::common(0));
        assert_eq!(scripts[0][1], LineSpec::change_with_ranges(1, vec![(0, 1)]));
        assert_eq!(scripts[1][1], LineSpec::change_with_ranges(1, vec![(0, 1)]));
        assert_eq!(change_blocks(&scripts), (vec![1], vec![1]));
    }

    #[test]
    fn test_without_detail_lines_are_whole_changes() {
        let options = CompareOptions {
            detailed_differences: false,
            ..Default::default()
        };
        let scripts = build("abc\ndef\n", "abc\nxef\n", options).unwrap();
        assert_eq!(scripts[0][1], LineSpec::change(1));
        assert_eq!(scripts[1][1], LineSpec::change(1));
    }

    #[test]
    fn test_insert_is_padded_with_blank() {
        let files = ["a\nc\n", "a\nb\nc\n"];
        let scripts = build(files[0], files[1], CompareOptions::default()).unwrap();
        check_alignment(&scripts, files);
        assert_eq!(scripts[0].len(), 3);
        assert!(scripts[0][1].is_blank());
        assert_eq!(scripts[1][1], LineSpec::change(1));
        assert_eq!(scripts[0][2], LineSpec::common(1));
        assert_eq!(scripts[1][2], LineSpec::common(2));
    }

    #[test]
    fn test_uneven_block_keeps_rows_aligned() {
        let files = ["head\nold one\ntail\n", "head\nnew one\nnew two\ntail\n"];
        let scripts = build(files[0], files[1], CompareOptions::default()).unwrap();
        check_alignment(&scripts, files);
        assert_eq!(scripts[0].last(), Some(&LineSpec::common(2)));
        assert_eq!(scripts[1].last(), Some(&LineSpec::common(3)));
        let (index, lengths) = change_blocks(&scripts);
        assert_eq!(index, vec![1]);
        assert_eq!(lengths, vec![2]);
    }

    #[test]
    fn test_ignore_case_is_identical() {
        let options = CompareOptions {
            ignore_case: true,
            ..Default::default()
        };
        assert!(build("ABC\n", "abc\n", options).is_none());
    }

    #[test]
    fn test_ignore_all_space_is_identical() {
        let options = CompareOptions {
            ignore_all_space: true,
            ..Default::default()
        };
        assert!(build("a  b\n", "a b\n", options).is_none());
    }

    #[test]
    fn test_ignore_space_change_detail_range() {
        let options = CompareOptions {
            ignore_space_change: true,
            ..Default::default()
        };
        assert!(build("a  b\n", "a b\n", options.clone()).is_none());
        let scripts = build("a  b\n", "ab\n", options).unwrap();
        assert_eq!(scripts[0][0], LineSpec::change_with_ranges(0, vec![(1, 3)]));
        assert_eq!(scripts[1][0], LineSpec::change_with_ranges(0, Vec::new()));
    }

    #[test]
    fn test_ignore_line_break_changes() {
        let options = CompareOptions {
            ignore_line_break_changes: true,
            ..Default::default()
        };
        assert!(build("one two\nthree\n", "one\ntwo three\n", options.clone()).is_none());

        let files = ["one two\nthree\n", "one\ntwo four\n"];
        let scripts = build(files[0], files[1], options).unwrap();
        check_alignment(&scripts, files);
        assert!(scripts.iter().any(|s| s.iter().any(|spec| spec.ranges().map_or(false, |r| !r.is_empty()))));
    }

    #[test]
    fn test_differs_stops_early() {
        let options = CompareOptions::default().normalized();
        let (a, b, c) = (model("one\ntwo\n"), model("one\ntwo\n"), model("one\nTWO\nthree\n"));
        let mut builder = LineScriptBuilder::new(&options);
        assert!(!builder.differs([&a, &b], None).unwrap());
        assert!(builder.differs([&a, &c], None).unwrap());
        // the distance cap is lifted again for a full build
        let scripts = builder.build([&a, &c], None).unwrap().unwrap();
        assert_eq!(change_blocks(&scripts), (vec![1], vec![2]));
    }

    #[test]
    fn test_differs_honors_filters() {
        let options = CompareOptions {
            ignore_case: true,
            ignore_line_break_changes: true,
            ..Default::default()
        }
        .normalized();
        let (a, b) = (model("One two\nthree\n"), model("one\nTWO three\n"));
        let mut builder = LineScriptBuilder::new(&options);
        assert!(!builder.differs([&a, &b], None).unwrap());
        let c = model("one\ntwo four\n");
        assert!(builder.differs([&a, &c], None).unwrap());
    }

    #[test]
    fn test_collapse_context() {
        let left = "1\n2\n3\n4\n5\n6\n7\n8\n";
        let right = "1\n2\n3\n4\nX\n6\n7\n8\n";
        let scripts = build(left, right, CompareOptions::default()).unwrap();
        let collapsed = collapse_context(&scripts, 1);
        let rows: Vec<Option<usize>> = collapsed[0].iter().map(|s| s.line()).collect();
        assert_eq!(rows, vec![None, Some(3), Some(4), Some(5), None]);
        assert!(collapsed[1][0].is_separator());
        assert!(collapsed[1][4].is_separator());
        assert_eq!(change_blocks(&collapsed), (vec![2], vec![1]));
    }
}
