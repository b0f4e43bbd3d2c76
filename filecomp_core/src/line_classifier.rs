use crate::edit_script::SourceToken;
use filecomp_common::{CompareOptions, FileCompError, Result, TextFileModel};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

const LF: u16 = b'\n' as u16;
const SPACE: u16 = b' ' as u16;

/// Space, tab, VT, FF, CR, NBSP and LF
pub fn is_space(unit: u16) -> bool {
    matches!(unit, 0x20 | 0x09 | 0x0B | 0x0C | 0x0D | 0xA0 | LF)
}

/// Simple lowercase mapping restricted to the BMP
pub fn fold_case(unit: u16) -> u16 {
    if unit < 0x80 {
        return (unit as u8).to_ascii_lowercase() as u16;
    }
    match char::from_u32(u32::from(unit)) {
        Some(c) => {
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(l), None) if (l as u32) <= 0xFFFF => l as u16,
                _ => unit,
            }
        }
        None => unit,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitespaceMode {
    Exact,
    /// Runs of whitespace compare equal regardless of length
    IgnoreChange,
    /// Whitespace other than line breaks is dropped
    IgnoreAll,
}

/// Folding rules shared by both comparison strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextFilter {
    pub ignore_case: bool,
    pub whitespace: WhitespaceMode,
    pub ignore_line_breaks: bool,
}

impl TextFilter {
    pub fn from_options(options: &CompareOptions) -> Self {
        let whitespace = if options.ignore_all_space {
            WhitespaceMode::IgnoreAll
        } else if options.ignore_space_change {
            WhitespaceMode::IgnoreChange
        } else {
            WhitespaceMode::Exact
        };
        Self {
            ignore_case: options.ignore_case,
            whitespace,
            ignore_line_breaks: options.ignore_line_break_changes,
        }
    }

    fn fold(&self, unit: u16) -> u16 {
        if self.ignore_case {
            fold_case(unit)
        } else {
            unit
        }
    }

    /// Normalized code units of a line without its line break
    pub fn normalize<'a>(&'a self, line: &'a [u16]) -> Normalized<'a> {
        Normalized {
            filter: self,
            units: line,
            pos: 0,
        }
    }
}

/// Iterator yielding the folded code units of one line
#[derive(Clone)]
pub struct Normalized<'a> {
    filter: &'a TextFilter,
    units: &'a [u16],
    pos: usize,
}

impl Iterator for Normalized<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let unit = *self.units.get(self.pos)?;
        self.pos += 1;
        if !is_space(unit) {
            return Some(self.filter.fold(unit));
        }
        match self.filter.whitespace {
            WhitespaceMode::Exact => Some(unit),
            WhitespaceMode::IgnoreChange => {
                while self.units.get(self.pos).map_or(false, |&u| is_space(u)) {
                    self.pos += 1;
                }
                Some(SPACE)
            }
            WhitespaceMode::IgnoreAll => {
                while self.units.get(self.pos).map_or(false, |&u| is_space(u)) {
                    self.pos += 1;
                }
                self.next()
            }
        }
    }
}

/// Hash-map key comparing lines through the active filter
struct LineKey<'a> {
    filter: &'a TextFilter,
    line: &'a [u16],
}

impl Hash for LineKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for unit in self.filter.normalize(self.line) {
            state.write_u16(unit);
        }
    }
}

impl PartialEq for LineKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.filter.normalize(self.line).eq(other.filter.normalize(other.line))
    }
}

impl Eq for LineKey<'_> {}

/// Maps the lines of both files to equivalence-class ids
pub struct LineClassifier<'a> {
    filter: &'a TextFilter,
}

impl<'a> LineClassifier<'a> {
    pub fn new(filter: &'a TextFilter) -> Self {
        Self { filter }
    }

    /// Equal ids mean equal lines under the filter
    pub fn classify(&self, files: [&'a TextFileModel; 2], cancel: Option<&AtomicBool>) -> Result<[Vec<u32>; 2]> {
        let mut classes: HashMap<LineKey<'a>, u32> = HashMap::new();
        let mut ids = [Vec::new(), Vec::new()];

        for (side, &file) in files.iter().enumerate() {
            let out = &mut ids[side];
            out.try_reserve_exact(file.line_count())?;
            for line in 0..file.line_count() {
                if line % 4096 == 0 && cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                    return Err(FileCompError::Cancelled);
                }
                let next_id = classes.len() as u32;
                let key = LineKey {
                    filter: self.filter,
                    line: file.line(line),
                };
                out.push(*classes.entry(key).or_insert(next_id));
            }
        }

        Ok(ids)
    }
}

/// One element of the filtered character stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharToken {
    /// Folded value; a collapsed whitespace run is a single space or LF
    pub value: u16,
    /// Code-unit offset of the first source unit
    pub offset: usize,
    /// Source line of the first source unit
    pub line: usize,
}

impl SourceToken for CharToken {
    fn offset(&self) -> usize {
        self.offset
    }

    fn is_line_break(&self) -> bool {
        self.value == LF
    }
}

/// Build the character stream of lines `first..first + count` into `out`
pub fn tokenize(
    file: &TextFileModel,
    first: usize,
    count: usize,
    filter: &TextFilter,
    cancel: Option<&AtomicBool>,
    out: &mut Vec<CharToken>,
) -> Result<()> {
    let (begin, end) = file.range_of_lines(first, count);
    let text = &file.text;
    out.clear();
    out.try_reserve(end - begin)?;

    let check_cancel = || {
        if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
            Err(FileCompError::Cancelled)
        } else {
            Ok(())
        }
    };

    let mut line = first;
    let mut pos = begin;
    while pos < end {
        let unit = text[pos];

        if !is_space(unit) || filter.whitespace == WhitespaceMode::Exact {
            out.push(CharToken {
                value: filter.fold(unit),
                offset: pos,
                line,
            });
            if unit == LF {
                line += 1;
                check_cancel()?;
            }
            pos += 1;
            continue;
        }

        let start = pos;
        let start_line = line;
        match filter.whitespace {
            WhitespaceMode::IgnoreAll => {
                if unit == LF {
                    if !filter.ignore_line_breaks {
                        out.push(CharToken {
                            value: LF,
                            offset: pos,
                            line,
                        });
                    }
                    line += 1;
                    check_cancel()?;
                }
                pos += 1;
            }
            WhitespaceMode::IgnoreChange if filter.ignore_line_breaks => {
                // a run with one line break matches a run without any; two or
                // more line breaks form a blank line
                let mut breaks = 0;
                while pos < end && is_space(text[pos]) {
                    if text[pos] == LF {
                        breaks += 1;
                        line += 1;
                    }
                    pos += 1;
                }
                out.push(CharToken {
                    value: if breaks > 1 { LF } else { SPACE },
                    offset: start,
                    line: start_line,
                });
                check_cancel()?;
            }
            WhitespaceMode::IgnoreChange if unit == LF => {
                while pos < end && text[pos] == LF {
                    line += 1;
                    pos += 1;
                }
                out.push(CharToken {
                    value: LF,
                    offset: start,
                    line: start_line,
                });
                check_cancel()?;
            }
            WhitespaceMode::IgnoreChange | WhitespaceMode::Exact => {
                while pos < end && text[pos] != LF && is_space(text[pos]) {
                    pos += 1;
                }
                out.push(CharToken {
                    value: SPACE,
                    offset: start,
                    line: start_line,
                });
            }
        }
    }

    Ok(())
}
