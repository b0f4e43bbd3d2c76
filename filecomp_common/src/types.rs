use crate::{FileCompError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::PathBuf;
use uuid::Uuid;

/// One of the two compared files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left = 0,
    Right = 1,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Text encoding of one input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Encoding {
    /// Detect automatically
    #[default]
    Auto,
    /// Single-byte codepage, optionally recoded through a named table
    Ascii8,
    Utf8,
    Utf16,
    Utf32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

bitflags! {
    /// Line-ending sequences converted to LF before comparison
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EolConversion: u32 {
        const CR = 0b001;
        const CRLF = 0b010;
        const NUL = 0b100;
    }
}

impl Default for EolConversion {
    fn default() -> Self {
        EolConversion::CR | EolConversion::CRLF
    }
}

/// Decoding options for one side of the comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SideOptions {
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub endian: Endian,
    #[serde(default)]
    pub eol_conversion: EolConversion,
    /// Name of a single-byte recoding table (e.g. "windows-1250")
    #[serde(default)]
    pub input_table: Option<String>,
}

/// Options for a single comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareOptions {
    #[serde(default)]
    pub force_text: bool,
    #[serde(default)]
    pub force_binary: bool,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub ignore_all_space: bool,
    #[serde(default)]
    pub ignore_space_change: bool,
    #[serde(default)]
    pub ignore_line_break_changes: bool,
    #[serde(default = "default_true")]
    pub detailed_differences: bool,
    /// Normalize decoded text to Unicode NFC before comparing
    #[serde(default)]
    pub normalization_form: bool,
    #[serde(default)]
    pub sides: [SideOptions; 2],
}

fn default_true() -> bool {
    true
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            force_text: false,
            force_binary: false,
            ignore_case: false,
            ignore_all_space: false,
            ignore_space_change: false,
            ignore_line_break_changes: false,
            detailed_differences: true,
            normalization_form: false,
            sides: Default::default(),
        }
    }
}

impl CompareOptions {
    /// Apply the implications between flags: ignoring line-break changes
    /// requires space-change folding and character-level detail.
    pub fn normalized(mut self) -> Self {
        if self.ignore_line_break_changes {
            self.ignore_space_change = true;
            self.detailed_differences = true;
        }
        self
    }

    pub fn side(&self, side: Side) -> &SideOptions {
        &self.sides[side.index()]
    }
}

/// Classification of one rendered row of a side-by-side view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineSpec {
    /// Line present on both sides and equal under the active options
    Common { line: usize },
    /// Changed line. `ranges` holds half-open code-unit ranges within the
    /// line when character-level detail was computed.
    Change {
        line: usize,
        ranges: Option<Vec<(usize, usize)>>,
    },
    /// Placeholder for elided common lines
    Separator,
    /// Padding row keeping both sides aligned
    Blank,
}

impl LineSpec {
    pub fn common(line: usize) -> Self {
        LineSpec::Common { line }
    }

    pub fn change(line: usize) -> Self {
        LineSpec::Change { line, ranges: None }
    }

    pub fn change_with_ranges(line: usize, ranges: Vec<(usize, usize)>) -> Self {
        LineSpec::Change {
            line,
            ranges: Some(ranges),
        }
    }

    /// Source line index, `None` for Blank and Separator rows
    pub fn line(&self) -> Option<usize> {
        match self {
            LineSpec::Common { line } | LineSpec::Change { line, .. } => Some(*line),
            LineSpec::Separator | LineSpec::Blank => None,
        }
    }

    pub fn is_common(&self) -> bool {
        matches!(self, LineSpec::Common { .. })
    }

    pub fn is_change(&self) -> bool {
        matches!(self, LineSpec::Change { .. })
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, LineSpec::Blank)
    }

    pub fn is_separator(&self) -> bool {
        matches!(self, LineSpec::Separator)
    }

    pub fn ranges(&self) -> Option<&[(usize, usize)]> {
        match self {
            LineSpec::Change {
                ranges: Some(ranges),
                ..
            } => Some(ranges),
            _ => None,
        }
    }
}

/// Ordered rows for one side of the comparison
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineScript {
    specs: Vec<LineSpec>,
}

impl LineScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spec: LineSpec) {
        self.specs.push(spec);
    }
}

impl Deref for LineScript {
    type Target = [LineSpec];

    fn deref(&self) -> &Self::Target {
        &self.specs
    }
}

impl From<Vec<LineSpec>> for LineScript {
    fn from(specs: Vec<LineSpec>) -> Self {
        Self { specs }
    }
}

/// Decoded text of one file together with its line table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFileModel {
    pub name: PathBuf,
    /// UTF-16 code units, LF-terminated lines
    pub text: Vec<u16>,
    /// Offset of each line start plus one entry past the last line
    pub line_starts: Vec<usize>,
    pub encoding_name: String,
}

impl TextFileModel {
    /// Hard cap on the line table size
    pub const MAX_LINES: usize = u32::MAX as usize;

    /// Build the line table over an already decoded buffer
    pub fn new(name: impl Into<PathBuf>, text: Vec<u16>, encoding_name: String) -> Result<Self> {
        let mut line_starts = Vec::new();
        line_starts.try_reserve(text.len() / 32 + 2)?;
        line_starts.push(0);
        for (pos, &unit) in text.iter().enumerate() {
            if unit == u16::from(b'\n') {
                line_starts.push(pos + 1);
            }
        }
        if *line_starts.last().unwrap_or(&0) != text.len() {
            line_starts.push(text.len());
        }
        if line_starts.len() > Self::MAX_LINES {
            return Err(FileCompError::UnsupportedInput(format!(
                "too many lines ({})",
                line_starts.len() - 1
            )));
        }

        Ok(Self {
            name: name.into(),
            text,
            line_starts,
            encoding_name,
        })
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len().saturating_sub(1)
    }

    /// Line content including its terminating LF
    pub fn line_with_eol(&self, index: usize) -> &[u16] {
        &self.text[self.line_starts[index]..self.line_starts[index + 1]]
    }

    /// Line content without the terminating LF
    pub fn line(&self, index: usize) -> &[u16] {
        let line = self.line_with_eol(index);
        match line.split_last() {
            Some((&last, rest)) if last == u16::from(b'\n') => rest,
            _ => line,
        }
    }

    pub fn line_string(&self, index: usize) -> String {
        String::from_utf16_lossy(self.line(index))
    }

    /// Code-unit range of lines `first..first + count`
    pub fn range_of_lines(&self, first: usize, count: usize) -> (usize, usize) {
        (self.line_starts[first], self.line_starts[first + count])
    }
}

/// A maximal run of differing bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryChange {
    pub offset: u64,
    pub length: u64,
}

impl BinaryChange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Rate-limited progress notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDiffResult {
    pub files: [TextFileModel; 2],
    pub line_scripts: [LineScript; 2],
    /// First row of each change block
    pub change_index: Vec<usize>,
    /// Row count of each change block
    pub change_lengths: Vec<usize>,
}

impl TextDiffResult {
    pub fn encoding_names(&self) -> [&str; 2] {
        [
            self.files[0].encoding_name.as_str(),
            self.files[1].encoding_name.as_str(),
        ]
    }

    pub fn change_count(&self) -> usize {
        self.change_index.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryDiffResult {
    pub first_difference: u64,
    pub changes: Vec<BinaryChange>,
    pub truncated: bool,
    pub sizes: [u64; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    Identical,
    TextDiff(Box<TextDiffResult>),
    BinaryDiff(BinaryDiffResult),
}

impl CompareResult {
    pub fn is_identical(&self) -> bool {
        matches!(self, CompareResult::Identical)
    }
}

/// Terminal state of a comparison run
#[derive(Debug)]
pub enum CompareOutcome {
    Completed(CompareResult),
    Cancelled,
    Failed(FileCompError),
}

impl From<Result<CompareResult>> for CompareOutcome {
    fn from(result: Result<CompareResult>) -> Self {
        match result {
            Ok(result) => CompareOutcome::Completed(result),
            Err(FileCompError::Cancelled) => CompareOutcome::Cancelled,
            Err(e) => CompareOutcome::Failed(e),
        }
    }
}

impl CompareOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CompareOutcome::Completed(CompareResult::Identical) => "identical",
            CompareOutcome::Completed(CompareResult::TextDiff(_)) => "text-diff",
            CompareOutcome::Completed(CompareResult::BinaryDiff(_)) => "binary-diff",
            CompareOutcome::Cancelled => "cancelled",
            CompareOutcome::Failed(_) => "error",
        }
    }
}

/// Identifier of one comparison run, used to tag log spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompareId(pub Uuid);

impl CompareId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CompareId {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 content hash (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_line_table() {
        let model = TextFileModel::new("a.txt", utf16("abc\ndef\n"), String::new()).unwrap();
        assert_eq!(model.line_starts, vec![0, 4, 8]);
        assert_eq!(model.line_count(), 2);
        assert_eq!(model.line_string(1), "def");
        assert_eq!(model.line_with_eol(0), utf16("abc\n").as_slice());
    }

    #[test]
    fn test_line_table_without_final_newline() {
        let model = TextFileModel::new("a.txt", utf16("abc\nde"), String::new()).unwrap();
        assert_eq!(model.line_count(), 2);
        assert_eq!(model.line_string(1), "de");
    }

    #[test]
    fn test_options_normalization() {
        let options = CompareOptions {
            ignore_line_break_changes: true,
            detailed_differences: false,
            ..Default::default()
        }
        .normalized();
        assert!(options.ignore_space_change);
        assert!(options.detailed_differences);
    }

    #[test]
    fn test_outcome_from_cancelled_error() {
        let outcome = CompareOutcome::from(Err(FileCompError::Cancelled));
        assert!(matches!(outcome, CompareOutcome::Cancelled));
        assert_eq!(outcome.label(), "cancelled");
    }

    #[test]
    fn test_eol_conversion_default() {
        let eol = EolConversion::default();
        assert!(eol.contains(EolConversion::CRLF));
        assert!(!eol.contains(EolConversion::NUL));
    }
}
