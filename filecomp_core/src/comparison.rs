use crate::binary_diff::{BinaryDiffEngine, BlockCache};
use crate::encoding::{decode, Detection, TextEncodingDetector};
use crate::line_script::{change_blocks, LineScriptBuilder};
use crate::progress::{NoProgress, ProgressSink};
use filecomp_common::{
    BinaryDiffResult, CompareId, CompareOptions, CompareResult, ContentHash, Encoding, EngineConfig, FileCompError,
    ProgressEvent, Result, Side, TextDiffResult, TextFileModel,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, info_span};

/// One input of a comparison: a seekable byte stream of known length
pub struct CompareInput<R> {
    pub name: PathBuf,
    pub reader: R,
    pub len: u64,
}

impl<R: Read + Seek> CompareInput<R> {
    pub fn new(name: impl Into<PathBuf>, reader: R, len: u64) -> Self {
        Self {
            name: name.into(),
            reader,
            len,
        }
    }

    /// Leading bytes used for encoding detection
    fn read_prefix(&mut self, size: usize) -> Result<Vec<u8>> {
        let want = (self.len.min(size as u64)) as usize;
        let mut prefix = Vec::new();
        prefix.try_reserve_exact(want)?;
        self.rewind()?;
        (&mut self.reader)
            .take(want as u64)
            .read_to_end(&mut prefix)
            .map_err(|e| FileCompError::io(&self.name, e))?;
        Ok(prefix)
    }

    /// The whole stream, allocated up front
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len)
            .map_err(|_| FileCompError::UnsupportedInput(format!("{} is too large", self.name.display())))?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        self.rewind()?;
        (&mut self.reader)
            .take(self.len)
            .read_to_end(&mut bytes)
            .map_err(|e| FileCompError::io(&self.name, e))?;
        Ok(bytes)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map(|_| ())
            .map_err(|e| FileCompError::io(&self.name, e))
    }
}

impl CompareInput<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| FileCompError::io(path, e))?;
        let len = file.metadata().map_err(|e| FileCompError::io(path, e))?.len();
        Ok(Self::new(path, file, len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Binary,
}

/// Decides between text and binary comparison and assembles the result
pub struct CompareOrchestrator {
    config: EngineConfig,
    detector: TextEncodingDetector,
}

impl CompareOrchestrator {
    pub fn new(config: EngineConfig) -> Self {
        let detector = TextEncodingDetector::new(&config);
        Self { config, detector }
    }

    pub fn with_detector(mut self, detector: TextEncodingDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Detect the encoding of a single file with the given per-side hint
    pub fn detect_file(&self, path: &Path, options: &CompareOptions, side: Side) -> Result<Detection> {
        let mut input = CompareInput::open(path)?;
        let prefix = input.read_prefix(self.config.prefix_size)?;
        Ok(self.detector.detect(&prefix, input.len, options.side(side)))
    }

    pub fn compare_files(
        &self,
        left: &Path,
        right: &Path,
        options: &CompareOptions,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<CompareResult> {
        let left = CompareInput::open(left)?;
        let right = CompareInput::open(right)?;
        self.compare_streams(left, right, options, progress, cancel)
    }

    pub fn compare_streams<A, B>(
        &self,
        mut left: CompareInput<A>,
        mut right: CompareInput<B>,
        options: &CompareOptions,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<CompareResult>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let id = CompareId::new();
        let span = info_span!("compare", id = %id.0);
        let _enter = span.enter();

        let options = options.clone().normalized();
        info!(
            "Comparing {} ({} bytes) with {} ({} bytes)",
            left.name.display(),
            left.len,
            right.name.display(),
            right.len
        );

        let mode = self.initial_mode(&left, &right, &options)?;
        let result = match mode {
            Mode::Binary => self.binary_compare(&mut left, &mut right, progress, cancel),
            Mode::Text => {
                let detections = [
                    self.detect(&mut left, &options, Side::Left)?,
                    self.detect(&mut right, &options, Side::Right)?,
                ];
                if detections.iter().all(|d| d.is_text) {
                    self.text_compare(&mut left, &mut right, detections, &options, progress, cancel)
                } else {
                    info!("Binary content detected, falling back to binary comparison");
                    self.binary_compare(&mut left, &mut right, progress, cancel)
                }
            }
        };

        match &result {
            Ok(CompareResult::Identical) => info!("Files are identical"),
            Ok(CompareResult::TextDiff(diff)) => info!("Text comparison found {} change blocks", diff.change_count()),
            Ok(CompareResult::BinaryDiff(diff)) => info!(
                "Binary comparison found {} changes{}",
                diff.changes.len(),
                if diff.truncated { " (truncated)" } else { "" }
            ),
            Err(FileCompError::Cancelled) => info!("Comparison cancelled"),
            Err(e) => debug!("Comparison failed: {}", e),
        }
        result
    }

    pub fn files_differ(
        &self,
        left: &Path,
        right: &Path,
        options: &CompareOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<bool> {
        let left = CompareInput::open(left)?;
        let right = CompareInput::open(right)?;
        self.streams_differ(left, right, options, cancel)
    }

    /// Whether the inputs differ under `options`. Stops at the first
    /// difference instead of describing all of them.
    pub fn streams_differ<A, B>(
        &self,
        mut left: CompareInput<A>,
        mut right: CompareInput<B>,
        options: &CompareOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<bool>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let options = options.clone().normalized();
        let detections = match self.initial_mode(&left, &right, &options)? {
            Mode::Binary => None,
            Mode::Text => {
                let detections = [
                    self.detect(&mut left, &options, Side::Left)?,
                    self.detect(&mut right, &options, Side::Right)?,
                ];
                detections.iter().all(|d| d.is_text).then_some(detections)
            }
        };

        let differs = match detections {
            Some(detections) => match self.load_text(&mut left, &mut right, detections, &options, cancel)? {
                Some(files) => LineScriptBuilder::new(&options).differs([&files[0], &files[1]], cancel)?,
                None => false,
            },
            None => {
                let mut a = BlockCache::from_config(&mut left.reader, left.len, &left.name, &self.config);
                let mut b = BlockCache::from_config(&mut right.reader, right.len, &right.name, &self.config);
                BinaryDiffEngine::from_config(&self.config)
                    .find_first_difference(&mut a, &mut b, &mut NoProgress, cancel)?
                    .is_some()
            }
        };
        debug!("{} and {} differ: {}", left.name.display(), right.name.display(), differs);
        Ok(differs)
    }

    fn initial_mode<A, B>(&self, left: &CompareInput<A>, right: &CompareInput<B>, options: &CompareOptions) -> Result<Mode> {
        if options.force_binary {
            debug!("Binary comparison forced");
            return Ok(Mode::Binary);
        }

        let limit = self.config.max_text_size;
        let oversized = [(&left.name, left.len), (&right.name, right.len)]
            .into_iter()
            .find(|&(_, len)| len > limit)
            .map(|(name, _)| name);
        match oversized {
            Some(name) if options.force_text => Err(FileCompError::UnsupportedInput(format!(
                "{} exceeds the text size limit of {} bytes",
                name.display(),
                limit
            ))),
            Some(name) => {
                debug!("{} exceeds the text size limit, comparing as binary", name.display());
                Ok(Mode::Binary)
            }
            None => Ok(Mode::Text),
        }
    }

    fn detect<R: Read + Seek>(&self, input: &mut CompareInput<R>, options: &CompareOptions, side: Side) -> Result<Detection> {
        let prefix = input.read_prefix(self.config.prefix_size)?;
        let mut detection = self.detector.detect(&prefix, input.len, options.side(side));

        if !detection.is_text && options.force_text {
            detection.is_text = true;
            if detection.encoding == Encoding::Auto {
                detection.encoding = Encoding::Ascii8;
                detection.codepage = Some(self.config.default_codepage.clone());
            }
        }
        debug!(
            "{}: {} ({:?}, text: {})",
            input.name.display(),
            detection.encoding_name(),
            detection.confidence,
            detection.is_text
        );
        Ok(detection)
    }

    /// Read, hash and decode both inputs; `None` when the bytes are equal
    /// and both sides are decoded alike
    fn load_text<A, B>(
        &self,
        left: &mut CompareInput<A>,
        right: &mut CompareInput<B>,
        detections: [Detection; 2],
        options: &CompareOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<[TextFileModel; 2]>>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let bytes = [left.read_all()?, right.read_all()?];
        check_cancel(cancel)?;

        let hashes: [ContentHash; 2] = [blake3::hash(&bytes[0]).into(), blake3::hash(&bytes[1]).into()];
        debug!("Content hashes: {} / {}", hashes[0].to_hex(), hashes[1].to_hex());
        if hashes[0] == hashes[1] && options.sides[0] == options.sides[1] && detections[0] == detections[1] {
            return Ok(None);
        }

        let names = [&left.name, &right.name];
        let mut decoded = Vec::with_capacity(2);
        for side in Side::BOTH {
            let s = side.index();
            let text = decode(
                &bytes[s],
                &detections[s],
                options.side(side).eol_conversion,
                options.normalization_form,
            )?;
            decoded.push(TextFileModel::new(names[s].clone(), text, detections[s].encoding_name())?);
            check_cancel(cancel)?;
        }
        drop(bytes);

        let files: [TextFileModel; 2] = decoded
            .try_into()
            .map_err(|_| FileCompError::InternalInvariant("expected two decoded files".to_string()))?;
        debug!("Decoded {} and {} lines", files[0].line_count(), files[1].line_count());
        Ok(Some(files))
    }

    fn text_compare<A, B>(
        &self,
        left: &mut CompareInput<A>,
        right: &mut CompareInput<B>,
        detections: [Detection; 2],
        options: &CompareOptions,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<CompareResult>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let Some(files) = self.load_text(left, right, detections, options, cancel)? else {
            progress.report(ProgressEvent { percent: 100, changes: 0 });
            return Ok(CompareResult::Identical);
        };
        progress.report(ProgressEvent { percent: 50, changes: 0 });

        let scripts = LineScriptBuilder::new(options).build([&files[0], &files[1]], cancel)?;
        let Some(line_scripts) = scripts else {
            progress.report(ProgressEvent { percent: 100, changes: 0 });
            return Ok(CompareResult::Identical);
        };

        let (change_index, change_lengths) = change_blocks(&line_scripts);
        progress.report(ProgressEvent {
            percent: 100,
            changes: change_index.len(),
        });
        if change_index.is_empty() {
            return Ok(CompareResult::Identical);
        }

        Ok(CompareResult::TextDiff(Box::new(TextDiffResult {
            files,
            line_scripts,
            change_index,
            change_lengths,
        })))
    }

    fn binary_compare<A, B>(
        &self,
        left: &mut CompareInput<A>,
        right: &mut CompareInput<B>,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<CompareResult>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let sizes = [left.len, right.len];
        let mut a = BlockCache::from_config(&mut left.reader, left.len, &left.name, &self.config);
        let mut b = BlockCache::from_config(&mut right.reader, right.len, &right.name, &self.config);
        let engine = BinaryDiffEngine::from_config(&self.config);

        let Some(first_difference) = engine.find_first_difference(&mut a, &mut b, progress, cancel)? else {
            progress.report(ProgressEvent { percent: 100, changes: 0 });
            return Ok(CompareResult::Identical);
        };

        let (changes, truncated) = engine.enumerate_differences(&mut a, &mut b, first_difference, progress, cancel)?;
        progress.report(ProgressEvent {
            percent: 100,
            changes: changes.len(),
        });

        Ok(CompareResult::BinaryDiff(BinaryDiffResult {
            first_difference,
            changes,
            truncated,
            sizes,
        }))
    }
}

impl Default for CompareOrchestrator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
        Err(FileCompError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use filecomp_common::{BinaryChange, LineSpec};
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn input(name: &str, data: &[u8]) -> CompareInput<Cursor<Vec<u8>>> {
        CompareInput::new(name, Cursor::new(data.to_vec()), data.len() as u64)
    }

    fn compare(left: &[u8], right: &[u8], options: CompareOptions) -> CompareResult {
        CompareOrchestrator::default()
            .compare_streams(input("left", left), input("right", right), &options, &mut NoProgress, None)
            .unwrap()
    }

    #[test]
    fn test_identical_files() {
        let result = compare(b"same\ntext\n", b"same\ntext\n", CompareOptions::default());
        assert!(result.is_identical());
    }

    #[test]
    fn test_text_diff_with_intra_line_ranges() {
        let result = compare(b"abc\ndef\n", b"abc\nxef\n", CompareOptions::default());
        let CompareResult::TextDiff(diff) = result else {
            panic!("expected a text diff, got {result:?}");
        };
        assert_eq!(diff.change_index, vec![1]);
        assert_eq!(diff.change_lengths, vec![1]);
        for script in &diff.line_scripts {
            assert_eq!(script[1], LineSpec::change_with_ranges(1, vec![(0, 1)]));
        }
        assert_eq!(diff.encoding_names(), ["windows-1252", "windows-1252"]);
    }

    #[test]
    fn test_ignore_case_is_identical() {
        let options = CompareOptions {
            ignore_case: true,
            ..Default::default()
        };
        assert!(compare(b"ABC\n", b"abc\n", options).is_identical());
    }

    #[test]
    fn test_utf16_bom_against_ascii() {
        let result = compare(&[0xFF, 0xFE, b'a', 0, b'\n', 0], b"a\n", CompareOptions::default());
        assert!(result.is_identical());
    }

    #[test]
    fn test_missing_final_newline_is_identical() {
        assert!(compare(b"a\nb", b"a\nb\n", CompareOptions::default()).is_identical());
    }

    #[test]
    fn test_odd_trailing_byte_is_a_difference() {
        let left = [0xFF, 0xFE, b'a', 0, b'\n', 0];
        let right = [0xFF, 0xFE, b'a', 0, b'\n', 0, 0x5A];
        let CompareResult::TextDiff(diff) = compare(&left, &right, CompareOptions::default()) else {
            panic!("expected a text diff");
        };
        assert_eq!(diff.change_index, vec![1]);
        assert!(diff.line_scripts[0][1].is_blank());
    }

    #[test]
    fn test_streams_differ() {
        let orchestrator = CompareOrchestrator::default();
        let differ = |left: &[u8], right: &[u8], options: &CompareOptions| {
            orchestrator
                .streams_differ(input("left", left), input("right", right), options, None)
                .unwrap()
        };
        let defaults = CompareOptions::default();
        let ignore_case = CompareOptions {
            ignore_case: true,
            ..Default::default()
        };

        assert!(!differ(b"one\ntwo\n", b"one\ntwo\n", &defaults));
        assert!(!differ(b"one\ntwo", b"one\ntwo\n", &defaults));
        assert!(differ(b"one\nTWO\n", b"one\ntwo\n", &defaults));
        assert!(!differ(b"one\nTWO\n", b"one\ntwo\n", &ignore_case));

        let binary = [0u8, 1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9];
        let mut changed = binary;
        changed[17] = 8;
        assert!(!differ(&binary, &binary, &defaults));
        assert!(differ(&binary, &changed, &defaults));
    }

    #[test]
    fn test_streams_differ_cancelled() {
        let cancel = AtomicBool::new(true);
        let err = CompareOrchestrator::default()
            .streams_differ(input("l", b"a\n"), input("r", b"b\n"), &CompareOptions::default(), Some(&cancel))
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_binary_fallback() {
        let left = [0u8, 1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9];
        let mut right = left;
        right[2] = 0xFF;
        let CompareResult::BinaryDiff(diff) = compare(&left, &right, CompareOptions::default()) else {
            panic!("expected a binary diff");
        };
        assert_eq!(diff.first_difference, 2);
        assert_eq!(diff.changes, vec![BinaryChange { offset: 2, length: 1 }]);
        assert_eq!(diff.sizes, [18, 18]);
        assert!(!diff.truncated);
    }

    #[test]
    fn test_force_binary() {
        let options = CompareOptions {
            force_binary: true,
            ..Default::default()
        };
        let CompareResult::BinaryDiff(diff) = compare(b"abc\n", b"abd\n", options) else {
            panic!("expected a binary diff");
        };
        assert_eq!(diff.first_difference, 2);
    }

    #[test]
    fn test_oversized_file() {
        let config = EngineConfig {
            max_text_size: 4,
            ..Default::default()
        };
        let orchestrator = CompareOrchestrator::new(config);

        let result = orchestrator
            .compare_streams(
                input("l", b"hello\n"),
                input("r", b"hello\n"),
                &CompareOptions::default(),
                &mut NoProgress,
                None,
            )
            .unwrap();
        assert!(result.is_identical());

        let forced = CompareOptions {
            force_text: true,
            ..Default::default()
        };
        let err = orchestrator
            .compare_streams(input("l", b"hello\n"), input("r", b"hellO\n"), &forced, &mut NoProgress, None)
            .unwrap_err();
        assert!(matches!(err, FileCompError::UnsupportedInput(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = AtomicBool::new(true);
        let err = CompareOrchestrator::default()
            .compare_streams(
                input("l", b"a\n"),
                input("r", b"b\n"),
                &CompareOptions::default(),
                &mut NoProgress,
                Some(&cancel),
            )
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_compare_files_on_disk() {
        let mut left = NamedTempFile::new().unwrap();
        let mut right = NamedTempFile::new().unwrap();
        left.write_all(b"one\ntwo\nthree\n").unwrap();
        right.write_all(b"one\nthree\n").unwrap();

        let mut events = Vec::new();
        let mut sink = |event: ProgressEvent| events.push(event);
        let result = CompareOrchestrator::default()
            .compare_files(left.path(), right.path(), &CompareOptions::default(), &mut sink, None)
            .unwrap();

        let CompareResult::TextDiff(diff) = result else {
            panic!("expected a text diff");
        };
        assert_eq!(diff.line_scripts[0][1], LineSpec::change(1));
        assert!(diff.line_scripts[1][1].is_blank());
        assert_eq!(events.last().map(|e| e.changes), Some(1));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let err = CompareOrchestrator::default()
            .compare_files(&missing, &missing, &CompareOptions::default(), &mut NoProgress, None)
            .unwrap_err();
        assert_eq!(err.path(), Some(missing.as_path()));
    }
}
