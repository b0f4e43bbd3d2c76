pub mod sequence_diff;
pub mod edit_script;
pub mod line_classifier;
pub mod line_script;
pub mod encoding;
pub mod binary_diff;
pub mod progress;
pub mod comparison;
pub mod worker;

pub use sequence_diff::{EditDistance, EditOp, SequenceDiffEngine};
pub use edit_script::{remove_single_char_matches, shift_boundaries, Change, EditScript, EditScriptBuilder};
pub use line_classifier::{LineClassifier, TextFilter};
pub use line_script::{change_blocks, collapse_context, LineScriptBuilder};
pub use encoding::{decode, CodepageRecognizer, Detection, TextEncodingDetector};
pub use binary_diff::{BinaryDiffEngine, BlockCache};
pub use progress::{NoProgress, ProgressSink};
pub use comparison::{CompareInput, CompareOrchestrator};
pub use worker::{CompareHandle, CompareRequest, CompareWorker, WorkerEvent};
