use filecomp_common::{EngineConfig, Encoding, Endian, EolConversion, FileCompError, Result, SideOptions};
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

pub const DEFAULT_CODEPAGE: &str = "windows-1252";

const LF: u16 = b'\n' as u16;
const CR: u16 = b'\r' as u16;
const BOM: u16 = 0xFEFF;
const REPLACEMENT: u16 = 0xFFFD;

/// How the encoding was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    ByteOrderMark,
    Statistical,
    Structural,
    Heuristic,
    UserHint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub is_text: bool,
    pub encoding: Encoding,
    pub endian: Endian,
    pub confidence: Confidence,
    /// Single-byte codepage label, for `Encoding::Ascii8`
    pub codepage: Option<String>,
}

impl Detection {
    fn unicode(encoding: Encoding, endian: Endian, confidence: Confidence) -> Self {
        Self {
            is_text: true,
            encoding,
            endian,
            confidence,
            codepage: None,
        }
    }

    fn binary() -> Self {
        Self {
            is_text: false,
            encoding: Encoding::Auto,
            endian: Endian::Little,
            confidence: Confidence::Heuristic,
            codepage: None,
        }
    }

    /// Display name, e.g. `UTF-16BE` or `windows-1250`
    pub fn encoding_name(&self) -> String {
        let suffix = match self.endian {
            Endian::Big => "BE",
            Endian::Little => "",
        };
        match self.encoding {
            Encoding::Utf8 => "UTF-8".to_string(),
            Encoding::Utf16 => format!("UTF-16{suffix}"),
            Encoding::Utf32 => format!("UTF-32{suffix}"),
            Encoding::Ascii8 => self
                .codepage
                .clone()
                .unwrap_or_else(|| DEFAULT_CODEPAGE.to_string()),
            Encoding::Auto if !self.is_text => "binary".to_string(),
            Encoding::Auto => String::new(),
        }
    }
}

/// Decides text vs. binary for data no Unicode test recognized, and names a
/// single-byte codepage for text. Returning `None` classifies the sample as
/// binary.
pub trait CodepageRecognizer: Send + Sync {
    fn recognize(&self, sample: &[u8]) -> Option<String>;
}

/// Rejects samples with long NUL runs or too many stray C0 control bytes,
/// otherwise proposes a fixed codepage
#[derive(Debug, Clone)]
pub struct DefaultCodepageRecognizer {
    codepage: String,
}

impl DefaultCodepageRecognizer {
    /// Longest run of NUL bytes tolerated in text
    const MAX_NUL_RUN: usize = 10;
    /// Stray control bytes tolerated per this many bytes of sample
    const CONTROL_BYTE_DIVISOR: usize = 200;

    pub fn new(codepage: impl Into<String>) -> Self {
        Self {
            codepage: codepage.into(),
        }
    }

    fn is_stray_control(byte: u8) -> bool {
        // BEL BS HT LF VT FF CR EOT SUB are common in text
        byte < b' ' && !matches!(byte, 0 | 0x04 | 0x07 | 0x08 | b'\t' | b'\n' | 0x0B | 0x0C | b'\r' | 0x1A)
    }
}

impl Default for DefaultCodepageRecognizer {
    fn default() -> Self {
        Self::new(DEFAULT_CODEPAGE)
    }
}

impl CodepageRecognizer for DefaultCodepageRecognizer {
    fn recognize(&self, sample: &[u8]) -> Option<String> {
        let max_controls = sample.len() / Self::CONTROL_BYTE_DIVISOR;
        let mut controls = 0;
        let mut nul_run = 0;

        for &byte in sample {
            if Self::is_stray_control(byte) {
                controls += 1;
                if controls > max_controls {
                    return None;
                }
            }
            if byte == 0 {
                nul_run += 1;
                if nul_run > Self::MAX_NUL_RUN {
                    return None;
                }
            } else {
                nul_run = 0;
            }
        }

        Some(self.codepage.clone())
    }
}

pub struct TextEncodingDetector {
    utf16_min_sample: usize,
    utf16_cutoff: f64,
    utf8_min_sample: usize,
    default_codepage: String,
    recognizer: Box<dyn CodepageRecognizer>,
}

impl TextEncodingDetector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            utf16_min_sample: config.utf16_min_sample,
            utf16_cutoff: config.utf16_bhattacharyya_cutoff,
            utf8_min_sample: config.utf8_min_sample,
            default_codepage: config.default_codepage.clone(),
            recognizer: Box::new(DefaultCodepageRecognizer::new(config.default_codepage.clone())),
        }
    }

    pub fn with_recognizer(mut self, recognizer: Box<dyn CodepageRecognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    /// Classify `prefix`, the leading bytes of a file of `total_len` bytes.
    ///
    /// An encoding set in `hint` is kept; detection then only decides
    /// whether the data is text.
    pub fn detect(&self, prefix: &[u8], total_len: u64, hint: &SideOptions) -> Detection {
        let unicode = bom_test(prefix)
            .or_else(|| self.utf16_test(prefix, total_len))
            .or_else(|| self.utf8_test(prefix, total_len));

        let mut detection = match unicode {
            Some(detection) => detection,
            None => match self.recognizer.recognize(prefix) {
                Some(codepage) => Detection {
                    is_text: true,
                    encoding: Encoding::Ascii8,
                    endian: Endian::Little,
                    confidence: Confidence::Heuristic,
                    codepage: Some(codepage),
                },
                None => Detection::binary(),
            },
        };

        if hint.encoding != Encoding::Auto {
            if hint.encoding == Encoding::Utf16 && !detection.is_text {
                detection.is_text = is_valid_utf16(prefix, hint.endian, prefix.len() as u64 >= total_len);
            }
            detection.encoding = hint.encoding;
            detection.endian = hint.endian;
            detection.confidence = Confidence::UserHint;
        }

        if detection.encoding == Encoding::Ascii8 {
            if let Some(table) = &hint.input_table {
                detection.codepage = Some(table.clone());
            } else if detection.codepage.is_none() {
                detection.codepage = Some(self.default_codepage.clone());
            }
        }

        debug!(
            "Detected {} (text: {}, {:?})",
            detection.encoding_name(),
            detection.is_text,
            detection.confidence
        );
        detection
    }

    fn utf16_test(&self, prefix: &[u8], total_len: u64) -> Option<Detection> {
        if prefix.len() < self.utf16_min_sample {
            return None;
        }

        let mut even = [0u64; 256];
        let mut odd = [0u64; 256];
        for pair in prefix.chunks_exact(2) {
            even[pair[0] as usize] += 1;
            odd[pair[1] as usize] += 1;
        }
        let pairs = (prefix.len() / 2) as f64;

        // 0 for orthogonal distributions, 1 for equal ones
        let bc: f64 = even
            .iter()
            .zip(odd.iter())
            .map(|(&e, &o)| ((e * o) as f64).sqrt())
            .sum::<f64>()
            / pairs;
        trace!("Bhattacharyya coefficient {:.4}", bc);
        if bc > self.utf16_cutoff {
            return None;
        }

        let whole = prefix.len() as u64 >= total_len;
        let little = is_valid_utf16(prefix, Endian::Little, whole);
        let big = is_valid_utf16(prefix, Endian::Big, whole);
        let endian = match (little, big) {
            (true, true) => {
                // the high-order byte plane has the lower entropy
                let norm = 1.0 / (pairs + 1.0);
                let entropy = |hist: &[u64; 256]| {
                    hist.iter()
                        .map(|&count| {
                            let p = (count as f64 + 1.0 / 256.0) * norm;
                            -p * p.ln()
                        })
                        .sum::<f64>()
                };
                let even_entropy = entropy(&even);
                let odd_entropy = entropy(&odd);
                trace!("Byte entropy even {:.4}, odd {:.4}", even_entropy, odd_entropy);
                if even_entropy > odd_entropy {
                    Endian::Little
                } else {
                    Endian::Big
                }
            }
            (true, false) => Endian::Little,
            (false, true) => Endian::Big,
            (false, false) => return None,
        };

        Some(Detection::unicode(Encoding::Utf16, endian, Confidence::Statistical))
    }

    fn utf8_test(&self, prefix: &[u8], total_len: u64) -> Option<Detection> {
        if prefix.len() < self.utf8_min_sample && (prefix.len() as u64) < total_len {
            return None;
        }

        let mut sequences = 0usize;
        let mut i = 0;
        while i < prefix.len() {
            let lead = prefix[i];
            let trail = match lead {
                0x00..=0x7F => {
                    i += 1;
                    continue;
                }
                _ if lead & 0xE0 == 0xC0 => 1,
                _ if lead & 0xF0 == 0xE0 => 2,
                _ if lead & 0xF8 == 0xF0 => 3,
                _ => return None,
            };
            if prefix.len() - i - 1 < trail {
                // cut by the end of the sample
                break;
            }
            if prefix[i + 1..=i + trail].iter().any(|&b| b & 0xC0 != 0x80) {
                return None;
            }
            sequences += 1;
            i += trail + 1;
        }

        (sequences > 0).then(|| Detection::unicode(Encoding::Utf8, Endian::Little, Confidence::Structural))
    }
}

fn bom_test(prefix: &[u8]) -> Option<Detection> {
    let detection = match prefix {
        [0xFF, 0xFE, 0x00, 0x00, ..] => Detection::unicode(Encoding::Utf32, Endian::Little, Confidence::ByteOrderMark),
        [0xFF, 0xFE, ..] => Detection::unicode(Encoding::Utf16, Endian::Little, Confidence::ByteOrderMark),
        [0xFE, 0xFF, ..] => Detection::unicode(Encoding::Utf16, Endian::Big, Confidence::ByteOrderMark),
        [0x00, 0x00, 0xFE, 0xFF, ..] => Detection::unicode(Encoding::Utf32, Endian::Big, Confidence::ByteOrderMark),
        [0xEF, 0xBB, 0xBF, ..] => Detection::unicode(Encoding::Utf8, Endian::Little, Confidence::ByteOrderMark),
        _ => return None,
    };
    Some(detection)
}

/// Structural UTF-16 check of a sample. A surrogate pair cut by the end of
/// the sample is accepted unless the sample is the whole file.
pub fn is_valid_utf16(sample: &[u8], endian: Endian, whole_file: bool) -> bool {
    let mut expect_trail = false;
    let (mut lf, mut cr, mut swapped_eol) = (false, false, false);

    for pair in sample.chunks_exact(2) {
        let unit = match endian {
            Endian::Little => u16::from_le_bytes([pair[0], pair[1]]),
            Endian::Big => u16::from_be_bytes([pair[0], pair[1]]),
        };
        if unit == 0 || unit == 0xFFFE || unit == 0xFFFF {
            trace!("Not UTF-16 ({:?}): code unit {:#06x}", endian, unit);
            return false;
        }
        let is_trail = (0xDC00..=0xDFFF).contains(&unit);
        if expect_trail {
            if !is_trail {
                return false;
            }
            expect_trail = false;
            continue;
        }
        if is_trail {
            return false;
        }
        match unit {
            0xD800..=0xDBFF => expect_trail = true,
            LF => lf = true,
            CR => cr = true,
            // Gurmukhi and Malayalam code points that look like CR/LF pairs
            // read with the wrong byte order
            0x0A0A | 0x0A0D | 0x0D0A | 0x0D0D => swapped_eol = true,
            _ => {}
        }
    }

    if expect_trail && whole_file {
        return false;
    }
    !(swapped_eol && !lf && !cr)
}

/// Decode a whole file to UTF-16 code units.
///
/// A leading BOM is dropped, line endings in `eol` are converted to LF and a
/// LF is appended unless the text is empty or already ends with one.
pub fn decode(bytes: &[u8], detection: &Detection, eol: EolConversion, normalize: bool) -> Result<Vec<u16>> {
    let mut text = match detection.encoding {
        Encoding::Utf8 => decode_utf8(bytes)?,
        Encoding::Utf16 => decode_utf16(bytes, detection.endian)?,
        Encoding::Utf32 => decode_utf32(bytes, detection.endian)?,
        Encoding::Ascii8 | Encoding::Auto => {
            decode_single_byte(bytes, detection.codepage.as_deref().unwrap_or(DEFAULT_CODEPAGE))?
        }
    };

    if text.first() == Some(&BOM) {
        text.remove(0);
    }
    convert_eols(&mut text, eol);
    if text.last().map_or(false, |&unit| unit != LF) {
        text.try_reserve(1)?;
        text.push(LF);
    }
    if normalize {
        text = normalize_nfc(&text)?;
    }
    Ok(text)
}

/// Lenient UTF-8 decoding: continuation bytes are masked rather than
/// validated and an incomplete sequence at the end becomes U+FFFD
fn decode_utf8(bytes: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    out.try_reserve(bytes.len())?;

    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let (initial, trail) = match lead {
            0x00..=0x7F => (u32::from(lead), 0),
            0x80..=0xBF => (0xFFFD, 0),
            0xC0..=0xDF => (u32::from(lead & 0x1F), 1),
            0xE0..=0xEF => (u32::from(lead & 0x0F), 2),
            0xF0..=0xF7 => (u32::from(lead & 0x07), 3),
            0xF8..=0xFB => (u32::from(lead & 0x03), 4),
            0xFC..=0xFF => (u32::from(lead & 0x01), 5),
        };
        if i + trail >= bytes.len() {
            out.push(REPLACEMENT);
            break;
        }
        let code_point = bytes[i + 1..=i + trail]
            .iter()
            .fold(initial, |acc, &b| (acc << 6) | u32::from(b & 0x3F));
        push_code_point(&mut out, code_point)?;
        i += trail + 1;
    }
    Ok(out)
}

fn decode_utf16(bytes: &[u8], endian: Endian) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes.len() / 2 + 1)?;
    let pairs = bytes.chunks_exact(2);
    let odd = !pairs.remainder().is_empty();
    out.extend(pairs.map(|pair| match endian {
        Endian::Little => u16::from_le_bytes([pair[0], pair[1]]),
        Endian::Big => u16::from_be_bytes([pair[0], pair[1]]),
    }));
    if odd {
        out.push(REPLACEMENT);
    }
    Ok(out)
}

fn decode_utf32(bytes: &[u8], endian: Endian) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    out.try_reserve(bytes.len() / 4 + 1)?;
    let quads = bytes.chunks_exact(4);
    let partial = !quads.remainder().is_empty();
    for quad in quads {
        let quad = [quad[0], quad[1], quad[2], quad[3]];
        let code_point = match endian {
            Endian::Little => u32::from_le_bytes(quad),
            Endian::Big => u32::from_be_bytes(quad),
        };
        push_code_point(&mut out, code_point)?;
    }
    if partial {
        out.try_reserve(1)?;
        out.push(REPLACEMENT);
    }
    Ok(out)
}

fn push_code_point(out: &mut Vec<u16>, code_point: u32) -> Result<()> {
    if code_point > 0x10FFFF {
        return Err(FileCompError::UnsupportedInput(format!(
            "code point {code_point:#x} is outside the Unicode range"
        )));
    }
    if code_point > 0xFFFF {
        let v = code_point - 0x10000;
        out.try_reserve(2)?;
        out.push(0xD800 + (v >> 10) as u16);
        out.push(0xDC00 + (v & 0x3FF) as u16);
    } else {
        out.try_reserve(1)?;
        out.push(code_point as u16);
    }
    Ok(())
}

fn decode_single_byte(bytes: &[u8], label: &str) -> Result<Vec<u16>> {
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| FileCompError::UnsupportedInput(format!("unknown recoding table '{label}'")))?;

    let mut decoder = encoding.new_decoder_without_bom_handling();
    let capacity = decoder
        .max_utf16_buffer_length(bytes.len())
        .ok_or(FileCompError::OutOfMemory)?;
    let mut out = Vec::new();
    out.try_reserve_exact(capacity + 1)?;
    out.resize(capacity, 0);
    let (_, _, written, _) = decoder.decode_to_utf16(bytes, &mut out, true);
    out.truncate(written);
    Ok(out)
}

/// Convert CR, CRLF and NUL line endings to LF in place, as selected by
/// `mask`. With CRLF selected a CR LF pair becomes a single LF.
pub fn convert_eols(text: &mut Vec<u16>, mask: EolConversion) {
    if mask.is_empty() {
        return;
    }
    let convert_cr = mask.intersects(EolConversion::CR | EolConversion::CRLF);
    let collapse_crlf = mask.contains(EolConversion::CRLF);
    let convert_nul = mask.contains(EolConversion::NUL);

    let mut dst = 0;
    let mut src = 0;
    while src < text.len() {
        let unit = text[src];
        text[dst] = if unit == CR && convert_cr {
            if collapse_crlf && text.get(src + 1) == Some(&LF) {
                src += 1;
            }
            LF
        } else if unit == 0 && convert_nul {
            LF
        } else {
            unit
        };
        src += 1;
        dst += 1;
    }
    text.truncate(dst);
}

fn normalize_nfc(text: &[u16]) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    out.try_reserve(text.len())?;
    let chars = char::decode_utf16(text.iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER));
    let mut units = [0u16; 2];
    for c in chars.nfc() {
        out.extend_from_slice(c.encode_utf16(&mut units));
    }
    Ok(out)
}
