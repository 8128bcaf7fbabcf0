use std::fmt;

use encoding_rs::{CoderResult, Encoding};
use regex::bytes::Regex as BytesRegex;

use crate::core::JobError;

/// What `expect_output` waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Exact text
    Literal(String),
    /// Regular expression, matched against the raw output bytes or the
    /// decoded output when the program has an encoding
    Regex(String),
    /// The first alternative to show up in the output wins
    Any(Vec<Pattern>),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(expr: impl Into<String>) -> Self {
        Pattern::Regex(expr.into())
    }

    pub(super) fn compile(&self, encoding: Option<&'static Encoding>) -> Result<Matcher, JobError> {
        let alternatives = match self {
            Pattern::Any(alternatives) => alternatives.as_slice(),
            single => std::slice::from_ref(single),
        };

        match encoding {
            Some(encoding) => {
                let regexes = alternatives
                    .iter()
                    .map(|p| p.expr().and_then(|expr| p.build(regex::Regex::new(&expr))))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Matcher::Text { regexes, encoding })
            }
            None => {
                let regexes = alternatives
                    .iter()
                    .map(|p| p.expr().and_then(|expr| p.build(BytesRegex::new(&expr))))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Matcher::Bytes(regexes))
            }
        }
    }

    fn expr(&self) -> Result<String, JobError> {
        match self {
            Pattern::Literal(text) => Ok(regex::escape(text)),
            Pattern::Regex(expr) => Ok(expr.clone()),
            Pattern::Any(_) => Err(JobError::InvalidConfiguration(
                "nested pattern alternatives are not supported".to_string(),
            )),
        }
    }

    fn build<R>(&self, compiled: Result<R, regex::Error>) -> Result<R, JobError> {
        compiled.map_err(|e| {
            JobError::InvalidConfiguration(format!("invalid output pattern {}: {}", self, e))
        })
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Pattern::Literal(text.to_string())
    }
}

impl From<String> for Pattern {
    fn from(text: String) -> Self {
        Pattern::Literal(text)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "'{}'", text),
            Pattern::Regex(expr) => write!(f, "/{}/", expr),
            Pattern::Any(alternatives) => {
                let parts: Vec<String> = alternatives.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Compiled alternatives of a [`Pattern`]
pub(super) enum Matcher {
    /// Raw output bytes
    Bytes(Vec<BytesRegex>),
    /// Output decoded with `encoding`
    Text {
        regexes: Vec<regex::Regex>,
        encoding: &'static Encoding,
    },
}

impl Matcher {
    /// Earliest match in `haystack`; on a tie the lower index wins.
    ///
    /// Returns the alternative index and the end offset of the match in
    /// `haystack` bytes.
    pub(super) fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        match self {
            Matcher::Bytes(regexes) => earliest(
                regexes
                    .iter()
                    .map(|re| re.find(haystack).map(|m| (m.start(), m.end()))),
            ),
            Matcher::Text { regexes, encoding } => {
                let decoded = DecodedOutput::new(*encoding, haystack);
                earliest(
                    regexes
                        .iter()
                        .map(|re| re.find(&decoded.text).map(|m| (m.start(), m.end()))),
                )
                .map(|(index, end)| (index, decoded.source_offset(end)))
            }
        }
    }
}

/// Index and end of the match starting first, lowest index on a tie
fn earliest(matches: impl Iterator<Item = Option<(usize, usize)>>) -> Option<(usize, usize)> {
    matches
        .enumerate()
        .filter_map(|(index, m)| m.map(|(start, end)| (start, index, end)))
        .min_by_key(|&(start, index, _)| (start, index))
        .map(|(_, index, end)| (index, end))
}

/// Output decoded to UTF-8, remembering which input bytes produced which text
struct DecodedOutput {
    text: String,
    /// (text length, input bytes consumed) after each input byte
    offsets: Vec<(usize, usize)>,
}

impl DecodedOutput {
    fn new(encoding: &'static Encoding, bytes: &[u8]) -> Self {
        let mut decoder = encoding.new_decoder_without_bom_handling();
        let mut text = String::with_capacity(bytes.len());
        let mut offsets = Vec::with_capacity(bytes.len());

        // An incomplete trailing sequence stays undecoded until more output arrives
        for (consumed, byte) in bytes.iter().enumerate() {
            let mut input = std::slice::from_ref(byte);
            loop {
                text.reserve(decoder.max_utf8_buffer_length(input.len()).unwrap_or(16));
                let (result, read, _) = decoder.decode_to_string(input, &mut text, false);
                input = &input[read..];
                if let CoderResult::InputEmpty = result {
                    break;
                }
            }
            offsets.push((text.len(), consumed + 1));
        }

        Self { text, offsets }
    }

    /// Number of input bytes needed to produce the text up to `text_end`
    fn source_offset(&self, text_end: usize) -> usize {
        if text_end == 0 {
            return 0;
        }
        let index = self.offsets.partition_point(|&(len, _)| len < text_end);
        self.offsets
            .get(index)
            .or(self.offsets.last())
            .map(|&(_, consumed)| consumed)
            .unwrap_or(0)
    }
}
