//! Text pattern detection for failure and panic messages
//!
//! Some failures only reveal their nature through their message: legacy network stacks
//! report resets as plain text, and most panics carry nothing but a formatted string.

use regex::Regex;
use std::sync::OnceLock;

/// Best-effort description of what a panic looked like.
///
/// Only used to enrich log lines; it never changes the outcome of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanicShape {
    /// Index or slice range out of bounds.
    OutOfBounds,
    /// Unwrapping an absent value or dereferencing a null pointer.
    NullDereference,
    /// Arithmetic overflow or division by zero.
    Arithmetic,
    /// The payload was a structured error value.
    RuntimeFault,
    /// Some other textual message.
    Message,
    /// A payload that is neither text nor a known error value.
    Opaque,
}

impl PanicShape {
    /// Returns the log line describing this shape.
    pub fn description(self) -> &'static str {
        match self {
            PanicShape::OutOfBounds => "array/slice bounds panic detected",
            PanicShape::NullDereference => "null dereference panic detected",
            PanicShape::Arithmetic => "arithmetic panic detected",
            PanicShape::RuntimeFault => "runtime fault panic detected",
            PanicShape::Message => "string panic",
            PanicShape::Opaque => "unknown panic type",
        }
    }
}

/// A regex paired with the category it signals.
#[derive(Debug)]
pub(crate) struct TextPattern<C> {
    regex: Regex,
    category: C,
}

impl<C: Copy> TextPattern<C> {
    /// Creates a new pattern, failing if the regex does not compile.
    pub(crate) fn new(pattern: &str, category: C) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            category,
        })
    }

    pub(crate) fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// An ordered set of patterns; the first match wins.
#[derive(Debug)]
pub(crate) struct PatternDetector<C> {
    patterns: Vec<TextPattern<C>>,
}

impl<C: Copy> PatternDetector<C> {
    pub(crate) fn with_patterns(patterns: Vec<TextPattern<C>>) -> Self {
        Self { patterns }
    }

    /// Returns the category of the first pattern matching `text`.
    pub(crate) fn category_of(&self, text: &str) -> Option<C> {
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(text))
            .map(|pattern| pattern.category)
    }

    fn from_table(table: &[(&str, C)]) -> Self {
        // Table entries are literals; one that fails to compile is dropped rather than
        // taking the process down.
        let patterns = table
            .iter()
            .filter_map(|(pattern, category)| TextPattern::new(pattern, *category).ok())
            .collect();
        Self::with_patterns(patterns)
    }
}

/// Returns true if `text` reads like a transport reset.
///
/// These substrings come from one particular network stack. Structured error kinds are
/// checked before this is consulted.
pub(crate) fn is_transport_reset(text: &str) -> bool {
    static RESET: OnceLock<Option<Regex>> = OnceLock::new();
    RESET
        .get_or_init(|| {
            Regex::new(
                r"(?i)connection reset by peer|broken pipe|context canceled|context deadline exceeded",
            )
            .ok()
        })
        .as_ref()
        .is_some_and(|regex| regex.is_match(text))
}

/// Returns the shared detector for textual panic payloads.
pub(crate) fn panic_message_detector() -> &'static PatternDetector<PanicShape> {
    static DETECTOR: OnceLock<PatternDetector<PanicShape>> = OnceLock::new();
    DETECTOR.get_or_init(|| {
        PatternDetector::from_table(&[
            (
                r"(?i)index out of (range|bounds)|slice (bounds out of range|index starts at)|range (start|end) index",
                PanicShape::OutOfBounds,
            ),
            (
                r"(?i)on a `None` value|null pointer|nil pointer dereference",
                PanicShape::NullDereference,
            ),
            (
                r"(?i)attempt to (add|subtract|multiply|negate|shift (left|right)) with overflow|divide by zero|remainder with a divisor of zero",
                PanicShape::Arithmetic,
            ),
        ])
    })
}
