//! Splitting text into segments small enough for one synthesis request.
//!
//! Sentences are detected with a punctuation heuristic only: a word closes a
//! sentence when it ends with one of the terminators below. Sentences are packed
//! into segments until the next one would push the segment past the size
//! target. A sentence longer than the target still becomes a single segment.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(usize);

impl SegmentId {
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    /// Name of the entry holding this segment's audio inside a checkpoint.
    pub fn payload_entry(self) -> String {
        format!("audio/{:06}.mp3", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: SegmentId,
    text: String,
    audio: Option<PathBuf>,
}

impl Segment {
    pub fn new(id: SegmentId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            audio: None,
        }
    }

    pub(crate) fn with_audio(id: SegmentId, text: String, audio: Option<PathBuf>) -> Self {
        Self { id, text, audio }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn audio(&self) -> Option<&Path> {
        self.audio.as_deref()
    }

    /// True when the segment still needs a synthesis call.
    pub fn is_pending(&self) -> bool {
        self.audio.is_none() && !self.text.is_empty()
    }

    pub fn attach_audio(&mut self, path: PathBuf) {
        debug_assert!(self.audio.is_none(), "audio of segment {} set twice", self.id);
        self.audio = Some(path);
    }
}

/// Splits `text` and numbers the resulting segments in document order.
pub fn build_segments(text: &str, max_size: usize) -> Vec<Segment> {
    segment_text(text, max_size)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Segment::new(SegmentId::new(index), text))
        .collect()
}

/// Splits `text` into ordered segments of roughly `max_size` characters.
///
/// The last element may be empty; callers skip empty segments.
pub fn segment_text(text: &str, max_size: usize) -> Vec<String> {
    let mut packer = Packer::new(max_size);

    for line in text.lines() {
        let mut words = line.split_whitespace().peekable();
        if words.peek().is_none() {
            packer.flush_paragraph();
            continue;
        }
        for word in words {
            packer.push_word(word);
        }
    }

    packer.finish()
}

/// Counts how many terminator classes `word` ends with; only exactly one closes
/// a sentence.
fn closes_sentence(word: &str) -> bool {
    SENTENCE_TERMINATORS
        .iter()
        .filter(|terminator| word.ends_with(**terminator))
        .count()
        == 1
}

struct Packer {
    max_size: usize,
    segments: Vec<String>,
    segment: String,
    segment_chars: usize,
    sentence: String,
    sentence_chars: usize,
}

impl Packer {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            segments: Vec::new(),
            segment: String::new(),
            segment_chars: 0,
            sentence: String::new(),
            sentence_chars: 0,
        }
    }

    fn push_word(&mut self, word: &str) {
        if !self.sentence.is_empty() {
            self.sentence.push(' ');
            self.sentence_chars += 1;
        }
        self.sentence.push_str(word);
        self.sentence_chars += word.chars().count();

        if closes_sentence(word) {
            self.close_sentence();
        }
    }

    fn close_sentence(&mut self) {
        if self.sentence.is_empty() {
            return;
        }
        let separator = usize::from(!self.segment.is_empty());
        if self.segment_chars + separator + self.sentence_chars > self.max_size {
            self.flush_segment();
        }
        if !self.segment.is_empty() {
            self.segment.push(' ');
            self.segment_chars += 1;
        }
        self.segment.push_str(&self.sentence);
        self.segment_chars += self.sentence_chars;
        self.sentence.clear();
        self.sentence_chars = 0;
    }

    fn flush_segment(&mut self) {
        if !self.segment.is_empty() {
            self.segments.push(std::mem::take(&mut self.segment));
        }
        self.segment_chars = 0;
    }

    /// A blank line ends the segment and any unterminated sentence separately.
    fn flush_paragraph(&mut self) {
        self.flush_segment();
        if !self.sentence.is_empty() {
            self.segments.push(std::mem::take(&mut self.sentence));
        }
        self.sentence_chars = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.close_sentence();
        self.segments.push(self.segment);
        self.segments
    }
}
