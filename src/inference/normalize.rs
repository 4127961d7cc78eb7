//! Response text normalization
//!
//! Models running on a plain transcript prompt often echo role markers or stock
//! openers, run past the end of their turn, and emit markdown blocks without the
//! blank line renderers need. This module cleans the streamed text:
//!
//! - [`PrefixStripper`] removes known labels and openers from the start of the
//!   text and of every line.
//! - [`MarkdownLayout`] inserts blank lines before block elements.
//! - [`ResponseNormalizer`] drives both over a token stream and cuts the response
//!   at stop sequences.

use once_cell::sync::Lazy;
use regex::Regex;

/// Role labels stripped from the start of a response
pub const ROLE_LABELS: &[&str] = &[
    "Assistant:",
    "AI:",
    "Bot:",
    "User:",
    "Human:",
    "Question:",
    "Answer:",
];

/// Stock openers that carry no content
pub const FILLER_OPENERS: &[&str] = &[
    "Let me help you with that.",
    "I'll help you with that.",
    "Here's what I can tell you:",
    "Here's what I found:",
    "Let me explain:",
    "Here's the answer:",
];

/// Case-insensitive prefix table, longest pattern first
#[derive(Debug, Clone)]
pub struct PrefixStripper {
    patterns: Vec<String>,
}

impl Default for PrefixStripper {
    fn default() -> Self {
        Self::new(ROLE_LABELS.iter().chain(FILLER_OPENERS.iter()).copied())
    }
}

impl PrefixStripper {
    /// Build a table from ASCII patterns. Non-ASCII and empty patterns are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut patterns: Vec<String> = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p| !p.is_empty() && p.is_ascii())
            .collect();
        patterns.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        patterns.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        Self { patterns }
    }

    /// Add patterns to the table, keeping longest-first order
    pub fn with_patterns<I, S>(self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(self.patterns.into_iter().chain(extra.into_iter().map(Into::into)))
    }

    /// Byte length of the longest pattern `text` starts with
    fn match_len(&self, text: &str) -> Option<usize> {
        let bytes = text.as_bytes();
        // Patterns are ASCII, so a match ends on a char boundary
        self.patterns
            .iter()
            .find(|p| bytes.len() >= p.len() && bytes[..p.len()].eq_ignore_ascii_case(p.as_bytes()))
            .map(|p| p.len())
    }

    /// Whether `text` could still grow into one of the patterns
    pub fn is_partial_match(&self, text: &str) -> bool {
        let text = text.trim_start().as_bytes();
        !text.is_empty()
            && self
                .patterns
                .iter()
                .any(|p| p.len() > text.len() && p.as_bytes()[..text.len()].eq_ignore_ascii_case(text))
    }

    fn strip_line<'a>(&self, line: &'a str) -> &'a str {
        let mut rest = line;
        let mut stripped = false;
        loop {
            let candidate = rest.trim_start();
            match self.match_len(candidate) {
                Some(len) => {
                    rest = &candidate[len..];
                    stripped = true;
                }
                None => break,
            }
        }
        if stripped {
            rest.trim_start()
        } else {
            line
        }
    }

    /// Remove patterns from the start of the text and of every line.
    ///
    /// Leading whitespace of the result is trimmed. Idempotent.
    pub fn strip(&self, text: &str) -> String {
        let lines: Vec<&str> = text.split('\n').map(|line| self.strip_line(line)).collect();
        lines.join("\n").trim_start().to_string()
    }
}

/// Line-start markers of markdown block elements
static BLOCK_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<fence>```|~~~)|(?P<heading>#{1,6}(?:[ \t]|$))|(?P<list>(?:[-*+]|\d{1,9}[.)])(?:[ \t]|$))|(?P<quote>>))")
        .expect("block pattern is valid")
});

/// Line starts that can still turn into a different block marker (`1` -> `1.`, `` ` `` -> ```` ``` ````)
static OPEN_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:#{1,6}|[-*+]|\d{1,9}[.)]?|`{1,2}|~{1,2})$").expect("marker pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Text,
    Heading,
    List,
    Quote,
    Fence,
    Code,
}

fn classify(line_start: &str) -> LineKind {
    match BLOCK_START.captures(line_start) {
        Some(caps) if caps.name("fence").is_some() => LineKind::Fence,
        Some(caps) if caps.name("heading").is_some() => LineKind::Heading,
        Some(caps) if caps.name("list").is_some() => LineKind::List,
        Some(_) => LineKind::Quote,
        None => LineKind::Text,
    }
}

/// Whether a chunk can contain the start of a block element
pub fn needs_layout(chunk: &str) -> bool {
    chunk.contains('\n') || BLOCK_START.is_match(chunk.trim_start_matches([' ', '\t']))
}

/// Streaming markdown spacer
///
/// Keeps state across the chunks of one response so a block element is detected
/// wherever its line begins. Only newlines are ever inserted.
#[derive(Debug, Clone)]
pub struct MarkdownLayout {
    at_line_start: bool,
    seen_text: bool,
    newlines_since_text: usize,
    in_fence: bool,
    last_kind: LineKind,
    /// Start of the current line, held until its block kind is known
    pending: String,
}

impl Default for MarkdownLayout {
    fn default() -> Self {
        Self {
            at_line_start: true,
            seen_text: false,
            newlines_since_text: 0,
            in_fence: false,
            last_kind: LineKind::Text,
            pending: String::new(),
        }
    }
}

impl MarkdownLayout {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, segment: &str) {
        for ch in segment.chars() {
            if ch == '\n' {
                self.newlines_since_text += 1;
            } else if !ch.is_whitespace() {
                self.newlines_since_text = 0;
                self.seen_text = true;
            }
        }
    }

    /// Newlines to insert before a line of `kind`
    fn spacing_before(&mut self, kind: LineKind) -> usize {
        let continues_block = matches!(
            (self.last_kind, kind),
            (LineKind::List, LineKind::List) | (LineKind::Quote, LineKind::Quote)
        );

        let needed = if self.in_fence {
            if kind == LineKind::Fence {
                self.in_fence = false;
            }
            self.last_kind = if kind == LineKind::Fence { LineKind::Fence } else { LineKind::Code };
            return 0;
        } else if kind == LineKind::Text || continues_block || !self.seen_text {
            0
        } else {
            2usize.saturating_sub(self.newlines_since_text)
        };

        if kind == LineKind::Fence {
            self.in_fence = true;
        }
        self.last_kind = kind;
        needed
    }

    /// Lay out one chunk
    ///
    /// A line start that could still become a block marker is held back and
    /// released with a later chunk or by [`finish`](Self::finish).
    pub fn format(&mut self, chunk: &str) -> String {
        self.layout(chunk, false)
    }

    /// Release any held line start
    pub fn finish(&mut self) -> String {
        self.layout("", true)
    }

    fn layout(&mut self, chunk: &str, last: bool) -> String {
        if self.pending.is_empty() && !self.at_line_start && !needs_layout(chunk) {
            self.track(chunk);
            return chunk.to_string();
        }

        let mut combined = std::mem::take(&mut self.pending);
        combined.push_str(chunk);

        let mut out = String::with_capacity(combined.len() + 2);
        let mut rest = combined.as_str();
        while !rest.is_empty() {
            if self.at_line_start {
                let body = rest.trim_start_matches([' ', '\t']);
                if body.is_empty() {
                    out.push_str(rest);
                    self.track(rest);
                    break;
                }
                if !last && OPEN_MARKER.is_match(body) {
                    self.pending = rest.to_string();
                    break;
                }
                if !body.starts_with('\n') && !body.starts_with('\r') {
                    let inserted = self.spacing_before(classify(body));
                    for _ in 0..inserted {
                        out.push('\n');
                    }
                    self.newlines_since_text += inserted;
                    self.at_line_start = false;
                }
            }

            match rest.find('\n') {
                Some(idx) => {
                    let (line, tail) = rest.split_at(idx + 1);
                    out.push_str(line);
                    self.track(line);
                    self.at_line_start = true;
                    rest = tail;
                }
                None => {
                    out.push_str(rest);
                    self.track(rest);
                    break;
                }
            }
        }
        out
    }
}

/// Minimum trimmed length before the opening of a response is released
pub const DEFAULT_MIN_PREFIX_LEN: usize = 3;

/// Per-response stream cleaner
///
/// The opening is buffered until it is long enough to tell whether it starts with
/// a label, prefix-stripped once, and released. Later chunks pass through the
/// markdown layout unchanged otherwise. Text that could be the start of a stop
/// sequence is held back until it is disambiguated.
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    stripper: PrefixStripper,
    layout: MarkdownLayout,
    stop_sequences: Vec<String>,
    min_prefix_len: usize,
    buffer: String,
    started: bool,
    stopped: bool,
}

impl ResponseNormalizer {
    pub fn new(stripper: PrefixStripper, stop_sequences: Vec<String>, min_prefix_len: usize) -> Self {
        Self {
            stripper,
            layout: MarkdownLayout::new(),
            stop_sequences: stop_sequences.into_iter().filter(|s| !s.is_empty()).collect(),
            min_prefix_len,
            buffer: String::new(),
            started: false,
            stopped: false,
        }
    }

    /// True once a stop sequence has been generated
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one generated piece; returns text ready to show, if any
    pub fn push(&mut self, piece: &str) -> Option<String> {
        if self.stopped {
            return None;
        }
        self.buffer.push_str(piece);

        if let Some(idx) = self.find_stop() {
            self.buffer.truncate(idx);
            self.stopped = true;
            return self.finish();
        }

        if !self.started {
            let cleaned = self.stripper.strip(&self.buffer);
            if cleaned.trim().chars().count() <= self.min_prefix_len || self.stripper.is_partial_match(&cleaned) {
                return None;
            }
            self.started = true;
            self.buffer = cleaned;
        }

        let held = self.held_back_len();
        let ready: String = self.buffer.drain(..self.buffer.len() - held).collect();
        self.emit(ready)
    }

    /// Flush whatever is still buffered at the end of the stream
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = if self.started {
            rest
        } else {
            self.started = true;
            self.stripper.strip(&rest)
        };
        let mut out = self.layout.format(&text);
        out.push_str(&self.layout.finish());
        non_empty(out)
    }

    fn emit(&mut self, text: String) -> Option<String> {
        non_empty(self.layout.format(&text))
    }

    fn find_stop(&self) -> Option<usize> {
        self.stop_sequences
            .iter()
            .filter_map(|stop| self.buffer.find(stop.as_str()))
            .min()
    }

    /// Length of the longest buffer suffix that is a proper prefix of a stop sequence
    fn held_back_len(&self) -> usize {
        let mut held = 0;
        for stop in &self.stop_sequences {
            for (idx, _) in stop.char_indices().skip(1) {
                let prefix = &stop[..idx];
                if idx > held && self.buffer.ends_with(prefix) {
                    held = idx;
                }
            }
        }
        held
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
