//! Phrase segmentation
//!
//! Accumulates response fragments and cuts speakable phrases off the front
//! of the buffer as early as possible:
//!
//! 1. at the first punctuation boundary (`, . ! ?`, optionally `: ;`),
//!    i.e. a run of marks followed by whitespace or the end of the buffer
//! 2. failing that, once the buffer is longer than the phrase limit, at the
//!    last whitespace that keeps the phrase within the limit, or the whole buffer
//!
//! A mark between two digits ("3.14", "1,5") is never a boundary, and a mark
//! right after a digit at the end of the buffer waits for the next fragment.

use crate::config::Config;

const SENTENCE_MARKS: [char; 4] = [',', '.', '!', '?'];
const CLAUSE_MARKS: [char; 2] = [':', ';'];

#[derive(Debug, Clone)]
pub struct PhraseSegmenter {
    buffer: String,
    max_chars: usize,
    clause_marks: bool,
}

impl PhraseSegmenter {
    pub fn new(max_chars: usize, clause_marks: bool) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
            clause_marks,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_phrase_chars, config.clause_marks)
    }

    /// Text received but not yet emitted
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a fragment and return every phrase it completes, in order
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut phrases = Vec::new();
        while let Some(cut) = self.next_cut() {
            let rest = self.buffer.split_off(cut);
            let phrase = std::mem::replace(&mut self.buffer, rest);
            let phrase = phrase.trim();
            if !phrase.is_empty() {
                phrases.push(phrase.to_string());
            }
        }
        phrases
    }

    /// End of stream: whatever is left becomes the last phrase
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    /// Stream failed: drop the unterminated tail
    pub fn discard(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn is_mark(&self, c: char) -> bool {
        SENTENCE_MARKS.contains(&c) || (self.clause_marks && CLAUSE_MARKS.contains(&c))
    }

    /// Byte offset where the next phrase ends, if any trigger fires
    fn next_cut(&self) -> Option<usize> {
        if self.buffer.trim().is_empty() {
            return None;
        }

        let boundary = self.boundary();
        if let Some(end) = boundary {
            if self.buffer[..end].trim().chars().count() <= self.max_chars {
                return Some(end);
            }
        }
        if self.buffer.trim_start().chars().count() > self.max_chars {
            return Some(
                self.length_break()
                    .or(boundary)
                    .unwrap_or(self.buffer.len()),
            );
        }
        boundary
    }

    /// End of the first mark run that is followed by whitespace or ends the buffer,
    /// including the whitespace after it
    fn boundary(&self) -> Option<usize> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut i = 0;
        while i < chars.len() {
            if !self.is_mark(chars[i].1) {
                i += 1;
                continue;
            }

            let start = i;
            while i < chars.len() && self.is_mark(chars[i].1) {
                i += 1;
            }
            let after_digit = start > 0 && chars[start - 1].1.is_ascii_digit();
            // Marks with no words before them ride along with the next phrase
            let has_words = chars[..start].iter().any(|(_, c)| c.is_alphanumeric());

            if i == chars.len() {
                // "3." might still become "3.14"
                if !has_words
                    || (after_digit && i - start == 1 && matches!(chars[start].1, '.' | ','))
                {
                    return None;
                }
                return Some(self.buffer.len());
            }
            if chars[i].1.is_whitespace() {
                while i < chars.len() && chars[i].1.is_whitespace() {
                    i += 1;
                }
                if has_words {
                    return Some(chars.get(i).map_or(self.buffer.len(), |(offset, _)| *offset));
                }
            }
        }
        None
    }

    /// Cut after the last whitespace that keeps the phrase within the limit
    fn length_break(&self) -> Option<usize> {
        let leading = self.buffer.len() - self.buffer.trim_start().len();
        self.buffer
            .char_indices()
            .skip_while(|(offset, _)| *offset < leading)
            .take(self.max_chars + 1)
            .filter(|(_, c)| c.is_whitespace())
            .map(|(offset, c)| offset + c.len_utf8())
            .filter(|end| !self.buffer[..*end].trim().is_empty())
            .last()
    }
}
