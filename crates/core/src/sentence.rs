use crate::generic_types::TextChunk;

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Buffers streamed reply text and cuts it into sentences for synthesis.
///
/// A sentence ends after a run of `.`, `!` or `?`, once the next character
/// is known. A single `.` between two digits is a decimal point. Each
/// sentence gets the next partial-response index, starting at 0.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
    next_index: u32,
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn push(&mut self, delta: &str) -> Vec<TextChunk> {
        self.buffer.push_str(delta);

        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut pieces = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i].1;
            if !is_terminator(c) {
                i += 1;
                continue;
            }

            let mut j = i;
            while j < chars.len() && is_terminator(chars[j].1) {
                j += 1;
            }
            if j == chars.len() {
                break;
            }

            let decimal = c == '.'
                && j == i + 1
                && i > 0
                && chars[i - 1].1.is_ascii_digit()
                && chars[j].1.is_ascii_digit();
            if !decimal {
                let end = chars[j].0;
                pieces.push(self.buffer[start..end].to_string());
                start = end;
            }
            i = j;
        }

        self.buffer.drain(..start);
        pieces.into_iter().filter_map(|p| self.chunk(&p)).collect()
    }

    /// Emits whatever is left in the buffer.
    pub fn flush(&mut self) -> Option<TextChunk> {
        let rest = std::mem::take(&mut self.buffer);
        self.chunk(&rest)
    }

    /// Drops buffered text and restarts numbering at 0.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_index = 0;
    }

    fn chunk(&mut self, piece: &str) -> Option<TextChunk> {
        let text = piece.trim();
        if !text.chars().any(char::is_alphanumeric) {
            return None;
        }
        let chunk = TextChunk::indexed(self.next_index, text);
        self.next_index += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[TextChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn splits_streamed_deltas_into_indexed_sentences() {
        let mut chunker = SentenceChunker::new();
        let mut chunks = Vec::new();
        for delta in ["Hello", " there! How", " are you? I'm", " fine"] {
            chunks.extend(chunker.push(delta));
        }
        chunks.extend(chunker.flush());

        assert_eq!(texts(&chunks), vec!["Hello there!", "How are you?", "I'm fine"]);
        let indices: Vec<_> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn waits_for_the_character_after_a_terminator() {
        let mut chunker = SentenceChunker::new();
        assert!(chunker.push("It costs 3.").is_empty());
        assert!(chunker.push("50 dollars.").is_empty());
        let chunks = chunker.push(" Anything else?!");
        assert_eq!(texts(&chunks), vec!["It costs 3.50 dollars."]);
        assert_eq!(chunker.flush().unwrap().text, "Anything else?!");
    }

    #[test]
    fn punctuation_only_pieces_do_not_use_an_index() {
        let mut chunker = SentenceChunker::new();
        let chunks = chunker.push("... Sure. ");
        assert_eq!(texts(&chunks), vec!["Sure."]);
        assert_eq!(chunks[0].index, Some(0));
        assert_eq!(chunker.next_index(), 1);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut chunker = SentenceChunker::new();
        chunker.push("One. Two. Thr");
        assert_eq!(chunker.next_index(), 2);
        chunker.reset();
        assert!(chunker.flush().is_none());
        assert_eq!(chunker.push("Again. ")[0].index, Some(0));
    }
}
