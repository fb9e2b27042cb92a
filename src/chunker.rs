use crate::error::{RagError, Result};

/// A bounded window of a document's concatenated text, tagged with the
/// 1-based page its first character falls on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub page: i32,
}

/// Splits per-page document text into fixed-size overlapping windows.
///
/// Sizes are counted in Unicode scalar values, so a window never lands
/// inside a multi-byte sequence. Consecutive windows share `overlap`
/// characters; the final window may be shorter and the walk stops once
/// a window reaches the end of the text.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(RagError::Config("max_chunk_size must be positive".into()));
        }
        if overlap >= max_chunk_size {
            return Err(RagError::Config(format!(
                "chunk overlap ({overlap}) must be smaller than max_chunk_size ({max_chunk_size})"
            )));
        }
        Ok(Self {
            max_chunk_size,
            overlap,
        })
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Splits the ordered per-page texts into chunks.
    ///
    /// Pages are concatenated into one buffer while recording each
    /// page's cumulative end offset; a chunk's page is the first page
    /// whose cumulative end lies beyond the chunk's start. Empty pages
    /// contribute only a boundary. Deterministic for a given input and
    /// configuration.
    pub fn split(&self, page_texts: &[String]) -> Vec<TextChunk> {
        let mut full = String::new();
        let mut page_ends = Vec::with_capacity(page_texts.len());
        let mut total_chars = 0usize;
        for page in page_texts {
            total_chars += page.chars().count();
            full.push_str(page);
            page_ends.push(total_chars);
        }

        if total_chars == 0 {
            return Vec::new();
        }

        // Byte offset of every char boundary, so char windows can be
        // sliced without re-scanning the buffer.
        let mut char_starts: Vec<usize> = Vec::with_capacity(total_chars + 1);
        char_starts.extend(full.char_indices().map(|(b, _)| b));
        char_starts.push(full.len());

        let mut chunks = Vec::new();
        let mut pos = 0usize;
        let mut page_cursor = 0usize;

        loop {
            let end = (pos + self.max_chunk_size).min(total_chars);

            while page_cursor < page_ends.len() && pos >= page_ends[page_cursor] {
                page_cursor += 1;
            }
            let page = (page_cursor + 1) as i32;

            let text = full[char_starts[pos]..char_starts[end]].to_string();
            chunks.push(TextChunk { text, page });

            if end == total_chars {
                break;
            }
            pos = if end - pos > self.overlap {
                end - self.overlap
            } else {
                end
            };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    /// Reassembles the original text by dropping each later chunk's
    /// leading overlap region.
    fn reassemble(chunker: &Chunker, chunks: &[TextChunk]) -> String {
        let mut out = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&chunk.text);
            } else {
                let skipped: String = chunk.text.chars().skip(chunker.overlap()).collect();
                out.push_str(&skipped);
            }
        }
        out
    }

    #[test]
    fn rejects_overlap_not_smaller_than_window() {
        assert!(Chunker::new(100, 100).is_err());
        assert!(Chunker::new(100, 150).is_err());
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(100, 99).is_ok());
    }

    #[test]
    fn empty_input_produces_no_chunks() {
        let chunker = Chunker::new(10, 2).unwrap();
        assert!(chunker.split(&[]).is_empty());
        assert!(chunker.split(&pages(&["", "", ""])).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk_on_page_one() {
        let chunker = Chunker::new(100, 10).unwrap();
        let chunks = chunker.split(&pages(&["short page"]));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short page");
        assert_eq!(chunks[0].page, 1);
    }

    #[test]
    fn chunk_count_matches_window_arithmetic() {
        // N = ceil((len - overlap) / (max - overlap)) once len > max.
        let chunker = Chunker::new(4, 1).unwrap();
        let text = "abcdefghij"; // len 10
        let chunks = chunker.split(&pages(&[text]));
        assert_eq!(chunks.len(), 3); // ceil(9 / 3)
        assert_eq!(chunks[0].text, "abcd");
        assert_eq!(chunks[1].text, "defg");
        assert_eq!(chunks[2].text, "ghij");

        let chunks = chunker.split(&pages(&["abcdefghijk"])); // len 11
        assert_eq!(chunks.len(), 4); // ceil(10 / 3)
        assert_eq!(chunks[3].text, "jk");
    }

    #[test]
    fn overlap_regions_match_between_neighbours() {
        let chunker = Chunker::new(8, 3).unwrap();
        let text = "the quick brown fox jumps over the lazy dog";
        let chunks = chunker.split(&pages(&[text]));
        for pair in chunks.windows(2) {
            let tail: String = pair[0]
                .text
                .chars()
                .skip(pair[0].text.chars().count() - 3)
                .collect();
            let head: String = pair[1].text.chars().take(3).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn reassembly_recovers_the_concatenated_text() {
        let chunker = Chunker::new(7, 2).unwrap();
        let input = pages(&["first page text ", "second page", " and a third"]);
        let chunks = chunker.split(&input);
        assert_eq!(reassemble(&chunker, &chunks), input.concat());
    }

    #[test]
    fn page_numbers_follow_window_starts() {
        let chunker = Chunker::new(5, 1).unwrap();
        // Page 1 covers chars [0, 6), page 2 covers [6, 12).
        let chunks = chunker.split(&pages(&["aaaaaa", "bbbbbb"]));
        assert_eq!(chunks[0].page, 1); // starts at 0
        assert_eq!(chunks[1].page, 1); // starts at 4
        assert_eq!(chunks[2].page, 2); // starts at 8
        for pair in chunks.windows(2) {
            assert!(pair[0].page <= pair[1].page);
        }
    }

    #[test]
    fn empty_pages_only_shift_boundaries() {
        let chunker = Chunker::new(4, 1).unwrap();
        let chunks = chunker.split(&pages(&["", "abcdef", ""]));
        assert!(!chunks.is_empty());
        // All content sits on page 2; the empty first page is skipped.
        assert!(chunks.iter().all(|c| c.page == 2));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let chunker = Chunker::new(4, 1).unwrap();
        let chunks = chunker.split(&pages(&["héllo wörld ünïcode"]));
        let total: usize = chunks[0].text.chars().count();
        assert_eq!(total, 4);
        assert_eq!(reassemble(&chunker, &chunks), "héllo wörld ünïcode");
    }

    #[test]
    fn pages_are_monotone_over_many_pages() {
        let chunker = Chunker::new(10, 3).unwrap();
        let input: Vec<String> = (0..8).map(|i| format!("page {i} body text. ")).collect();
        let chunks = chunker.split(&input);
        assert!(!chunks.is_empty());
        for pair in chunks.windows(2) {
            assert!(pair[0].page <= pair[1].page);
        }
        assert!(chunks.iter().all(|c| c.page >= 1 && c.page <= 8));
    }
}
