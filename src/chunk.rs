//! Splitting of long lines into request-sized chunks.
//!
//! Chunks are borrowed slices of the input and concatenate back to it
//! exactly. Limits count characters, not bytes. A chunk only exceeds the
//! limit when it holds a single oversized token, or when a whitespace run is
//! too long to fit beside any content. The preceding chunk absorbs as much of
//! such a run as the limit allows; the remainder leads the next chunk.

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '…'];
const CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’'];

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Cuts fall on or inside whitespace, preferring the end of a sentence when
/// one lies in the second half of the window. Every chunk contains
/// non-whitespace; whitespace-only input yields no chunks.
pub fn plan(text: &str, max_chars: usize) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let Some(last_content) = chars.iter().rposition(|(_, c)| !c.is_whitespace()) else {
        return Vec::new();
    };
    let max_chars = max_chars.max(1);
    let n = chars.len();
    let byte_at = |pos: usize| chars.get(pos).map_or(text.len(), |(b, _)| *b);

    // any position not inside a word is a cut candidate
    let is_cut = |p: usize| {
        p > 0 && p < n && (chars[p - 1].1.is_whitespace() || chars[p].1.is_whitespace())
    };

    let mut chunks = Vec::new();
    let mut start = 0;
    while n - start > max_chars {
        let first_content = (start..n)
            .find(|&p| !chars[p].1.is_whitespace())
            .unwrap_or(n);
        // both sides of a cut must keep some content
        let valid = |p: usize| is_cut(p) && p > first_content && p <= last_content;

        let window_end = start + max_chars;
        let mut best = None;
        let mut best_sentence = None;
        for p in (start + 1..=window_end).filter(|&p| valid(p)) {
            best = Some(p);
            if p - start >= max_chars / 2 && ends_sentence(&chars[start..p]) {
                best_sentence = Some(p);
            }
        }

        let cut = best_sentence
            .or(best)
            .or_else(|| (window_end + 1..n).find(|&p| valid(p)));
        let Some(cut) = cut else {
            break;
        };
        chunks.push(&text[byte_at(start)..byte_at(cut)]);
        start = cut;
    }
    chunks.push(&text[byte_at(start)..]);
    chunks
}

fn ends_sentence(chars: &[(usize, char)]) -> bool {
    chars
        .iter()
        .rev()
        .map(|(_, c)| *c)
        .find(|c| !c.is_whitespace() && !CLOSERS.contains(c))
        .is_some_and(|c| SENTENCE_ENDS.contains(&c))
}
