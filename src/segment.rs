//! Sentence segmentation and token-bounded chunk packing.
//!
//! Text is split on sentence terminators, then sentences are greedily
//! packed into chunks up to a token budget. When a chunk overflows, a
//! trailing window of sentences is carried into the next chunk so adjacent
//! chunks overlap. Token counting is approximate (whitespace words) and
//! pluggable.

/// Split text into sentences at `.`, `!`, or `?` followed by whitespace.
///
/// Fragments shorter than `min_chars` characters are dropped; pass 0 to
/// keep everything. Runs of terminators (`¡Bien!!`) end one sentence.
pub fn split_sentences(text: &str, min_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            // Swallow the rest of a terminator run before checking for a
            // boundary.
            let next = chars.peek().map(|&(_, n)| n);
            if matches!(next, Some('.') | Some('!') | Some('?')) {
                continue;
            }
            if next.is_none() || next.is_some_and(char::is_whitespace) {
                let end = idx + c.len_utf8();
                push_sentence(&mut sentences, &text[start..end], min_chars);
                start = end;
            }
        }
    }

    push_sentence(&mut sentences, &text[start..], min_chars);
    sentences
}

fn push_sentence(out: &mut Vec<String>, raw: &str, min_chars: usize) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.chars().count() >= min_chars {
        out.push(trimmed.to_string());
    }
}

/// Whitespace word count — an approximation, not a tokenizer count.
pub fn approx_tokens(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Greedily pack sentences into `(text, token_count)` chunks.
///
/// When adding the next sentence would push the buffer past `max_tokens`,
/// the buffer is emitted and sentences are popped from its front until the
/// carried tokens drop to at most `overlap`. A single sentence longer than
/// `max_tokens` is emitted whole rather than split mid-sentence.
pub fn pack_sentences<F>(
    sentences: &[String],
    max_tokens: usize,
    overlap: usize,
    count: F,
) -> Vec<(String, usize)>
where
    F: Fn(&str) -> usize,
{
    let mut chunks: Vec<(String, usize)> = Vec::new();
    let mut buf: std::collections::VecDeque<(&str, usize)> = std::collections::VecDeque::new();
    let mut buf_tokens = 0usize;

    for sentence in sentences {
        let tokens = count(sentence);
        if buf_tokens + tokens > max_tokens && !buf.is_empty() {
            chunks.push((join_buffer(&buf), buf_tokens));
            while let Some(&(_, front_tokens)) = buf.front() {
                if buf_tokens <= overlap {
                    break;
                }
                buf_tokens -= front_tokens;
                buf.pop_front();
            }
        }
        buf.push_back((sentence.as_str(), tokens));
        buf_tokens += tokens;
    }

    if !buf.is_empty() {
        chunks.push((join_buffer(&buf), buf_tokens));
    }

    chunks
}

fn join_buffer(buf: &std::collections::VecDeque<(&str, usize)>) -> String {
    buf.iter()
        .map(|&(s, _)| s)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full segmentation: sentence split with the configured boilerplate
/// threshold, then packing with the default token counter. Non-empty
/// input always yields at least one chunk.
pub fn segment(
    text: &str,
    max_tokens: usize,
    overlap: usize,
    min_sentence_chars: usize,
) -> Vec<(String, usize)> {
    let sentences = split_sentences(text, min_sentence_chars);
    if sentences.is_empty() {
        // Everything fell under the fragment threshold; keep the raw text
        // rather than losing the document.
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![(trimmed.to_string(), approx_tokens(trimmed))];
    }
    pack_sentences(&sentences, max_tokens, overlap, approx_tokens)
}
