//! Cleaning and word-window chunking for email bodies.
//!
//! Bodies are flattened to a single line, quoted replies are cut out, and
//! the remaining words are split into overlapping windows that are each
//! embedded separately.

/// Default window size in words.
pub const DEFAULT_MAX_WORDS: usize = 512;

/// Default number of words shared by adjacent windows.
pub const DEFAULT_OVERLAP: usize = 50;

/// Windows with this many words or fewer are dropped as noise.
pub const MIN_CHUNK_WORDS: usize = 10;

const REPLY_OPENER: &str = "On ";
const REPLY_CLOSER: &str = " wrote:";

/// Normalize an email body for chunking.
///
/// Collapses all whitespace runs (including line breaks) to single spaces,
/// removes the quoted-reply span from the first `"On "` to the last
/// `" wrote:"`, and trims the result.
///
/// # Examples
///
/// ```
/// use threadsearch::chunking::clean_email_body;
///
/// let body = "Sounds good.\r\n\r\nOn Mon, Jane wrote:\n> old text";
/// assert_eq!(clean_email_body(body), "Sounds good.  > old text");
/// ```
pub fn clean_email_body(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_quoted_reply(&flat).trim().to_string()
}

fn strip_quoted_reply(text: &str) -> String {
    let Some(closer) = text.rfind(REPLY_CLOSER) else {
        return text.to_string();
    };

    let opener = text
        .match_indices(REPLY_OPENER)
        .map(|(i, _)| i)
        .find(|&i| i + REPLY_OPENER.len() <= closer);

    match opener {
        Some(start) => {
            let end = closer + REPLY_CLOSER.len();
            format!("{}{}", &text[..start], &text[end..])
        }
        None => text.to_string(),
    }
}

/// Split text into overlapping windows of at most `max_words` words.
///
/// Windows start every `max_words - overlap` words. Only windows with more
/// than [`MIN_CHUNK_WORDS`] words are kept.
///
/// # Examples
///
/// ```
/// use threadsearch::chunking::chunk_words;
///
/// let text = "word ".repeat(30);
/// let chunks = chunk_words(&text, 20, 5);
/// assert_eq!(chunks.len(), 2); // windows at 0 and 15; the one at 30 is empty
/// assert_eq!(chunks[0].split_whitespace().count(), 20);
/// assert_eq!(chunks[1].split_whitespace().count(), 15);
/// ```
pub fn chunk_words(text: &str, max_words: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let max_words = max_words.max(1);
    let step = max_words.saturating_sub(overlap).max(1);

    (0..words.len())
        .step_by(step)
        .map(|start| &words[start..(start + max_words).min(words.len())])
        .filter(|window| window.len() > MIN_CHUNK_WORDS)
        .map(|window| window.join(" "))
        .collect()
}
