pub(super) const TRUNCATION_MARKER: &str = "… [content truncated]";

pub(super) const SCREENING_SYSTEM: &str = "You are a fast news screener. Decide from the \
headline and summary alone whether the story could plausibly satisfy the reader's criteria. \
Lean permissive: only reject stories that are clearly off-topic. Answer with a bare JSON \
object and nothing else, no prose and no code fences: \
{\"relevant\": <true|false>, \"reason\": \"<one short sentence>\"}";

pub(super) const EVALUATION_SYSTEM: &str = "You are a careful news analyst. Read the article \
and decide whether it satisfies the reader's criteria. Answer with a bare JSON object and \
nothing else, no prose and no code fences: {\"matches\": <true|false>, \"reason\": \"<one \
short sentence>\", \"analysis\": \"<two or three sentences of supporting detail>\"}";

pub(super) fn screening_user(criteria: &str, title: &str, summary: &str) -> String {
    format!("Criteria:\n{criteria}\n\nHeadline: {title}\n\nSummary:\n{summary}")
}

pub(super) fn evaluation_user(criteria: &str, title: &str, content: &str) -> String {
    format!("Criteria:\n{criteria}\n\nHeadline: {title}\n\nArticle:\n{content}")
}

/// Truncates article text to at most `max_chars` characters, appending a
/// marker only when something was actually cut.
pub(super) fn clip_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut clipped = content[..cut].to_string();
            clipped.push_str(TRUNCATION_MARKER);
            clipped
        }
        None => content.to_string(),
    }
}
