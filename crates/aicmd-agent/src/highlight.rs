use regex::Regex;
use std::sync::OnceLock;

pub const GREEN_BOLD: &str = "\x1b[1;32m";
pub const RESET: &str = "\x1b[0m";

/// Markers placed around each highlighted span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightStyle<'a> {
    pub open: &'a str,
    pub close: &'a str,
}

impl HighlightStyle<'static> {
    pub const ANSI: Self = Self {
        open: GREEN_BOLD,
        close: RESET,
    };
    pub const PLAIN: Self = Self { open: "", close: "" };
}

/// Wrap every standalone occurrence of the command's tokens in `text`.
///
/// A token matches only where it is bounded by the start or end of the text,
/// whitespace, or ASCII punctuation that does not itself occur in the token.
/// Longer tokens claim their spans first and claimed spans are never matched
/// again, so `ls` inside `tools` stays untouched.
pub fn highlight_tokens(text: &str, command: &str, style: HighlightStyle<'_>) -> String {
    if style.open.is_empty() && style.close.is_empty() {
        return text.to_string();
    }
    let mut tokens: Vec<&str> = Vec::new();
    for token in command.split_whitespace() {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));

    let mut claimed: Vec<(usize, usize)> = Vec::new();
    for token in tokens {
        let Ok(pattern) = Regex::new(&regex::escape(token)) else {
            continue;
        };
        let mut at = 0;
        while at <= text.len() {
            let Some(found) = pattern.find_at(text, at) else {
                break;
            };
            let (start, end) = (found.start(), found.end());
            let free = !claimed.iter().any(|&(s, e)| start < e && s < end);
            if free && is_boundary(text[..start].chars().next_back(), token)
                && is_boundary(text[end..].chars().next(), token)
            {
                claimed.push((start, end));
                at = end;
            } else {
                at = next_char_start(text, start);
            }
        }
    }
    claimed.sort_unstable();

    let mut out = String::with_capacity(text.len() + claimed.len() * 8);
    let mut cursor = 0;
    for (start, end) in claimed {
        out.push_str(&text[cursor..start]);
        out.push_str(style.open);
        out.push_str(&text[start..end]);
        out.push_str(style.close);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn is_boundary(neighbor: Option<char>, token: &str) -> bool {
    match neighbor {
        None => true,
        Some(c) if c.is_whitespace() => true,
        Some(c) => c.is_ascii_punctuation() && !token.contains(c),
    }
}

fn next_char_start(text: &str, index: usize) -> usize {
    text[index..]
        .chars()
        .next()
        .map_or(text.len() + 1, |c| index + c.len_utf8())
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)\r?\n?```$").ok())
        .as_ref()
}

/// Clean a raw completion into a bare command: trim, drop a surrounding
/// markdown fence or backtick pair, drop a leading `$ ` prompt.
pub fn normalize_command(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(caps) = fence_pattern().and_then(|re| re.captures(text))
        && let Some(body) = caps.get(1)
    {
        text = body.as_str().trim();
    }
    if text.len() >= 2 && text.starts_with('`') && text.ends_with('`') && !text.contains('\n') {
        text = text.trim_matches('`').trim();
    }
    if let Some(rest) = text.strip_prefix("$ ") {
        text = rest.trim_start();
    }
    text.to_string()
}

/// Drop repeated candidates, keeping the first occurrence of each.
pub fn dedup_candidates<I>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRACKETS: HighlightStyle<'static> = HighlightStyle {
        open: "[",
        close: "]",
    };

    #[test]
    fn tokens_inside_words_are_left_alone() {
        let out = highlight_tokens("ls shows files in tools and ls.", "ls", BRACKETS);
        assert_eq!(out, "[ls] shows files in tools and [ls].");
    }

    #[test]
    fn longer_tokens_win_and_are_not_rematched() {
        let out = highlight_tokens(
            "Run ls -la to see hidden files; -la means long+all.",
            "ls -la",
            BRACKETS,
        );
        assert_eq!(
            out,
            "Run [ls] [-la] to see hidden files; [-la] means long+all."
        );
    }

    #[test]
    fn punctuation_inside_token_is_not_a_boundary() {
        let out = highlight_tokens("cat a.txt.bak, then `a.txt`.", "cat a.txt", BRACKETS);
        assert_eq!(out, "[cat] a.txt.bak, then `[a.txt]`.");
    }

    #[test]
    fn regex_metacharacters_are_escaped() {
        let out = highlight_tokens("grep for a* and a+b", "grep a*", BRACKETS);
        assert_eq!(out, "[grep] for [a*] and a+b");
    }

    #[test]
    fn plain_style_is_identity() {
        assert_eq!(highlight_tokens("ls here", "ls", HighlightStyle::PLAIN), "ls here");
        let ansi = highlight_tokens("use ls", "ls", HighlightStyle::ANSI);
        assert_eq!(ansi, format!("use {GREEN_BOLD}ls{RESET}"));
    }

    #[test]
    fn normalizes_fences_and_prompts() {
        assert_eq!(normalize_command("  ls -la \n"), "ls -la");
        assert_eq!(normalize_command("```bash\nls -la\n```"), "ls -la");
        assert_eq!(normalize_command("```\n$ df -h\n```"), "df -h");
        assert_eq!(normalize_command("`pwd`"), "pwd");
        assert_eq!(normalize_command("$ echo hi"), "echo hi");
        assert_eq!(normalize_command("   "), "");
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let out = dedup_candidates(
            ["ls", "ls -a", "ls", "ls -la", "ls -a"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(out, vec!["ls", "ls -a", "ls -la"]);
    }
}
