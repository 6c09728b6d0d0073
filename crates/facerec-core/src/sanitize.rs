//! Cleanup for names entering the registry.

const MAX_NAME_CHARS: usize = 50;

/// Trim, strip HTML tags, keep only letters (including Latin-1 accented),
/// whitespace, `-`, `'` and `.`, collapse whitespace runs, cap the length.
pub fn sanitize_name(name: &str) -> String {
    let stripped = strip_tags(name.trim());

    let mut out = String::with_capacity(stripped.len());
    let mut last_space = false;
    for c in stripped.chars().filter(|&c| is_name_char(c)) {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }

    out.chars().take(MAX_NAME_CHARS).collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphabetic()
        || c.is_whitespace()
        || matches!(c, '-' | '\'' | '.')
        || ('\u{C0}'..='\u{FF}').contains(&c)
}

/// Remove `<...>` runs. An unterminated `<` is left for the char filter.
fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}
