//! Fixed-width status-line rendering.

use nightrun_core::HostKey;

/// Fit `text` into exactly `length` characters: long text is truncated
/// with an ellipsis, short text is centered.
pub(crate) fn str_of_length(text: &str, length: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() > length {
        let keep = length.saturating_sub(3);
        let mut out: String = chars[..keep].iter().collect();
        out.push_str("...");
        out
    } else {
        let diff = length - chars.len();
        let before = diff / 2;
        let after = diff / 2 + diff % 2;
        format!("{}{}{}", " ".repeat(before), text, " ".repeat(after))
    }
}

/// The status table header: a rule line and one column label per host.
pub(crate) fn host_header(hosts: &[HostKey], width: usize) -> (String, String) {
    let mut text_line = String::new();
    for key in hosts {
        text_line.push('|');
        text_line.push_str(&str_of_length(&key.to_string(), width));
    }
    text_line.push('|');
    let rule = format!(" {}", "-".repeat(text_line.len().saturating_sub(1)));
    (rule, text_line)
}
