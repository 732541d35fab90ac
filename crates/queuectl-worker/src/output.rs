//! Turning raw child output into the text stored on a job.

/// Strip terminal escape sequences, decode lossily, and cap at `max_chars`.
pub fn clean(raw: &[u8], max_chars: usize) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    cap(&String::from_utf8_lossy(&stripped), max_chars)
}

/// Keep the head and tail of `text`, dropping the middle, so the result holds
/// at most `max_chars` characters of original output plus a one-line marker.
/// `max_chars == 0` disables the cap.
pub fn cap(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.len() <= max_chars {
        return text.to_owned();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let head_chars = max_chars / 2;
    let tail_chars = max_chars - head_chars;
    let head_end = byte_offset(text, head_chars);
    let tail_start = byte_offset(text, total - tail_chars);
    let omitted = total - head_chars - tail_chars;

    format!(
        "{}\n[... {omitted} chars omitted ...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}
