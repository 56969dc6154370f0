//! Move-number extraction from OCR-style free text.
//!
//! The companion app overlays a move counter the OCR stage reads as text
//! like "第 127 手" (or, in some skins, "Move 127"). Fetching that text is
//! the caller's job; this module only parses it.

/// Pull a move number out of free text. Returns `None` when no counter
/// phrase is present or the number is zero.
pub fn extract_move_number(text: &str) -> Option<u32> {
    if let Some(idx) = text.find('第') {
        let rest = &text[idx + '第'.len_utf8()..];
        if let Some(n) = leading_number(rest) {
            let after = rest
                .trim_start()
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start();
            if after.starts_with('手') && n > 0 {
                return Some(n);
            }
        }
    }

    let lower = text.to_lowercase();
    if let Some(idx) = lower.find("move") {
        if let Some(n) = leading_number(&lower[idx + 4..]) {
            if n > 0 {
                return Some(n);
            }
        }
    }

    None
}

/// The digit run at the start of `rest`, after separator characters.
fn leading_number(rest: &str) -> Option<u32> {
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '#');
    let digits: &str = rest.split(|c: char| !c.is_ascii_digit()).next()?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
