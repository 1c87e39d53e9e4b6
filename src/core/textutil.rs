//! Small string helpers shared across the core.

/// Truncate in place to at most `max` bytes, backing up to the nearest
/// char boundary so multibyte output can never panic the caller.
pub fn truncate_lossy(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let cut = (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
    s.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_char_boundaries() {
        let mut s = "héllo wörld".to_string();
        truncate_lossy(&mut s, 2);
        assert_eq!(s, "h");

        let mut s = "abc".to_string();
        truncate_lossy(&mut s, 10);
        assert_eq!(s, "abc");

        let mut s = "日本語テキスト".to_string();
        truncate_lossy(&mut s, 7);
        assert_eq!(s, "日本");
    }
}
