const VISIBLE_PREFIX: usize = 6;

/// Shorten a credential for log output, keeping only a short prefix.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".to_string();
    }
    if token.chars().count() <= VISIBLE_PREFIX {
        return "[MASKED]".to_string();
    }
    let prefix: String = token.chars().take(VISIBLE_PREFIX).collect();
    format!("{prefix}...[MASKED]")
}
