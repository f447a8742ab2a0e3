/// Number of leading token characters shown in logs
const TOKEN_PREVIEW_LEN: usize = 30;

/// Format a remaining lifetime as zero-padded `MM:SS`.
/// Minutes are not wrapped into hours, so 2h reads as `120:00`.
pub fn format_remaining(seconds: u64) -> String {
    let mins = seconds / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}", mins, secs)
}

/// Short, log-safe rendering of a bearer token
pub fn token_preview(token: &str) -> String {
    let head: String = token.chars().take(TOKEN_PREVIEW_LEN).collect();
    if head.len() < token.len() {
        format!("{}...", head)
    } else {
        head
    }
}
