//! Small formatting helpers shared by logging call sites.

/// Render a duration in seconds as a compact human-readable string.
///
/// Sub-second durations show milliseconds, sub-minute show one decimal,
/// anything longer switches to minute/hour units.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{}ms", (seconds * 1000.0).round() as u64)
    } else if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        let whole = seconds as u64;
        format!("{}m{:02}s", whole / 60, whole % 60)
    } else {
        let whole = seconds as u64;
        format!("{}h{:02}m", whole / 3600, (whole % 3600) / 60)
    }
}

/// Safely truncate a string to at most `max_chars` characters for log output.
///
/// Multi-byte characters are never split; truncated strings get a trailing
/// ellipsis. Newlines are collapsed so a prompt stays on one log line.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let char_count = flattened.chars().count();
    if char_count <= max_chars {
        flattened
    } else {
        let truncated: String = flattened.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}
