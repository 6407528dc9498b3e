use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Whole seconds between two millisecond timestamps
pub fn elapsed_secs(since_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(since_ms) / 1000
}

// Label shown for a participant in lobby and analytics views
pub fn display_name(is_host: bool, ordinal: usize) -> String {
    if is_host {
        "Host".to_string()
    } else {
        format!("Player{}", ordinal)
    }
}

// Decode the handful of HTML entities trivia dumps are escaped with
pub fn decode_html_entities(text: &str) -> String {
    const ENTITIES: [(&str, &str); 12] = [
        ("&quot;", "\""),
        ("&#039;", "'"),
        ("&#39;", "'"),
        ("&apos;", "'"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&eacute;", "é"),
        ("&uuml;", "ü"),
        ("&ouml;", "ö"),
        ("&rsquo;", "'"),
        ("&ldquo;", "\""),
        ("&rdquo;", "\""),
    ];

    let mut decoded = text.to_string();
    for (entity, replacement) in ENTITIES {
        decoded = decoded.replace(entity, replacement);
    }
    // Last, so "&amp;quot;" decodes to "&quot;" rather than a quote
    decoded.replace("&amp;", "&").trim().to_string()
}
