//! Output filename templates.

use chrono::{DateTime, Utc};

/// Default output filename template.
pub const DEFAULT_TEMPLATE: &str = "measurements-{timestamp}-{hostname}-{pid}.csv";

/// `strftime` format of the `{timestamp}` placeholder.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Expands `{timestamp}`, `{hostname}` and `{pid}` in `template`.
///
/// Unknown placeholders and unbalanced braces are kept verbatim.
pub fn expand_template(template: &str, started: DateTime<Utc>, hostname: &str, pid: u32) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('}') else {
            rest = tail;
            break;
        };
        match &tail[1..close] {
            "timestamp" => out.push_str(&started.format(TIMESTAMP_FORMAT).to_string()),
            "hostname" => out.push_str(hostname),
            "pid" => out.push_str(&pid.to_string()),
            _ => out.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}
