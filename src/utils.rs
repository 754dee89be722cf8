use anyhow::{bail, Result};
use regex::Regex;
use std::time::Duration;
use uuid::Uuid;

/// 生成消息UUID
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// 解析Go风格的时长字符串，如 "120s"、"2m"、"1h30m"、"500ms"
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty duration");
    }

    let re = Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?(?:(\d+)ms)?$").unwrap();
    let captures = match re.captures(input) {
        Some(c) => c,
        None => bail!("invalid duration: {}", input),
    };

    if captures.iter().skip(1).all(|g| g.is_none()) {
        bail!("invalid duration: {}", input);
    }

    let part = |i: usize| -> u64 {
        captures
            .get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    let millis = part(1) * 3_600_000 + part(2) * 60_000 + part(3) * 1_000 + part(4);
    Ok(Duration::from_millis(millis))
}
