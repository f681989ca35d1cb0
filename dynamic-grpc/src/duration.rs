//! Parsing and rendering of refresh-period duration strings such as `10s`.

use anyhow::{bail, Context};
use std::time::Duration;

/// Parse a duration string.
///
/// Accepted forms are a bare number of seconds (`"30"`), a number with a
/// `ms`, `s`, `m`, `h` or `d` unit (`"500ms"`, `"10s"`, `"1m"`), and the
/// ISO-8601 time form (`"PT10S"`, `"PT1M30S"`).
pub fn parse_duration(raw: &str) -> Result<Duration, anyhow::Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }

    if let Some(iso) = raw
        .strip_prefix("PT")
        .or_else(|| raw.strip_prefix("pt"))
    {
        return parse_iso8601(iso).with_context(|| format!("invalid ISO-8601 duration '{raw}'"));
    }

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);
    let amount: u64 = amount
        .parse()
        .with_context(|| format!("invalid duration '{raw}'"))?;

    let duration = match unit.trim() {
        "" | "s" => Some(Duration::from_secs(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "m" => seconds(amount, 60),
        "h" => seconds(amount, 60 * 60),
        "d" => seconds(amount, 60 * 60 * 24),
        other => bail!("unknown duration unit '{other}' in '{raw}'"),
    };
    duration.with_context(|| format!("duration '{raw}' is too large"))
}

fn seconds(amount: u64, unit: u64) -> Option<Duration> {
    amount.checked_mul(unit).map(Duration::from_secs)
}

fn parse_iso8601(raw: &str) -> Result<Duration, anyhow::Error> {
    let mut total = Duration::ZERO;
    let mut amount = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            amount.push(c);
            continue;
        }
        let value: u64 = amount.parse().context("missing amount")?;
        amount.clear();
        let part = match c.to_ascii_uppercase() {
            'H' => seconds(value, 60 * 60),
            'M' => seconds(value, 60),
            'S' => Some(Duration::from_secs(value)),
            other => bail!("unknown designator '{other}'"),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .context("duration is too large")?;
    }
    if !amount.is_empty() {
        bail!("trailing amount without designator");
    }
    Ok(total)
}

/// Render a duration in the short form understood by [`parse_duration`].
///
/// The precision is one millisecond: anything below is truncated, so only
/// whole milliseconds survive a round trip through [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
