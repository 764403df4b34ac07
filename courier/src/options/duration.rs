use crate::{CourierError, Result};

/// Parse a duration string into milliseconds.
///
/// Accepts bare integers as milliseconds (`"1500"`) and anything humantime
/// understands (`"5m"`, `"1h 30m"`, `"250ms"`).
pub fn parse_millis(input: &str) -> Result<u64> {
    let trimmed = input.trim();

    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(ms);
    }

    humantime::parse_duration(trimmed)
        .map(|duration| duration.as_millis().min(u64::MAX as u128) as u64)
        .map_err(|e| CourierError::Validation(format!("Invalid delay '{}': {}", input, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_millis("5m").unwrap(), 300_000);
        assert_eq!(parse_millis("250ms").unwrap(), 250);
        assert_eq!(parse_millis("1h 30m").unwrap(), 5_400_000);
        assert_eq!(parse_millis(" 2s ").unwrap(), 2_000);
    }

    #[test]
    fn test_parse_bare_millis() {
        assert_eq!(parse_millis("1500").unwrap(), 1500);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_millis("").is_err());
        assert!(parse_millis("-5m").is_err());
        assert!(parse_millis("later").is_err());
    }
}
