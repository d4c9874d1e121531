//! Human-friendly byte sizes.
//!
//! Suffixes are binary multiples whether or not the `i` is spelled out:
//! `100M`, `100MB` and `100MiB` all mean 100 * 2^20 bytes. A bare number is
//! a count of bytes.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseSizeError(String);

/// Parses a positive byte size such as `4096`, `64K`, `100MiB` or `2 GB`.
pub fn parse_size(input: &str) -> Result<u64, ParseSizeError> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(ParseSizeError(format!(
            "{input:?} is not a size; expected something like 100MiB"
        )));
    }
    let number: u64 = number
        .parse()
        .map_err(|e| ParseSizeError(format!("{input:?}: {e}")))?;

    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => {
            return Err(ParseSizeError(format!(
                "unknown size suffix {other:?} in {input:?}"
            )))
        }
    };
    let bytes = number
        .checked_mul(1u64 << shift)
        .ok_or_else(|| ParseSizeError(format!("{input:?} is too large")))?;
    if bytes == 0 {
        return Err(ParseSizeError("size must be greater than zero".to_string()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::parse_size;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_size("100MiB"), Ok(100 * 1024 * 1024));
        assert_eq!(parse_size("100mb"), Ok(100 * 1024 * 1024));
        assert_eq!(parse_size(" 2 GB "), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1T"), Ok(1 << 40));
    }

    #[test]
    fn rejects_nonsense() {
        assert!(parse_size("0").is_err());
        assert!(parse_size("0MiB").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("1.5G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("99999999999T").is_err());
    }
}
