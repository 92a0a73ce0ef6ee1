//! Sentence cleaning and validation.
//!
//! Every line read by a transport goes through [`SentenceFilter::check`]:
//!
//! 1. [`clean`] strips repeater prefixes (`$P1$GPGGA` → `$GPGGA`), collapses
//!    repeated `$` and removes control characters.
//! 2. Lines that do not start with `$` or `!` are rejected.
//! 3. The deny pattern rejects noisy sentence types before the checksum
//!    is computed.
//! 4. [`validate_checksum`] checks the `*hh` suffix when checksums are required.
//!
//! Rejections are expected on marginal links; callers count them rather than
//! treating them as errors.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::model::{Sentence, Source};

/// Deny pattern used by default.
///
/// Matches GSA/GSV-style satellite chatter, transducer readings and a handful
/// of proprietary AM* sentences that subscribers never use.
pub const DEFAULT_DENY_PATTERN: &str = r"^\$([A-Z][A-Z])(GS[A-Z]|XDR|AMAID|AMCLK|AMSA|SGR|MMB|MDA)";

/// GPS/AIS talker prefixes accepted as proof that a device speaks NMEA.
pub const GPS_TALKER_PREFIXES: [&str; 4] = ["$GP", "$GN", "$GL", "!AI"];

fn repeater_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$[A-Z0-9]{2,6}\$").expect("static regex"))
}

fn repeated_dollar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$+").expect("static regex"))
}

/// Normalize a raw line into sentence text.
///
/// Returns `None` when nothing is left after cleaning. `clean` is idempotent:
/// cleaning an already cleaned line returns it unchanged.
pub fn clean(raw: &str) -> Option<String> {
    let without_control: String = raw.chars().filter(|c| !c.is_ascii_control()).collect();
    let trimmed = without_control.trim();
    let mut text = repeated_dollar().replace_all(trimmed, "$").into_owned();

    // A prefix like `$P1$` may hide another one behind it.
    while let Some(m) = repeater_prefix().find(&text) {
        text.replace_range(..m.end(), "$");
    }

    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// XOR of every byte between the leading `$`/`!` and `*`.
///
/// Returns `None` when the text has no leading marker or no `*`.
pub fn compute_checksum(text: &str) -> Option<u8> {
    let body = text.strip_prefix(['$', '!'])?;
    let star = body.find('*')?;
    Some(body.as_bytes()[..star].iter().fold(0u8, |acc, b| acc ^ b))
}

/// Check the `*hh` checksum suffix of a sentence (hex digits case-insensitive).
pub fn validate_checksum(text: &str) -> bool {
    let Some(expected) = compute_checksum(text) else {
        return false;
    };
    let Some((_, digits)) = text.split_once('*') else {
        return false;
    };
    if digits.len() != 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    u8::from_str_radix(digits, 16).map_or(false, |actual| actual == expected)
}

/// Whether a line carries a GPS or AIS talker prefix.
pub fn is_gps_sentence(line: &str) -> bool {
    GPS_TALKER_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Why a line was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Nothing left after cleaning.
    Empty,
    /// Does not start with `$` or `!`.
    NotNmea,
    /// Matched the deny pattern.
    Denied,
    /// Missing or wrong `*hh` checksum.
    BadChecksum,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::Empty => "empty",
            Rejection::NotNmea => "not NMEA",
            Rejection::Denied => "denied",
            Rejection::BadChecksum => "bad checksum",
        };
        f.write_str(reason)
    }
}

/// Allow/deny policy applied to cleaned lines.
#[derive(Debug, Clone)]
pub struct SentenceFilter {
    deny: Option<Regex>,
    require_checksum: bool,
}

impl SentenceFilter {
    /// Build a filter from a deny pattern (empty disables the denylist).
    pub fn new(deny_pattern: &str, require_checksum: bool) -> Result<Self, regex::Error> {
        let deny = if deny_pattern.trim().is_empty() {
            None
        } else {
            Some(Regex::new(deny_pattern)?)
        };
        Ok(Self {
            deny,
            require_checksum,
        })
    }

    /// Filter that accepts every well-formed line.
    pub fn permissive() -> Self {
        Self {
            deny: None,
            require_checksum: false,
        }
    }

    pub fn requires_checksum(&self) -> bool {
        self.require_checksum
    }

    pub fn deny_pattern(&self) -> Option<&str> {
        self.deny.as_ref().map(Regex::as_str)
    }

    /// Whether the deny pattern matches the line.
    pub fn is_denied(&self, text: &str) -> bool {
        self.deny.as_ref().map_or(false, |re| re.is_match(text))
    }

    /// Clean and validate a raw line from `source`.
    pub fn check(&self, source: Source, raw: &str) -> Result<Sentence, Rejection> {
        let text = clean(raw).ok_or(Rejection::Empty)?;
        if !(text.starts_with('$') || text.starts_with('!')) {
            return Err(Rejection::NotNmea);
        }
        if self.is_denied(&text) {
            return Err(Rejection::Denied);
        }
        if self.require_checksum && !validate_checksum(&text) {
            return Err(Rejection::BadChecksum);
        }
        Ok(Sentence::new(source, text))
    }
}

impl Default for SentenceFilter {
    fn default() -> Self {
        Self {
            deny: Some(Regex::new(DEFAULT_DENY_PATTERN).expect("default deny pattern")),
            require_checksum: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn test_valid_checksum() {
        assert!(validate_checksum(GGA));
        assert!(validate_checksum("!AIVDM,1,1,,B,177KQJ5000G?tO`K>RA1wUbN0TKH,0*5C"));
    }

    #[test]
    fn test_checksum_hex_is_case_insensitive() {
        let text = "!AIVDM,1,1,,B,177KQJ5000G?tO`K>RA1wUbN0TKH,0*5c";
        assert!(validate_checksum(text));
    }

    #[test]
    fn test_flipped_payload_fails_checksum() {
        let tampered = GGA.replacen("4807.038", "4807.039", 1);
        assert!(!validate_checksum(&tampered));

        let tampered = GGA.replacen(",N,", ",S,", 1);
        assert!(!validate_checksum(&tampered));
    }

    #[test]
    fn test_checksum_requires_delimiter_and_digits() {
        assert!(!validate_checksum("$GPGGA,123519,4807.038,N"));
        assert!(!validate_checksum("$GPGGA,123519*"));
        assert!(!validate_checksum("$GPGGA,123519*4"));
        assert!(!validate_checksum("$GPGGA,123519*ZZ"));
        assert!(!validate_checksum("GPGGA,123519*47"));
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(compute_checksum(GGA), Some(0x47));
        assert_eq!(compute_checksum("$*00"), Some(0));
        assert_eq!(compute_checksum("GPGGA*00"), None);
    }

    #[test]
    fn test_clean_strips_repeater_prefix() {
        let raw = "$P1$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*4B";
        assert_eq!(
            clean(raw).as_deref(),
            Some("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*4B")
        );
    }

    #[test]
    fn test_clean_removes_control_and_duplicate_markers() {
        assert_eq!(clean("$$GPRMC,1*00\r\n").as_deref(), Some("$GPRMC,1*00"));
        assert_eq!(clean("\x00$GPRMC\x07,1*00").as_deref(), Some("$GPRMC,1*00"));
        assert_eq!(clean("  !AIVDM,1*00  ").as_deref(), Some("!AIVDM,1*00"));
        assert_eq!(clean("\r\n"), None);
        assert_eq!(clean(""), None);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let inputs = [
            GGA,
            "$P1$GPGGA,1*00",
            "$AB$$CD$GPGGA,1*00",
            "$$$REPEAT1$$GPRMC\r\n",
            " $AB$ GPGGA",
            "!AIVDM,1,1,,A,13aEOK?P00PD2wVMdLDRhgvL289?,0*26\n",
            "garbage\tline",
            "$",
        ];
        for raw in inputs {
            if let Some(once) = clean(raw) {
                assert_eq!(clean(&once), Some(once.clone()), "input {raw:?}");
            }
        }
    }

    #[test]
    fn test_filter_accepts_valid_sentence() {
        let filter = SentenceFilter::default();
        let sentence = filter.check(Source::Serial, &format!("{GGA}\r\n")).unwrap();
        assert_eq!(sentence.text, GGA);
        assert_eq!(sentence.source, Source::Serial);
    }

    #[test]
    fn test_filter_denies_before_checksum() {
        let filter = SentenceFilter::default();
        assert_eq!(
            filter.check(Source::Udp, "$GPMMB,29.9350,I,1.0136,B*00"),
            Err(Rejection::Denied)
        );
        assert_eq!(
            filter.check(Source::Udp, "$GPGSV,3,1,11,03,03,111,00*74"),
            Err(Rejection::Denied)
        );
        assert_eq!(
            filter.check(Source::Udp, "$IIXDR,C,19.52,C,TempAir*19"),
            Err(Rejection::Denied)
        );
    }

    #[test]
    fn test_filter_rejections() {
        let filter = SentenceFilter::default();
        assert_eq!(filter.check(Source::Tcp, "\r\n"), Err(Rejection::Empty));
        assert_eq!(filter.check(Source::Tcp, "hello"), Err(Rejection::NotNmea));
        assert_eq!(
            filter.check(Source::Tcp, "$GPGGA,123519*00"),
            Err(Rejection::BadChecksum)
        );
    }

    #[test]
    fn test_filter_without_checksum_requirement() {
        let filter = SentenceFilter::new("", false).unwrap();
        assert!(filter.check(Source::Tcp, "$GPMMB,1*00").is_ok());
        assert!(filter.check(Source::Tcp, "$GPGGA,no-checksum").is_ok());
        assert_eq!(filter.deny_pattern(), None);
    }

    #[test]
    fn test_invalid_deny_pattern() {
        assert!(SentenceFilter::new("([unclosed", true).is_err());
    }

    #[test]
    fn test_gps_prefixes() {
        assert!(is_gps_sentence(GGA));
        assert!(is_gps_sentence("$GNRMC,1"));
        assert!(is_gps_sentence("$GLGSV,1"));
        assert!(is_gps_sentence("!AIVDM,1"));
        assert!(!is_gps_sentence("$IIMWV,1"));
        assert!(!is_gps_sentence("AT+OK"));
    }
}
