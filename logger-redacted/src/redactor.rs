use regex::Regex;
use lazy_static::lazy_static;
use sha2::{Sha256, Digest};
use base64::{Engine as _, engine::general_purpose};

lazy_static! {
    static ref MRN_REGEX: Regex = Regex::new(r"(?i)\bMRN[-:#\s]*[A-Z0-9]+\b").unwrap();
    static ref EMAIL_REGEX: Regex = Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    static ref PHONE_REGEX: Regex = Regex::new(r"\b(?:\+1[-.\s]?)?\(?([0-9]{3})\)?[-.\s]?([0-9]{3})[-.\s]?([0-9]{4})\b").unwrap();
    static ref DATE_REGEX: Regex = Regex::new(r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b").unwrap();
}

/// PHI redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_mrns: bool,
    pub redact_emails: bool,
    pub redact_phones: bool,
    /// Dates are redacted because a date next to a name is usually a date of birth.
    pub redact_dates: bool,
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_mrns: true,
            redact_emails: true,
            redact_phones: true,
            redact_dates: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

/// PHI redactor for log messages
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        // MRNs first: an MRN can look like a phone number once its prefix is gone.
        if self.config.redact_mrns {
            result = self.replace(&MRN_REGEX, &result, "MRN", "MRN[REDACTED]");
        }

        if self.config.redact_emails {
            result = self.replace(&EMAIL_REGEX, &result, "EMAIL", "***@***");
        }

        if self.config.redact_phones {
            result = self.replace(&PHONE_REGEX, &result, "PHONE", "(***) ***-****");
        }

        if self.config.redact_dates {
            result = DATE_REGEX.replace_all(&result, "****-**-**").to_string();
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    fn replace(&self, pattern: &Regex, text: &str, label: &str, mask: &str) -> String {
        pattern.replace_all(text, |caps: &regex::Captures| {
            if self.config.hash_for_correlation {
                format!("{}[{}]", label, hash_identifier(&caps[0]))
            } else {
                mask.to_string()
            }
        }).to_string()
    }
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

/// Short, stable hash of an identifier so log lines about the same patient
/// can be correlated without exposing the identifier itself.
pub fn hash_identifier(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.trim().as_bytes());
    let result = hasher.finalize();
    general_purpose::STANDARD_NO_PAD.encode(&result[..8])
}
