use std::sync::OnceLock;

use regex::Regex;
use tracing::error;

use crate::domain::recovery::{ErrorCategory, ErrorClassification, ReportedError, Severity};

struct ClassRule {
    /// Regex fragments matched as whole words against the normalized text.
    keywords: &'static [&'static str],
    category: ErrorCategory,
    severity: Severity,
    recoverable: bool,
    retryable: bool,
    escalatable: bool,
}

// First match wins; order matters for messages like "connection timeout".
// Keywords match whole words, so "author" is not an auth failure.
const CLASS_RULES: &[ClassRule] = &[
    ClassRule {
        keywords: &["time ?outs?", "timed out", "deadlines?"],
        category: ErrorCategory::Timeout,
        severity: Severity::Medium,
        recoverable: true,
        retryable: true,
        escalatable: false,
    },
    ClassRule {
        keywords: &["connections?", "network", "unreachable", "econnrefused", "econnreset"],
        category: ErrorCategory::External,
        severity: Severity::Medium,
        recoverable: true,
        retryable: true,
        escalatable: false,
    },
    ClassRule {
        keywords: &["transient(?:ly)?", "temporar(?:y|ily)", "rate ?limit(?:s|ed)?", "unavailable"],
        category: ErrorCategory::Transient,
        severity: Severity::Low,
        recoverable: true,
        retryable: true,
        escalatable: false,
    },
    ClassRule {
        keywords: &[
            "auth(?:n|z|entication|enticate|enticated|orization|orize|orized)?",
            "unauthori[sz]ed",
            "unauthenticated",
            "forbidden",
            "permissions?",
            "credentials?",
        ],
        category: ErrorCategory::Authentication,
        severity: Severity::High,
        recoverable: false,
        retryable: false,
        escalatable: true,
    },
    ClassRule {
        keywords: &["validation", "invalid", "schemas?"],
        category: ErrorCategory::Validation,
        severity: Severity::Medium,
        recoverable: false,
        retryable: false,
        escalatable: false,
    },
    ClassRule {
        keywords: &["memory", "resources?", "quotas?", "capacity"],
        category: ErrorCategory::Resource,
        severity: Severity::High,
        recoverable: true,
        retryable: false,
        escalatable: true,
    },
    ClassRule {
        keywords: &["system", "internal", "panic(?:s|ked)?"],
        category: ErrorCategory::System,
        severity: Severity::Critical,
        recoverable: true,
        retryable: true,
        escalatable: true,
    },
];

fn matchers() -> &'static [Option<Regex>] {
    static MATCHERS: OnceLock<Vec<Option<Regex>>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        CLASS_RULES
            .iter()
            .map(|rule| {
                let pattern = format!(r"\b(?:{})\b", rule.keywords.join("|"));
                Regex::new(&pattern)
                    .map_err(|compile_error| {
                        error!(
                            event_name = "recovery.classify.bad_pattern",
                            category = rule.category.as_str(),
                            error = %compile_error,
                            "classification keywords failed to compile"
                        );
                    })
                    .ok()
            })
            .collect()
    })
}

/// Lowercases and splits camel case, snake case and punctuation into
/// space-separated words: `AUTH_FAILED` and `AuthFailed` both read `auth failed`.
fn normalize(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len() + 8);
    let mut previous: Option<char> = None;
    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            normalized.push(' ');
        } else {
            let camel_boundary = ch.is_uppercase()
                && previous.is_some_and(|prev| prev.is_lowercase() || prev.is_ascii_digit());
            if camel_boundary {
                normalized.push(' ');
            }
            normalized.extend(ch.to_lowercase());
        }
        previous = Some(ch);
    }
    normalized
}

/// Classifies a reported error by keyword over its name, code and message.
pub fn classify(error: &ReportedError) -> ErrorClassification {
    let haystack = normalize(&format!(
        "{} {} {}",
        error.name,
        error.code.as_deref().unwrap_or_default(),
        error.message
    ));

    CLASS_RULES
        .iter()
        .zip(matchers())
        .find(|(_, matcher)| matches!(matcher, Some(regex) if regex.is_match(&haystack)))
        .map(|(rule, _)| ErrorClassification {
            category: rule.category,
            severity: rule.severity,
            recoverable: rule.recoverable,
            retryable: rule.retryable,
            escalatable: rule.escalatable,
        })
        .unwrap_or(ErrorClassification {
            category: ErrorCategory::Unknown,
            severity: Severity::Medium,
            recoverable: true,
            retryable: true,
            escalatable: true,
        })
}

#[cfg(test)]
mod tests {
    use super::{classify, matchers, normalize};
    use crate::domain::recovery::{ErrorCategory, ReportedError, Severity};

    #[test]
    fn timeouts_win_over_connection_keywords() {
        let class = classify(&ReportedError::new("ConnectionError", "connection timed out"));
        assert_eq!(class.category, ErrorCategory::Timeout);
        assert!(class.retryable);
    }

    #[test]
    fn authentication_errors_are_terminal_but_escalatable() {
        let class = classify(&ReportedError::new("Error", "401 Unauthorized"));
        assert_eq!(class.category, ErrorCategory::Authentication);
        assert!(!class.recoverable);
        assert!(!class.retryable);
        assert!(class.escalatable);
    }

    #[test]
    fn error_codes_take_part_in_matching() {
        let error =
            ReportedError::new("StepFailed", "step review failed").with_code("VALIDATION_ERROR");
        let class = classify(&error);
        assert_eq!(class.category, ErrorCategory::Validation);
        assert!(!class.recoverable);
    }

    #[test]
    fn resource_and_system_errors_escalate() {
        let resource = classify(&ReportedError::new("Error", "monthly quota exhausted"));
        assert_eq!(resource.category, ErrorCategory::Resource);
        assert!(!resource.retryable);
        assert!(resource.escalatable);

        let system = classify(&ReportedError::new("Panic", "worker thread panicked"));
        assert_eq!(system.category, ErrorCategory::System);
        assert_eq!(system.severity, Severity::Critical);
    }

    #[test]
    fn unmatched_errors_are_unknown_and_retryable() {
        let class = classify(&ReportedError::new("Error", "something odd happened"));
        assert_eq!(class.category, ErrorCategory::Unknown);
        assert!(class.recoverable);
        assert!(class.retryable);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let author = classify(&ReportedError::new("ValidationFailed", "author field missing"));
        assert_eq!(author.category, ErrorCategory::Validation);

        let authority = classify(&ReportedError::new("Error", "certificate authority rotated"));
        assert_eq!(authority.category, ErrorCategory::Unknown);
        assert!(authority.recoverable);

        let code_only = classify(&ReportedError::new("StepFailed", "rejected").with_code("AUTH"));
        assert_eq!(code_only.category, ErrorCategory::Authentication);

        let camel = classify(&ReportedError::new("RateLimitedError", "slow down"));
        assert_eq!(camel.category, ErrorCategory::Transient);
    }

    #[test]
    fn names_and_codes_split_into_words() {
        assert_eq!(normalize("AuthFailed"), "auth failed");
        assert_eq!(normalize("UPSTREAM_TIMEOUT"), "upstream timeout");
        assert_eq!(normalize("401Unauthorized: token"), "401 unauthorized  token");
        assert!(matchers().iter().all(Option::is_some));
    }
}
