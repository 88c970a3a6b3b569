//! Engine-wide configuration.
//!
//! All options live in an explicit [`Config`] value;
//! a blessed process-wide default is available through
//! [`Config::global`] for the common case,
//! and can be replaced once at startup with [`Config::set_global`].

use std::sync::OnceLock;

/// Validator for UID values; returns whether the value is acceptable.
pub type UidValidator = fn(&str) -> bool;
/// Validator for application entity titles.
pub type AetValidator = fn(&str) -> bool;

/// The tunable options of the DIMSE engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether UIDs in command sets must fully conform
    /// to the encoding rules (numeric components, length limit)
    /// rather than only being length-checked.
    pub enforce_uid_conformance: bool,
    /// Whether AE titles in DIMSE elements are emitted
    /// without padding to 16 characters.
    pub use_short_aet: bool,
    /// Whether AE titles longer than 16 characters
    /// are tolerated in DIMSE elements on ingest.
    pub allow_long_dimse_aet: bool,
    /// Whether to log the identifiers of outgoing requests.
    pub log_request_identifiers: bool,
    /// Whether to log the identifiers of incoming responses.
    pub log_response_identifiers: bool,
    /// Whether storage operations send data sets in chunks
    /// read directly from their source,
    /// instead of materializing them in memory first.
    pub store_send_chunked: bool,
    /// Whether storage providers receive data sets in chunks,
    /// handing the stream to the handler
    /// instead of materializing it in memory first.
    pub store_recv_chunked: bool,
    /// Whether a storage provider accepts any SOP class
    /// presented to it and passes the raw data set bytes through
    /// to the handler without decoding them.
    ///
    /// This trades conformance checking for throughput.
    pub unrestricted_storage: bool,
    /// The validator applied to UID values.
    pub uid_validator: UidValidator,
    /// The validator applied to application entity titles.
    pub aet_validator: AetValidator,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enforce_uid_conformance: false,
            use_short_aet: true,
            allow_long_dimse_aet: false,
            log_request_identifiers: false,
            log_response_identifiers: false,
            store_send_chunked: false,
            store_recv_chunked: false,
            unrestricted_storage: false,
            uid_validator: validate_uid,
            aet_validator: validate_aet,
        }
    }
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

impl Config {
    /// The process-wide configuration.
    ///
    /// Defaults apply unless [`set_global`](Config::set_global)
    /// was called first.
    pub fn global() -> &'static Config {
        GLOBAL.get_or_init(Config::default)
    }

    /// Install the process-wide configuration.
    ///
    /// Fails with the given value if a configuration
    /// was already installed or read.
    pub fn set_global(config: Config) -> Result<(), Config> {
        GLOBAL.set(config)
    }

    /// Check a UID value against this configuration's validator
    /// and conformance policy.
    pub fn check_uid(&self, uid: &str) -> bool {
        if self.enforce_uid_conformance {
            (self.uid_validator)(uid)
        } else {
            !uid.is_empty() && uid.len() <= 64
        }
    }

    /// Check an AE title against this configuration's validator.
    pub fn check_aet(&self, aet: &str) -> bool {
        (self.aet_validator)(aet)
    }
}

/// Validate a UID per the encoding rules:
/// up to 64 characters of dotted numeric components,
/// without empty components or leading zeros.
pub fn validate_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}

/// Validate an application entity title,
/// applying the same wire rules as the address parser
/// (see [`netdicom_ul::address::is_valid_ae_title`]).
pub fn validate_aet(aet: &str) -> bool {
    netdicom_ul::address::is_valid_ae_title(aet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_validation() {
        assert!(validate_uid("1.2.840.10008.1.1"));
        assert!(validate_uid("2.25.137731105014285922864382715319230807491"));
        assert!(validate_uid("1.0.3"));
        assert!(!validate_uid(""));
        assert!(!validate_uid("1..2"));
        assert!(!validate_uid("1.02.3"));
        assert!(!validate_uid("1.2.a"));
        assert!(!validate_uid(&"1.2".repeat(40)));
    }

    #[test]
    fn aet_validation() {
        assert!(validate_aet("STORE-SCP"));
        assert!(validate_aet("A"));
        assert!(!validate_aet(""));
        assert!(!validate_aet("                "));
        assert!(!validate_aet("THIS-AET-IS-TOO-LONG"));
        assert!(!validate_aet("BAD\\AET"));
    }

    #[test]
    fn lenient_uid_check_only_bounds_length() {
        let config = Config::default();
        assert!(config.check_uid("1.2.840.Q"));
        let strict = Config {
            enforce_uid_conformance: true,
            ..Config::default()
        };
        assert!(!strict.check_uid("1.2.840.Q"));
    }
}
