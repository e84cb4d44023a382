//! Recurrence rule validation
//!
//! Mirrors carry RRULE strings through at the instance level; the only
//! thing this module guarantees is that a rule we accept parses under RFC
//! 5545 so that FULL-detail mirrors never push garbage to a provider.

use crate::error::GraphError;
use rrule::{RRuleError, RRuleSet};

/// Parse an RRULE string and validate its format
pub fn validate_rrule(rrule_str: &str) -> Result<(), GraphError> {
    // The rrule crate requires a DTSTART for strict parsing; any fixed
    // instant works for validation.
    let full_str = format!("DTSTART:20240101T000000Z\nRRULE:{rrule_str}");

    full_str
        .parse::<RRuleSet>()
        .map_err(|e: RRuleError| GraphError::Validation(format!("invalid recurrence rule: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rrule_valid() {
        assert!(validate_rrule("FREQ=DAILY;COUNT=5").is_ok());
        assert!(validate_rrule("FREQ=WEEKLY;BYDAY=MO,FR").is_ok());
    }

    #[test]
    fn test_validate_rrule_invalid() {
        assert!(validate_rrule("INVALID=TRUE").is_err());
        assert!(validate_rrule("").is_err());
    }
}
