//! Phone number normalization

use crate::types::ValidationError;

/// Accepted digit count for a normalized phone number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneRule {
    pub min_digits: usize,
    pub max_digits: usize,
}

impl Default for PhoneRule {
    fn default() -> Self {
        Self {
            min_digits: 4,
            max_digits: 15,
        }
    }
}

impl PhoneRule {
    /// Strip everything but ASCII digits and check the length.
    ///
    /// "+1 (555) 010-0" → "15550100"
    pub fn normalize(&self, raw: &str) -> Result<String, ValidationError> {
        if raw.trim().is_empty() {
            return Err(ValidationError::MissingPhone);
        }

        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        let count = digits.len();

        if count == 0 {
            return Err(ValidationError::InvalidPhone);
        }
        if count < self.min_digits {
            return Err(ValidationError::PhoneTooShort {
                digits: count,
                min: self.min_digits,
            });
        }
        if count > self.max_digits {
            return Err(ValidationError::PhoneTooLong {
                digits: count,
                max: self.max_digits,
            });
        }

        Ok(digits)
    }
}
