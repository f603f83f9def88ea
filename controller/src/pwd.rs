use tracing::{debug, instrument};

use crate::err::{Error, Result};

// Consts

const PASSWORD_LENGTH: usize = 16;

// Traits

#[cfg_attr(test, mockall::automock)]
pub trait PasswordGenerator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

// DefaultPasswordGenerator

/// Generates alphanumeric tenant credentials from a cryptographically secure source.
pub struct DefaultPasswordGenerator(passwords::PasswordGenerator);

impl DefaultPasswordGenerator {
    pub fn new() -> Self {
        Self(passwords::PasswordGenerator {
            exclude_similar_characters: false,
            length: PASSWORD_LENGTH,
            lowercase_letters: true,
            numbers: true,
            spaces: false,
            strict: true,
            symbols: false,
            uppercase_letters: true,
        })
    }
}

impl PasswordGenerator for DefaultPasswordGenerator {
    #[instrument(skip(self))]
    fn generate(&self) -> Result<String> {
        debug!("generating password");
        self.0
            .generate_one()
            .map_err(|err| Error::PasswordGeneration(err.into()))
    }
}

// Tests

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alphanumeric_of_fixed_length() {
        let gen = DefaultPasswordGenerator::new();
        let pwd = gen.generate().unwrap();
        assert_eq!(pwd.len(), PASSWORD_LENGTH);
        assert!(pwd.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn distinct() {
        let gen = DefaultPasswordGenerator::new();
        assert_ne!(gen.generate().unwrap(), gen.generate().unwrap());
    }
}
