use crate::Generator;
use burrow_core::{GeneratorError, ShortCode};
use rand::rngs::OsRng;
use rand::TryRngCore;
use typed_builder::TypedBuilder;

/// Symbols used for generated codes.
///
/// Visually confusable characters (`0`, `O`, `o`, `1`, `l`, `I`) are left out.
pub const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default length of generated codes.
pub const DEFAULT_LENGTH: usize = 6;

// Largest multiple of the alphabet size that fits in a byte. Bytes at or
// above it are rejected so every symbol stays equally likely.
const ACCEPT_BELOW: usize = 256 - (256 % ALPHABET.len());

/// Generates random codes from [`ALPHABET`] using the operating system's
/// cryptographically secure random source.
///
/// Predictable codes would let anyone enumerate stored links, so no
/// user-space PRNG is involved.
#[derive(Debug, Clone, TypedBuilder)]
pub struct AlphabetGenerator {
    #[builder(default = DEFAULT_LENGTH)]
    length: usize,
}

impl AlphabetGenerator {
    /// Creates a generator producing codes of `length` symbols.
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    /// Returns the number of symbols in each generated code.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Draws `length` symbols independently and uniformly from [`ALPHABET`].
    pub fn generate_code(&self) -> Result<String, GeneratorError> {
        let mut code = String::with_capacity(self.length);
        let mut buf = vec![0_u8; self.length.max(1) * 2];

        while code.len() < self.length {
            OsRng
                .try_fill_bytes(&mut buf)
                .map_err(|e| GeneratorError::Entropy(e.to_string()))?;

            for byte in buf.iter().map(|b| *b as usize) {
                if code.len() == self.length {
                    break;
                }
                if byte < ACCEPT_BELOW {
                    code.push(ALPHABET[byte % ALPHABET.len()] as char);
                }
            }
        }

        Ok(code)
    }
}

impl Default for AlphabetGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_LENGTH)
    }
}

impl Generator for AlphabetGenerator {
    type Output = ShortCode;

    fn generate(&self) -> Result<Self::Output, GeneratorError> {
        self.generate_code().map(ShortCode::new_unchecked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_requested_length() {
        for length in [1, 4, 6, 10, 32] {
            let generator = AlphabetGenerator::new(length);
            assert_eq!(generator.generate_code().unwrap().len(), length);
        }
    }

    #[test]
    fn default_length_is_six() {
        let generator = AlphabetGenerator::builder().build();
        assert_eq!(generator.length(), DEFAULT_LENGTH);
        assert_eq!(generator.generate().unwrap().as_str().len(), 6);
    }

    #[test]
    fn only_uses_alphabet_symbols() {
        let generator = AlphabetGenerator::default();
        for _ in 0..1_000 {
            let code = generator.generate_code().unwrap();
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)), "{code}");
        }
    }

    #[test]
    fn excludes_confusable_symbols() {
        for confusable in [b'0', b'O', b'o', b'1', b'l', b'I'] {
            assert!(!ALPHABET.contains(&confusable));
        }
    }

    #[test]
    fn generated_codes_are_valid_short_codes() {
        let generator = AlphabetGenerator::default();
        let code = generator.generate().unwrap();
        assert!(ShortCode::new(code.as_str()).is_ok());
    }

    #[test]
    fn codes_rarely_repeat() {
        let generator = AlphabetGenerator::default();
        let codes: HashSet<String> = (0..1_000)
            .map(|_| generator.generate_code().unwrap())
            .collect();
        // 56^6 possible codes; a handful of repeats would already be suspicious
        assert!(codes.len() > 990);
    }

    #[test]
    fn every_symbol_shows_up() {
        let generator = AlphabetGenerator::new(32);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.extend(generator.generate_code().unwrap().into_bytes());
        }
        assert_eq!(seen.len(), ALPHABET.len());
    }

    #[test]
    fn generator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AlphabetGenerator>();
    }
}
