//! CSPRNG helpers for rendezvous codes, local identifiers and candidate choice.

use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Rendezvous code alphabet: 32 symbols, no `0`/`O`/`1`/`I`
pub const SHARE_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a rendezvous code
pub const SHARE_CODE_LEN: usize = 5;

/// Prefix of generated local identifiers
pub const LOCAL_ID_PREFIX: &str = "user_";

const LOCAL_ID_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LOCAL_ID_SUFFIX_LEN: usize = 9;

// ============================================================================
// Error Type
// ============================================================================

/// The system random source could not produce bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomError;

impl std::fmt::Display for RandomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "system random source failed")
    }
}

impl std::error::Error for RandomError {}

// ============================================================================
// Generators
// ============================================================================

fn fill(rng: &SystemRandom, buf: &mut [u8]) -> Result<(), RandomError> {
    rng.fill(buf).map_err(|_| RandomError)
}

/// Generate a rendezvous code.
///
/// The alphabet has exactly 32 symbols, so masking a random byte keeps the
/// distribution uniform.
pub fn generate_share_code(rng: &SystemRandom) -> Result<String, RandomError> {
    let mut buf = [0u8; SHARE_CODE_LEN];
    fill(rng, &mut buf)?;

    Ok(buf
        .iter()
        .map(|b| SHARE_CODE_ALPHABET[(*b & 0x1F) as usize] as char)
        .collect())
}

/// Generate a rendezvous code different from `previous`
pub fn generate_fresh_share_code(
    rng: &SystemRandom,
    previous: Option<&str>,
) -> Result<String, RandomError> {
    loop {
        let code = generate_share_code(rng)?;
        if previous != Some(code.as_str()) {
            return Ok(code);
        }
    }
}

/// Generate a local identifier such as `user_k3v9x0q2a`
pub fn generate_local_id(rng: &SystemRandom) -> Result<String, RandomError> {
    // 252 is the largest multiple of 36 below 256
    const ZONE: u8 = 252;

    let mut id = String::with_capacity(LOCAL_ID_PREFIX.len() + LOCAL_ID_SUFFIX_LEN);
    id.push_str(LOCAL_ID_PREFIX);

    let mut buf = [0u8; 16];
    while id.len() < LOCAL_ID_PREFIX.len() + LOCAL_ID_SUFFIX_LEN {
        fill(rng, &mut buf)?;
        for b in buf.iter().filter(|b| **b < ZONE) {
            if id.len() == LOCAL_ID_PREFIX.len() + LOCAL_ID_SUFFIX_LEN {
                break;
            }
            id.push(LOCAL_ID_ALPHABET[(*b % 36) as usize] as char);
        }
    }

    Ok(id)
}

/// Pick an index in `0..len` uniformly using rejection sampling.
///
/// Returns `None` when `len` is zero.
pub fn uniform_index(rng: &SystemRandom, len: usize) -> Result<Option<usize>, RandomError> {
    if len == 0 {
        return Ok(None);
    }
    if len == 1 {
        return Ok(Some(0));
    }

    let bound = len as u64;
    let zone = u64::MAX - (u64::MAX % bound);

    loop {
        let mut buf = [0u8; 8];
        fill(rng, &mut buf)?;
        let value = u64::from_ne_bytes(buf);
        if value < zone {
            return Ok(Some((value % bound) as usize));
        }
    }
}

/// Check the shape of a rendezvous code as listed by the directory.
/// Codes are dialed verbatim, so padding makes a code invalid.
pub fn is_valid_share_code(code: &str) -> bool {
    code.chars().count() == SHARE_CODE_LEN && !code.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_share_code_shape() {
        let rng = SystemRandom::new();
        for _ in 0..100 {
            let code = generate_share_code(&rng).unwrap();
            assert_eq!(code.len(), SHARE_CODE_LEN);
            assert!(code.bytes().all(|b| SHARE_CODE_ALPHABET.contains(&b)));
            assert!(is_valid_share_code(&code));
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_symbols() {
        assert_eq!(SHARE_CODE_ALPHABET.len(), 32);
        for ambiguous in [b'0', b'O', b'1', b'I'] {
            assert!(!SHARE_CODE_ALPHABET.contains(&ambiguous));
        }
        let unique: HashSet<_> = SHARE_CODE_ALPHABET.iter().collect();
        assert_eq!(unique.len(), 32);
    }

    #[test]
    fn test_fresh_share_code_differs_from_previous() {
        let rng = SystemRandom::new();
        let first = generate_share_code(&rng).unwrap();
        for _ in 0..50 {
            let next = generate_fresh_share_code(&rng, Some(&first)).unwrap();
            assert_ne!(next, first);
        }
    }

    #[test]
    fn test_local_id_format() {
        let rng = SystemRandom::new();
        let id = generate_local_id(&rng).unwrap();
        assert!(id.starts_with(LOCAL_ID_PREFIX));
        assert_eq!(id.len(), LOCAL_ID_PREFIX.len() + LOCAL_ID_SUFFIX_LEN);
        assert!(id[LOCAL_ID_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_uniform_index_bounds() {
        let rng = SystemRandom::new();
        assert_eq!(uniform_index(&rng, 0).unwrap(), None);
        assert_eq!(uniform_index(&rng, 1).unwrap(), Some(0));

        let mut seen = HashSet::new();
        for _ in 0..500 {
            let idx = uniform_index(&rng, 3).unwrap().unwrap();
            assert!(idx < 3);
            seen.insert(idx);
        }
        // 500 draws over 3 slots hit every slot
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_code_validity() {
        assert!(is_valid_share_code("ABCDE"));
        assert!(!is_valid_share_code("ABCD"));
        assert!(!is_valid_share_code("ABCDEF"));
        assert!(!is_valid_share_code(""));
        assert!(!is_valid_share_code("     "));
        assert!(!is_valid_share_code("ABCDE "));
        assert!(!is_valid_share_code(" ABCD"));
    }
}
