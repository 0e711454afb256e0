//! Promotion-code generation.

use rand::Rng;

/// Unambiguous uppercase alphabet (no 0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_LEN: usize = 10;

/// Generate a random code. 32^10 possibilities makes guessing and collisions
/// equally unlikely; collisions are handled by re-rolling at insert time.
pub fn generate(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let body: String = (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect();
    if prefix.is_empty() {
        body
    } else {
        format!("{prefix}-{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_use_the_alphabet() {
        let code = generate("", 64);
        assert_eq!(code.len(), 64);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_prefix_is_prepended() {
        let code = generate("REF", 8);
        assert!(code.starts_with("REF-"));
        assert_eq!(code.len(), 4 + 8);
    }

    #[test]
    fn test_codes_are_not_repeated_in_practice() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate("", DEFAULT_CODE_LEN)));
        }
    }
}
