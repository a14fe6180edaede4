use rand::Rng;

use crate::constants::INVITE_CODE_LEN;

// Unambiguous alphabet: no 0/O, 1/I/L
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generate a fresh, human-copyable invite code.
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Canonical form of a user-typed code: trimmed, uppercase, separators removed.
pub fn normalize_invite_code(code: &str) -> String {
    code.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Compare a presented code against the group's current one.
pub fn invite_code_matches(expected: &str, presented: &str) -> bool {
    !expected.is_empty() && normalize_invite_code(presented) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_canonical() {
        let code = generate_invite_code();
        assert_eq!(code.len(), INVITE_CODE_LEN);
        assert_eq!(normalize_invite_code(&code), code);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn codes_differ() {
        assert_ne!(generate_invite_code(), generate_invite_code());
    }

    #[test]
    fn typed_code_matches_after_normalizing() {
        assert!(invite_code_matches("ABCD2345", " abcd-2345 "));
        assert!(!invite_code_matches("ABCD2345", "ABCD2346"));
        assert!(!invite_code_matches("", ""));
    }
}
