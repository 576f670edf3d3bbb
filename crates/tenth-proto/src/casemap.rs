//! RFC-1459 case folding and the folded-name hash.
//!
//! Folding follows the ISO-8859-1 lowering table the network agrees on,
//! with the classic quirk that `{` == `[`, `|` == `\` and `}` == `]`
//! (and `^` == `~`). Folding is idempotent; every peer must reach the
//! same folded form or name lookups diverge across the mesh.

/// Fold one byte to its canonical lower form.
pub fn fold_byte(b: u8) -> u8 {
    match b {
        b'A'..=b'Z' => b + 32,
        b'[' => b'{',
        b'\\' => b'|',
        b']' => b'}',
        // `~` is the canonical form; `^` sits in the upper row.
        b'^' => b'~',
        // ISO-8859-1 uppercase letters, multiplication sign excepted.
        0xC0..=0xDE if b != 0xD7 => b + 32,
        _ => b,
    }
}

/// Fold a name to its canonical lower form. Operates on bytes; names on
/// the wire are ASCII-safe and anything else passes through untouched.
pub fn irc_to_lower(s: &str) -> String {
    let folded: Vec<u8> = s.bytes().map(fold_byte).collect();
    String::from_utf8_lossy(&folded).into_owned()
}

/// Case-folded equality without allocating.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(ca, cb)| fold_byte(ca) == fold_byte(cb))
}

/// Multiplier for the rotation hash. The store sizes its bucket table
/// with a prime so the rotation distributes evenly.
const HASH_MUL: u32 = 33;

/// Hash a name under case folding. Callers reduce modulo their table
/// size; equal names under [`irc_eq`] always hash equal.
pub fn hash_folded(name: &str) -> u32 {
    let mut h: u32 = 0;
    for b in name.bytes() {
        h = h.wrapping_mul(HASH_MUL).wrapping_add(fold_byte(b) as u32);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_lowering() {
        assert_eq!(irc_to_lower("NickName"), "nickname");
        assert_eq!(irc_to_lower("#Channel"), "#channel");
    }

    #[test]
    fn test_rfc1459_quirk() {
        assert!(irc_eq("nick[a]", "nick{a}"));
        assert!(irc_eq("ni\\ck", "ni|ck"));
        assert!(irc_eq("a~b", "a^b"));
        assert_eq!(irc_to_lower("[]\\^"), "{}|~");
    }

    #[test]
    fn test_fold_idempotent() {
        for b in 0u8..=255 {
            assert_eq!(fold_byte(fold_byte(b)), fold_byte(b), "byte {b:#x}");
        }
    }

    #[test]
    fn test_iso_8859_1_range() {
        // 0xC0 (À) folds to 0xE0 (à); 0xD7 (×) stays put.
        assert_eq!(fold_byte(0xC0), 0xE0);
        assert_eq!(fold_byte(0xD7), 0xD7);
        assert_eq!(fold_byte(0xDE), 0xFE);
    }

    #[test]
    fn test_hash_agrees_with_eq() {
        assert_eq!(hash_folded("Foo[x]"), hash_folded("foo{X}"));
        assert_ne!(hash_folded("foo"), hash_folded("bar"));
    }

    #[test]
    fn test_eq_length_mismatch() {
        assert!(!irc_eq("abc", "abcd"));
    }
}
