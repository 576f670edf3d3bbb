//! Verb token table.
//!
//! Between peers every command travels as a 1-4 character token; local
//! users send the full name. Both spellings resolve to the same
//! handler, so the table is the single source of truth for the mapping.

/// (command name, peer token) pairs.
pub const TOKENS: &[(&str, &str)] = &[
    ("PASS", "PA"),
    ("CAP", "CAP"),
    ("SERVER", "S"),
    ("NICK", "N"),
    ("USER", "USER"),
    ("WEBIRC", "WI"),
    ("QUIT", "Q"),
    ("SQUIT", "SQ"),
    ("KILL", "D"),
    ("OPER", "OPER"),
    ("JOIN", "J"),
    ("CREATE", "C"),
    ("PART", "L"),
    ("KICK", "K"),
    ("TOPIC", "T"),
    ("MODE", "M"),
    ("INVITE", "I"),
    ("NAMES", "E"),
    ("BURST", "B"),
    ("EOB", "EB"),
    ("EOB_ACK", "EA"),
    ("PRIVMSG", "P"),
    ("NOTICE", "O"),
    ("WALLCHOPS", "WC"),
    ("WALLOPS", "WA"),
    ("GLINE", "GL"),
    ("JUPE", "JU"),
    ("CLEARMODE", "CM"),
    ("OPMODE", "OM"),
    ("PING", "G"),
    ("PONG", "Z"),
    ("SETTIME", "SE"),
    ("AWAY", "A"),
    ("SILENCE", "U"),
    ("ERROR", "Y"),
];

/// The peer token for a command name.
pub fn token_for(name: &str) -> Option<&'static str> {
    TOKENS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, t)| *t)
}

/// The command name for a peer token. Tokens are case-sensitive.
pub fn name_for_token(tok: &str) -> Option<&'static str> {
    TOKENS.iter().find(|(_, t)| *t == tok).map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        assert_eq!(token_for("BURST"), Some("B"));
        assert_eq!(token_for("burst"), Some("B"));
        assert_eq!(name_for_token("EA"), Some("EOB_ACK"));
        assert_eq!(name_for_token("ea"), None);
        assert_eq!(token_for("NOSUCH"), None);
    }

    #[test]
    fn test_tokens_are_short_and_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for (name, tok) in TOKENS {
            assert!((1..=4).contains(&tok.len()), "token {tok} for {name}");
            assert!(seen.insert(*tok), "duplicate token {tok}");
        }
    }
}
