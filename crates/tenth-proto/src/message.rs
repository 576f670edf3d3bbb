//! Nom-based line parser for the P10 / client grammar.
//!
//! ```text
//! [":" <prefix> SP] <verb> (SP <param>){0,14} [SP ":" <trailing>] CRLF
//! ```
//!
//! The verb is either an uppercase command name (local users), a
//! three-digit numeric, or a 1-4 character token (peers). Bytes are
//! treated as opaque; nothing here assumes UTF-8 beyond what the caller
//! already decoded.

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::ParseError;

/// Maximum line length including the CR-LF terminator.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of parameters after the verb, trailing included.
pub const MAX_PARAMS: usize = 15;

/// Parse the message prefix (the part after `:` and before the first space).
fn parse_prefix(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Parse the verb: command name, numeric, or peer token.
fn parse_verb(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

/// Scan the parameters following the verb.
///
/// Regular parameters are space-separated; a parameter beginning with
/// `:` swallows the remainder of the line verbatim. Runs of spaces
/// count as a single separator.
fn scan_params(input: &str) -> Result<Vec<&str>, ParseError> {
    let mut params: Vec<&str> = Vec::new();
    let mut rest = input;

    while rest.as_bytes().first() == Some(&b' ') {
        while rest.as_bytes().first() == Some(&b' ') {
            rest = &rest[1..];
        }
        if rest.is_empty() {
            break;
        }

        if params.len() == MAX_PARAMS {
            return Err(ParseError::TooManyParams);
        }

        if let Some(stripped) = rest.strip_prefix(':') {
            params.push(stripped);
            break;
        }

        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    Ok(params)
}

/// A parsed protocol line with borrowed string slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    /// Sender name or numnick (without the leading `:`), if present.
    pub prefix: Option<&'a str>,
    /// Command name or peer token.
    pub verb: &'a str,
    /// Parameters, trailing included as the final element.
    pub params: Vec<&'a str>,
}

impl<'a> ParsedLine<'a> {
    /// Parse one line, already stripped of its CR-LF terminator.
    ///
    /// Returns `Ok(None)` for an empty line, which the caller ignores.
    pub fn parse(input: &'a str) -> Result<Option<Self>, ParseError> {
        if input.is_empty() || input.bytes().all(|b| b == b' ') {
            return Ok(None);
        }

        let (input, prefix) = opt(parse_prefix)(input).map_err(|_: nom::Err<nom::error::Error<&str>>| ParseError::TruncatedLine)?;
        let (input, _) = space0::<_, nom::error::Error<&str>>(input).map_err(|_| ParseError::TruncatedLine)?;

        let (input, verb) = parse_verb(input).map_err(|_: nom::Err<nom::error::Error<&str>>| ParseError::TruncatedLine)?;

        let params = scan_params(input)?;

        Ok(Some(ParsedLine {
            prefix,
            verb,
            params,
        }))
    }

    /// Parameter by index, if present.
    pub fn param(&self, idx: usize) -> Option<&'a str> {
        self.params.get(idx).copied()
    }

    /// Number of parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

/// Render a line from its parts, choosing `:`-trailing form when the
/// final parameter needs it (contains a space, starts with `:`, or is
/// empty). The terminator is not appended; the send layer owns that.
pub fn format_line(prefix: Option<&str>, verb: &str, params: &[&str]) -> String {
    let mut out = String::with_capacity(64);
    if let Some(p) = prefix {
        out.push(':');
        out.push_str(p);
        out.push(' ');
    }
    out.push_str(verb);

    let last = params.len().checked_sub(1);
    for (i, param) in params.iter().enumerate() {
        out.push(' ');
        let needs_trailing =
            param.is_empty() || param.starts_with(':') || param.contains(' ');
        if Some(i) == last && needs_trailing {
            out.push(':');
        }
        out.push_str(param);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_verb() {
        let msg = ParsedLine::parse("PING").unwrap().unwrap();
        assert_eq!(msg.verb, "PING");
        assert!(msg.prefix.is_none());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_parse_with_trailing() {
        let msg = ParsedLine::parse("PRIVMSG #channel :Hello, world!")
            .unwrap()
            .unwrap();
        assert_eq!(msg.verb, "PRIVMSG");
        assert_eq!(msg.params, vec!["#channel", "Hello, world!"]);
    }

    #[test]
    fn test_parse_numnick_prefix_and_token() {
        let msg = ParsedLine::parse(":ABAAB P #channel :hi").unwrap().unwrap();
        assert_eq!(msg.prefix, Some("ABAAB"));
        assert_eq!(msg.verb, "P");
        assert_eq!(msg.params, vec!["#channel", "hi"]);
    }

    #[test]
    fn test_parse_numeric_verb() {
        let msg = ParsedLine::parse(":server 001 nick :Welcome").unwrap().unwrap();
        assert_eq!(msg.prefix, Some("server"));
        assert_eq!(msg.verb, "001");
        assert_eq!(msg.params, vec!["nick", "Welcome"]);
    }

    #[test]
    fn test_parse_empty_line_ignored() {
        assert_eq!(ParsedLine::parse("").unwrap(), None);
        assert_eq!(ParsedLine::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_bare_prefix_truncated() {
        assert_eq!(
            ParsedLine::parse(":ABAAB").unwrap_err(),
            ParseError::TruncatedLine
        );
        assert_eq!(
            ParsedLine::parse(":ABAAB ").unwrap_err(),
            ParseError::TruncatedLine
        );
    }

    #[test]
    fn test_parse_too_many_params() {
        let mut line = String::from("FOO");
        for i in 0..16 {
            line.push_str(&format!(" p{}", i));
        }
        assert_eq!(
            ParsedLine::parse(&line).unwrap_err(),
            ParseError::TooManyParams
        );
    }

    #[test]
    fn test_parse_exactly_fifteen_params() {
        let mut line = String::from("FOO");
        for i in 0..15 {
            line.push_str(&format!(" p{}", i));
        }
        let msg = ParsedLine::parse(&line).unwrap().unwrap();
        assert_eq!(msg.param_count(), 15);
    }

    #[test]
    fn test_parse_collapses_space_runs() {
        let msg = ParsedLine::parse("MODE  #chan   +o    nick").unwrap().unwrap();
        assert_eq!(msg.params, vec!["#chan", "+o", "nick"]);
    }

    #[test]
    fn test_parse_empty_trailing() {
        let msg = ParsedLine::parse("TOPIC #chan :").unwrap().unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
    }

    #[test]
    fn test_format_simple() {
        assert_eq!(
            format_line(Some("AB"), "G", &["AB", "server.example"]),
            ":AB G AB server.example"
        );
    }

    #[test]
    fn test_format_trailing_forms() {
        assert_eq!(
            format_line(None, "PRIVMSG", &["#c", "two words"]),
            "PRIVMSG #c :two words"
        );
        assert_eq!(format_line(None, "TOPIC", &["#c", ""]), "TOPIC #c :");
        assert_eq!(
            format_line(None, "PRIVMSG", &["#c", ":starts"]),
            "PRIVMSG #c ::starts"
        );
    }

    #[test]
    fn test_round_trip() {
        // parse(format(msg)) == msg for legal messages
        let cases: Vec<(Option<&str>, &str, Vec<&str>)> = vec![
            (Some("ABAAB"), "P", vec!["#chan", "hello there"]),
            (None, "NICK", vec!["someone"]),
            (Some("AB"), "B", vec!["#x", "400", "+ntk", "key", "ABAAC:o"]),
            (Some("AB"), "EB", vec![]),
            (None, "QUIT", vec![""]),
        ];
        for (prefix, verb, params) in cases {
            let rendered = format_line(prefix, verb, &params);
            let parsed = ParsedLine::parse(&rendered).unwrap().unwrap();
            assert_eq!(parsed.prefix, prefix, "line: {rendered}");
            assert_eq!(parsed.verb, verb, "line: {rendered}");
            assert_eq!(parsed.params, params, "line: {rendered}");
        }
    }
}
