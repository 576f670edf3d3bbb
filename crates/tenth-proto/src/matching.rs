//! Wildcard and CIDR mask matching.
//!
//! `*` matches any run, `?` matches one byte; comparison is
//! case-insensitive under the same folding the name hash uses, so a ban
//! and a lookup can never disagree about a name. IP masks use the
//! `a.b.c.d/n` notation for both address families.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::casemap::fold_byte;

/// Match `name` against `mask`.
pub fn match_mask(mask: &str, name: &str) -> bool {
    let m = mask.as_bytes();
    let n = name.as_bytes();
    let mut mi = 0;
    let mut ni = 0;
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if mi < m.len() {
            match m[mi] {
                b'*' => {
                    star = Some((mi, ni));
                    mi += 1;
                    continue;
                }
                b'?' => {
                    mi += 1;
                    ni += 1;
                    continue;
                }
                c if fold_byte(c) == fold_byte(n[ni]) => {
                    mi += 1;
                    ni += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((smi, sni)) => {
                mi = smi + 1;
                ni = sni + 1;
                star = Some((smi, sni + 1));
            }
            None => return false,
        }
    }

    while mi < m.len() && m[mi] == b'*' {
        mi += 1;
    }
    mi == m.len()
}

/// True when `wider` matches every name that `narrower` matches.
///
/// This is mask-versus-mask containment: `*` in the wider mask covers
/// anything (wildcards of the narrower included); `?` covers any single
/// element except the narrower's `*`; a literal covers only the same
/// literal. Used by the ban-list algebra and the G-line overlap rules.
pub fn mask_contains(wider: &str, narrower: &str) -> bool {
    let m = wider.as_bytes();
    let n = narrower.as_bytes();
    let mut mi = 0;
    let mut ni = 0;
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if mi < m.len() {
            let stepped = match m[mi] {
                b'*' => {
                    star = Some((mi, ni));
                    mi += 1;
                    continue;
                }
                b'?' => n[ni] != b'*',
                c => fold_byte(c) == fold_byte(n[ni]),
            };
            if stepped {
                mi += 1;
                ni += 1;
                continue;
            }
        }
        match star {
            Some((smi, sni)) => {
                mi = smi + 1;
                ni = sni + 1;
                star = Some((smi, sni + 1));
            }
            None => return false,
        }
    }

    while mi < m.len() && m[mi] == b'*' {
        mi += 1;
    }
    mi == m.len()
}

/// Normalize a mask's wildcard runs: within each run, `?`s are kept (in
/// front, each still consumes one byte) and any number of `*`s reduce
/// to one. `collapse` of a collapsed mask is a no-op.
pub fn collapse(mask: &str) -> String {
    let bytes = mask.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'*' || b == b'?' {
            let mut questions = 0;
            let mut any_star = false;
            while i < bytes.len() && (bytes[i] == b'*' || bytes[i] == b'?') {
                if bytes[i] == b'?' {
                    questions += 1;
                } else {
                    any_star = true;
                }
                i += 1;
            }
            out.extend(std::iter::repeat(b'?').take(questions));
            if any_star {
                out.push(b'*');
            }
        } else {
            out.push(b);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse an IP address or CIDR string into an [`IpNet`].
///
/// A bare address becomes a /32 (or /128) network.
pub fn ipmask_parse(s: &str) -> Option<IpNet> {
    s.parse().ok().or_else(|| {
        s.parse::<IpAddr>().ok().map(|addr| match addr {
            IpAddr::V4(v4) => {
                IpNet::V4(ipnet::Ipv4Net::new(v4, 32).expect("prefix 32 is valid"))
            }
            IpAddr::V6(v6) => {
                IpNet::V6(ipnet::Ipv6Net::new(v6, 128).expect("prefix 128 is valid"))
            }
        })
    })
}

/// Match an address against a CIDR-form mask. `None` when the mask is
/// not CIDR/IP shaped (callers fall back to the wildcard matcher).
pub fn match_cidr(mask: &str, ip: IpAddr) -> Option<bool> {
    let net = ipmask_parse(mask)?;
    Some(net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_literals_and_case() {
        assert!(match_mask("nick", "nick"));
        assert!(match_mask("NICK", "nick"));
        assert!(match_mask("nick[1]", "NICK{1}"));
        assert!(!match_mask("nick", "nack"));
    }

    #[test]
    fn test_match_wildcards() {
        assert!(match_mask("*!*@*.example.com", "a!b@x.example.com"));
        assert!(match_mask("a?c", "abc"));
        assert!(!match_mask("a?c", "ac"));
        assert!(match_mask("*", ""));
        assert!(match_mask("**a*", "bbba"));
        assert!(!match_mask("*a", "b"));
    }

    #[test]
    fn test_match_backtracking() {
        assert!(match_mask("*abc*abc", "xabcyabcabc"));
        assert!(!match_mask("*abc*abd", "xabcyabcabc"));
    }

    #[test]
    fn test_contains_basic() {
        assert!(mask_contains("*@192.0.2.*", "*@192.0.2.42"));
        assert!(mask_contains("*!*@host", "a!b@host"));
        assert!(mask_contains("a?c", "abc"));
        assert!(mask_contains("a*", "a?"));
        assert!(!mask_contains("a?", "a*"));
        assert!(!mask_contains("*@host.a", "*@host.b"));
    }

    #[test]
    fn test_contains_is_reflexive() {
        for m in ["*!*@*", "a?c*", "nick!user@host"] {
            assert!(mask_contains(m, m), "mask {m}");
        }
    }

    #[test]
    fn test_contains_narrower_does_not_contain_wider() {
        assert!(!mask_contains("*@192.0.2.42", "*@192.0.2.*"));
        assert!(!mask_contains("a!b@host", "*!*@host"));
    }

    #[test]
    fn test_collapse() {
        assert_eq!(collapse("a**b"), "a*b");
        assert_eq!(collapse("*?*"), "?*");
        assert_eq!(collapse("a*?*b??"), "a?*b??");
        assert_eq!(collapse("plain"), "plain");
        assert_eq!(collapse(&collapse("***??***")), collapse("***??***"));
    }

    #[test]
    fn test_cidr() {
        let ip: IpAddr = "192.0.2.42".parse().unwrap();
        assert_eq!(match_cidr("192.0.2.0/24", ip), Some(true));
        assert_eq!(match_cidr("192.0.3.0/24", ip), Some(false));
        assert_eq!(match_cidr("192.0.2.42", ip), Some(true));
        assert_eq!(match_cidr("*.example.com", ip), None);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(match_cidr("2001:db8::/32", v6), Some(true));
        assert_eq!(match_cidr("2001:db9::/32", v6), Some(false));
    }
}
