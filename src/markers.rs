//! Scripting shorthand shared by every scenario payload.
//!
//! `^` at either end is a cosmetic anchor and is stripped. Every `$` becomes
//! the protocol line terminator, CRLF.

pub const LINE_END: &str = "\r\n";

/// Expand markers in `payload` into the literal text that goes on the wire.
pub fn expand(payload: &str) -> String {
    payload.trim_matches('^').replace('$', LINE_END)
}

/// Like [`expand`], as bytes.
pub fn expand_bytes(payload: &str) -> Vec<u8> {
    expand(payload).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_anchors_and_expands_terminator() {
        assert_eq!(expand("^version$"), "version\r\n");
        assert_eq!(expand("^STO"), "STO");
        assert_eq!(expand("RED$"), "RED\r\n");
    }

    #[test]
    fn expands_every_dollar() {
        assert_eq!(expand("^set a 0 0 1$1$"), "set a 0 0 1\r\n1\r\n");
        assert_eq!(expand("^set a 0 0 1\r\n1$"), "set a 0 0 1\r\n1\r\n");
    }

    #[test]
    fn strips_repeated_anchors_only_at_ends() {
        assert_eq!(expand("^^a^b^^"), "a^b");
    }

    #[test]
    fn expansion_is_stable_on_expanded_text() {
        let once = expand("^flush_all$");
        assert_eq!(once, "flush_all\r\n");
        assert_eq!(expand(&once), once);
    }

    #[test]
    fn empty_and_bare_markers() {
        assert_eq!(expand(""), "");
        assert_eq!(expand("^"), "");
        assert_eq!(expand("$"), "\r\n");
        assert_eq!(expand_bytes("^OK$"), b"OK\r\n".to_vec());
    }
}
