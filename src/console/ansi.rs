//! ANSI escape stripping for serial output.
//!
//! The guest terminal decorates its output with escape sequences (colors,
//! cursor moves, charset selection). Marker and milestone matching runs on
//! stripped text so a color code in the middle of a line never hides a match.

/// Strip ANSI escape sequences and stray control bytes from a line.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars().peekable();

    while let Some(c) = it.next() {
        if c != '\x1b' {
            // BEL/NUL and shift-in/shift-out show up on serial lines too.
            if !matches!(c, '\x07' | '\x00' | '\x0e' | '\x0f') {
                out.push(c);
            }
            continue;
        }
        match it.peek().copied() {
            // CSI: parameters and intermediates, terminated by 0x40..=0x7e.
            Some('[') => {
                it.next();
                for b in it.by_ref() {
                    if ('\x40'..='\x7e').contains(&b) {
                        break;
                    }
                }
            }
            // OSC: runs to BEL or ST (ESC \).
            Some(']') => {
                it.next();
                while let Some(b) = it.next() {
                    if b == '\x07' {
                        break;
                    }
                    if b == '\x1b' && it.peek() == Some(&'\\') {
                        it.next();
                        break;
                    }
                }
            }
            // Charset selection carries one designator char.
            Some('(') | Some(')') => {
                it.next();
                it.next();
            }
            // Two-byte escapes (ESC =, ESC >, ESC M, ...).
            Some(b) if b.is_ascii_alphabetic() || b == '=' || b == '>' => {
                it.next();
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_untouched() {
        assert_eq!(strip_ansi("hello world"), "hello world");
    }

    #[test]
    fn csi_color_removed() {
        assert_eq!(strip_ansi("\x1b[1;32mOK\x1b[0m done"), "OK done");
    }

    #[test]
    fn osc_title_removed() {
        assert_eq!(strip_ansi("\x1b]0;title\x07prompt$"), "prompt$");
    }

    #[test]
    fn charset_and_keypad_escapes_removed() {
        assert_eq!(strip_ansi("\x1b(B\x1b=ready"), "ready");
    }

    #[test]
    fn control_bytes_dropped() {
        assert_eq!(strip_ansi("a\x07b\x00c"), "abc");
    }

    #[test]
    fn marker_survives_embedded_escapes() {
        let line = "\x1b[?2004h__HOST_END__17__ EXIT=0";
        assert_eq!(strip_ansi(line), "__HOST_END__17__ EXIT=0");
    }
}
