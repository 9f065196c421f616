//! Subprocess output is echoed to the operator's terminal; escape sequences
//! from tools like `mkfs` or `parted` must not reach it.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC and DCS-style strings end with BEL or ESC \.
    Str { saw_esc: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut esc: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']' | 'P' | 'X' | '^' | '_') => Some(Escape::Str { saw_esc: false }),
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Str { .. }, '\x07') => None,
                (Escape::Str { saw_esc: true }, '\\') => None,
                (Escape::Str { .. }, '\x1b') => Some(Escape::Str { saw_esc: true }),
                (Escape::Str { .. }, _) => Some(Escape::Str { saw_esc: false }),
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }

        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "mke2fs \u{1b}[1;32mdone\u{1b}[0m \u{1b}]0;title\u{7}ok";
        assert_eq!(sanitize_log_line(input), "mke2fs done ok");
    }

    #[test]
    fn strips_controls_and_expands_tabs() {
        assert_eq!(sanitize_log_line("a\tb\r\n\u{202e}c"), "a bc");
    }

    #[test]
    fn caps_very_long_lines() {
        let long = "x".repeat(10_000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with("...[truncated]"));
        assert_eq!(got.chars().filter(|c| *c == 'x').count(), 4096);
    }
}
