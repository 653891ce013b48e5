//! Tool output hygiene: strip terminal escapes, then cap size before the
//! text enters the conversation.

const DEFAULT_BUDGET: usize = 256 * 1024;
const BASH_BUDGET: usize = 1024 * 1024;

/// Byte budget for one tool result. Shell output is allowed more room
/// than other tools.
pub fn output_budget(tool_name: &str) -> usize {
    if tool_name == "bash" {
        BASH_BUDGET
    } else {
        DEFAULT_BUDGET
    }
}

/// Strip ANSI escape sequences and control characters. Newlines and tabs
/// survive; CSI and OSC sequences are removed whole.
pub fn strip_escapes(output: &str) -> String {
    let mut out = String::with_capacity(output.len());
    let mut chars = output.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                // CSI: ESC [ ... final byte in @..~
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... terminated by BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                // Two-character escape
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c.is_control() && c != '\n' && c != '\t' {
            continue;
        }
        out.push(c);
    }

    out
}

/// Cap `output` at `budget` bytes, cutting on a char boundary and
/// appending a marker with the kept and original sizes.
pub fn cap_bytes(output: &str, budget: usize) -> String {
    if output.len() <= budget {
        return output.to_string();
    }
    let kept = (0..=budget).rev().find(|i| output.is_char_boundary(*i));
    let kept = kept.unwrap_or(0);
    format!(
        "{}\n\n[output capped: kept {kept} of {} bytes]",
        &output[..kept],
        output.len()
    )
}

/// Strip escapes, then cap with the per-tool budget.
pub fn clean_output(tool_name: &str, output: &str) -> String {
    cap_bytes(&strip_escapes(output), output_budget(tool_name))
}
