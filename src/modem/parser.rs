//! Modem response parser.
//!
//! The modem intermixes command echo, unsolicited result codes and the final
//! status on one byte stream. A response is complete when a line consisting of
//! exactly `OK` or `ERROR` arrives, framed as `CR LF OK CR LF` — the
//! terminator is a structural match, not a substring scan, so content lines
//! that merely contain `OK` are never truncated. Extended error forms such as
//! `+CME ERROR: 10` terminate the response as soon as the line is emitted.
//!
//! Callers that know the modem must answer (`requires_ok_or_error = true`)
//! have read timeouts swallowed; otherwise a timeout ends the response, which
//! is how the non-newline-terminated `"> "` prompt of `AT+CMGS` is surfaced
//! as an ordinary line.

use std::io;

use log::debug;

/// One read from the serial line: a byte, or nothing within the read timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEvent {
    Byte(u8),
    Timeout,
}

const OK: &[u8] = b"OK";
const ERROR: &[u8] = b"ERROR";

/// Terminator recognition state. The automaton looks for
/// `CR LF` → (`OK` | `ERROR`) → `CR LF`; everything that falls out of a
/// partial match is ordinary content.
enum MatchState {
    /// Inside a content line, waiting for the next CR.
    MidLine,
    /// A CR was consumed, expecting the LF that completes the line break.
    CrSeen,
    /// A full CR LF was consumed; a terminator keyword may start here.
    LineStart,
    /// Matching `OK`/`ERROR` byte by byte.
    Keyword { keyword: &'static [u8], idx: usize },
    /// Keyword fully matched, expecting the trailing CR.
    TailCr,
    /// Trailing CR matched, expecting the final LF.
    TailLf,
}

/// Split the accumulated bytes on `CR LF`, append all non-blank lines (raw,
/// untrimmed) to `lines` and report whether any newly added line contains
/// `ERROR`.
fn flush(lines: &mut Vec<String>, buf: &mut Vec<u8>) -> bool {
    if buf.is_empty() {
        return false;
    }
    let mut error_seen = false;
    let text = String::from_utf8_lossy(buf);
    for line in text.split("\r\n") {
        if !line.trim().is_empty() {
            if line.contains("ERROR") {
                error_seen = true;
            }
            lines.push(line.to_string());
        }
    }
    buf.clear();
    error_seen
}

/// Read bytes from `next_byte` until the response is complete and return the
/// ordered list of non-blank response lines.
///
/// Termination:
/// - a structurally framed `OK` or `ERROR` line,
/// - any emitted line containing the substring `ERROR`,
/// - a read timeout, unless `requires_ok_or_error` is set,
/// - an I/O error, which is propagated.
pub fn parse_response<F>(mut next_byte: F, requires_ok_or_error: bool) -> io::Result<Vec<String>>
where
    F: FnMut() -> io::Result<ByteEvent>,
{
    let mut lines: Vec<String> = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut state = MatchState::MidLine;

    loop {
        let b = match next_byte()? {
            ByteEvent::Timeout => {
                if requires_ok_or_error {
                    debug!("Timeout but still expecting OK or ERROR, keep waiting for response");
                    continue;
                }
                break;
            }
            ByteEvent::Byte(b) => b,
        };

        if matches!(state, MatchState::TailLf) && b == b'\n' {
            // <cr><lf>OK<cr><lf> or <cr><lf>ERROR<cr><lf> completed
            buf.push(b);
            flush(&mut lines, &mut buf);
            return Ok(lines);
        }

        let mut error_seen = false;
        state = match state {
            // A CR anywhere outside the trailing-newline match starts a new
            // line break; flush the content gathered so far.
            MatchState::MidLine
            | MatchState::LineStart
            | MatchState::Keyword { .. }
            | MatchState::TailLf
                if b == b'\r' =>
            {
                error_seen = flush(&mut lines, &mut buf);
                MatchState::CrSeen
            }
            MatchState::MidLine => MatchState::MidLine,
            MatchState::CrSeen => {
                if b == b'\n' {
                    MatchState::LineStart
                } else {
                    MatchState::MidLine
                }
            }
            MatchState::LineStart => match b {
                b'O' => MatchState::Keyword { keyword: OK, idx: 1 },
                b'E' => MatchState::Keyword {
                    keyword: ERROR,
                    idx: 1,
                },
                _ => MatchState::MidLine,
            },
            MatchState::Keyword { keyword, idx } => {
                if b == keyword[idx] {
                    if idx + 1 == keyword.len() {
                        MatchState::TailCr
                    } else {
                        MatchState::Keyword {
                            keyword,
                            idx: idx + 1,
                        }
                    }
                } else {
                    MatchState::MidLine
                }
            }
            MatchState::TailCr => {
                if b == b'\r' {
                    MatchState::TailLf
                } else {
                    MatchState::MidLine
                }
            }
            MatchState::TailLf => MatchState::MidLine,
        };
        buf.push(b);
        if error_seen {
            return Ok(lines);
        }
    }

    // Timeout with no definitive terminator required.
    flush(&mut lines, &mut buf);
    Ok(lines)
}
