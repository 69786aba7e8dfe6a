//! Telnet control-marker filtering.
//!
//! The BIT 802E Telnet server (port 5024) interleaves option negotiation with
//! SCPI payload. The filter here is a byte-level state machine: every byte is
//! classified exactly once, and a sequence cut by a read boundary is carried
//! in the state instead of being guessed at.
//!
//! Recognised sequences:
//!
//! | Bytes                          | Result                |
//! |--------------------------------|-----------------------|
//! | `IAC WILL/WONT/DO/DONT <opt>`  | removed (3 bytes)     |
//! | `IAC SB ... IAC SE`            | removed in full       |
//! | `IAC IAC`                      | one literal `0xFF`    |
//! | `IAC <any other command>`      | removed (2 bytes)     |

/// Interpret-as-command marker.
pub const IAC: u8 = 0xFF;
/// Sub-negotiation end.
pub const SE: u8 = 0xF0;
/// Sub-negotiation begin.
pub const SB: u8 = 0xFA;
/// Option negotiation: sender will perform option.
pub const WILL: u8 = 0xFB;
/// Option negotiation: sender refuses option.
pub const WONT: u8 = 0xFC;
/// Option negotiation: sender requests option.
pub const DO: u8 = 0xFD;
/// Option negotiation: sender forbids option.
pub const DONT: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Stateful stripper for Telnet control sequences.
///
/// Feed it raw reads in order; it emits payload bytes only.
#[derive(Debug, Clone, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    /// Create a filter positioned between sequences.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one read, appending payload bytes to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    out.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.push(IAC);
                    State::Data
                }
                (State::Iac, WILL..=DONT) => State::Option,
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Option, _) => State::Data,
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                // IAC IAC inside a sub-negotiation is escaped option data.
                (State::SubIac, _) => State::Sub,
            };
        }
    }

    /// True while a control sequence has started but not finished.
    #[must_use]
    pub fn is_mid_sequence(&self) -> bool {
        self.state != State::Data
    }

    /// Forget any partially received sequence.
    pub fn reset(&mut self) {
        self.state = State::Data;
    }
}

/// Strip control sequences from a complete buffer.
///
/// An unfinished trailing sequence is dropped, so use [`TelnetFilter`] for
/// streams that arrive in pieces.
#[must_use]
pub fn strip(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    TelnetFilter::new().feed(input, &mut out);
    out
}
