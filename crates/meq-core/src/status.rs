use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONTROL_MASK: u32 = 0x000F;
pub const ACTIVE: u32 = 0x0001;
pub const RESULT_MASK: u32 = 0x0070;
pub const RESULT_SHIFT: u32 = 4;
pub const PUBLISHING: u32 = 0x0100;
pub const CACHED: u32 = 0x0200;
pub const RETCACHE: u32 = 0x0400;
pub const BREAKPOINT: u32 = 0x0800;
pub const BREAKPOINT_SINGLE_SHOT: u32 = 0x1000;
pub const STOPPED: u32 = 0x2000;
pub const STOP_AT_BREAKPOINT: u32 = 0x4000;
pub const EXEC_STATE_MASK: u32 = 0xF_0000;
pub const EXEC_STATE_SHIFT: u32 = 16;

/// Breakpoint command mask that arms every exec phase at once.
pub const BREAKPOINT_ALL_PHASES: u32 = 0xFF;

/// Packed control status word as reported by the kernel for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusWord(pub u32);

impl StatusWord {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn result_raw(self) -> u8 {
        ((self.0 & RESULT_MASK) >> RESULT_SHIFT) as u8
    }

    pub fn exec_state_raw(self) -> u8 {
        ((self.0 & EXEC_STATE_MASK) >> EXEC_STATE_SHIFT) as u8
    }

    fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

impl From<u32> for StatusWord {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#07x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecPhase {
    /// Shares its value with the kernel's "end of processing" state.
    Idle,
    Request,
    Command,
    Poll,
    Eval,
    Unknown(u8),
}

impl ExecPhase {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Request,
            2 => Self::Command,
            3 => Self::Poll,
            4 => Self::Eval,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Request => 1,
            Self::Command => 2,
            Self::Poll => 3,
            Self::Eval => 4,
            Self::Unknown(raw) => raw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Request => "request",
            Self::Command => "command",
            Self::Poll => "poll",
            Self::Eval => "eval",
            Self::Unknown(_) => "unknown",
        }
    }

    fn glyph(self) -> char {
        match self {
            Self::Idle => '-',
            Self::Request => 'R',
            Self::Command => 'C',
            Self::Poll => 'P',
            Self::Eval => 'E',
            Self::Unknown(raw) => char::from_digit(u32::from(raw & 0xF), 16).unwrap_or('?'),
        }
    }
}

impl fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    #[default]
    None,
    Ok,
    Wait,
    Empty,
    Missing,
    Fail,
}

impl ResultCode {
    /// Reserved encodings 6 and 7 are reported as failures.
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x7 {
            0 => Self::None,
            1 => Self::Ok,
            2 => Self::Wait,
            3 => Self::Empty,
            4 => Self::Missing,
            _ => Self::Fail,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Ok => 1,
            Self::Wait => 2,
            Self::Empty => 3,
            Self::Missing => 4,
            Self::Fail => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ok => "ok",
            Self::Wait => "wait",
            Self::Empty => "empty",
            Self::Missing => "missing",
            Self::Fail => "fail",
        }
    }

    fn glyph(self) -> char {
        match self {
            Self::None => '-',
            Self::Ok => 'o',
            Self::Wait => 'w',
            Self::Empty => 'e',
            Self::Missing => 'm',
            Self::Fail => 'F',
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded view of a [`StatusWord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status {
    pub is_active: bool,
    pub is_publishing: bool,
    pub has_persistent_breakpoint: bool,
    pub has_single_shot_breakpoint: bool,
    pub is_stopped: bool,
    pub stop_at_breakpoint: bool,
    pub is_cached: bool,
    pub is_retcache: bool,
    pub exec_phase: ExecPhase,
    pub result_code: ResultCode,
}

impl Default for ExecPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl Status {
    pub fn has_breakpoint(&self) -> bool {
        self.has_persistent_breakpoint || self.has_single_shot_breakpoint
    }

    /// Re-packs the decoded fields. Bits the codec does not model come back as zero.
    pub fn encode(&self) -> StatusWord {
        let mut word = 0u32;
        let flags = [
            (self.is_active, ACTIVE),
            (self.is_publishing, PUBLISHING),
            (self.is_cached, CACHED),
            (self.is_retcache, RETCACHE),
            (self.has_persistent_breakpoint, BREAKPOINT),
            (self.has_single_shot_breakpoint, BREAKPOINT_SINGLE_SHOT),
            (self.is_stopped, STOPPED),
            (self.stop_at_breakpoint, STOP_AT_BREAKPOINT),
        ];
        for (set, flag) in flags {
            if set {
                word |= flag;
            }
        }
        word |= (u32::from(self.result_code.raw()) << RESULT_SHIFT) & RESULT_MASK;
        word |= (u32::from(self.exec_phase.raw()) << EXEC_STATE_SHIFT) & EXEC_STATE_MASK;
        StatusWord(word)
    }
}

pub fn decode(word: StatusWord) -> Status {
    Status {
        is_active: word.has(ACTIVE),
        is_publishing: word.has(PUBLISHING),
        has_persistent_breakpoint: word.has(BREAKPOINT),
        has_single_shot_breakpoint: word.has(BREAKPOINT_SINGLE_SHOT),
        is_stopped: word.has(STOPPED),
        stop_at_breakpoint: word.has(STOP_AT_BREAKPOINT),
        is_cached: word.has(CACHED),
        is_retcache: word.has(RETCACHE),
        exec_phase: ExecPhase::from_raw(word.exec_state_raw()),
        result_code: ResultCode::from_raw(word.result_raw()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointTarget {
    Phase(ExecPhase),
    All,
}

/// Breakpoint commands use their own bit space, indexed by exec phase number.
pub fn breakpoint_mask_for_phase(target: BreakpointTarget) -> u32 {
    match target {
        BreakpointTarget::All => BREAKPOINT_ALL_PHASES,
        BreakpointTarget::Phase(phase) => 1u32 << u32::from(phase.raw() & 0xF),
    }
}

/// Eight glyphs: phase, breakpoint, active, publishing, cached, retcache, result, stop.
pub fn format_compact(status: &Status) -> String {
    let breakpoint = match (
        status.has_persistent_breakpoint,
        status.has_single_shot_breakpoint,
    ) {
        (false, false) => '-',
        (true, false) => 'B',
        (false, true) => 'b',
        (true, true) => '*',
    };
    let stop = match (status.is_stopped, status.stop_at_breakpoint) {
        (false, false) => '-',
        (true, false) => 'S',
        (false, true) => 's',
        (true, true) => '#',
    };
    let flag = |set: bool, glyph: char| if set { glyph } else { '-' };

    [
        status.exec_phase.glyph(),
        breakpoint,
        flag(status.is_active, 'A'),
        flag(status.is_publishing, 'P'),
        flag(status.is_cached, 'C'),
        flag(status.is_retcache, 'r'),
        status.result_code.glyph(),
        stop,
    ]
    .iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const SIDE_BITS: [u32; 7] = [
        PUBLISHING,
        CACHED,
        RETCACHE,
        BREAKPOINT,
        BREAKPOINT_SINGLE_SHOT,
        STOPPED,
        STOP_AT_BREAKPOINT,
    ];

    #[test]
    fn result_code_depends_only_on_result_bits() {
        for raw in 0u32..8 {
            let base = StatusWord(raw << RESULT_SHIFT);
            let expected = decode(base).result_code;
            assert_eq!(expected, ResultCode::from_raw(raw as u8));
            for mask in 0u32..(1 << SIDE_BITS.len()) {
                let mut word = base.0 | 0x000F | 0x4_0000;
                for (bit, flag) in SIDE_BITS.iter().enumerate() {
                    if mask & (1 << bit) != 0 {
                        word |= flag;
                    }
                }
                assert_eq!(decode(StatusWord(word)).result_code, expected);
            }
        }
    }

    #[test]
    fn exec_phase_depends_only_on_exec_bits() {
        for raw in 0u32..16 {
            let word = StatusWord((raw << EXEC_STATE_SHIFT) | 0x7F7F | 0xFFF0_0000);
            let phase = decode(word).exec_phase;
            assert_eq!(phase, ExecPhase::from_raw(raw as u8));
            if raw > 4 {
                assert_eq!(phase, ExecPhase::Unknown(raw as u8));
            }
        }
        assert_eq!(decode(StatusWord(0x1_0000)).exec_phase, ExecPhase::Request);
        assert_eq!(decode(StatusWord(0x4_0000)).exec_phase, ExecPhase::Eval);
    }

    #[test]
    fn unknown_bits_are_ignored() {
        let clean = decode(StatusWord(ACTIVE | CACHED));
        let noisy = decode(StatusWord(ACTIVE | CACHED | 0x0080 | 0x8000 | 0xFFF0_0000));
        assert_eq!(clean, noisy);
        assert!(clean.is_active);
        assert!(clean.is_cached);
        assert!(!clean.is_publishing);
    }

    #[test]
    fn flags_decode_individually() {
        let status = decode(StatusWord(
            PUBLISHING | RETCACHE | BREAKPOINT_SINGLE_SHOT | STOP_AT_BREAKPOINT,
        ));
        assert!(status.is_publishing);
        assert!(status.is_retcache);
        assert!(status.has_single_shot_breakpoint);
        assert!(!status.has_persistent_breakpoint);
        assert!(status.stop_at_breakpoint);
        assert!(!status.is_stopped);
        assert!(status.has_breakpoint());
    }

    #[test]
    fn encode_restores_modelled_bits() {
        let word = StatusWord(ACTIVE | PUBLISHING | BREAKPOINT | (2 << RESULT_SHIFT) | 0x3_0000);
        assert_eq!(decode(word).encode(), word);
    }

    #[test]
    fn breakpoint_masks_follow_phase_numbers() {
        assert_eq!(
            breakpoint_mask_for_phase(BreakpointTarget::Phase(ExecPhase::Idle)),
            0x01
        );
        assert_eq!(
            breakpoint_mask_for_phase(BreakpointTarget::Phase(ExecPhase::Poll)),
            0x08
        );
        assert_eq!(
            breakpoint_mask_for_phase(BreakpointTarget::Phase(ExecPhase::Eval)),
            0x10
        );
        assert_eq!(breakpoint_mask_for_phase(BreakpointTarget::All), 0xFF);
    }

    #[test]
    fn compact_format_is_stable_and_eight_wide() {
        let status = decode(StatusWord(
            ACTIVE | CACHED | BREAKPOINT | (1 << RESULT_SHIFT) | 0x4_0000,
        ));
        let first = format_compact(&status);
        assert_eq!(first, "EBA-C-o-");
        assert_eq!(format_compact(&status), first);
        assert_eq!(format_compact(&Status::default()), "--------");
    }

    #[test]
    fn compact_format_changes_when_any_single_field_changes() {
        let base = decode(StatusWord(0x2_0000 | (3 << RESULT_SHIFT)));
        let rendered = format_compact(&base);

        let mut variants = vec![
            Status { is_active: true, ..base },
            Status { is_publishing: true, ..base },
            Status { has_persistent_breakpoint: true, ..base },
            Status { has_single_shot_breakpoint: true, ..base },
            Status { is_stopped: true, ..base },
            Status { stop_at_breakpoint: true, ..base },
            Status { is_cached: true, ..base },
            Status { is_retcache: true, ..base },
        ];
        for phase in [
            ExecPhase::Idle,
            ExecPhase::Request,
            ExecPhase::Poll,
            ExecPhase::Eval,
            ExecPhase::Unknown(9),
        ] {
            variants.push(Status { exec_phase: phase, ..base });
        }
        for code in [
            ResultCode::None,
            ResultCode::Ok,
            ResultCode::Wait,
            ResultCode::Missing,
            ResultCode::Fail,
        ] {
            variants.push(Status { result_code: code, ..base });
        }

        for variant in variants {
            assert_ne!(format_compact(&variant), rendered, "{variant:?}");
        }
    }

    #[test]
    fn compact_format_is_injective_over_decoded_words() {
        let mut seen = HashSet::new();
        let mut rendered = HashSet::new();
        for phase in 0u32..16 {
            for result in 0u32..6 {
                for flags in 0u32..(1 << 9) {
                    let mut word = (phase << EXEC_STATE_SHIFT) | (result << RESULT_SHIFT);
                    if flags & 1 != 0 {
                        word |= ACTIVE;
                    }
                    for (bit, flag) in SIDE_BITS.iter().enumerate() {
                        if flags & (1 << (bit + 1)) != 0 {
                            word |= flag;
                        }
                    }
                    let status = decode(StatusWord(word));
                    if seen.insert(status) {
                        assert!(rendered.insert(format_compact(&status)));
                    }
                }
            }
        }
        assert_eq!(seen.len(), rendered.len());
    }
}
