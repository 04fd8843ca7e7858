//! SAM-BA monitor command language.
//!
//! Commands are ASCII, terminated by `#`, with addresses and values in
//! uppercase hex without a prefix or fixed width.

/// Liveness probe, the monitor answers with a line terminator
pub const PROBE: &[u8] = b"N#";

/// Terminator the monitor sends in reply to a probe
pub const LINE_TERMINATOR: &[u8] = b"\n\r";

/// Bytes read when classifying a probe response
pub const PROBE_READ_LEN: usize = 4;

/// Device word size, the granularity of reads, writes and code loading
pub const WORD_SIZE: usize = 4;

/// Largest payload sent in a single `S` command
pub const MAX_BLOCK: usize = 128;

#[derive(Debug, PartialEq, Clone)]
pub enum MonitorCommand<'a> {
    /// Check the monitor is responding
    Probe,

    /// Read one 32-bit word
    ReadWord(u32),

    /// Write one 32-bit word
    WriteWord(u32, u32),

    /// Write a block of raw bytes starting at the address
    SendBlock(u32, &'a [u8]),

    /// Jump to code at the address
    Execute(u32),
}

impl<'a> MonitorCommand<'a> {
    /// Encode the command as sent on the wire
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MonitorCommand::Probe => PROBE.to_vec(),
            MonitorCommand::ReadWord(a) => format!("w{:X},{:X}#", a, WORD_SIZE).into_bytes(),
            MonitorCommand::WriteWord(a, v) => format!("W{:X},{:X}#", a, v).into_bytes(),
            MonitorCommand::SendBlock(a, data) => {
                let mut b = format!("S{:X},{:X}#", a, data.len()).into_bytes();
                b.extend_from_slice(data);
                b
            }
            MonitorCommand::Execute(a) => format!("G{:X}#", a).into_bytes(),
        }
    }
}

/// Result of a single probe exchange
#[derive(Debug, PartialEq, Clone)]
pub enum ProbeOutcome {
    /// Bare terminator
    Ok,
    /// Terminator padded to four bytes
    Ok4,
    /// Terminator present but at an unexpected length
    BadLength(Vec<u8>),
    /// Nothing arrived
    NoResponse,
    /// Data arrived without a terminator
    Malformed(Vec<u8>),
    /// The exchange failed at the port
    Failed,
}

impl ProbeOutcome {
    /// Classify the bytes received in reply to [`PROBE`]
    pub fn classify(response: &[u8]) -> Self {
        if response.is_empty() {
            return ProbeOutcome::NoResponse;
        }

        let terminated = response
            .windows(LINE_TERMINATOR.len())
            .any(|w| w == LINE_TERMINATOR);
        if !terminated {
            return ProbeOutcome::Malformed(response.to_vec());
        }

        match response.len() {
            2 => ProbeOutcome::Ok,
            4 => ProbeOutcome::Ok4,
            _ => ProbeOutcome::BadLength(response.to_vec()),
        }
    }

    /// Whether the monitor should be considered reachable
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::Ok | ProbeOutcome::Ok4 | ProbeOutcome::BadLength(_)
        )
    }
}

/// Decode the response to a [`MonitorCommand::ReadWord`]
pub fn decode_word(data: &[u8]) -> Option<u32> {
    if data.len() != WORD_SIZE {
        return None;
    }
    let mut b = [0u8; WORD_SIZE];
    b.copy_from_slice(data);
    Some(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_uppercase_hex_without_padding() {
        assert_eq!(MonitorCommand::Probe.encode(), b"N#".to_vec());
        assert_eq!(MonitorCommand::ReadWord(0x308000).encode(), b"w308000,4#".to_vec());
        assert_eq!(
            MonitorCommand::WriteWord(0x00200000, 0x1).encode(),
            b"W200000,1#".to_vec()
        );
        assert_eq!(
            MonitorCommand::WriteWord(0xfffff400, 0xdeadbeef).encode(),
            b"WFFFFF400,DEADBEEF#".to_vec()
        );
        assert_eq!(MonitorCommand::Execute(0x308000).encode(), b"G308000#".to_vec());
    }

    #[test]
    fn send_block_appends_raw_payload() {
        let payload = [0x23u8, 0x00, 0xff];
        assert_eq!(
            MonitorCommand::SendBlock(0x300000, &payload).encode(),
            b"S300000,3##\x00\xff".to_vec()
        );
    }

    #[test]
    fn classifies_probe_responses() {
        assert_eq!(ProbeOutcome::classify(b"\n\r"), ProbeOutcome::Ok);
        assert_eq!(ProbeOutcome::classify(b"\n\r>\n"), ProbeOutcome::Ok4);
        assert_eq!(ProbeOutcome::classify(b">\n\r"), ProbeOutcome::BadLength(b">\n\r".to_vec()));
        assert_eq!(ProbeOutcome::classify(b""), ProbeOutcome::NoResponse);
        assert_eq!(ProbeOutcome::classify(b"\r\n"), ProbeOutcome::Malformed(b"\r\n".to_vec()));
        assert_eq!(ProbeOutcome::classify(b"abcd"), ProbeOutcome::Malformed(b"abcd".to_vec()));
    }

    #[test]
    fn bad_length_still_counts_as_up() {
        assert!(ProbeOutcome::Ok.is_up());
        assert!(ProbeOutcome::Ok4.is_up());
        assert!(ProbeOutcome::BadLength(b">\n\r".to_vec()).is_up());
        assert!(!ProbeOutcome::NoResponse.is_up());
        assert!(!ProbeOutcome::Malformed(vec![0]).is_up());
        assert!(!ProbeOutcome::Failed.is_up());
    }

    #[test]
    fn words_are_little_endian() {
        assert_eq!(decode_word(&[0x78, 0x56, 0x34, 0x12]), Some(0x12345678));
        assert_eq!(decode_word(&[0x78, 0x56, 0x34]), None);
        assert_eq!(decode_word(&[]), None);
    }
}
