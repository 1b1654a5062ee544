// Fragment datagram layout, control messages, encode/decode
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of fragments a single test instance is split into.
pub type TestSize = u8;
/// Index of a test instance inside the population of one test size.
pub type TestIndex = u8;
/// Index of a fragment inside one test instance, in `[0, test_size)`.
pub type FragmentIndex = u8;

/// `[test_size][test_index][fragment_index][send_ts: u64 BE]`
pub const HEADER_LEN: usize = 11;
/// Trailing padding carried by every fragment datagram. Ignored on receipt.
pub const PADDING_LEN: usize = 1200;
pub const DATAGRAM_LEN: usize = HEADER_LEN + PADDING_LEN;

/// Every control message on the stream (and the registration datagram) is 8 ASCII bytes.
pub const CONTROL_LEN: usize = 8;
/// Prefix of the warm-up datagrams the server emits before the battery.
pub const WARMUP_PREFIX: &[u8; CONTROL_LEN] = b"WARPTEST";

const RUN_TESTS: &[u8; CONTROL_LEN] = b"RUNTESTS";
const PING: &[u8; CONTROL_LEN] = b"PINGPING";
const REGISTER: &[u8; CONTROL_LEN] = b"REGISTER";
/// `REGISTER` followed by the client's stream port, big-endian.
pub const REGISTRATION_LEN: usize = CONTROL_LEN + 2;

/// Milliseconds since the UNIX epoch, the clock basis shared with the server.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `later - earlier` in signed milliseconds, saturating at the `i64` range.
pub fn signed_diff_ms(later: u64, earlier: u64) -> i64 {
    let diff = later as i128 - earlier as i128;
    diff.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

// Fixed-width big-endian integers give exactly the 11-byte wire header.
fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// The header part of a fragment datagram, exactly as it sits on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub test_size: TestSize,
    pub test_index: TestIndex,
    pub fragment_index: FragmentIndex,
    pub send_timestamp_ms: u64, // Sender's wall clock, ms since UNIX epoch
}

impl FragmentHeader {
    /// Header stamped with the current wall-clock time.
    pub fn stamped_now(test_size: TestSize, test_index: TestIndex, fragment_index: FragmentIndex) -> Self {
        FragmentHeader {
            test_size,
            test_index,
            fragment_index,
            send_timestamp_ms: now_millis(),
        }
    }

    /// Serializes the header followed by `padding_len` filler bytes.
    pub fn encode_datagram(&self, padding_len: usize) -> Result<Vec<u8>, bincode::Error> {
        let mut bytes = header_options().serialize(self)?;
        bytes.resize(HEADER_LEN + padding_len, b'a');
        Ok(bytes)
    }
}

/// One decoded fragment, tagged with the local time it arrived.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentArrivalEvent {
    pub test_size: TestSize,
    pub test_index: TestIndex,
    pub fragment_index: FragmentIndex,
    pub send_timestamp_ms: u64,
    pub arrival_timestamp_ms: u64,
}

impl FragmentArrivalEvent {
    /// Arrival minus send time. Negative when the two clocks disagree.
    pub fn one_way_delay_ms(&self) -> i64 {
        signed_diff_ms(self.arrival_timestamp_ms, self.send_timestamp_ms)
    }
}

/// Decodes a fragment datagram, stamping it with the current wall-clock time.
///
/// Returns `None` for anything that is not a fragment record: wrong length or a
/// recognised control prefix. That is ordinary filtering, not an error.
pub fn decode(raw: &[u8]) -> Option<FragmentArrivalEvent> {
    let header = decode_header(raw)?;
    Some(with_arrival(header, now_millis()))
}

/// Same as [`decode`] with an explicit arrival time.
pub fn decode_at(raw: &[u8], arrival_timestamp_ms: u64) -> Option<FragmentArrivalEvent> {
    decode_header(raw).map(|header| with_arrival(header, arrival_timestamp_ms))
}

fn decode_header(raw: &[u8]) -> Option<FragmentHeader> {
    if raw.len() != DATAGRAM_LEN || raw.starts_with(WARMUP_PREFIX) {
        return None;
    }
    header_options().deserialize(&raw[..HEADER_LEN]).ok()
}

fn with_arrival(header: FragmentHeader, arrival_timestamp_ms: u64) -> FragmentArrivalEvent {
    FragmentArrivalEvent {
        test_size: header.test_size,
        test_index: header.test_index,
        fragment_index: header.fragment_index,
        send_timestamp_ms: header.send_timestamp_ms,
        arrival_timestamp_ms,
    }
}

/// Warm-up marker datagram, padded to the fragment length so only the prefix tells it apart.
pub fn warmup_datagram() -> Vec<u8> {
    let mut bytes = WARMUP_PREFIX.to_vec();
    bytes.resize(DATAGRAM_LEN, b'a');
    bytes
}

/// Fixed 8-byte messages exchanged outside the fragment datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    RunTests, // Starts the battery; followed by the two RunFlags bytes
    Ping,     // Keep-alive on the control stream
    Register, // Prefix of the registration datagram, see `registration_datagram`
}

impl ControlMessage {
    pub fn as_bytes(&self) -> &'static [u8; CONTROL_LEN] {
        match self {
            ControlMessage::RunTests => RUN_TESTS,
            ControlMessage::Ping => PING,
            ControlMessage::Register => REGISTER,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b if b == RUN_TESTS => Some(ControlMessage::RunTests),
            b if b == PING => Some(ControlMessage::Ping),
            b if b == REGISTER => Some(ControlMessage::Register),
            _ => None,
        }
    }
}

/// Registration datagram binding the sender's datagram address to the stream
/// connected from `stream_port`.
pub fn registration_datagram(stream_port: u16) -> [u8; REGISTRATION_LEN] {
    let mut bytes = [0u8; REGISTRATION_LEN];
    bytes[..CONTROL_LEN].copy_from_slice(REGISTER);
    bytes[CONTROL_LEN..].copy_from_slice(&stream_port.to_be_bytes());
    bytes
}

/// Stream port carried by a registration datagram.
pub fn parse_registration(raw: &[u8]) -> Option<u16> {
    if raw.len() != REGISTRATION_LEN || !raw.starts_with(REGISTER) {
        return None;
    }
    Some(u16::from_be_bytes([raw[CONTROL_LEN], raw[CONTROL_LEN + 1]]))
}

/// Remote-side behaviour selected by the flag bytes that follow `RUNTESTS`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub warmup: bool,
    pub inter_fragment_delay: bool,
}

impl RunFlags {
    pub fn to_bytes(self) -> [u8; 2] {
        [flag_byte(self.warmup), flag_byte(self.inter_fragment_delay)]
    }
}

pub fn flag_byte(on: bool) -> u8 {
    if on {
        b'1'
    } else {
        b'0'
    }
}

/// `'0'` / `'1'` to bool, anything else is not a flag.
pub fn parse_flag_byte(byte: u8) -> Option<bool> {
    match byte {
        b'0' => Some(false),
        b'1' => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn datagram(size: u8, index: u8, fragment: u8, ts: u64) -> Vec<u8> {
        FragmentHeader {
            test_size: size,
            test_index: index,
            fragment_index: fragment,
            send_timestamp_ms: ts,
        }
        .encode_datagram(PADDING_LEN)
        .unwrap()
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let bytes = datagram(25, 7, 3, 0x0102_0304_0506_0708);
        assert_eq!(bytes.len(), DATAGRAM_LEN);
        assert_eq!(&bytes[..HEADER_LEN], &[25, 7, 3, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(bytes[HEADER_LEN..].iter().all(|b| *b == b'a'));
    }

    #[test]
    fn test_decode_reproduces_header_bytes() {
        let mut raw = vec![0u8; DATAGRAM_LEN];
        raw[..HEADER_LEN].copy_from_slice(&[200, 99, 199, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88]);
        let event = decode_at(&raw, 42).expect("valid datagram");
        assert_eq!(event.test_size, 200);
        assert_eq!(event.test_index, 99);
        assert_eq!(event.fragment_index, 199);
        assert_eq!(event.send_timestamp_ms, 0xffee_ddcc_bbaa_9988);
        assert_eq!(event.arrival_timestamp_ms, 42);
    }

    #[test]
    fn test_decode_uses_local_clock_for_arrival() {
        let before = now_millis();
        let event = decode(&datagram(10, 0, 0, 1)).unwrap();
        let after = now_millis();
        assert!(event.arrival_timestamp_ms >= before && event.arrival_timestamp_ms <= after);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let good = datagram(10, 1, 2, 1_700_000_000_000);
        assert!(decode_at(&good, 0).is_some());
        assert!(decode_at(&good[..DATAGRAM_LEN - 1], 0).is_none());
        let mut long = good.clone();
        long.push(b'a');
        assert!(decode_at(&long, 0).is_none());
        assert!(decode_at(&[], 0).is_none());
        assert!(decode_at(&good[..HEADER_LEN], 0).is_none());
    }

    #[test]
    fn test_warmup_marker_is_rejected() {
        let warmup = warmup_datagram();
        assert_eq!(warmup.len(), DATAGRAM_LEN);
        assert!(decode_at(&warmup, 0).is_none());
    }

    #[test]
    fn test_one_way_delay_can_be_negative() {
        let mut event = decode_at(&datagram(10, 0, 0, 1_000), 1_250).unwrap();
        assert_eq!(event.one_way_delay_ms(), 250);
        event.arrival_timestamp_ms = 900;
        assert_eq!(event.one_way_delay_ms(), -100);
    }

    #[test]
    fn test_one_way_delay_at_the_edge_of_the_clock() {
        let event = decode_at(&datagram(10, 0, 0, 1 << 63), 1_700_000_000_100).unwrap();
        assert_eq!(event.send_timestamp_ms, 1 << 63);
        assert_eq!(event.one_way_delay_ms(), 1_700_000_000_100 - (1i64 << 62) - (1i64 << 62));

        let event = decode_at(&datagram(10, 0, 0, 0), u64::MAX).unwrap();
        assert_eq!(event.one_way_delay_ms(), i64::MAX);
        let event = decode_at(&datagram(10, 0, 0, u64::MAX), 0).unwrap();
        assert_eq!(event.one_way_delay_ms(), i64::MIN);
    }

    #[test]
    fn test_registration_datagram() {
        let raw = registration_datagram(0xbeef);
        assert_eq!(&raw, b"REGISTER\xbe\xef");
        assert_eq!(parse_registration(&raw), Some(0xbeef));
        assert_eq!(parse_registration(b"REGISTER"), None);
        assert_eq!(parse_registration(b"PINGPING\xbe\xef"), None);
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(ControlMessage::parse(b"RUNTESTS"), Some(ControlMessage::RunTests));
        assert_eq!(ControlMessage::parse(ControlMessage::Ping.as_bytes()), Some(ControlMessage::Ping));
        assert_eq!(ControlMessage::parse(b"REGISTER"), Some(ControlMessage::Register));
        assert_eq!(ControlMessage::parse(b"WARPTEST"), None);
        assert_eq!(ControlMessage::parse(b"RUN"), None);
    }

    #[test]
    fn test_run_flags_bytes() {
        let flags = RunFlags { warmup: true, inter_fragment_delay: false };
        assert_eq!(flags.to_bytes(), *b"10");
        assert_eq!(parse_flag_byte(b'1'), Some(true));
        assert_eq!(parse_flag_byte(b'0'), Some(false));
        assert_eq!(parse_flag_byte(b'x'), None);
    }

    proptest! {
        #[test]
        fn decode_reproduces_any_header(size: u8, index: u8, fragment: u8, ts: u64, arrival: u64) {
            let event = decode_at(&datagram(size, index, fragment, ts), arrival).unwrap();
            prop_assert_eq!(
                (event.test_size, event.test_index, event.fragment_index, event.send_timestamp_ms),
                (size, index, fragment, ts)
            );
            prop_assert_eq!(event.arrival_timestamp_ms, arrival);
            prop_assert_eq!(event.one_way_delay_ms() as i128, (arrival as i128 - ts as i128).clamp(i64::MIN as i128, i64::MAX as i128));
        }

        #[test]
        fn decode_rejects_any_other_length(len in 0usize..4096, fill: u8) {
            prop_assume!(len != DATAGRAM_LEN);
            prop_assert!(decode_at(&vec![fill; len], 0).is_none());
        }
    }
}
