use chrono::{DateTime, Local};

/// Largest payload a classic CAN frame can carry.
pub const CLASSIC_MAX_DLEN: usize = 8;
/// Highest identifier of the standard 11-bit id space.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Highest identifier of the extended 29-bit id space.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Maps a Data Length Code to the number of payload bytes a classic CAN
/// frame carries for it. Identity for 0..=8, anything larger clamps to 8.
pub fn dlc_to_length(dlc: u8) -> usize {
    usize::from(dlc).min(CLASSIC_MAX_DLEN)
}

/// A single classic CAN frame.
///
/// `dlc` is kept separately from `data` on purpose: the length attack sends
/// frames whose payload length disagrees with the advertised DLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub arbitration_id: u32,
    pub dlc: u8,
    pub data: Vec<u8>,
    pub is_extended: bool,
    pub timestamp: DateTime<Local>,
}

impl CanFrame {
    /// Builds a frame, clamping the DLC to the classic range and the payload
    /// to eight bytes. Identifiers above 0x7FF are flagged as extended.
    pub fn new(arbitration_id: u32, dlc: u8, data: &[u8]) -> Self {
        let arbitration_id = arbitration_id & EXTENDED_ID_MAX;
        let take = data.len().min(CLASSIC_MAX_DLEN);
        Self {
            arbitration_id,
            dlc: dlc.min(CLASSIC_MAX_DLEN as u8),
            data: data[..take].to_vec(),
            is_extended: arbitration_id > STANDARD_ID_MAX,
            timestamp: Local::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the payload length differs from what the DLC advertises.
    pub fn is_length_mismatch(&self) -> bool {
        self.data.len() != dlc_to_length(self.dlc)
    }

    pub fn data_hex(&self) -> String {
        hex::encode(&self.data)
    }

    /// The `[RECV]` line the listener emits for every received frame.
    pub fn recv_line(&self) -> String {
        format!(
            "[RECV] ID=0x{:X} DLC={} LEN={} FD=false DATA={}",
            self.arbitration_id,
            self.dlc,
            self.data.len(),
            self.data_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_length_matches_dlc_in_classic_range() {
        for dlc in 0u8..=8 {
            assert_eq!(dlc_to_length(dlc), usize::from(dlc));
        }
    }

    #[test]
    fn canonical_length_clamps_above_eight() {
        for dlc in 9u8..=15 {
            assert_eq!(dlc_to_length(dlc), 8);
        }
        assert_eq!(dlc_to_length(u8::MAX), 8);
    }

    #[test]
    fn frame_new_clamps_dlc_and_payload() {
        let frame = CanFrame::new(0x123, 12, &[0xAA; 12]);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.len(), 8);
        assert!(!frame.is_extended);
        assert!(!frame.is_length_mismatch());
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let frame = CanFrame::new(0x7FF, 0, &[]);
        assert!(frame.is_empty());
        assert_eq!(frame.data_hex(), "");
        assert!(!frame.is_length_mismatch());
    }

    #[test]
    fn extended_ids_are_flagged() {
        let frame = CanFrame::new(0x1234_5678, 2, &[1, 2]);
        assert!(frame.is_extended);
        assert_eq!(frame.arbitration_id, 0x1234_5678);
    }

    #[test]
    fn mismatch_is_detected() {
        let frame = CanFrame::new(0x100, 4, &[1, 2]);
        assert!(frame.is_length_mismatch());
    }

    #[test]
    fn recv_line_shape() {
        let frame = CanFrame::new(0x1A0, 3, &[0xDE, 0xAD, 0x01]);
        assert_eq!(
            frame.recv_line(),
            "[RECV] ID=0x1A0 DLC=3 LEN=3 FD=false DATA=dead01"
        );
    }
}
