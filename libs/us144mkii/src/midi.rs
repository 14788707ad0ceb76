//! MIDI byte framing for the bulk endpoints.
//!
//! The device moves MIDI in fixed 9-byte envelopes: a channel-voice message
//! of up to three bytes spans two envelopes, unused payload positions are
//! filled with `0xFD`, and the trailing ninth byte is a status byte that is
//! not part of the MIDI stream. Running status is not expanded here; callers
//! send complete messages.

/// Wire size of one MIDI envelope.
pub const MIDI_PACKET_LEN: usize = 9;

/// Filler byte marking unused payload positions.
pub const MIDI_FILLER: u8 = 0xFD;

/// Frame a 1..=3 byte MIDI message into its two 9-byte envelopes.
///
/// The first envelope leads with the packet header: cable number 0 in the
/// high nibble and the message's status nibble in the low nibble. Returns
/// `None` for an empty or oversized message.
pub fn frame_message(message: &[u8]) -> Option<[[u8; MIDI_PACKET_LEN]; 2]> {
    if message.is_empty() || message.len() > 3 {
        return None;
    }

    let mut first = [MIDI_FILLER; MIDI_PACKET_LEN];
    first[0] = message[0] >> 4;
    first[1] = message[0];
    first[8] = 0x00;

    let mut second = [MIDI_FILLER; MIDI_PACKET_LEN];
    second[0] = message.get(1).copied().unwrap_or(MIDI_FILLER);
    second[1] = message.get(2).copied().unwrap_or(MIDI_FILLER);
    second[8] = 0x00;

    Some([first, second])
}

/// Extract the MIDI payload from one inbound 9-byte envelope: the prefix of
/// the first eight bytes up to (but not including) the first filler byte.
pub fn unframe_packet(packet: &[u8; MIDI_PACKET_LEN]) -> &[u8] {
    let payload = &packet[..MIDI_PACKET_LEN - 1];
    let end = payload
        .iter()
        .position(|&b| b == MIDI_FILLER)
        .unwrap_or(payload.len());
    &payload[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_frames_to_two_envelopes() {
        // S5: note on, middle C, velocity 100.
        let [first, second] = frame_message(&[0x90, 0x3C, 0x64]).unwrap();
        assert_eq!(
            first,
            [0x09, 0x90, 0xFD, 0xFD, 0xFD, 0xFD, 0xFD, 0xFD, 0x00]
        );
        assert_eq!(
            second,
            [0x3C, 0x64, 0xFD, 0xFD, 0xFD, 0xFD, 0xFD, 0xFD, 0x00]
        );
    }

    #[test]
    fn test_short_messages_pad_with_filler() {
        // Two-byte message (program change).
        let [first, second] = frame_message(&[0xC1, 0x07]).unwrap();
        assert_eq!(first[..2], [0x0C, 0xC1]);
        assert_eq!(second[..2], [0x07, 0xFD]);

        // Single byte (real-time clock).
        let [first, second] = frame_message(&[0xF8]).unwrap();
        assert_eq!(first[..2], [0x0F, 0xF8]);
        assert_eq!(second[..2], [0xFD, 0xFD]);
    }

    #[test]
    fn test_empty_and_oversized_messages_are_rejected() {
        assert!(frame_message(&[]).is_none());
        assert!(frame_message(&[0x90, 0x3C, 0x64, 0x00]).is_none());
    }

    #[test]
    fn test_unframe_takes_prefix_before_filler() {
        let packet = [0x90, 0x3C, 0x64, 0xFD, 0xFD, 0xFD, 0xFD, 0xFD, 0x00];
        assert_eq!(unframe_packet(&packet), &[0x90, 0x3C, 0x64]);
    }

    #[test]
    fn test_unframe_all_filler_is_empty() {
        let packet = [0xFD; MIDI_PACKET_LEN];
        assert_eq!(unframe_packet(&packet), &[] as &[u8]);
    }

    #[test]
    fn test_unframe_ignores_trailing_status_byte() {
        // No filler anywhere: all eight payload bytes count, the ninth never.
        let packet = [1, 2, 3, 4, 5, 6, 7, 8, 0xAA];
        assert_eq!(unframe_packet(&packet), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_framed_envelopes_unframe_back() {
        let message = [0x80u8, 0x40, 0x00];
        let [first, second] = frame_message(&message).unwrap();
        let mut reassembled = Vec::new();
        // Byte 0 of the first envelope is the packet header, not MIDI.
        reassembled.push(first[1]);
        reassembled.extend_from_slice(unframe_packet(&second));
        assert_eq!(reassembled, message);
    }
}
