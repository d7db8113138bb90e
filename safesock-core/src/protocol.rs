//! SafeSocket wire vocabulary: reserved line prefixes and their grammar.

/// Terminates a payload frame. The suffix carries the sender's salt counter.
pub const MESSAGE_DELIMITER: &str = "SAFE_SOCKET_MESSAGE_DELIMITER_";

/// Acknowledges a received frame. The suffix carries the frame fingerprint.
pub const MESSAGE_ACK: &str = "SAFE_SOCKET_ACK_MESSAGE_";

/// Liveness probe. The suffix carries the heartbeat sequence number.
pub const HEART_BEAT: &str = "SAFE_SOCKET_HEART_BEAT_";

/// Required echo for a heartbeat, carrying the same sequence number.
pub const HEART_BEAT_ACK: &str = "SAFE_SOCKET_ACK_HEART_BEAT_";

/// Friendly shutdown announcement.
pub const DISCONNECT: &str = "SAFE_SOCKET_DISCONNECT";

/// Filter-internal veto marker; never written to the wire.
pub const MESSAGE_DISCARDED: &str = "MESSAGE_DISCARDED_BY_FILTER";

/// Whether a line begins with a prefix reserved for internal traffic.
/// No payload line may legitimately start with any of these; the framing
/// grammar depends on it.
pub fn is_reserved(line: &str) -> bool {
    line.starts_with(MESSAGE_ACK)
        || line.starts_with(HEART_BEAT_ACK)
        || line.starts_with(HEART_BEAT)
        || line.starts_with(MESSAGE_DELIMITER)
        || line.starts_with(MESSAGE_DISCARDED)
        || line.starts_with(DISCONNECT)
}

pub fn delimiter_line(salt: u64) -> String {
    format!("{MESSAGE_DELIMITER}{salt}")
}

pub fn message_ack_line(fingerprint: &str) -> String {
    format!("{MESSAGE_ACK}{fingerprint}")
}

pub fn heartbeat_line(seq: u64) -> String {
    format!("{HEART_BEAT}{seq}")
}

pub fn heartbeat_ack_line(seq: u64) -> String {
    format!("{HEART_BEAT_ACK}{seq}")
}

/// Salt of a delimiter line. None if the line is no delimiter or the
/// suffix is not an integer.
pub fn parse_delimiter(line: &str) -> Option<u64> {
    line.strip_prefix(MESSAGE_DELIMITER)?.parse().ok()
}

/// Sequence number of a heartbeat line.
pub fn parse_heartbeat(line: &str) -> Option<u64> {
    line.strip_prefix(HEART_BEAT)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_are_recognized() {
        assert!(is_reserved(&delimiter_line(12)));
        assert!(is_reserved(&message_ack_line("0a1b")));
        assert!(is_reserved(&heartbeat_line(0)));
        assert!(is_reserved(&heartbeat_ack_line(0)));
        assert!(is_reserved(DISCONNECT));
        assert!(is_reserved(MESSAGE_DISCARDED));
    }

    #[test]
    fn ordinary_lines_are_not_reserved() {
        assert!(!is_reserved("hello"));
        assert!(!is_reserved(""));
        assert!(!is_reserved("SAFE_SOCKET"));
        // Reserved means "starts with", not "contains".
        assert!(!is_reserved("prefix SAFE_SOCKET_DISCONNECT"));
    }

    #[test]
    fn delimiter_roundtrip() {
        assert_eq!(parse_delimiter(&delimiter_line(0)), Some(0));
        assert_eq!(parse_delimiter(&delimiter_line(u64::MAX)), Some(u64::MAX));
        assert_eq!(parse_delimiter("no delimiter"), None);
    }

    #[test]
    fn malformed_delimiter_salt_is_rejected() {
        assert_eq!(parse_delimiter("SAFE_SOCKET_MESSAGE_DELIMITER_abc"), None);
        assert_eq!(parse_delimiter("SAFE_SOCKET_MESSAGE_DELIMITER_"), None);
        assert_eq!(parse_delimiter("SAFE_SOCKET_MESSAGE_DELIMITER_-1"), None);
    }

    #[test]
    fn heartbeat_roundtrip() {
        assert_eq!(parse_heartbeat(&heartbeat_line(7)), Some(7));
        assert_eq!(parse_heartbeat("SAFE_SOCKET_HEART_BEAT_x"), None);
        // The ack prefix must never parse as a heartbeat.
        assert_eq!(parse_heartbeat(&heartbeat_ack_line(7)), None);
    }
}
