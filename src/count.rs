//! Count-handshake signed encoding.
//!
//! `-n-1` lets the receiver distinguish "count arrived with value 0"
//! (transmitted as `-1`) from "still waiting" (raw `0`, the zeroed
//! initial state the cleaner leaves behind).

/// Encodes a token count for transmission.
pub fn encode(n: u32) -> i64 {
    -(n as i64) - 1
}

/// Decodes a transmitted value. `None` means "not yet arrived".
pub fn decode(v: i64) -> Option<u32> {
    if v == 0 {
        None
    } else {
        Some((-v - 1) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_encodes_to_negative_one() {
        assert_eq!(encode(0), -1);
        assert_eq!(decode(-1), Some(0));
    }

    #[test]
    fn not_arrived_decodes_to_none() {
        assert_eq!(decode(0), None);
    }

    #[test]
    fn round_trips_arbitrary_counts() {
        for n in [1u32, 2, 17, 4096] {
            assert_eq!(decode(encode(n)), Some(n));
        }
    }
}
