//! Jitter Reassembler
//!
//! Gleicht Umsortierung und Jitter im Netz aus und liefert die Pakete
//! lückenlos in Sequenz-Reihenfolge an den Decoder.

use bytes::Bytes;
use std::collections::BTreeMap;

const SEQ_CYCLE: u64 = 1 << 16;

/// Kodierter Audio-Frame mit RTP-Metadaten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl EncodedPacket {
    pub fn new(sequence: u16, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            timestamp,
            payload: payload.into(),
        }
    }
}

/// Sortiert Pakete nach Sequenznummer und überspringt Lücken nach `max_depth`
///
/// Fehlende Pakete werden nicht ersetzt; ob Stille eingefügt wird,
/// entscheidet die Playback-Seite.
#[derive(Debug)]
pub struct JitterReassembler {
    max_depth: usize,
    held: BTreeMap<u64, EncodedPacket>,
    next_expected: Option<u64>,
    highest: Option<u64>,
    lost: u64,
    discarded: u64,
}

impl JitterReassembler {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            held: BTreeMap::new(),
            next_expected: None,
            highest: None,
            lost: 0,
            discarded: 0,
        }
    }

    /// Nimmt ein Paket an und gibt alle jetzt freigegebenen Pakete zurück
    pub fn push(&mut self, packet: EncodedPacket) -> Vec<EncodedPacket> {
        let ext = self.extend(packet.sequence);
        let next = *self.next_expected.get_or_insert(ext);

        if ext < next || self.held.contains_key(&ext) {
            self.discarded += 1;
            tracing::trace!("Discarding late or duplicate packet {}", packet.sequence);
            return Vec::new();
        }

        self.held.insert(ext, packet);

        let mut released = self.release_contiguous();

        // Lücke aufgeben, sobald zu viele Pakete dahinter warten
        while self.held.len() >= self.max_depth {
            let Some((&oldest, _)) = self.held.first_key_value() else {
                break;
            };
            if let Some(next) = self.next_expected {
                let skipped = oldest - next;
                self.lost += skipped;
                tracing::debug!("Giving up on {} missing packet(s) before {}", skipped, oldest);
            }
            self.next_expected = Some(oldest);
            released.extend(self.release_contiguous());
        }

        released
    }

    /// Gibt alle gehaltenen Pakete in Reihenfolge frei (z.B. am Stream-Ende)
    pub fn drain(&mut self) -> Vec<EncodedPacket> {
        let held = std::mem::take(&mut self.held);
        if let Some((&last, _)) = held.last_key_value() {
            self.next_expected = Some(last + 1);
        }
        held.into_values().collect()
    }

    /// Anzahl übersprungener (verlorener) Sequenznummern
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Anzahl verworfener verspäteter oder doppelter Pakete
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn release_contiguous(&mut self) -> Vec<EncodedPacket> {
        let mut released = Vec::new();
        while let Some(next) = self.next_expected {
            match self.held.remove(&next) {
                Some(packet) => {
                    released.push(packet);
                    self.next_expected = Some(next + 1);
                }
                None => break,
            }
        }
        released
    }

    /// Erweitert die 16-bit Sequenznummer um einen Wrap-Zähler
    fn extend(&mut self, sequence: u16) -> u64 {
        let ext = match self.highest {
            // Erster Zyklus beginnt bei 1, damit etwas ältere Pakete nicht unterlaufen
            None => SEQ_CYCLE + u64::from(sequence),
            Some(highest) => {
                let delta = i64::from(sequence.wrapping_sub(highest as u16) as i16);
                (highest as i64 + delta).max(0) as u64
            }
        };
        if self.highest.map_or(true, |h| ext > h) {
            self.highest = Some(ext);
        }
        ext
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(sequence: u16) -> EncodedPacket {
        EncodedPacket::new(sequence, u32::from(sequence) * 960, vec![sequence as u8])
    }

    fn sequences(packets: &[EncodedPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.sequence).collect()
    }

    #[test]
    fn test_reorders_swapped_packets() {
        let mut jitter = JitterReassembler::new(10);
        let mut out = Vec::new();

        for seq in [1, 2, 4, 3] {
            out.extend(jitter.push(packet(seq)));
        }

        assert_eq!(sequences(&out), vec![1, 2, 3, 4]);
        assert_eq!(jitter.held(), 0);
    }

    #[test]
    fn test_skips_gap_after_depth() {
        let mut jitter = JitterReassembler::new(2);

        assert_eq!(sequences(&jitter.push(packet(1))), vec![1]);
        assert!(jitter.push(packet(3)).is_empty());
        assert_eq!(sequences(&jitter.push(packet(4))), vec![3, 4]);
        assert_eq!(jitter.lost(), 1);

        // Zu spät eingetroffenes Paket 2 wird verworfen
        assert!(jitter.push(packet(2)).is_empty());
        assert_eq!(jitter.discarded(), 1);
    }

    #[test]
    fn test_waits_within_depth() {
        let mut jitter = JitterReassembler::new(10);
        jitter.push(packet(1));
        for seq in 3..=8 {
            assert!(jitter.push(packet(seq)).is_empty());
        }
        assert_eq!(jitter.held(), 6);
        assert_eq!(sequences(&jitter.push(packet(2))), vec![2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_duplicates_are_not_emitted_twice() {
        let mut jitter = JitterReassembler::new(10);
        let mut out = Vec::new();
        for seq in [5, 7, 7, 6, 5, 6] {
            out.extend(jitter.push(packet(seq)));
        }
        assert_eq!(sequences(&out), vec![5, 6, 7]);
        assert_eq!(jitter.discarded(), 3);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jitter = JitterReassembler::new(10);
        let mut out = Vec::new();
        for seq in [65534, 0, 65535, 1] {
            out.extend(jitter.push(packet(seq)));
        }
        assert_eq!(sequences(&out), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_drain_releases_held_in_order() {
        let mut jitter = JitterReassembler::new(10);
        jitter.push(packet(10));
        jitter.push(packet(14));
        jitter.push(packet(12));

        assert_eq!(sequences(&jitter.drain()), vec![12, 14]);
        assert_eq!(jitter.held(), 0);
        assert!(jitter.push(packet(13)).is_empty());
    }
}
