use std::time::Duration;

/// Per-packet metadata carried next to each buffered packet.
///
/// Reset to the empty state before every receive operation so that stale
/// values never leak from a previous session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Time the packet was received, relative to the start of its input
    /// session. `None` when the input did not stamp it.
    input_stamp: Option<Duration>,
    /// 32 label bits that plugins may set to tag packets.
    labels: u32,
}

impl PacketMetadata {
    /// Restore the defined empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn input_stamp(&self) -> Option<Duration> {
        self.input_stamp
    }

    pub fn set_input_stamp(&mut self, stamp: Duration) {
        self.input_stamp = Some(stamp);
    }

    pub fn has_label(&self, label: u8) -> bool {
        label < 32 && self.labels & (1 << label) != 0
    }

    pub fn set_label(&mut self, label: u8) {
        if label < 32 {
            self.labels |= 1 << label;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset() {
        let mut meta = PacketMetadata::default();
        meta.set_input_stamp(Duration::from_millis(40));
        meta.set_label(3);
        assert!(meta.has_label(3));
        meta.reset();
        assert_eq!(meta, PacketMetadata::default());
        assert!(meta.input_stamp().is_none());
        assert!(!meta.has_label(3));
    }

    #[test]
    fn test_label_range() {
        let mut meta = PacketMetadata::default();
        meta.set_label(40);
        assert!(!meta.has_label(40));
    }
}
