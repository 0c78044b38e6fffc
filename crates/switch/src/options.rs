use std::time::Duration;

use crate::SwitchError;

/// Input switching strategy, constant for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Stop the current input, then start the next one once the stop
    /// completed.
    #[default]
    Sequential,
    /// Start the next input first; the current one is stopped when the
    /// next produces its first packet.
    Delayed,
    /// Keep all inputs running and flip the current pointer atomically.
    Fast,
}

/// Options of the switch core.
#[derive(Debug, Clone)]
pub struct SwitchOptions {
    /// Index of the input to start with.
    pub first_input: usize,
    /// Optional privileged input that pre-empts others when it produces.
    pub primary_input: Option<usize>,
    /// Number of complete cycles through all inputs before terminating.
    /// Zero means unlimited.
    pub cycle_count: usize,
    /// Terminate the run when the first input session ends.
    pub terminate: bool,
    /// Switching strategy.
    pub strategy: Strategy,
    /// Capacity of each input packet ring, in packets.
    pub buffered_packets: usize,
    /// Maximum number of packets per receive operation.
    pub max_input_packets: usize,
    /// Receive timeout triggering automatic failover. Zero disables the
    /// watchdog.
    pub receive_timeout: Duration,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            first_input: 0,
            primary_input: None,
            cycle_count: 0,
            terminate: false,
            strategy: Strategy::default(),
            buffered_packets: 512,
            max_input_packets: 128,
            receive_timeout: Duration::ZERO,
        }
    }
}

impl SwitchOptions {
    /// Check the options against the number of configured inputs.
    pub fn validate(&self, input_count: usize) -> Result<(), SwitchError> {
        if input_count == 0 {
            return Err(SwitchError::Config("at least one input is required".into()));
        }
        if self.first_input >= input_count {
            return Err(SwitchError::Config(format!(
                "first input index {} out of range, {} inputs",
                self.first_input, input_count
            )));
        }
        if let Some(primary) = self.primary_input {
            if primary >= input_count {
                return Err(SwitchError::Config(format!(
                    "primary input index {primary} out of range, {input_count} inputs"
                )));
            }
        }
        if self.buffered_packets == 0 {
            return Err(SwitchError::Config("buffered packet count must not be zero".into()));
        }
        if self.max_input_packets == 0 || self.max_input_packets > self.buffered_packets {
            return Err(SwitchError::Config(format!(
                "max input packets must be in 1..={}",
                self.buffered_packets
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SwitchOptions::default().validate(2).is_ok());
    }

    #[test]
    fn test_out_of_range_indexes() {
        let opts = SwitchOptions {
            first_input: 2,
            ..Default::default()
        };
        assert!(opts.validate(2).is_err());

        let opts = SwitchOptions {
            primary_input: Some(3),
            ..Default::default()
        };
        assert!(opts.validate(2).is_err());
    }

    #[test]
    fn test_max_input_packets_bound() {
        let opts = SwitchOptions {
            buffered_packets: 16,
            max_input_packets: 32,
            ..Default::default()
        };
        assert!(opts.validate(1).is_err());
    }
}
