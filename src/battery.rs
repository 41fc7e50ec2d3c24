/// Offset and scale of the raw battery code reported by the trap.
const RAW_OFFSET: f64 = 253.0;
const RAW_PER_VOLT: f64 = 72.0;

pub const DEFAULT_EMPTY_VOLTS: f64 = 2.0;
pub const DEFAULT_FULL_VOLTS: f64 = 3.2;

/// Battery state derived from one raw code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// Battery voltage in V. Negative values mean "below empty".
    pub voltage: f64,
    /// Linear state of charge in %, clamped to 0..=100
    pub percentage: u8,
}

/// Maps raw codes to a reading using a linear empty/full voltage range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryModel {
    pub empty_volts: f64,
    pub full_volts: f64,
}

impl Default for BatteryModel {
    fn default() -> Self {
        BatteryModel {
            empty_volts: DEFAULT_EMPTY_VOLTS,
            full_volts: DEFAULT_FULL_VOLTS,
        }
    }
}

impl BatteryModel {
    pub fn new(empty_volts: f64, full_volts: f64) -> Self {
        BatteryModel {
            empty_volts,
            full_volts,
        }
    }

    pub fn compute(&self, battery_raw: u16) -> BatteryReading {
        let voltage = raw_to_voltage(battery_raw);
        BatteryReading {
            voltage,
            percentage: self.percentage(voltage),
        }
    }

    pub fn percentage(&self, voltage: f64) -> u8 {
        let span = self.full_volts - self.empty_volts;
        if span <= 0.0 {
            // Degenerate range, treat it as a step at the empty threshold.
            return if voltage > self.empty_volts { 100 } else { 0 };
        }
        let fraction = ((voltage - self.empty_volts) / span).clamp(0.0, 1.0);
        (fraction * 100.0).round() as u8
    }
}

/// Convert with the default 2.0 V to 3.2 V range.
pub fn compute(battery_raw: u16) -> BatteryReading {
    BatteryModel::default().compute(battery_raw)
}

pub fn raw_to_voltage(battery_raw: u16) -> f64 {
    (f64::from(battery_raw) - RAW_OFFSET) / RAW_PER_VOLT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 0.01,
            "expected {expected} V, got {actual} V"
        );
    }

    #[test]
    fn test_worked_examples() {
        let reading = compute(440);
        assert_close(reading.voltage, 2.6);
        assert_eq!(reading.percentage, 50);

        let reading = compute(458);
        assert_close(reading.voltage, 2.85);
        assert_eq!(reading.percentage, 71);

        let reading = compute(475);
        assert_close(reading.voltage, 3.08);
        assert_eq!(reading.percentage, 90);
    }

    #[test]
    fn test_monotonic_over_all_codes() {
        let mut previous = compute(0);
        for raw in 1..=u16::MAX {
            let reading = compute(raw);
            assert!(reading.voltage >= previous.voltage);
            assert!(reading.percentage >= previous.percentage);
            previous = reading;
        }
    }

    #[test]
    fn test_clamping() {
        // Code 397 is exactly 2.0 V, code 484 is just above 3.2 V.
        assert_eq!(compute(397).percentage, 0);
        assert_eq!(compute(300).percentage, 0);
        assert_eq!(compute(484).percentage, 100);
        assert_eq!(compute(u16::MAX).percentage, 100);
    }

    #[test]
    fn test_below_offset_is_negative_not_an_error() {
        let reading = compute(0);
        assert!(reading.voltage < 0.0);
        assert_eq!(reading.percentage, 0);
    }

    #[test]
    fn test_custom_range() {
        let model = BatteryModel::new(2.4, 2.8);
        assert_eq!(model.percentage(2.6), 50);
        assert_eq!(model.percentage(3.0), 100);
        assert_eq!(model.percentage(2.0), 0);
    }
}
