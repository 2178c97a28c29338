//! Register address and write-value limits for the attached inverter

/// Address window and write guards of the polled device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLimits {
    /// Number of addressable holding registers (addresses `0..max_registers`)
    pub max_registers: u16,
    /// Register holding the export power limit, in percent
    pub export_power_register: u16,
    pub export_power_min: u16,
    pub export_power_max: u16,
}

impl Default for RegisterLimits {
    fn default() -> Self {
        Self {
            max_registers: 10,
            export_power_register: 8,
            export_power_min: 0,
            export_power_max: 100,
        }
    }
}

impl RegisterLimits {
    pub fn is_valid_register(&self, register: u16) -> bool {
        register < self.max_registers
    }

    /// Writes to the export power register must stay within its range;
    /// any other valid register accepts the full `u16` range.
    pub fn is_valid_write_value(&self, register: u16, value: u16) -> bool {
        if !self.is_valid_register(register) {
            return false;
        }
        if register == self.export_power_register {
            return (self.export_power_min..=self.export_power_max).contains(&value);
        }
        true
    }

    /// Whether a read of `count` registers from `start` stays in the window
    pub fn is_valid_read(&self, start: u16, count: u16) -> bool {
        count > 0 && u32::from(start) + u32::from(count) <= u32::from(self.max_registers)
    }
}
