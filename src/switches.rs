// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The three hardware trust switches: write protect, recovery, developer.
//!
//! Each is a GPIO described in `/config` as `<phandle port flags>`. They are
//! read exactly once, at the start of the boot attempt, and every later
//! decision uses that snapshot. Nothing re-reads a switch mid-flow.

use crate::fdt::{self, DeviceTree};
use crate::fmap::ConfigError;
use crate::oracle::init_flags;

/// Bit 0 of a GPIO specifier's flags cell: the signal is active low.
pub const GPIO_ACTIVE_LOW: u32 = 1 << 0;

/// Where a switch is wired.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GpioDescriptor {
    /// Phandle of the GPIO controller.
    pub phandle: u32,
    pub port: u32,
    pub flags: u32,
}

impl GpioDescriptor {
    /// 1 if the switch reads high when asserted, 0 if low. This is the form
    /// the crossystem data records.
    pub fn polarity(&self) -> u32 {
        if self.flags & GPIO_ACTIVE_LOW == 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GpioError;

pub trait Gpio {
    /// Raw level of the pin: true is high.
    fn level(&mut self, gpio: &GpioDescriptor) -> Result<bool, GpioError>;
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HardwareSwitch {
    pub gpio: GpioDescriptor,
    /// Whether the switch is asserted, polarity already applied.
    pub value: bool,
}

impl HardwareSwitch {
    fn decode(
        fdt: &dyn DeviceTree,
        gpio: &mut dyn Gpio,
        config: fdt::Node,
        name: &'static str,
    ) -> Result<Self, ConfigError> {
        let mut cells = [0; 3];
        fdt::read_cells(fdt, config, name, &mut cells).map_err(|e| ConfigError::Missing(name, e))?;
        let descriptor = GpioDescriptor {
            phandle: cells[0],
            port: cells[1],
            flags: cells[2],
        };
        let level = gpio.level(&descriptor).map_err(|_| ConfigError::Gpio(name))?;
        Ok(Self {
            gpio: descriptor,
            value: level == (descriptor.polarity() == 1),
        })
    }
}

/// Snapshot of all three switches.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Switches {
    pub write_protect: HardwareSwitch,
    pub recovery: HardwareSwitch,
    pub developer: HardwareSwitch,
}

impl Switches {
    pub fn decode(fdt: &dyn DeviceTree, gpio: &mut dyn Gpio) -> Result<Self, ConfigError> {
        let config = fdt
            .path_offset("/config")
            .map_err(|e| ConfigError::Missing("/config", e))?;
        let switches = Switches {
            write_protect: HardwareSwitch::decode(fdt, gpio, config, "write-protect-switch")?,
            recovery: HardwareSwitch::decode(fdt, gpio, config, "recovery-switch")?,
            developer: HardwareSwitch::decode(fdt, gpio, config, "developer-switch")?,
        };
        log::info!(
            "switches: wp={} rec={} dev={}",
            switches.write_protect.value as u8,
            switches.recovery.value as u8,
            switches.developer.value as u8
        );
        Ok(switches)
    }

    /// The switch part of the verified boot library's init flags.
    pub fn init_flags(&self) -> u32 {
        let mut flags = 0;
        if self.developer.value {
            flags |= init_flags::DEV_SWITCH_ON;
        }
        if self.recovery.value {
            flags |= init_flags::REC_BUTTON_PRESSED;
        }
        if self.write_protect.value {
            flags |= init_flags::WP_ENABLED;
        }
        flags
    }
}
