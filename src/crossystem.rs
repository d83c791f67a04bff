// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crossystem data: what the firmware tells the kernel (and the userspace
//! `crossystem` tool) about this boot.
//!
//! The read-only bootstub creates it once per boot at a fixed RAM address.
//! If it jumps to read-write firmware, that firmware finds the blob at the
//! same address, checks it, and updates the active firmware fields. Finally
//! it is exported into the kernel's device tree. It is never written to
//! flash.
//!
//! The two stages are separate builds, so the in-memory layout is a contract
//! between them. It is pinned below with static assertions rather than left
//! to the compiler.

use core::mem::{offset_of, size_of};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::fdt::{self, DeviceTree, FdtError};
use crate::minirt::{c_field, copy_c_field};
use crate::switches::{HardwareSwitch, Switches};

pub const CROSSYSTEM_DATA_SIGNATURE: [u8; 8] = *b"CHROMEOS";
pub const CROSSYSTEM_DATA_VERSION: u32 = 1;

/// RAM reserved for the blob. The GBB copy starts right after it.
pub const CROSSYSTEM_DATA_MAX_SIZE: usize = 0x8000;

/// Size of the verified boot library's shared data area when recovery is
/// possible.
pub const VB_SHARED_DATA_REC_SIZE: usize = 16 * 1024;

pub const ID_LEN: usize = 256;
pub const ARCH_DATA_LEN: usize = 256;

/// Where the device tree export goes.
pub const FDT_NODE_PATH: &str = "/firmware/chromeos";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum ActiveEcFirmware {
    Ro = 0,
    Rw = 1,
}

impl ActiveEcFirmware {
    pub fn name(self) -> &'static str {
        match self {
            ActiveEcFirmware::Ro => "RO",
            ActiveEcFirmware::Rw => "RW",
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum FirmwareType {
    Recovery = 0,
    Normal = 1,
    Developer = 2,
}

impl FirmwareType {
    pub fn name(self) -> &'static str {
        match self {
            FirmwareType::Recovery => "recovery",
            FirmwareType::Normal => "normal",
            FirmwareType::Developer => "developer",
        }
    }
}

/// Location of the verified boot non-volatile context on the boot disk.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct NvContextLocation {
    pub lba: u32,
    pub offset: u32,
    pub size: u32,
}

/// The board-specific part of the blob.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ArchData {
    pub nvcontext: Option<NvContextLocation>,
}

impl ArchData {
    // Three little-endian words; a zero size means the board has none.
    fn encode(&self, out: &mut [u8; ARCH_DATA_LEN]) {
        out.fill(0);
        if let Some(nv) = self.nvcontext {
            out[0..4].copy_from_slice(&nv.lba.to_le_bytes());
            out[4..8].copy_from_slice(&nv.offset.to_le_bytes());
            out[8..12].copy_from_slice(&nv.size.to_le_bytes());
        }
    }

    fn decode(raw: &[u8; ARCH_DATA_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let nvcontext = (word(8) != 0).then(|| NvContextLocation {
            lba: word(0),
            offset: word(4),
            size: word(8),
        });
        ArchData { nvcontext }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntegrityError {
    SizeMismatch,
    BadSignature,
    VersionMismatch,
    /// The memory handed to `from_memory` can't hold a blob at all (too
    /// short or misaligned).
    Misplaced,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EmbedError {
    /// The tree couldn't be enlarged. Nothing was written.
    Grow(FdtError),
    Node(FdtError),
    Property(&'static str, FdtError),
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct CrossystemData {
    pub total_size: u32,
    pub signature: [u8; 8],
    pub version: u32,

    // Switch snapshot, taken once at the start of the boot.
    pub boot_write_protect_switch: u32,
    pub boot_recovery_switch: u32,
    pub boot_developer_switch: u32,
    pub polarity_write_protect_switch: u32,
    pub polarity_recovery_switch: u32,
    pub polarity_developer_switch: u32,
    pub gpio_phandle_write_protect_switch: u32,
    pub gpio_phandle_recovery_switch: u32,
    pub gpio_phandle_developer_switch: u32,
    pub gpio_port_write_protect_switch: u32,
    pub gpio_port_recovery_switch: u32,
    pub gpio_port_developer_switch: u32,

    pub fmap_offset: u32,
    pub active_ec_firmware: u8,
    pub firmware_type: u8,
    _pad: [u8; 2],

    pub hardware_id: [u8; ID_LEN],
    pub readonly_firmware_id: [u8; ID_LEN],
    /// The only ID that changes after `init`: it follows the firmware that
    /// was finally selected.
    pub firmware_id: [u8; ID_LEN],

    pub arch_data: [u8; ARCH_DATA_LEN],

    /// Owned by the verified boot library; we only forward it.
    pub vbshared_data: [u8; VB_SHARED_DATA_REC_SIZE],
}

const_assert_eq!(offset_of!(CrossystemData, signature), 4);
const_assert_eq!(offset_of!(CrossystemData, version), 12);
const_assert_eq!(offset_of!(CrossystemData, boot_write_protect_switch), 16);
const_assert_eq!(offset_of!(CrossystemData, fmap_offset), 64);
const_assert_eq!(offset_of!(CrossystemData, active_ec_firmware), 68);
const_assert_eq!(offset_of!(CrossystemData, hardware_id), 72);
const_assert_eq!(offset_of!(CrossystemData, readonly_firmware_id), 328);
const_assert_eq!(offset_of!(CrossystemData, firmware_id), 584);
const_assert_eq!(offset_of!(CrossystemData, arch_data), 840);
const_assert_eq!(offset_of!(CrossystemData, vbshared_data), 1096);
const_assert_eq!(size_of::<CrossystemData>(), 1096 + VB_SHARED_DATA_REC_SIZE);
const_assert!(size_of::<CrossystemData>() <= CROSSYSTEM_DATA_MAX_SIZE);

impl CrossystemData {
    /// Fills in a fresh blob. Called once per boot, by the bootstub.
    pub fn init(
        &mut self,
        switches: &Switches,
        fmap_offset: u32,
        active_ec_firmware: ActiveEcFirmware,
        hardware_id: &[u8],
        readonly_firmware_id: &[u8],
        arch: &ArchData,
    ) {
        self.as_bytes_mut().fill(0);

        self.total_size = size_of::<Self>() as u32;
        self.signature = CROSSYSTEM_DATA_SIGNATURE;
        self.version = CROSSYSTEM_DATA_VERSION;

        let record = |switch: &HardwareSwitch| {
            (switch.value as u32, switch.gpio.polarity(), switch.gpio.phandle, switch.gpio.port)
        };
        (
            self.boot_write_protect_switch,
            self.polarity_write_protect_switch,
            self.gpio_phandle_write_protect_switch,
            self.gpio_port_write_protect_switch,
        ) = record(&switches.write_protect);
        (
            self.boot_recovery_switch,
            self.polarity_recovery_switch,
            self.gpio_phandle_recovery_switch,
            self.gpio_port_recovery_switch,
        ) = record(&switches.recovery);
        (
            self.boot_developer_switch,
            self.polarity_developer_switch,
            self.gpio_phandle_developer_switch,
            self.gpio_port_developer_switch,
        ) = record(&switches.developer);

        self.fmap_offset = fmap_offset;
        self.active_ec_firmware = active_ec_firmware as u8;

        copy_c_field(&mut self.hardware_id, hardware_id);
        copy_c_field(&mut self.readonly_firmware_id, readonly_firmware_id);
        // Until a selection is made, we're running the read-only firmware.
        copy_c_field(&mut self.firmware_id, readonly_firmware_id);

        arch.encode(&mut self.arch_data);
    }

    /// Checks that this is a blob we understand. Pure; never modifies it.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        if self.total_size as usize != size_of::<Self>() {
            return Err(IntegrityError::SizeMismatch);
        }
        if self.signature != CROSSYSTEM_DATA_SIGNATURE {
            return Err(IntegrityError::BadSignature);
        }
        if self.version != CROSSYSTEM_DATA_VERSION {
            return Err(IntegrityError::VersionMismatch);
        }
        Ok(())
    }

    /// Views `memory` (the fixed RAM location) as a blob without looking at
    /// its contents. The bootstub uses this before `init`.
    pub fn place(memory: &mut [u8]) -> Result<&mut Self, IntegrityError> {
        let (blob, _) = LayoutVerified::<_, Self>::new_from_prefix(memory)
            .ok_or(IntegrityError::Misplaced)?;
        Ok(blob.into_mut())
    }

    /// Views `memory` as a blob left by an earlier stage, refusing it unless
    /// it passes `check_integrity`.
    pub fn from_memory(memory: &mut [u8]) -> Result<&mut Self, IntegrityError> {
        let blob = Self::place(memory)?;
        blob.check_integrity()?;
        Ok(blob)
    }

    /// Records the firmware we're committed to.
    pub fn set_main_firmware(&mut self, firmware_type: FirmwareType, firmware_id: &[u8]) {
        self.firmware_type = firmware_type as u8;
        copy_c_field(&mut self.firmware_id, firmware_id);
    }

    pub fn active_ec(&self) -> Option<ActiveEcFirmware> {
        ActiveEcFirmware::from_u8(self.active_ec_firmware)
    }

    pub fn main_firmware_type(&self) -> Option<FirmwareType> {
        FirmwareType::from_u8(self.firmware_type)
    }

    pub fn arch(&self) -> ArchData {
        ArchData::decode(&self.arch_data)
    }

    /// Writes every field into the device tree under `/firmware/chromeos`.
    ///
    /// The tree is enlarged first, so a failure to grow leaves it untouched.
    /// Failing here only costs the export; whether to boot without it is the
    /// caller's call.
    pub fn embed_into_fdt(&self, fdt: &mut dyn DeviceTree) -> Result<(), EmbedError> {
        let new_size = fdt.total_size() + size_of::<Self>() + 4096;
        fdt.resize(new_size).map_err(EmbedError::Grow)?;

        let node = fdt::ensure_path(fdt, FDT_NODE_PATH).map_err(EmbedError::Node)?;

        macro_rules! prop {
            ($name:literal, $set:expr) => {
                $set.map_err(|e: FdtError| EmbedError::Property($name, e))?
            };
        }

        prop!("compatible", fdt::set_string(fdt, node, "compatible", b"chromeos-firmware"));
        prop!("total-size", fdt::set_u32(fdt, node, "total-size", self.total_size));
        prop!("signature", fdt::set_string(fdt, node, "signature", &self.signature));
        prop!("version", fdt::set_u32(fdt, node, "version", self.version));

        prop!(
            "boot-write-protect-switch",
            fdt::set_u32(fdt, node, "boot-write-protect-switch", self.boot_write_protect_switch)
        );
        prop!(
            "boot-recovery-switch",
            fdt::set_u32(fdt, node, "boot-recovery-switch", self.boot_recovery_switch)
        );
        prop!(
            "boot-developer-switch",
            fdt::set_u32(fdt, node, "boot-developer-switch", self.boot_developer_switch)
        );
        prop!(
            "write-protect-switch",
            fdt::set_cells(
                fdt,
                node,
                "write-protect-switch",
                &[
                    self.gpio_phandle_write_protect_switch,
                    self.gpio_port_write_protect_switch,
                    self.polarity_write_protect_switch,
                ],
            )
        );
        prop!(
            "recovery-switch",
            fdt::set_cells(
                fdt,
                node,
                "recovery-switch",
                &[
                    self.gpio_phandle_recovery_switch,
                    self.gpio_port_recovery_switch,
                    self.polarity_recovery_switch,
                ],
            )
        );
        prop!(
            "developer-switch",
            fdt::set_cells(
                fdt,
                node,
                "developer-switch",
                &[
                    self.gpio_phandle_developer_switch,
                    self.gpio_port_developer_switch,
                    self.polarity_developer_switch,
                ],
            )
        );

        prop!("fmap-offset", fdt::set_u32(fdt, node, "fmap-offset", self.fmap_offset));

        let ec = self.active_ec().map(ActiveEcFirmware::name).unwrap_or("");
        prop!("active-ec-firmware", fdt::set_string(fdt, node, "active-ec-firmware", ec.as_bytes()));
        let fw_type = self.main_firmware_type().map(FirmwareType::name).unwrap_or("");
        prop!("firmware-type", fdt::set_string(fdt, node, "firmware-type", fw_type.as_bytes()));

        prop!(
            "hardware-id",
            fdt::set_string(fdt, node, "hardware-id", c_field(&self.hardware_id))
        );
        prop!(
            "firmware-version",
            fdt::set_string(fdt, node, "firmware-version", c_field(&self.firmware_id))
        );
        prop!(
            "readonly-firmware-version",
            fdt::set_string(
                fdt,
                node,
                "readonly-firmware-version",
                c_field(&self.readonly_firmware_id)
            )
        );

        if let Some(nv) = self.arch().nvcontext {
            prop!(
                "nonvolatile-context-lba",
                fdt::set_u32(fdt, node, "nonvolatile-context-lba", nv.lba)
            );
            prop!(
                "nonvolatile-context-offset",
                fdt::set_u32(fdt, node, "nonvolatile-context-offset", nv.offset)
            );
            prop!(
                "nonvolatile-context-size",
                fdt::set_u32(fdt, node, "nonvolatile-context-size", nv.size)
            );
        }

        prop!(
            "vboot-shared-data",
            fdt.set_property(node, "vboot-shared-data", &self.vbshared_data)
        );

        Ok(())
    }

    /// Logs the whole blob, minus the opaque shared data.
    pub fn dump(&self) {
        fn id(field: &[u8]) -> &str {
            core::str::from_utf8(c_field(field)).unwrap_or("<binary>")
        }

        log::debug!("crossystem data at {:p}:", self);
        log::debug!(
            "  total_size {:#x} signature {:?} version {}",
            self.total_size,
            core::str::from_utf8(&self.signature).unwrap_or("<binary>"),
            self.version
        );
        log::debug!(
            "  switches: wp {} (pol {} gpio {:#x}/{}) rec {} (pol {} gpio {:#x}/{}) dev {} (pol {} gpio {:#x}/{})",
            self.boot_write_protect_switch,
            self.polarity_write_protect_switch,
            self.gpio_phandle_write_protect_switch,
            self.gpio_port_write_protect_switch,
            self.boot_recovery_switch,
            self.polarity_recovery_switch,
            self.gpio_phandle_recovery_switch,
            self.gpio_port_recovery_switch,
            self.boot_developer_switch,
            self.polarity_developer_switch,
            self.gpio_phandle_developer_switch,
            self.gpio_port_developer_switch
        );
        log::debug!(
            "  fmap_offset {:#x} active_ec {:?} firmware_type {:?}",
            self.fmap_offset,
            self.active_ec(),
            self.main_firmware_type()
        );
        log::debug!("  hardware_id {:?}", id(&self.hardware_id));
        log::debug!("  readonly_firmware_id {:?}", id(&self.readonly_firmware_id));
        log::debug!("  firmware_id {:?}", id(&self.firmware_id));
        log::debug!("  arch {:?}", self.arch());
    }
}
