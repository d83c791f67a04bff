// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handing the verified kernel to the generic loader.
//!
//! The kernel partition carries its own command line template, signed along
//! with the kernel. It refers to the boot disk symbolically; we fill in the
//! device, partition and partition GUID the verified boot library found the
//! kernel on, then let the loader boot it. The loader calls back just before
//! entering the kernel so the crossystem data can go into the kernel's
//! device tree.

use alloc::string::String;
use core::fmt::Write;

use crate::crossystem::{CrossystemData, EmbedError};
use crate::fdt::DeviceTree;
use crate::minirt::c_field;
use crate::oracle::KernelParams;

/// Size of the kernel parameter block that sits below the bootloader.
pub const CROS_PARAMS_SIZE: u64 = 4096;
/// Size of the command line template that sits below the parameter block.
pub const CROS_CONFIG_SIZE: u64 = 4096;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoaderError {
    /// The command line template isn't inside the kernel buffer.
    NoCommandLine,
    /// The command line template isn't text.
    BadCommandLine,
    /// Setting the loader's boot arguments failed.
    Env,
    /// The crossystem data couldn't be put into the kernel's device tree.
    Fixup(EmbedError),
    /// The loader itself gave up, with its own error code.
    Boot(i32),
}

/// The generic kernel loader (`bootm`).
pub trait KernelLoader {
    fn set_bootargs(&mut self, cmdline: &str) -> Result<(), LoaderError>;

    /// Boots the kernel image at `image`. `fixup` runs on the kernel's device
    /// tree as the very last step before entering the kernel; if it fails the
    /// boot is abandoned. Returns only on failure.
    fn boot(
        &mut self,
        image: u64,
        fixup: &mut dyn FnMut(&mut dyn DeviceTree) -> Result<(), LoaderError>,
    ) -> LoaderError;
}

fn write_guid(out: &mut String, guid: &[u8; 16]) {
    // GPT stores the first three fields little-endian.
    let order = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];
    for (n, &i) in order.iter().enumerate() {
        if matches!(n, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{:02X}", guid[i]);
    }
}

/// Substitutes the boot disk into a command line template.
///
/// - `%D`: the device as a letter (`a` is device 0), or as a number when the
///   next character is `p` (for names like `mmcblk0p3`)
/// - `%P`: the partition number
/// - `%U`: the partition GUID
/// - `%%`: a percent sign
///
/// Any other `%` sequence, including a `%` at the very end, is copied through
/// unchanged.
pub fn rewrite_command_line(template: &str, device: u32, partition: u32, guid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(template.len() + 40);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('D') => {
                let numeric = chars.peek() == Some(&'p');
                match u8::try_from(device).ok().filter(|&d| !numeric && d < 26) {
                    Some(d) => out.push(char::from(b'a' + d)),
                    None => {
                        let _ = write!(out, "{}", device);
                    }
                }
            }
            Some('P') => {
                let _ = write!(out, "{}", partition);
            }
            Some('U') => write_guid(&mut out, guid),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Finds the command line template in a loaded kernel partition.
///
/// `kernel_buffer` holds the partition and starts at physical address
/// `buffer_base`; the template ends `CROS_PARAMS_SIZE` below the bootloader.
pub fn kernel_config(
    kernel_buffer: &[u8],
    buffer_base: u64,
    bootloader_address: u64,
) -> Result<&str, LoaderError> {
    let start = bootloader_address
        .checked_sub(CROS_PARAMS_SIZE + CROS_CONFIG_SIZE)
        .and_then(|at| at.checked_sub(buffer_base))
        .and_then(|at| usize::try_from(at).ok())
        .ok_or(LoaderError::NoCommandLine)?;
    let config = kernel_buffer
        .get(start..start + CROS_CONFIG_SIZE as usize)
        .ok_or(LoaderError::NoCommandLine)?;
    core::str::from_utf8(c_field(config)).map_err(|_| LoaderError::BadCommandLine)
}

/// Boots the kernel the verified boot library selected and loaded. Returns
/// only if that fails.
pub fn boot_kernel(
    loader: &mut dyn KernelLoader,
    params: &KernelParams<'_>,
    cdata: &CrossystemData,
) -> LoaderError {
    let template = match kernel_config(
        &params.kernel_buffer[..],
        params.kernel_buffer_address,
        params.bootloader_address,
    ) {
        Ok(template) => template,
        Err(e) => return e,
    };
    let cmdline = rewrite_command_line(
        template,
        params.disk.device,
        params.partition_number,
        &params.partition_guid,
    );
    log::info!("kernel command line: {}", cmdline);
    if let Err(e) = loader.set_bootargs(&cmdline) {
        return e;
    }

    let mut fixup = |fdt: &mut dyn DeviceTree| {
        cdata.embed_into_fdt(fdt).map_err(|e| {
            log::error!("can't export crossystem data: {:?}", e);
            LoaderError::Fixup(e)
        })
    };
    loader.boot(params.kernel_buffer_address, &mut fixup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DiskHandle;
    use crate::testing::{zeroed_cdata, MemTree, RecordingLoader, TEST_GUID};
    use alloc::vec;

    #[test]
    fn device_letter_and_partition() {
        assert_eq!(
            rewrite_command_line("root=/dev/sd%D%P", 2, 3, &TEST_GUID),
            "root=/dev/sdc3"
        );
    }

    #[test]
    fn device_number_before_p() {
        assert_eq!(
            rewrite_command_line("root=/dev/mmcblk%Dp%P", 0, 5, &TEST_GUID),
            "root=/dev/mmcblk0p5"
        );
        assert_eq!(
            rewrite_command_line("root=/dev/mmcblk%Dp%P", 1, 12, &TEST_GUID),
            "root=/dev/mmcblk1p12"
        );
    }

    #[test]
    fn unknown_escapes_pass_through() {
        assert_eq!(rewrite_command_line("%Z", 0, 0, &TEST_GUID), "%Z");
        assert_eq!(rewrite_command_line("a %% b %", 0, 0, &TEST_GUID), "a % b %");
    }

    #[test]
    fn guid_is_mixed_endian() {
        assert_eq!(
            rewrite_command_line("root=PARTUUID=%U", 0, 0, &TEST_GUID),
            "root=PARTUUID=33221100-5544-7766-8899-AABBCCDDEEFF"
        );
    }

    #[test]
    fn finds_config_below_bootloader() {
        let base = 0x4200_0000;
        let mut buffer = vec![0u8; 0x10000];
        let bootloader = base + 0x9000;
        let config_at = (bootloader - base - CROS_PARAMS_SIZE - CROS_CONFIG_SIZE) as usize;
        buffer[config_at..config_at + 14].copy_from_slice(b"console=tty1 x");
        assert_eq!(kernel_config(&buffer, base, bootloader), Ok("console=tty1 x"));

        assert_eq!(
            kernel_config(&buffer, base, base + 0x1000),
            Err(LoaderError::NoCommandLine)
        );
        assert_eq!(
            kernel_config(&buffer, base, base + 0x20000),
            Err(LoaderError::NoCommandLine)
        );
    }

    #[test]
    fn boot_sets_bootargs_and_exports_crossystem() {
        let base = 0x4200_0000;
        let mut buffer = vec![0u8; 0x10000];
        buffer[0x1000..0x1000 + 22].copy_from_slice(b"root=/dev/mmcblk%Dp%P ");
        let params = KernelParams {
            kernel_buffer: &mut buffer,
            kernel_buffer_address: base,
            disk: DiskHandle { device: 1, cookie: 0 },
            partition_number: 2,
            bootloader_address: base + 0x1000 + CROS_PARAMS_SIZE + CROS_CONFIG_SIZE,
            bootloader_size: 0x1000,
            partition_guid: TEST_GUID,
        };
        let cdata = zeroed_cdata();

        let mut loader = RecordingLoader::new(MemTree::new(256));
        let err = boot_kernel(&mut loader, &params, &cdata);
        assert_eq!(err, LoaderError::Boot(-1));
        assert_eq!(loader.bootargs.as_deref(), Some("root=/dev/mmcblk1p2 "));
        assert_eq!(loader.booted, Some(base));
        assert!(loader.fdt.path_offset("/firmware/chromeos").is_ok());
    }

    #[test]
    fn failed_export_abandons_the_boot() {
        let base = 0;
        let mut buffer = vec![0u8; 0x4000];
        let params = KernelParams {
            kernel_buffer: &mut buffer,
            kernel_buffer_address: base,
            disk: DiskHandle::default(),
            partition_number: 2,
            bootloader_address: CROS_PARAMS_SIZE + CROS_CONFIG_SIZE,
            bootloader_size: 0,
            partition_guid: TEST_GUID,
        };
        let cdata = zeroed_cdata();
        let mut tree = MemTree::new(256);
        tree.refuse_resize();
        let mut loader = RecordingLoader::new(tree);
        assert!(matches!(
            boot_kernel(&mut loader, &params, &cdata),
            LoaderError::Fixup(EmbedError::Grow(_))
        ));
    }
}
