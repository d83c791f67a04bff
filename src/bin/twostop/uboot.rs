// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bindings to U-Boot and the verified boot library linked into it, and the
//! adapters that implement the boot flow's traits over them.
//!
//! The disk side of the verified boot library's `VbEx*` interface stays in
//! U-Boot's C glue. The firmware body and EC callbacks are exported from here
//! because they need the flow's state.

#![allow(non_snake_case)]

use alloc::vec::Vec;
use core::ffi::{c_char, c_int, c_void};
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes};

use twostop::bsp::RamLayout;
use twostop::ec::{EcChannel, EcError, HashResponse, ProtectError, SHA256_DIGEST_SIZE};
use twostop::fdt::{DeviceTree, FdtError, Node};
use twostop::kernel::{KernelLoader, LoaderError};
use twostop::minirt::{format_fixed, FixedBuf};
use twostop::oracle::{
    CommonParams, DiskHandle, InitParams, KernelParams, SelectFirmwareParams, VbError,
    VbootCallbacks, VbootOracle,
};
use twostop::storage::{FlashGeometry, SpiFlash, StorageError};
use twostop::switches::{self, GpioDescriptor, GpioError};
use twostop::twostop::{DeviceError, Machine};
use twostop::Selection;

const VBERROR_SUCCESS: u32 = 0;
const VBERROR_UNKNOWN: u32 = 0x0001_0000;
const VBERROR_EC_REBOOT_TO_RO_REQUIRED: u32 = 0x0001_0025;

// Default SPI flash the firmware image lives on.
const SF_BUS: u32 = 1;
const SF_CS: u32 = 0;
const SF_SPEED_HZ: u32 = 50_000_000;
const SF_MODE: u32 = 0;

// libfdt error numbers (negated in return values).
const FDT_ERR_NOTFOUND: c_int = 1;
const FDT_ERR_NOSPACE: c_int = 3;
const FDT_ERR_BADVALUE: c_int = 15;

const EC_CMD_VBOOT_HASH: u8 = 0x2a;
const EC_VBOOT_HASH_GET: u8 = 0;
const EC_VBOOT_HASH_START: u8 = 2;
const EC_FLASH_REGION_RW: u32 = 1;

/// U-Boot's `struct spi_flash`. Only the leading, stable part is described.
#[repr(C)]
pub struct SpiFlashC {
    spi: *mut c_void,
    name: *const c_char,
    size: u32,
    page_size: u32,
    sector_size: u32,
    read: unsafe extern "C" fn(flash: *mut SpiFlashC, offset: u32, len: usize, buf: *mut c_void) -> c_int,
    write: unsafe extern "C" fn(flash: *mut SpiFlashC, offset: u32, len: usize, buf: *const c_void) -> c_int,
    erase: unsafe extern "C" fn(flash: *mut SpiFlashC, offset: u32, len: usize) -> c_int,
}

/// The head of U-Boot's `block_dev_desc_t`.
#[repr(C)]
struct BlockDevDescHead {
    if_type: c_int,
    dev: c_int,
}

#[repr(C)]
struct VbCommonParamsC {
    gbb_data: *mut c_void,
    gbb_size: u32,
    shared_data_blob: *mut c_void,
    shared_data_size: u32,
    vboot_context: *mut c_void,
    caller_context: *mut c_void,
}

#[repr(C)]
struct VbInitParamsC {
    flags: u32,
    out_flags: u32,
}

#[repr(C)]
#[allow(non_snake_case)]
struct VbSelectFirmwareParamsC {
    verification_block_A: *mut c_void,
    verification_block_B: *mut c_void,
    verification_size_A: u32,
    verification_size_B: u32,
    selected_firmware: u32,
}

#[repr(C)]
struct VbSelectAndLoadKernelParamsC {
    kernel_buffer: *mut c_void,
    kernel_buffer_size: u32,
    disk_handle: *mut c_void,
    partition_number: u32,
    bootloader_address: u64,
    bootloader_size: u32,
    partition_guid: [u8; 16],
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct EcParamsVbootHash {
    cmd: u8,
    hash_type: u8,
    nonce_size: u8,
    reserved0: u8,
    offset: u32,
    size: u32,
    nonce_data: [u8; 64],
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct EcResponseVbootHash {
    status: u8,
    hash_type: u8,
    digest_size: u8,
    reserved0: u8,
    offset: u32,
    size: u32,
    hash_digest: [u8; 64],
}

#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
#[repr(C)]
struct EcResponseFlashProtect {
    flags: u32,
    valid_flags: u32,
    writable_flags: u32,
}

extern "C" {
    fn puts(s: *const c_char);
    fn mdelay(ms: u32);
    fn cold_reboot() -> !;
    fn power_off() -> !;
    fn cleanup_before_linux() -> c_int;
    fn setenv(name: *const c_char, value: *const c_char) -> c_int;
    fn do_bootm(cmdtp: *mut c_void, flag: c_int, argc: c_int, argv: *const *const c_char) -> c_int;
    fn tis_init() -> c_int;
    fn tis_open() -> c_int;
    fn drv_lcd_init() -> c_int;

    fn fdt_path_offset(blob: *const c_void, path: *const c_char) -> c_int;
    fn fdt_getprop(blob: *const c_void, node: c_int, name: *const c_char, len: *mut c_int) -> *const c_void;
    fn fdt_add_subnode(blob: *mut c_void, parent: c_int, name: *const c_char) -> c_int;
    fn fdt_setprop(blob: *mut c_void, node: c_int, name: *const c_char, val: *const c_void, len: c_int) -> c_int;
    fn fdt_open_into(blob: *const c_void, buf: *mut c_void, bufsize: c_int) -> c_int;

    fn gpio_direction_input(gpio: u32) -> c_int;
    fn gpio_get_value(gpio: u32) -> c_int;

    fn spi_flash_probe(bus: u32, cs: u32, max_hz: u32, mode: u32) -> *mut SpiFlashC;

    fn board_get_cros_ec_dev() -> *mut c_void;
    fn cros_ec_read_current_image(dev: *mut c_void, image: *mut u32) -> c_int;
    fn cros_ec_reboot(dev: *mut c_void, cmd: u32, flags: u8) -> c_int;
    fn cros_ec_flash_protect(
        dev: *mut c_void,
        set_mask: u32,
        set_flags: u32,
        resp: *mut EcResponseFlashProtect,
    ) -> c_int;
    fn cros_ec_flash_offset(dev: *mut c_void, region: u32, offset: *mut u32, size: *mut u32) -> c_int;
    fn cros_ec_flash_erase(dev: *mut c_void, offset: u32, size: u32) -> c_int;
    fn cros_ec_flash_write(dev: *mut c_void, data: *const u8, offset: u32, size: u32) -> c_int;
    fn ec_command(
        dev: *mut c_void,
        cmd: u8,
        cmd_version: c_int,
        dout: *const u8,
        dout_len: c_int,
        din: *mut u8,
        din_len: c_int,
    ) -> c_int;

    fn VbInit(cparams: *mut VbCommonParamsC, iparams: *mut VbInitParamsC) -> u32;
    fn VbSelectFirmware(cparams: *mut VbCommonParamsC, fparams: *mut VbSelectFirmwareParamsC) -> u32;
    fn VbSelectAndLoadKernel(
        cparams: *mut VbCommonParamsC,
        kparams: *mut VbSelectAndLoadKernelParamsC,
    ) -> u32;
    fn VbUpdateFirmwareBodyHash(cparams: *mut VbCommonParamsC, data: *const u8, size: u32);

    /// Bounds of the heap window, placed by the linker script.
    static mut __twostop_heap_start: u8;
    static mut __twostop_heap_end: u8;
}

pub fn console_write(bytes: &mut FixedBuf<256>) {
    // Safety: `as_c_ptr` NUL-terminates the buffer, which outlives the call.
    unsafe { puts(bytes.as_c_ptr().cast()) }
}

pub fn reboot() -> ! {
    // Safety: no preconditions; does not return.
    unsafe { cold_reboot() }
}

pub fn shut_down() -> ! {
    // Safety: no preconditions; does not return.
    unsafe { power_off() }
}

/// The heap window reserved for us, as `(start, size)`.
pub fn heap_window() -> (*mut u8, usize) {
    // Safety: only the addresses of the linker symbols are taken.
    unsafe {
        let start = ptr::addr_of_mut!(__twostop_heap_start);
        let end = ptr::addr_of_mut!(__twostop_heap_end);
        (start, end as usize - start as usize)
    }
}

/// Physical memory the board layout reserves for us.
///
/// # Safety
///
/// `start..start + len` must be RAM nothing else in this program refers to.
pub unsafe fn reserved_ram(start: u64, len: usize) -> &'static mut [u8] {
    core::slice::from_raw_parts_mut(start as usize as *mut u8, len)
}

fn fdt_error(rc: c_int) -> FdtError {
    match -rc {
        FDT_ERR_NOTFOUND => FdtError::NotFound,
        FDT_ERR_NOSPACE => FdtError::NoSpace,
        FDT_ERR_BADVALUE => FdtError::BadValue,
        _ => FdtError::Other(rc),
    }
}

fn fdt_result(rc: c_int) -> Result<c_int, FdtError> {
    if rc < 0 {
        Err(fdt_error(rc))
    } else {
        Ok(rc)
    }
}

/// A flattened device tree handled by libfdt, in place.
pub struct LibFdt {
    blob: *mut c_void,
}

impl LibFdt {
    pub fn new(blob: *mut c_void) -> Self {
        Self { blob }
    }
}

impl DeviceTree for LibFdt {
    fn path_offset(&self, path: &str) -> Result<Node, FdtError> {
        let mut path = FixedBuf::<256>::c_str(path);
        if path.truncated() {
            return Err(FdtError::NotFound);
        }
        // Safety: both pointers are valid C strings / blobs for the call.
        fdt_result(unsafe { fdt_path_offset(self.blob, path.as_c_ptr().cast()) }).map(Node)
    }

    fn property(&self, node: Node, name: &str) -> Result<&[u8], FdtError> {
        let mut name = FixedBuf::<64>::c_str(name);
        let mut len = 0;
        // Safety: libfdt returns a pointer into the blob, which outlives
        // `self`'s borrow, along with its length.
        unsafe {
            let value = fdt_getprop(self.blob, node.0, name.as_c_ptr().cast(), &mut len);
            if value.is_null() {
                return Err(fdt_error(len));
            }
            Ok(core::slice::from_raw_parts(value.cast(), len as usize))
        }
    }

    fn add_subnode(&mut self, parent: Node, name: &str) -> Result<Node, FdtError> {
        let mut name = FixedBuf::<64>::c_str(name);
        // Safety: valid blob and C string.
        fdt_result(unsafe { fdt_add_subnode(self.blob, parent.0, name.as_c_ptr().cast()) }).map(Node)
    }

    fn set_property(&mut self, node: Node, name: &str, value: &[u8]) -> Result<(), FdtError> {
        let mut name = FixedBuf::<64>::c_str(name);
        // Safety: libfdt copies `value` into the blob.
        let rc = unsafe {
            fdt_setprop(
                self.blob,
                node.0,
                name.as_c_ptr().cast(),
                value.as_ptr().cast(),
                value.len() as c_int,
            )
        };
        fdt_result(rc).map(drop)
    }

    fn total_size(&self) -> usize {
        // `totalsize` is the second big-endian word of the header.
        let mut word = [0u8; 4];
        // Safety: every blob starts with a 40-byte header.
        unsafe { ptr::copy_nonoverlapping(self.blob.cast::<u8>().add(4), word.as_mut_ptr(), 4) };
        u32::from_be_bytes(word) as usize
    }

    fn resize(&mut self, new_size: usize) -> Result<(), FdtError> {
        // U-Boot gives the kernel's tree padding to grow into, so it can be
        // reopened in place.
        // Safety: in-place open is allowed by libfdt.
        fdt_result(unsafe { fdt_open_into(self.blob, self.blob, new_size as c_int) }).map(drop)
    }
}

pub struct UbootGpio;

impl switches::Gpio for UbootGpio {
    fn level(&mut self, gpio: &GpioDescriptor) -> Result<bool, GpioError> {
        // Safety: plain calls into the GPIO driver.
        let value = unsafe {
            if gpio_direction_input(gpio.port) < 0 {
                return Err(GpioError);
            }
            gpio_get_value(gpio.port)
        };
        if value < 0 {
            return Err(GpioError);
        }
        Ok(value != 0)
    }
}

/// The SPI flash the firmware image lives on, probed on first use.
pub struct UbootSpiFlash {
    flash: *mut SpiFlashC,
}

impl UbootSpiFlash {
    pub fn new() -> Self {
        Self {
            flash: ptr::null_mut(),
        }
    }

    fn device(&mut self) -> Result<*mut SpiFlashC, StorageError> {
        if self.flash.is_null() {
            return Err(StorageError::Open);
        }
        Ok(self.flash)
    }
}

impl SpiFlash for UbootSpiFlash {
    fn probe(&mut self) -> Result<FlashGeometry, StorageError> {
        if self.flash.is_null() {
            // Safety: the driver hands back a device it owns, or null.
            self.flash = unsafe { spi_flash_probe(SF_BUS, SF_CS, SF_SPEED_HZ, SF_MODE) };
        }
        if self.flash.is_null() {
            log::error!("no SPI flash on bus {} cs {}", SF_BUS, SF_CS);
            return Err(StorageError::Open);
        }
        // Safety: non-null devices stay valid for the life of U-Boot.
        let flash = unsafe { &*self.flash };
        Ok(FlashGeometry {
            size: flash.size,
            sector_size: flash.sector_size,
        })
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let flash = self.device()?;
        // Safety: non-null devices stay valid, and `buf` is ours to fill.
        let rc = unsafe { ((*flash).read)(flash, offset, buf.len(), buf.as_mut_ptr().cast()) };
        if rc != 0 {
            return Err(StorageError::Io);
        }
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        let flash = self.device()?;
        // Safety: as for `read`.
        let rc = unsafe { ((*flash).erase)(flash, offset, len as usize) };
        if rc != 0 {
            return Err(StorageError::Io);
        }
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let flash = self.device()?;
        // Safety: as for `read`; the driver only reads `data`.
        let rc = unsafe { ((*flash).write)(flash, offset, data.len(), data.as_ptr().cast()) };
        if rc != 0 {
            return Err(StorageError::Io);
        }
        Ok(())
    }
}

fn ec_result(rc: c_int) -> Result<(), EcError> {
    if rc < 0 {
        return Err(EcError::Channel);
    }
    Ok(())
}

pub struct CrosEc {
    dev: *mut c_void,
}

impl CrosEc {
    pub fn find() -> Option<Self> {
        // Safety: returns the board's EC device, or null.
        let dev = unsafe { board_get_cros_ec_dev() };
        if dev.is_null() {
            log::warn!("board has no EC device");
            return None;
        }
        Some(Self { dev })
    }

    fn vboot_hash(&mut self, cmd: u8, hash_type: u8, offset: u32) -> Result<HashResponse, EcError> {
        let mut params = EcParamsVbootHash::new_zeroed();
        params.cmd = cmd;
        params.hash_type = hash_type;
        params.offset = offset;
        let mut resp = EcResponseVbootHash::new_zeroed();
        // Safety: both buffers are plain structs sized as passed.
        let rc = unsafe {
            ec_command(
                self.dev,
                EC_CMD_VBOOT_HASH,
                0,
                params.as_bytes().as_ptr(),
                params.as_bytes().len() as c_int,
                resp.as_bytes_mut().as_mut_ptr(),
                resp.as_bytes().len() as c_int,
            )
        };
        ec_result(rc)?;
        Ok(HashResponse {
            status: resp.status,
            hash_type: resp.hash_type,
            digest_size: resp.digest_size,
            digest: resp.hash_digest,
        })
    }
}

impl EcChannel for CrosEc {
    fn current_image(&mut self) -> Result<u32, EcError> {
        let mut image = 0;
        // Safety: plain call with an out pointer to a local.
        ec_result(unsafe { cros_ec_read_current_image(self.dev, &mut image) })?;
        Ok(image)
    }

    fn reboot(&mut self, cmd: u8, flags: u8) -> Result<(), EcError> {
        // Safety: plain call.
        ec_result(unsafe { cros_ec_reboot(self.dev, u32::from(cmd), flags) })
    }

    fn flash_protect(&mut self, mask: u32, flags: u32) -> Result<u32, EcError> {
        let mut resp = EcResponseFlashProtect::default();
        // Safety: plain call with an out pointer to a local.
        ec_result(unsafe { cros_ec_flash_protect(self.dev, mask, flags, &mut resp) })?;
        Ok(resp.flags)
    }

    fn hash_status(&mut self) -> Result<HashResponse, EcError> {
        self.vboot_hash(EC_VBOOT_HASH_GET, 0, 0)
    }

    fn hash_start(&mut self, hash_type: u8, offset: u32) -> Result<HashResponse, EcError> {
        self.vboot_hash(EC_VBOOT_HASH_START, hash_type, offset)
    }

    fn rw_region(&mut self) -> Result<(u32, u32), EcError> {
        let (mut offset, mut size) = (0, 0);
        // Safety: plain call with out pointers to locals.
        ec_result(unsafe { cros_ec_flash_offset(self.dev, EC_FLASH_REGION_RW, &mut offset, &mut size) })?;
        Ok((offset, size))
    }

    fn flash_erase(&mut self, offset: u32, size: u32) -> Result<(), EcError> {
        // Safety: plain call.
        ec_result(unsafe { cros_ec_flash_erase(self.dev, offset, size) })
    }

    fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<(), EcError> {
        // Safety: the driver only reads `data`.
        ec_result(unsafe { cros_ec_flash_write(self.dev, data.as_ptr(), offset, data.len() as u32) })
    }

    fn delay_ms(&mut self, ms: u32) {
        // Safety: plain call.
        unsafe { mdelay(ms) }
    }
}

/// State the library's callbacks reach through the exported `VbEx*`
/// functions while one entry point runs.
struct CallbackScope<'a> {
    callbacks: &'a mut dyn VbootCallbacks,
    ec_hash: [u8; SHA256_DIGEST_SIZE],
    expected_ec: Vec<u8>,
}

static CALLBACK_SCOPE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

fn with_callbacks<R>(callbacks: &mut dyn VbootCallbacks, f: impl FnOnce() -> R) -> R {
    let mut scope = CallbackScope {
        callbacks,
        ec_hash: [0; SHA256_DIGEST_SIZE],
        expected_ec: Vec::new(),
    };
    CALLBACK_SCOPE.store((&mut scope as *mut CallbackScope<'_>).cast(), Ordering::SeqCst);
    let result = f();
    CALLBACK_SCOPE.store(ptr::null_mut(), Ordering::SeqCst);
    result
}

fn in_scope(f: impl FnOnce(&mut CallbackScope<'_>) -> u32) -> u32 {
    let scope = CALLBACK_SCOPE.load(Ordering::SeqCst);
    if scope.is_null() {
        log::error!("verified boot callback outside of an entry point");
        return VBERROR_UNKNOWN;
    }
    // Safety: the pointer was stored by `with_callbacks`, whose frame is
    // still live because the library only calls back from inside the entry
    // point it wraps.
    f(unsafe { &mut *scope.cast::<CallbackScope<'_>>() })
}

fn vb_status<T>(result: Result<T, EcError>) -> u32 {
    match result {
        Ok(_) => VBERROR_SUCCESS,
        Err(e) => {
            log::error!("EC callback failed: {:?}", e);
            VBERROR_UNKNOWN
        }
    }
}

#[no_mangle]
extern "C" fn VbExHashFirmwareBody(cparams: *mut VbCommonParamsC, firmware_index: u32) -> u32 {
    in_scope(|scope| match scope.callbacks.hash_firmware_body(firmware_index) {
        Ok(body) => {
            // Safety: `cparams` is the library's own, passed straight back.
            unsafe { VbUpdateFirmwareBodyHash(cparams, body.as_ptr(), body.len() as u32) };
            VBERROR_SUCCESS
        }
        Err(e) => {
            log::error!("can't hash firmware body {}: {:?}", firmware_index, e);
            VBERROR_UNKNOWN
        }
    })
}

#[no_mangle]
extern "C" fn VbExTrustEC(_devidx: c_int) -> c_int {
    let mut trusted = false;
    in_scope(|scope| {
        trusted = scope.callbacks.ec_trusted();
        VBERROR_SUCCESS
    });
    trusted as c_int
}

#[no_mangle]
extern "C" fn VbExEcRunningRW(_devidx: c_int, in_rw: *mut c_int) -> u32 {
    in_scope(|scope| {
        let running = scope.callbacks.ec_running_rw();
        if let Ok(rw) = running {
            // Safety: the library passes a valid out pointer.
            unsafe { *in_rw = rw as c_int };
        }
        vb_status(running)
    })
}

#[no_mangle]
extern "C" fn VbExEcJumpToRW(_devidx: c_int) -> u32 {
    in_scope(|scope| vb_status(scope.callbacks.ec_jump_to_rw()))
}

#[no_mangle]
extern "C" fn VbExEcStayInRO(_devidx: c_int) -> u32 {
    in_scope(|scope| vb_status(scope.callbacks.ec_stay_in_ro()))
}

#[no_mangle]
extern "C" fn VbExEcHashRW(_devidx: c_int, hash: *mut *const u8, hash_size: *mut c_int) -> u32 {
    in_scope(|scope| {
        let result = scope.callbacks.ec_hash_rw();
        if let Ok(h) = &result {
            scope.ec_hash = h.digest;
            // Safety: valid out pointers; the digest lives in the scope,
            // which outlasts the library's use of it.
            unsafe {
                *hash = scope.ec_hash.as_ptr();
                *hash_size = SHA256_DIGEST_SIZE as c_int;
            }
        }
        vb_status(result)
    })
}

#[no_mangle]
extern "C" fn VbExEcGetExpectedRW(
    _devidx: c_int,
    select: u32,
    image: *mut *const u8,
    image_size: *mut c_int,
) -> u32 {
    let Some(selection) = Selection::from_u32(select) else {
        log::error!("asked for EC image of selection {}", select);
        return VBERROR_UNKNOWN;
    };
    in_scope(|scope| match scope.callbacks.ec_expected_rw(selection) {
        Ok(expected) => {
            scope.expected_ec = expected.into_owned();
            // Safety: as for `VbExEcHashRW`.
            unsafe {
                *image = scope.expected_ec.as_ptr();
                *image_size = scope.expected_ec.len() as c_int;
            }
            VBERROR_SUCCESS
        }
        Err(e) => vb_status::<()>(Err(e)),
    })
}

#[no_mangle]
extern "C" fn VbExEcUpdateRW(_devidx: c_int, image: *const u8, image_size: c_int) -> u32 {
    in_scope(|scope| {
        // Safety: the library passes its own buffer and length.
        let image = unsafe { core::slice::from_raw_parts(image, image_size as usize) };
        vb_status(scope.callbacks.ec_update_rw(image))
    })
}

#[no_mangle]
extern "C" fn VbExEcProtectRW(_devidx: c_int) -> u32 {
    in_scope(|scope| match scope.callbacks.ec_protect_rw(true) {
        Ok(()) => VBERROR_SUCCESS,
        Err(ProtectError::NeedsReboot) => VBERROR_EC_REBOOT_TO_RO_REQUIRED,
        Err(ProtectError::Unknown) => VBERROR_UNKNOWN,
    })
}

fn common_params(common: &mut CommonParams<'_>) -> VbCommonParamsC {
    VbCommonParamsC {
        // The library never writes the GBB.
        gbb_data: common.gbb.as_ptr() as *mut c_void,
        gbb_size: common.gbb.len() as u32,
        shared_data_blob: common.shared_data.as_mut_ptr().cast(),
        shared_data_size: common.shared_data.len() as u32,
        vboot_context: ptr::null_mut(),
        caller_context: ptr::null_mut(),
    }
}

fn vb_result(rc: u32) -> Result<(), VbError> {
    if rc == VBERROR_SUCCESS {
        Ok(())
    } else {
        Err(VbError::from_code(rc))
    }
}

/// The verified boot library.
pub struct Vboot;

impl VbootOracle for Vboot {
    fn init(&mut self, common: &mut CommonParams<'_>, params: &mut InitParams) -> Result<(), VbError> {
        let mut c = common_params(common);
        let mut p = VbInitParamsC {
            flags: params.flags,
            out_flags: 0,
        };
        // Safety: both structs and what they point at outlive the call.
        let rc = unsafe { VbInit(&mut c, &mut p) };
        params.out_flags = p.out_flags;
        vb_result(rc)
    }

    fn select_firmware(
        &mut self,
        common: &mut CommonParams<'_>,
        params: &SelectFirmwareParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<Selection, VbError> {
        let mut c = common_params(common);
        let mut p = VbSelectFirmwareParamsC {
            verification_block_A: params.vblock_a.as_ptr() as *mut c_void,
            verification_block_B: params.vblock_b.as_ptr() as *mut c_void,
            verification_size_A: params.vblock_a.len() as u32,
            verification_size_B: params.vblock_b.len() as u32,
            selected_firmware: 0,
        };
        // Safety: as for `init`; the vblocks are only read.
        let rc = with_callbacks(callbacks, || unsafe { VbSelectFirmware(&mut c, &mut p) });
        vb_result(rc)?;
        Selection::from_u32(p.selected_firmware).ok_or_else(|| {
            log::error!("library selected unknown firmware {}", p.selected_firmware);
            VbError::Code(VBERROR_UNKNOWN)
        })
    }

    fn select_and_load_kernel(
        &mut self,
        common: &mut CommonParams<'_>,
        params: &mut KernelParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<(), VbError> {
        let mut c = common_params(common);
        let mut p = VbSelectAndLoadKernelParamsC {
            kernel_buffer: params.kernel_buffer.as_mut_ptr().cast(),
            kernel_buffer_size: params.kernel_buffer.len() as u32,
            disk_handle: ptr::null_mut(),
            partition_number: 0,
            bootloader_address: 0,
            bootloader_size: 0,
            partition_guid: [0; 16],
        };
        // Safety: as for `init`.
        let rc = with_callbacks(callbacks, || unsafe { VbSelectAndLoadKernel(&mut c, &mut p) });
        vb_result(rc)?;

        let device = if p.disk_handle.is_null() {
            0
        } else {
            // Safety: disk handles are U-Boot block device descriptors.
            unsafe { (*p.disk_handle.cast::<BlockDevDescHead>()).dev as u32 }
        };
        params.disk = DiskHandle {
            device,
            cookie: p.disk_handle as usize,
        };
        params.partition_number = p.partition_number;
        params.bootloader_address = p.bootloader_address;
        params.bootloader_size = p.bootloader_size;
        params.partition_guid = p.partition_guid;
        Ok(())
    }
}

/// The device tree fixup for the boot in progress, reached from
/// `ft_board_setup`.
struct PendingFixup<'a> {
    run: &'a mut dyn FnMut(&mut dyn DeviceTree) -> Result<(), LoaderError>,
    error: Option<LoaderError>,
}

static PENDING_FIXUP: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Called by `bootm` once the kernel's device tree is in place.
#[no_mangle]
extern "C" fn ft_board_setup(blob: *mut c_void, _bd: *mut c_void) -> c_int {
    let pending = PENDING_FIXUP.load(Ordering::SeqCst);
    if pending.is_null() {
        return 0;
    }
    // Safety: set by `Bootm::boot`, whose frame is live for the whole of
    // `do_bootm`.
    let pending = unsafe { &mut *pending.cast::<PendingFixup<'_>>() };
    match (pending.run)(&mut LibFdt::new(blob)) {
        Ok(()) => 0,
        Err(e) => {
            pending.error = Some(e);
            -1
        }
    }
}

/// Longest command line we hand to `setenv`.
const BOOTARGS_MAX: usize = 4096 + 256;

/// U-Boot's `bootm`.
pub struct Bootm;

impl KernelLoader for Bootm {
    fn set_bootargs(&mut self, cmdline: &str) -> Result<(), LoaderError> {
        let mut value = FixedBuf::<BOOTARGS_MAX>::c_str(cmdline);
        if value.truncated() {
            return Err(LoaderError::BadCommandLine);
        }
        // Safety: NUL-terminated strings that outlive the call.
        let rc = unsafe { setenv(b"bootargs\0".as_ptr().cast(), value.as_c_ptr().cast()) };
        if rc != 0 {
            return Err(LoaderError::Env);
        }
        Ok(())
    }

    fn boot(
        &mut self,
        image: u64,
        fixup: &mut dyn FnMut(&mut dyn DeviceTree) -> Result<(), LoaderError>,
    ) -> LoaderError {
        let mut address: FixedBuf<24> = format_fixed(format_args!("{:x}", image));
        let argv = [b"bootm\0".as_ptr().cast::<c_char>(), address.as_c_ptr().cast()];

        let mut pending = PendingFixup {
            run: fixup,
            error: None,
        };
        PENDING_FIXUP.store((&mut pending as *mut PendingFixup<'_>).cast(), Ordering::SeqCst);
        // Safety: `argv` holds NUL-terminated strings that outlive the call.
        let rc = unsafe { do_bootm(ptr::null_mut(), 0, argv.len() as c_int, argv.as_ptr()) };
        PENDING_FIXUP.store(ptr::null_mut(), Ordering::SeqCst);

        pending.error.unwrap_or(LoaderError::Boot(rc))
    }
}

/// The machine itself, as laid out by the board.
pub struct UbootMachine {
    layout: RamLayout,
}

impl UbootMachine {
    pub fn new(layout: RamLayout) -> Self {
        Self { layout }
    }
}

impl Machine for UbootMachine {
    fn stack_pointer(&self) -> u64 {
        let marker = 0u8;
        ptr::addr_of!(marker) as usize as u64
    }

    fn zero_memory(&mut self, range: Range<u64>) {
        // Safety: the wipe only hands out ranges outside our stack and the
        // regions shared between stages.
        unsafe {
            ptr::write_bytes(range.start as usize as *mut u8, 0, (range.end - range.start) as usize);
        }
    }

    fn kernel_buffer(&mut self) -> &mut [u8] {
        // Safety: the board reserves the kernel buffer for this use.
        unsafe { reserved_ram(self.layout.kernel_buffer, self.layout.kernel_buffer_size as usize) }
    }

    fn transfer_control(&mut self, address: u64, body: &[u8]) {
        // Safety: the board reserves `firmware_text_base` for the read-write
        // firmware, which the verified boot library has just verified.
        unsafe {
            ptr::copy_nonoverlapping(body.as_ptr(), address as usize as *mut u8, body.len());
            cleanup_before_linux();
            let entry: extern "C" fn() = core::mem::transmute(address as usize);
            entry();
        }
    }

    fn tpm_init(&mut self) -> Result<(), DeviceError> {
        // Safety: plain calls into the TPM driver.
        unsafe {
            let rc = tis_init();
            if rc != 0 {
                return Err(DeviceError(rc));
            }
            let rc = tis_open();
            if rc != 0 {
                return Err(DeviceError(rc));
            }
        }
        Ok(())
    }

    fn enable_display(&mut self) -> Result<(), DeviceError> {
        // Safety: plain call into the display driver.
        let rc = unsafe { drv_lcd_init() };
        if rc < 0 {
            return Err(DeviceError(rc));
        }
        Ok(())
    }
}

