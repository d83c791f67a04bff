// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The twostop boot flow.
//!
//! Two entry points, one per firmware stage:
//!
//! - [`twostop_boot`] runs in the read-only bootstub. It reads the hardware
//!   description, creates the crossystem data, lets the verified boot
//!   library pick a firmware, and either jumps into the chosen read-write
//!   body or carries on to kernel selection itself (recovery, or a read-only
//!   normal boot).
//! - [`twostop_readwrite_main_firmware`] runs in the read-write firmware the
//!   bootstub jumped to. It refuses to trust what it inherited in RAM until
//!   it has checked it, and then selects a kernel.
//!
//! Both return only on failure, with a [`BootError`] whose
//! [`disposition`](BootError::disposition) tells the caller whether to halt,
//! reboot or power off.

use alloc::borrow::Cow;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ops::Range;

use crate::bsp::RamLayout;
use crate::crossystem::{
    ActiveEcFirmware, ArchData, CrossystemData, FirmwareType, IntegrityError,
};
use crate::ec::{EcChannel, EcError, EcHash, EcTrust, HashKind, ImageSource, ProtectError};
use crate::fdt::DeviceTree;
use crate::fmap::{ConfigError, FlashMap};
use crate::gbb::{self, GbbError};
use crate::hasher::{FirmwareBodyCache, HashError};
use crate::kernel::{self, KernelLoader, LoaderError};
use crate::memory_wipe::{MemoryWipe, WipeError};
use crate::minirt::c_field;
use crate::oracle::{
    init_flags, init_out_flags, CommonParams, DiskHandle, InitParams, KernelParams,
    SelectFirmwareParams, VbError, VbootCallbacks, VbootOracle,
};
use crate::storage::{self, FirmwareStorage, SpiFlash, SpiStorage, StorageError};
use crate::switches::{Gpio, Switches};
use crate::{FirmwareIndex, Selection};

/// A platform operation failed, with the platform's own error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceError(pub i32);

/// The parts of the machine the flow needs that aren't drivers.
pub trait Machine {
    fn stack_pointer(&self) -> u64;

    /// Zeroes physical memory.
    fn zero_memory(&mut self, range: Range<u64>);

    /// The kernel load buffer described by the board's RAM layout.
    fn kernel_buffer(&mut self) -> &mut [u8];

    /// Copies `body` to `address`, flushes caches and jumps to it. Returns
    /// only if that fails.
    fn transfer_control(&mut self, address: u64, body: &[u8]);

    /// Re-establishes the TPM command interface. The TPM itself was set up
    /// by the read-only stage.
    fn tpm_init(&mut self) -> Result<(), DeviceError>;

    fn enable_display(&mut self) -> Result<(), DeviceError>;
}

/// Everything one boot attempt works with. Built once at entry and passed
/// down by reference.
pub struct BootContext<'a> {
    pub layout: RamLayout,
    pub arch: ArchData,
    pub fdt: &'a mut dyn DeviceTree,
    pub gpio: &'a mut dyn Gpio,
    /// Present on boards whose EC takes part in software sync.
    pub ec: Option<&'a mut dyn EcChannel>,
    pub oracle: &'a mut dyn VbootOracle,
    pub loader: &'a mut dyn KernelLoader,
    pub machine: &'a mut dyn Machine,
    /// The crossystem data at its fixed RAM address.
    pub cdata: &'a mut CrossystemData,
    /// The GBB window at its fixed RAM address.
    pub gbb: &'a mut [u8],
    /// The whole firmware image, when it was loaded into RAM along with this
    /// firmware. Saves going back to the flash for the EC image.
    pub resident_image: Option<&'a [u8]>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootError {
    /// The device tree doesn't describe the hardware we need.
    Config(ConfigError),
    Storage(StorageError),
    Gbb(GbbError),
    /// Inherited crossystem data failed its check.
    Integrity(IntegrityError),
    /// The verified boot library failed to initialise.
    OracleInit(u32),
    Wipe(WipeError),
    /// The library found no usable firmware.
    SelectFirmware(u32),
    /// The user asked to power off.
    ShutdownRequested,
    /// A read-write firmware was selected without its body ever being
    /// hashed.
    BodyNotLoaded(FirmwareIndex),
    /// The jump into a read-write firmware came back.
    JumpReturned,
    Tpm(DeviceError),
    /// No bootable kernel.
    SelectKernel(u32),
    Boot(LoaderError),
}

/// What to do once the flow has given up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    PowerOff,
    ColdReboot,
    Halt,
}

impl BootError {
    pub fn disposition(&self) -> Disposition {
        match self {
            BootError::ShutdownRequested => Disposition::PowerOff,
            BootError::SelectKernel(_) | BootError::Boot(_) => Disposition::ColdReboot,
            _ => Disposition::Halt,
        }
    }
}

impl From<ConfigError> for BootError {
    fn from(e: ConfigError) -> Self {
        BootError::Config(e)
    }
}

impl From<StorageError> for BootError {
    fn from(e: StorageError) -> Self {
        BootError::Storage(e)
    }
}

impl From<GbbError> for BootError {
    fn from(e: GbbError) -> Self {
        BootError::Gbb(e)
    }
}

impl From<IntegrityError> for BootError {
    fn from(e: IntegrityError) -> Self {
        BootError::Integrity(e)
    }
}

impl From<WipeError> for BootError {
    fn from(e: WipeError) -> Self {
        BootError::Wipe(e)
    }
}

impl From<LoaderError> for BootError {
    fn from(e: LoaderError) -> Self {
        BootError::Boot(e)
    }
}

/// How the library's callbacks get at the firmware image.
enum ImageAccess<'c> {
    Open(&'c mut dyn FirmwareStorage),
    /// Storage is closed; open it again for the duration of a read.
    Closed(&'c mut dyn SpiFlash),
    Resident(&'c [u8]),
}

struct Callbacks<'c> {
    fmap: &'c FlashMap,
    bodies: Option<&'c mut FirmwareBodyCache>,
    image: ImageAccess<'c>,
    ec: Option<EcTrust<'c>>,
}

impl VbootCallbacks for Callbacks<'_> {
    fn hash_firmware_body(&mut self, index: u32) -> Result<&[u8], HashError> {
        match (&mut self.bodies, &mut self.image) {
            (Some(cache), ImageAccess::Open(storage)) => cache.hash_body(&mut **storage, index),
            _ => Err(HashError::NotLoaded),
        }
    }

    fn ec_trusted(&mut self) -> bool {
        self.ec.as_mut().map_or(false, |ec| ec.is_ec_trusted())
    }

    fn ec_running_rw(&mut self) -> Result<bool, EcError> {
        self.ec.as_mut().ok_or(EcError::Channel)?.is_running_rw()
    }

    fn ec_jump_to_rw(&mut self) -> Result<(), EcError> {
        self.ec.as_mut().ok_or(EcError::Channel)?.request_jump_to_rw()
    }

    fn ec_stay_in_ro(&mut self) -> Result<(), EcError> {
        self.ec.as_mut().ok_or(EcError::Channel)?.request_stay_in_ro()
    }

    fn ec_hash_rw(&mut self) -> Result<EcHash, EcError> {
        self.ec
            .as_mut()
            .ok_or(EcError::Channel)?
            .read_rw_hash(HashKind::Sha256)
    }

    fn ec_expected_rw(&mut self, selection: Selection) -> Result<Cow<'_, [u8]>, EcError> {
        let ec = self.ec.as_mut().ok_or(EcError::Channel)?;
        match &mut self.image {
            ImageAccess::Resident(image) => {
                ec.get_expected_rw(self.fmap, selection, ImageSource::Resident(*image))
            }
            ImageAccess::Open(storage) => {
                ec.get_expected_rw(self.fmap, selection, ImageSource::Storage(&mut **storage))
            }
            ImageAccess::Closed(flash) => {
                let mut storage = SpiStorage::open(&mut **flash)?;
                let image = ec
                    .get_expected_rw(self.fmap, selection, ImageSource::Storage(&mut storage))
                    .map(|image| Cow::Owned(image.into_owned()));
                storage.close();
                image
            }
        }
    }

    fn ec_update_rw(&mut self, image: &[u8]) -> Result<(), EcError> {
        self.ec.as_mut().ok_or(EcError::Channel)?.update_rw(image)
    }

    fn ec_protect_rw(&mut self, enable: bool) -> Result<(), ProtectError> {
        self.ec
            .as_mut()
            .ok_or(ProtectError::Unknown)?
            .protect_rw(enable)
    }
}

fn decode_hardware_config(ctx: &mut BootContext<'_>) -> Result<(FlashMap, Switches), BootError> {
    let fmap = FlashMap::decode(&*ctx.fdt)?;
    let switches = Switches::decode(&*ctx.fdt, &mut *ctx.gpio)?;
    Ok((fmap, switches))
}

/// What the bootstub knows once it's initialised.
pub struct InitState<'f> {
    pub fmap: FlashMap,
    pub switches: Switches,
    pub storage: SpiStorage<'f>,
    pub readonly_firmware_id: Vec<u8>,
}

/// Clears RAM except our own stack (and everything above it), the
/// crossystem data and the GBB.
fn wipe_unused_memory(ctx: &mut BootContext<'_>) -> Result<(), WipeError> {
    let layout = &ctx.layout;
    let mut wipe = MemoryWipe::init(layout.dram.start, layout.dram.end)?;

    let sp = ctx.machine.stack_pointer();
    wipe.exclude(sp.saturating_sub(layout.stack_margin), layout.dram.end)?;
    let cdata = layout.crossystem_data();
    wipe.exclude(cdata, cdata + size_of::<CrossystemData>() as u64)?;
    wipe.exclude(layout.gbb(), layout.gbb() + layout.gbb_max_size)?;

    log::info!("wiping unused memory");
    wipe.execute(|range| ctx.machine.zero_memory(range));
    Ok(())
}

/// The bootstub's setup: hardware description, storage, crossystem data and
/// the verified boot library's init, with whatever side effects it asks for.
pub fn twostop_init<'f>(
    ctx: &mut BootContext<'_>,
    flash: &'f mut dyn SpiFlash,
) -> Result<InitState<'f>, BootError> {
    let (fmap, switches) = decode_hardware_config(ctx)?;
    let mut storage = SpiStorage::open(flash)?;

    let ro_id_region = fmap.readonly.firmware_id;
    let readonly_firmware_id =
        storage::read_vec(&mut storage, ro_id_region.offset, ro_id_region.length)?;
    let readonly_firmware_id = c_field(&readonly_firmware_id).to_vec();
    gbb::load(&mut storage, fmap.readonly.gbb, ctx.gbb)?;
    let hardware_id = gbb::hardware_id(&ctx.gbb[..fmap.readonly.gbb.length as usize])?;

    let active_ec = match ctx.ec.as_deref_mut().map(|ec| EcTrust::new(ec).is_running_rw()) {
        Some(Ok(true)) => ActiveEcFirmware::Rw,
        Some(Err(e)) => {
            log::warn!("can't ask the EC which image it runs: {:?}", e);
            ActiveEcFirmware::Ro
        }
        Some(Ok(false)) | None => ActiveEcFirmware::Ro,
    };

    ctx.cdata.init(
        &switches,
        fmap.readonly.fmap.offset,
        active_ec,
        hardware_id,
        &readonly_firmware_id,
        &ctx.arch,
    );

    let mut params = InitParams {
        flags: switches.init_flags() | init_flags::RO_NORMAL_SUPPORT,
        out_flags: 0,
    };
    if ctx.ec.is_some() {
        params.flags |= init_flags::EC_SOFTWARE_SYNC;
    }
    let mut common = CommonParams {
        gbb: &ctx.gbb[..],
        shared_data: &mut ctx.cdata.vbshared_data,
    };
    log::debug!("VbInit, flags {:#x}", params.flags);
    ctx.oracle.init(&mut common, &mut params).map_err(|e| match e {
        VbError::ShutdownRequested => BootError::ShutdownRequested,
        VbError::Code(code) => {
            log::error!("VbInit failed: {:#x}", code);
            BootError::OracleInit(code)
        }
    })?;
    log::debug!("VbInit out flags {:#x}", params.out_flags);

    if params.out_flags & init_out_flags::CLEAR_RAM != 0 {
        wipe_unused_memory(ctx)?;
    }
    if params.out_flags & init_out_flags::ENABLE_DISPLAY != 0 {
        if let Err(e) = ctx.machine.enable_display() {
            log::warn!("can't enable display: {:?}", e);
        } else if let Err(e) = gbb::load_bmp_block(&mut storage, fmap.readonly.gbb, ctx.gbb) {
            log::warn!("can't load screen bitmaps: {:?}", e);
        }
    }
    if params.out_flags & init_out_flags::ENABLE_RECOVERY != 0 {
        if let Err(e) = gbb::load_recovery_key(&mut storage, fmap.readonly.gbb, ctx.gbb) {
            log::warn!("can't load recovery key: {:?}", e);
        }
    }

    Ok(InitState {
        fmap,
        switches,
        storage,
        readonly_firmware_id,
    })
}

/// Wraps the EC for the library's callbacks. With `ec-fault-injection`, a
/// `/config` property `ec-fault-offset` arms corruption of the expected image.
#[cfg(feature = "ec-fault-injection")]
fn ec_trust<'a, 'e: 'a>(
    ec: Option<&'a mut (dyn EcChannel + 'e)>,
    fdt: &dyn DeviceTree,
) -> Option<EcTrust<'a>> {
    let mut trust = EcTrust::new(ec?);
    let offset = fdt
        .path_offset("/config")
        .and_then(|node| crate::fdt::read_u32(fdt, node, "ec-fault-offset"));
    if let Ok(offset) = offset {
        trust.inject_fault(offset as usize);
    }
    Some(trust)
}

#[cfg(not(feature = "ec-fault-injection"))]
fn ec_trust<'a, 'e: 'a>(
    ec: Option<&'a mut (dyn EcChannel + 'e)>,
    _fdt: &dyn DeviceTree,
) -> Option<EcTrust<'a>> {
    ec.map(|ec| EcTrust::new(ec))
}

fn firmware_type(selection: Selection, switches: &Switches) -> FirmwareType {
    if selection == Selection::Recovery {
        FirmwareType::Recovery
    } else if switches.developer.value {
        FirmwareType::Developer
    } else {
        FirmwareType::Normal
    }
}

/// Runs the bootstub up to and including the firmware decision, which is
/// recorded in the crossystem data. Storage is closed on return. The bodies
/// hashed along the way are left in `cache`, with only the selected one
/// kept.
pub fn twostop_select_and_set_main_firmware(
    ctx: &mut BootContext<'_>,
    flash: &mut dyn SpiFlash,
    cache: &mut FirmwareBodyCache,
) -> Result<Selection, BootError> {
    let mut init = twostop_init(ctx, flash)?;

    cache.load_vblocks(&mut init.storage, &init.fmap)?;
    // The library gets its own copy of the vblocks, leaving the cache free
    // to fill in bodies while it runs.
    let vblock_a = cache.vblock(FirmwareIndex::A).to_vec();
    let vblock_b = cache.vblock(FirmwareIndex::B).to_vec();
    let params = SelectFirmwareParams {
        vblock_a: &vblock_a,
        vblock_b: &vblock_b,
    };

    let selection = {
        let mut common = CommonParams {
            gbb: &ctx.gbb[..],
            shared_data: &mut ctx.cdata.vbshared_data,
        };
        let mut callbacks = Callbacks {
            fmap: &init.fmap,
            bodies: Some(&mut *cache),
            image: ImageAccess::Open(&mut init.storage),
            ec: ec_trust(ctx.ec.as_deref_mut(), &*ctx.fdt),
        };
        ctx.oracle.select_firmware(&mut common, &params, &mut callbacks)
    };
    let selection = selection.map_err(|e| match e {
        VbError::ShutdownRequested => BootError::ShutdownRequested,
        VbError::Code(code) => {
            log::error!("VbSelectFirmware failed: {:#x}", code);
            BootError::SelectFirmware(code)
        }
    })?;
    log::info!("selected firmware: {:?}", selection);
    cache.resolve(selection);

    let firmware_id = match selection.index() {
        None => init.readonly_firmware_id.clone(),
        Some(index) => {
            let region = init.fmap.slot(index).firmware_id;
            match storage::read_vec(&mut init.storage, region.offset, region.length) {
                Ok(id) => c_field(&id).to_vec(),
                Err(e) => {
                    log::warn!("can't read firmware ID of {:?}: {:?}", index, e);
                    Vec::new()
                }
            }
        }
    };
    ctx.cdata
        .set_main_firmware(firmware_type(selection, &init.switches), &firmware_id);

    init.storage.close();
    Ok(selection)
}

/// Kernel selection and boot, shared by both stages.
pub fn twostop_main_firmware(ctx: &mut BootContext<'_>, flash: &mut dyn SpiFlash) -> BootError {
    let fmap = match FlashMap::decode(&*ctx.fdt) {
        Ok(fmap) => fmap,
        Err(e) => return e.into(),
    };

    let mut params = KernelParams {
        kernel_buffer: ctx.machine.kernel_buffer(),
        kernel_buffer_address: ctx.layout.kernel_buffer,
        disk: DiskHandle::default(),
        partition_number: 0,
        bootloader_address: 0,
        bootloader_size: 0,
        partition_guid: [0; 16],
    };

    let result = {
        let mut common = CommonParams {
            gbb: &ctx.gbb[..],
            shared_data: &mut ctx.cdata.vbshared_data,
        };
        let image = match ctx.resident_image {
            Some(image) => ImageAccess::Resident(image),
            None => ImageAccess::Closed(flash),
        };
        let mut callbacks = Callbacks {
            fmap: &fmap,
            bodies: None,
            image,
            ec: ec_trust(ctx.ec.as_deref_mut(), &*ctx.fdt),
        };
        ctx.oracle
            .select_and_load_kernel(&mut common, &mut params, &mut callbacks)
    };
    match result {
        Ok(()) => {}
        Err(VbError::ShutdownRequested) => {
            log::info!("shutdown requested");
            return BootError::ShutdownRequested;
        }
        Err(VbError::Code(code)) => {
            log::error!("VbSelectAndLoadKernel failed: {:#x}", code);
            return BootError::SelectKernel(code);
        }
    }

    log::info!(
        "kernel on disk {} partition {}, bootloader at {:#x}+{:#x}",
        params.disk.device,
        params.partition_number,
        params.bootloader_address,
        params.bootloader_size
    );
    ctx.cdata.dump();

    let e = kernel::boot_kernel(ctx.loader, &params, ctx.cdata);
    log::error!("kernel boot failed: {:?}", e);
    e.into()
}

/// The read-only bootstub. Returns only on failure.
pub fn twostop_boot(ctx: &mut BootContext<'_>, flash: &mut dyn SpiFlash) -> BootError {
    let mut cache = FirmwareBodyCache::new();
    let selection = match twostop_select_and_set_main_firmware(ctx, flash, &mut cache) {
        Ok(selection) => selection,
        Err(e) => return e,
    };

    match selection.index() {
        Some(index) => {
            let Some(body) = cache.body(index) else {
                log::error!("firmware {:?} selected but never read", index);
                return BootError::BodyNotLoaded(index);
            };
            log::info!(
                "jumping to firmware {:?} at {:#x} ({:#x} bytes)",
                index,
                ctx.layout.firmware_text_base,
                body.len()
            );
            ctx.machine.transfer_control(ctx.layout.firmware_text_base, body);
            log::error!("jump to firmware {:?} returned", index);
            BootError::JumpReturned
        }
        None => twostop_main_firmware(ctx, flash),
    }
}

/// The read-write firmware. Returns only on failure.
pub fn twostop_readwrite_main_firmware(
    ctx: &mut BootContext<'_>,
    flash: &mut dyn SpiFlash,
) -> BootError {
    if let Err(e) = ctx.cdata.check_integrity() {
        log::error!("inherited crossystem data is bad: {:?}", e);
        return e.into();
    }
    let fmap = match FlashMap::decode(&*ctx.fdt) {
        Ok(fmap) => fmap,
        Err(e) => return e.into(),
    };
    // Only the part the flash map gives the GBB was copied in.
    let inherited = ctx
        .gbb
        .get(..fmap.readonly.gbb.length as usize)
        .ok_or(GbbError::TooLarge)
        .and_then(gbb::check);
    if let Err(e) = inherited {
        log::error!("inherited GBB is bad: {:?}", e);
        return e.into();
    }
    if let Err(e) = ctx.machine.tpm_init() {
        log::error!("can't reach the TPM: {:?}", e);
        return BootError::Tpm(e);
    }
    twostop_main_firmware(ctx, flash)
}
