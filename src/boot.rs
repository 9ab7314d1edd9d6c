//! What the boot loader does with the MMU before jumping to the next stage.

use crate::ipi::frame::BootData;
use crate::ipi::Transport;
use crate::memory_map::BOOT_LAYOUT;
use crate::mmu::regs::TranslationRegisters;
use crate::mmu::{Manager, MmuError};
use crate::os_services::{BlockAllocator, OsServices};
use crate::phys::PhysMemory;

/// Build tables for [`BOOT_LAYOUT`] out of low DDR and turn translation on.
pub fn setup_mmu<S, M, R>(source: S, memory: M, regs: &mut R) -> Result<Manager<S, M>, MmuError>
where
    S: BlockAllocator,
    M: PhysMemory,
    R: TranslationRegisters,
{
    let mut manager = Manager::init(source, memory, false)?;
    manager.apply_layout(BOOT_LAYOUT)?;

    // Table writes must land before the walker can see them.
    regs.barrier();
    manager.enable(regs);

    log::info!("mmu on, L1 table at {}", manager.l1_table());
    Ok(manager)
}

/// Tell the peer boot is done and where the tables live. The manager is not
/// used by this stage after this.
pub fn handoff<T, M>(
    manager: Manager<OsServices<T>, M>,
    boot_code_start: u32,
    boot_code_size: u32,
) -> OsServices<T>
where
    T: Transport,
    M: PhysMemory,
{
    let data = BootData {
        mmu: manager.storage_addr().as_u64(),
        boot_code_start,
        boot_code_size,
        video_block: 0,
    };

    let mut services = manager.into_source();
    services.boot_complete(&data);
    log::info!("boot complete, mmu storage at {:#x}", data.mmu);
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipi::frame::{Request, ResponseResult};
    use crate::mmu::PageType;
    use crate::os_services::RemoteError;
    use crate::testing::{RecordingRegisters, RegisterOp, SimMemory, SimPeer};

    #[test]
    fn setup_classifies_then_enables() {
        let mut regs = RecordingRegisters::default();
        let mmu = setup_mmu(OsServices::new(SimPeer::new()), SimMemory::new(), &mut regs).unwrap();

        assert_eq!(mmu.page_type(0), PageType::Fault);
        assert_eq!(mmu.page_type(0x0020_0000), PageType::NormalCached);
        assert_eq!(mmu.page_type(0xFF00_0000), PageType::Device);

        let ops = regs.ops();
        assert_eq!(ops[0], RegisterOp::Barrier);
        assert_eq!(ops[1], RegisterOp::Sctlr(0));
        assert_eq!(ops.last(), Some(&RegisterOp::Barrier));
        assert!(ops.contains(&RegisterOp::Ttbr0(mmu.l1_table().as_u64())));
    }

    #[test]
    fn setup_without_memory_leaves_registers_alone() {
        let mut peer = SimPeer::new();
        peer.fail_with(ResponseResult::OutOfMemory);
        let mut regs = RecordingRegisters::default();

        let result = setup_mmu(OsServices::new(peer), SimMemory::new(), &mut regs);

        assert_eq!(result.err(), Some(MmuError::Remote(RemoteError::OutOfMemory)));
        assert!(regs.ops().is_empty());
    }

    #[test]
    fn handoff_reports_storage() {
        let mut regs = RecordingRegisters::default();
        let mmu = setup_mmu(OsServices::new(SimPeer::new()), SimMemory::new(), &mut regs).unwrap();
        let storage = mmu.storage_addr();

        let mut services = handoff(mmu, 0xFFFC_0000, 0x4_0000);

        let expected = BootData {
            mmu: storage.as_u64(),
            boot_code_start: 0xFFFC_0000,
            boot_code_size: 0x4_0000,
            video_block: 0,
        };
        assert_eq!(
            services.transport().last_request(),
            Some(Request::BootComplete(expected))
        );

        services.transport_mut().fail_with(ResponseResult::BadParameters);
        assert_eq!(services.fetch_boot_data(), Err(RemoteError::BadParameters));
        services.transport_mut().succeed();
        assert_eq!(services.fetch_boot_data(), Ok(expected));
    }
}
