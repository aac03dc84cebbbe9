use xlat_types::Endian;

/// Architectural state of the guest CPU, as the engine sees it.
///
/// Register numbers are shared between the embedding API and the IR the front end
/// emits; the program counter has its own number so `reg_write` can redirect
/// execution.
pub trait GuestCpu {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);

    /// Number of addressable registers, program counter included.
    fn reg_count(&self) -> u16;
    /// Register number of the program counter.
    fn pc_reg(&self) -> u16;
    /// `reg` is always below [`reg_count`](Self::reg_count).
    fn read_reg(&self, reg: u16) -> u64;
    fn write_reg(&mut self, reg: u16, value: u64);

    /// Mode bits that change how code translates (part of the block key).
    fn tb_flags(&self) -> u32;
    /// Soft-MMU privilege bank for data and code accesses.
    fn mmu_index(&self) -> usize;

    fn endian(&self) -> Endian {
        Endian::Little
    }

    /// Whether exception `intno` returns to the caller instead of going to the
    /// interrupt hooks, e.g. a privilege fault taken in a restricted mode.
    fn stops_on_exception(&self, _intno: u32) -> bool {
        false
    }
}
