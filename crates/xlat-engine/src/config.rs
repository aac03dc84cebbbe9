use serde::{Deserialize, Serialize};
use xlat_hooks::HookOrder;
use xlat_mmu::TlbConfig;
use xlat_tb::TbCacheConfig;

/// Engine-wide knobs. Every field has a default, so partial JSON/TOML documents load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Code arena capacity in bytes.
    pub code_buffer_size: usize,
    /// Instruction limit for a single translation block.
    pub max_insns: u32,
    /// Code-page writes before a page gets a code bitmap.
    pub smc_bitmap_threshold: u32,
    /// Where new hooks go when the caller does not say.
    pub hook_order: HookOrder,
    /// Translate one instruction per block.
    pub single_step: bool,
    pub tlb: TlbConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tb = TbCacheConfig::default();
        Self {
            code_buffer_size: tb.code_buffer_size,
            max_insns: tb.max_insns,
            smc_bitmap_threshold: tb.smc_bitmap_threshold,
            hook_order: HookOrder::Append,
            single_step: false,
            tlb: TlbConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_code_buffer_size(mut self, bytes: usize) -> Self {
        self.code_buffer_size = bytes;
        self
    }

    pub fn with_max_insns(mut self, max_insns: u32) -> Self {
        self.max_insns = max_insns;
        self
    }

    pub fn with_smc_bitmap_threshold(mut self, writes: u32) -> Self {
        self.smc_bitmap_threshold = writes;
        self
    }

    pub fn with_hook_order(mut self, order: HookOrder) -> Self {
        self.hook_order = order;
        self
    }

    pub fn with_single_step(mut self, enabled: bool) -> Self {
        self.single_step = enabled;
        self
    }

    pub fn with_victim_entries(mut self, entries: usize) -> Self {
        self.tlb.victim_entries = entries;
        self
    }

    pub(crate) fn tb_cache(&self) -> TbCacheConfig {
        TbCacheConfig {
            code_buffer_size: self.code_buffer_size,
            max_insns: self.max_insns.max(1),
            smc_bitmap_threshold: self.smc_bitmap_threshold,
        }
    }
}
