//! Register state machine.
//!
//! Every allocatable register is FREE, ALLOCATED (holds a value that may
//! be evicted) or USED (pinned: the value must stay in exactly this
//! register until released). All transitions live here:
//!
//! ```text
//!   alloc    FREE -> USED, or ALLOCATED -> USED after spilling the occupant
//!   take(N)  like alloc for one specific register; faults when N is USED
//!   release  USED -> ALLOCATED
//!   pin      ALLOCATED -> USED
//!   free     USED | ALLOCATED -> FREE, dropping the value
//!   spill    ALLOCATED -> FREE, storing the value to spill memory first
//!   load     spilled value -> register, which becomes ALLOCATED
//! ```
//!
//! Moves that must become machine code (spill stores and reloads) are
//! queued as [`MoveOp`]s for the caller to materialize.

use hashbrown::HashMap;

use super::spill::{RegClass, SlotIdx, SpillMemory};

/// Maximum number of register banks supported (GP, FP).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 16;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Identifier of a value tracked by the allocator (the producing node).
pub type ValueId = u32;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self { bank: 0, id }
    }

    pub const fn xmm(id: RegId) -> Self {
        Self { bank: 1, id }
    }

    fn linear_index(&self) -> usize {
        (self.bank as usize) * MAX_REGISTERS_PER_BANK + (self.id as usize)
    }
}

/// Bit set for tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (reg.bank as usize) < MAX_REGISTER_BANKS && (self.banks[reg.bank as usize] >> reg.id) & 1 != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && (reg.id as usize) < MAX_REGISTERS_PER_BANK {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks.get(bank as usize).map_or(0, |b| b.count_ones())
    }

    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..MAX_REGISTER_BANKS).flat_map(move |bank| {
            (0..MAX_REGISTERS_PER_BANK)
                .map(move |id| AsmReg::new(bank as RegBank, id as RegId))
                .filter(move |reg| self.contains(*reg))
        })
    }
}

/// State of one physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    Free,
    Allocated(ValueId),
    Used(ValueId),
}

/// A data movement the allocator needs the code to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOp {
    /// Store `reg` into spill slot `slot`.
    Spill { reg: AsmReg, slot: SlotIdx, class: RegClass },
    /// Load spill slot `slot` into `reg`.
    Reload { reg: AsmReg, slot: SlotIdx, class: RegClass },
}

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLoc {
    pub class: RegClass,
    pub reg: Option<AsmReg>,
    pub slot: Option<SlotIdx>,
    /// The register copy is newer than the spill slot.
    pub dirty: bool,
}

/// Error types for register allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAllocError {
    /// Every register of the bank is pinned.
    NoRegistersAvailable,
    /// The register is pinned by another value.
    RegisterPinned(AsmReg),
    /// The register holds no value.
    RegisterNotAllocated(AsmReg),
    /// The register is not part of the allocatable set.
    InvalidRegister(AsmReg),
    /// The value has never been stored to spill memory.
    ValueNotSpilled(ValueId),
    /// The value is not tracked.
    UnknownValue(ValueId),
}

impl std::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegAllocError::NoRegistersAvailable => write!(f, "all registers of the class are pinned"),
            RegAllocError::RegisterPinned(r) => write!(f, "register {}:{} is pinned", r.bank, r.id),
            RegAllocError::RegisterNotAllocated(r) => {
                write!(f, "register {}:{} holds no value", r.bank, r.id)
            }
            RegAllocError::InvalidRegister(r) => {
                write!(f, "register {}:{} is not allocatable", r.bank, r.id)
            }
            RegAllocError::ValueNotSpilled(v) => write!(f, "value {v} has no spill slot"),
            RegAllocError::UnknownValue(v) => write!(f, "value {v} is not tracked"),
        }
    }
}

impl std::error::Error for RegAllocError {}

/// Register file with per-register state and per-value location tracking.
pub struct RegisterFile {
    allocatable: RegBitSet,
    /// Handout order per bank, walked round-robin.
    rings: [Vec<AsmReg>; MAX_REGISTER_BANKS],
    cursors: [usize; MAX_REGISTER_BANKS],
    states: Vec<RegState>,
    values: HashMap<ValueId, ValueLoc>,
    /// Registers written at least once.
    clobbered: RegBitSet,
    moves: Vec<MoveOp>,
}

impl RegisterFile {
    /// Create a register file handing out `gp` and `fp` in the given order.
    pub fn new(gp: &[AsmReg], fp: &[AsmReg]) -> Self {
        let mut allocatable = RegBitSet::from_regs(gp);
        for &reg in fp {
            allocatable.set(reg);
        }
        Self {
            allocatable,
            rings: [gp.to_vec(), fp.to_vec()],
            cursors: [0; MAX_REGISTER_BANKS],
            states: vec![RegState::Free; MAX_REGISTER_BANKS * MAX_REGISTERS_PER_BANK],
            values: HashMap::new(),
            clobbered: RegBitSet::new(),
            moves: Vec::new(),
        }
    }

    pub fn state(&self, reg: AsmReg) -> RegState {
        self.states[reg.linear_index()]
    }

    pub fn value(&self, value: ValueId) -> Option<&ValueLoc> {
        self.values.get(&value)
    }

    /// Register currently holding `value`.
    pub fn reg_of(&self, value: ValueId) -> Option<AsmReg> {
        self.values.get(&value).and_then(|v| v.reg)
    }

    pub fn is_allocatable(&self, reg: AsmReg) -> bool {
        self.allocatable.contains(reg)
    }

    pub fn clobbered(&self) -> &RegBitSet {
        &self.clobbered
    }

    /// Drain the moves queued since the last call.
    pub fn take_moves(&mut self) -> Vec<MoveOp> {
        std::mem::take(&mut self.moves)
    }

    /// Start tracking `value` without a location.
    pub fn define(&mut self, value: ValueId, class: RegClass) {
        self.values.entry(value).or_insert(ValueLoc {
            class,
            reg: None,
            slot: None,
            dirty: false,
        });
    }

    fn set_state(&mut self, reg: AsmReg, state: RegState) {
        self.states[reg.linear_index()] = state;
    }

    fn check(&self, reg: AsmReg) -> Result<(), RegAllocError> {
        if self.is_allocatable(reg) {
            Ok(())
        } else {
            Err(RegAllocError::InvalidRegister(reg))
        }
    }

    /// Find a register of `bank`: a FREE one first, then evict an ALLOCATED
    /// one, walking the ring from the cursor so registers are handed out
    /// round-robin.
    fn claim(&mut self, spill: &mut SpillMemory, bank: RegBank) -> Result<AsmReg, RegAllocError> {
        let ring_len = self.rings[bank as usize].len();
        if ring_len == 0 {
            return Err(RegAllocError::NoRegistersAvailable);
        }
        let start = self.cursors[bank as usize];
        let mut victim = None;
        for step in 0..ring_len {
            let pos = (start + step) % ring_len;
            let reg = self.rings[bank as usize][pos];
            match self.state(reg) {
                RegState::Free => {
                    self.cursors[bank as usize] = (pos + 1) % ring_len;
                    return Ok(reg);
                }
                RegState::Allocated(_) if victim.is_none() => victim = Some((pos, reg)),
                _ => {}
            }
        }
        let (pos, reg) = victim.ok_or(RegAllocError::NoRegistersAvailable)?;
        self.cursors[bank as usize] = (pos + 1) % ring_len;
        self.spill(spill, reg)?;
        Ok(reg)
    }

    fn attach(&mut self, value: ValueId, reg: AsmReg, state: RegState, dirty: bool) -> Result<(), RegAllocError> {
        let previous = {
            let loc = self.values.get_mut(&value).ok_or(RegAllocError::UnknownValue(value))?;
            let previous = loc.reg.replace(reg);
            loc.dirty = dirty;
            previous
        };
        if let Some(old) = previous.filter(|old| *old != reg) {
            self.set_state(old, RegState::Free);
        }
        self.set_state(reg, state);
        self.clobbered.set(reg);
        Ok(())
    }

    /// Allocate a register for a fresh definition of `value`. The register
    /// comes back USED.
    pub fn alloc(&mut self, spill: &mut SpillMemory, value: ValueId) -> Result<AsmReg, RegAllocError> {
        let class = self.values.get(&value).ok_or(RegAllocError::UnknownValue(value))?.class;
        let reg = self.claim(spill, class.bank())?;
        self.attach(value, reg, RegState::Used(value), true)?;
        log::trace!("alloc {:?} for value {}", reg, value);
        Ok(reg)
    }

    /// Claim the specific register `reg` for `value`, evicting its occupant.
    pub fn take(&mut self, spill: &mut SpillMemory, reg: AsmReg, value: ValueId) -> Result<(), RegAllocError> {
        self.check(reg)?;
        match self.state(reg) {
            RegState::Used(owner) if owner == value => return Ok(()),
            RegState::Used(_) => return Err(RegAllocError::RegisterPinned(reg)),
            RegState::Allocated(owner) if owner == value => {
                self.set_state(reg, RegState::Used(value));
                return Ok(());
            }
            RegState::Allocated(_) => self.spill(spill, reg)?,
            RegState::Free => {}
        }
        // The bits are produced in `reg` by the caller, either by a fresh
        // definition or a `load`; a copy elsewhere goes to memory first.
        let current = self.values.get(&value).ok_or(RegAllocError::UnknownValue(value))?.reg;
        if let Some(other) = current {
            self.spill(spill, other)?;
        }
        let dirty = self.values.get(&value).is_some_and(|v| v.dirty);
        self.attach(value, reg, RegState::Used(value), dirty)
    }

    /// Unpin a register. No-op unless the register is USED.
    pub fn release(&mut self, reg: AsmReg) {
        if let RegState::Used(value) = self.state(reg) {
            self.set_state(reg, RegState::Allocated(value));
        }
    }

    /// Pin the register holding a value so it cannot be evicted.
    pub fn pin(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        match self.state(reg) {
            RegState::Allocated(value) | RegState::Used(value) => {
                self.set_state(reg, RegState::Used(value));
                Ok(())
            }
            RegState::Free => Err(RegAllocError::RegisterNotAllocated(reg)),
        }
    }

    /// Drop whatever `reg` holds. Freeing a FREE register is a no-op.
    pub fn free(&mut self, reg: AsmReg) {
        match self.state(reg) {
            RegState::Free => {}
            RegState::Allocated(value) | RegState::Used(value) => {
                if let Some(loc) = self.values.get_mut(&value) {
                    if loc.reg == Some(reg) {
                        loc.reg = None;
                    }
                }
                self.set_state(reg, RegState::Free);
            }
        }
    }

    /// Evict the value in `reg` to spill memory. Stores only when the spill
    /// slot is missing or stale.
    pub fn spill(&mut self, spill: &mut SpillMemory, reg: AsmReg) -> Result<(), RegAllocError> {
        let value = match self.state(reg) {
            RegState::Free => return Ok(()),
            RegState::Used(_) => return Err(RegAllocError::RegisterPinned(reg)),
            RegState::Allocated(value) => value,
        };
        let loc = self.values.get_mut(&value).ok_or(RegAllocError::UnknownValue(value))?;
        let slot = match loc.slot {
            Some(slot) => slot,
            None => {
                let slot = spill.select(loc.class);
                loc.slot = Some(slot);
                loc.dirty = true;
                slot
            }
        };
        if loc.dirty {
            self.moves.push(MoveOp::Spill {
                reg,
                slot,
                class: loc.class,
            });
            loc.dirty = false;
        }
        loc.reg = None;
        self.set_state(reg, RegState::Free);
        log::trace!("spill value {} from {:?} to slot {}", value, reg, slot);
        Ok(())
    }

    /// Bring a spilled value back into `reg`. A FREE target becomes
    /// ALLOCATED; a target already taken for the same value stays USED.
    pub fn load(&mut self, value: ValueId, reg: AsmReg) -> Result<(), RegAllocError> {
        self.check(reg)?;
        let loc = *self.values.get(&value).ok_or(RegAllocError::UnknownValue(value))?;
        let slot = loc.slot.ok_or(RegAllocError::ValueNotSpilled(value))?;
        let state = match self.state(reg) {
            RegState::Free => RegState::Allocated(value),
            RegState::Used(owner) if owner == value => RegState::Used(value),
            RegState::Allocated(owner) if owner == value => return Ok(()),
            _ => return Err(RegAllocError::RegisterPinned(reg)),
        };
        self.moves.push(MoveOp::Reload {
            reg,
            slot,
            class: loc.class,
        });
        self.attach(value, reg, state, false)
    }

    /// Make `value` available in some register, reloading it if needed.
    /// The register comes back ALLOCATED.
    pub fn reload(&mut self, spill: &mut SpillMemory, value: ValueId) -> Result<AsmReg, RegAllocError> {
        if let Some(reg) = self.reg_of(value) {
            return Ok(reg);
        }
        let class = self.values.get(&value).ok_or(RegAllocError::UnknownValue(value))?.class;
        if self.values.get(&value).and_then(|v| v.slot).is_none() {
            return Err(RegAllocError::ValueNotSpilled(value));
        }
        let reg = self.claim(spill, class.bank())?;
        self.load(value, reg)?;
        Ok(reg)
    }

    /// Spill every ALLOCATED register; USED registers stay put.
    pub fn invalidate(&mut self, spill: &mut SpillMemory) -> Result<(), RegAllocError> {
        for bank in 0..MAX_REGISTER_BANKS {
            for pos in 0..self.rings[bank].len() {
                let reg = self.rings[bank][pos];
                if matches!(self.state(reg), RegState::Allocated(_)) {
                    self.spill(spill, reg)?;
                }
            }
        }
        Ok(())
    }

    /// Forget a dead value, releasing its register and spill slot.
    pub fn kill(&mut self, spill: &mut SpillMemory, value: ValueId) {
        if let Some(loc) = self.values.remove(&value) {
            if let Some(reg) = loc.reg {
                if matches!(self.state(reg), RegState::Allocated(v) | RegState::Used(v) if v == value) {
                    self.set_state(reg, RegState::Free);
                }
            }
            if let Some(slot) = loc.slot {
                spill.release(slot);
            }
        }
    }

    /// Number of registers of `bank` in each state: (free, allocated, used).
    pub fn bank_usage(&self, bank: RegBank) -> (usize, usize, usize) {
        let mut usage = (0, 0, 0);
        for reg in &self.rings[bank as usize] {
            match self.state(*reg) {
                RegState::Free => usage.0 += 1,
                RegState::Allocated(_) => usage.1 += 1,
                RegState::Used(_) => usage.2 += 1,
            }
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_regfile() -> RegisterFile {
        let gp: Vec<_> = (0..4).map(AsmReg::gp).collect();
        let fp: Vec<_> = (0..2).map(AsmReg::xmm).collect();
        RegisterFile::new(&gp, &fp)
    }

    /// Executes queued moves against simulated registers and memory.
    struct Machine {
        regs: [u64; 2 * MAX_REGISTERS_PER_BANK],
        memory: Vec<u64>,
    }

    impl Machine {
        fn new() -> Self {
            Self {
                regs: [0; 2 * MAX_REGISTERS_PER_BANK],
                memory: vec![0; 32],
            }
        }

        fn run(&mut self, file: &mut RegisterFile) {
            for op in file.take_moves() {
                match op {
                    MoveOp::Spill { reg, slot, .. } => {
                        self.memory[slot as usize] = self.regs[reg.linear_index()];
                    }
                    MoveOp::Reload { reg, slot, .. } => {
                        self.regs[reg.linear_index()] = self.memory[slot as usize];
                    }
                }
            }
        }
    }

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::gp(5);
        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![reg]);
        set.clear(reg);
        assert!(!set.contains(reg));
    }

    #[test]
    fn test_alloc_release_free() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(1, RegClass::Int);
        let reg = file.alloc(&mut spill, 1).unwrap();
        assert_eq!(file.state(reg), RegState::Used(1));
        file.release(reg);
        assert_eq!(file.state(reg), RegState::Allocated(1));
        file.free(reg);
        assert_eq!(file.state(reg), RegState::Free);
        assert_eq!(file.reg_of(1), None);
    }

    #[test]
    fn test_round_robin_handout() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(1, RegClass::Int);
        file.define(2, RegClass::Int);
        let a = file.alloc(&mut spill, 1).unwrap();
        file.free(a);
        let b = file.alloc(&mut spill, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_alloc_spills_allocated_register() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        for v in 0..4 {
            file.define(v, RegClass::Int);
            let reg = file.alloc(&mut spill, v).unwrap();
            file.release(reg);
        }
        file.define(10, RegClass::Int);
        let reg = file.alloc(&mut spill, 10).unwrap();
        let moves = file.take_moves();
        assert_eq!(moves.len(), 1);
        assert!(matches!(moves[0], MoveOp::Spill { reg: r, .. } if r == reg));
        assert_eq!(file.bank_usage(0), (0, 3, 1));
    }

    #[test]
    fn test_pinned_registers_exhaust_bank() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        for v in 0..4 {
            file.define(v, RegClass::Int);
            file.alloc(&mut spill, v).unwrap();
        }
        file.define(9, RegClass::Int);
        assert_eq!(
            file.alloc(&mut spill, 9),
            Err(RegAllocError::NoRegistersAvailable)
        );
    }

    #[test]
    fn test_take_specific_register() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(1, RegClass::Int);
        file.define(2, RegClass::Int);
        let reg = file.alloc(&mut spill, 1).unwrap();

        // USED registers cannot be taken.
        assert_eq!(
            file.take(&mut spill, reg, 2),
            Err(RegAllocError::RegisterPinned(reg))
        );

        file.release(reg);
        file.take(&mut spill, reg, 2).unwrap();
        assert_eq!(file.state(reg), RegState::Used(2));
        assert_eq!(file.reg_of(1), None);
        assert!(file.value(1).unwrap().slot.is_some());
    }

    #[test]
    fn test_spill_round_trip() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        let mut machine = Machine::new();

        file.define(7, RegClass::Int);
        let reg = file.alloc(&mut spill, 7).unwrap();
        machine.regs[reg.linear_index()] = 0xDEAD_BEEF_0123_4567;
        file.release(reg);
        file.spill(&mut spill, reg).unwrap();
        machine.run(&mut file);

        // Clobber every register before reloading.
        machine.regs = [0; 2 * MAX_REGISTERS_PER_BANK];

        let back = file.reload(&mut spill, 7).unwrap();
        machine.run(&mut file);
        assert_eq!(machine.regs[back.linear_index()], 0xDEAD_BEEF_0123_4567);
        assert_eq!(file.state(back), RegState::Allocated(7));
    }

    #[test]
    fn test_clean_value_is_not_stored_twice() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(3, RegClass::Int);
        let reg = file.alloc(&mut spill, 3).unwrap();
        file.release(reg);
        file.spill(&mut spill, reg).unwrap();
        assert_eq!(file.take_moves().len(), 1);

        let reg = file.reload(&mut spill, 3).unwrap();
        file.spill(&mut spill, reg).unwrap();
        // Only the reload, no second store.
        let moves = file.take_moves();
        assert_eq!(moves.len(), 1);
        assert!(matches!(moves[0], MoveOp::Reload { .. }));
    }

    #[test]
    fn test_invalidate_keeps_used() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(1, RegClass::Int);
        file.define(2, RegClass::Int);
        let pinned = file.alloc(&mut spill, 1).unwrap();
        let loose = file.alloc(&mut spill, 2).unwrap();
        file.release(loose);

        file.invalidate(&mut spill).unwrap();
        assert_eq!(file.state(pinned), RegState::Used(1));
        assert_eq!(file.state(loose), RegState::Free);
    }

    #[test]
    fn test_idempotent_free_and_release() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        let reg = AsmReg::gp(2);
        file.free(reg);
        file.release(reg);
        file.spill(&mut spill, reg).unwrap();
        assert_eq!(file.state(reg), RegState::Free);
        assert!(file.take_moves().is_empty());
        assert_eq!(file.bank_usage(0), (4, 0, 0));
    }

    #[test]
    fn test_kill_releases_slot() {
        let mut file = create_test_regfile();
        let mut spill = SpillMemory::new(0);
        file.define(4, RegClass::Num);
        let reg = file.alloc(&mut spill, 4).unwrap();
        assert_eq!(reg.bank, 1);
        file.release(reg);
        file.spill(&mut spill, reg).unwrap();
        file.kill(&mut spill, 4);
        assert_eq!(spill.free_count(RegClass::Num), 1);
        assert!(file.value(4).is_none());
    }

    #[test]
    fn test_load_requires_spilled_value() {
        let mut file = create_test_regfile();
        file.define(5, RegClass::Int);
        assert_eq!(
            file.load(5, AsmReg::gp(0)),
            Err(RegAllocError::ValueNotSpilled(5))
        );
        assert_eq!(
            file.load(5, AsmReg::gp(12)),
            Err(RegAllocError::InvalidRegister(AsmReg::gp(12)))
        );
    }
}
