//! Hardware performance-counter driver.
//!
//! Peripheral to the boot core: the rest of the kernel only sees the
//! [`ProfHw`] contract. When CPUID does not advertise a usable architectural
//! perfmon unit, the nil driver stands in and every request reports failure.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use amd64::apic::ApicRegisters;
use amd64::cpuid;
use amd64::msr;

use bitflags::bitflags;

use spin::Mutex;

/// Performance-monitoring event ids. The numeric values are part of the
/// user-visible profiling ABI.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
#[repr(u32)]
pub enum PmEventId {
    // architectural
    UnhaltedCoreCycles = 1 << 0,
    LlcMisses = 1 << 1,
    LlcRefs = 1 << 2,
    BranchInstrRetired = 1 << 3,
    BranchMissRetired = 1 << 4,
    InstrRetired = 1 << 5,
    // non-architectural
    DtlbLoadMissAny = 1 << 6,
    DtlbLoadMissStlb = 1 << 7,
    StoreDtlbMiss = 1 << 8,
    L2LdHits = 1 << 9,
    ItlbLoadMissAny = 1 << 10,
}

impl PmEventId {
    pub fn name(self) -> &'static str {
        match self {
            PmEventId::UnhaltedCoreCycles => "Unhalted core cycles",
            PmEventId::LlcMisses => "LLC misses",
            PmEventId::LlcRefs => "LLC references",
            PmEventId::BranchInstrRetired => "Branch instructions retired",
            PmEventId::BranchMissRetired => "Branch misses retired",
            PmEventId::InstrRetired => "Instructions retired",
            PmEventId::DtlbLoadMissAny => "dTLB load misses",
            PmEventId::DtlbLoadMissStlb => "sTLB misses",
            PmEventId::StoreDtlbMiss => "Store dTLB misses",
            PmEventId::L2LdHits => "L2 load hits",
            PmEventId::ItlbLoadMissAny => "iTLB load misses",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PmFlags: u32 {
        /// Count in ring 0.
        const OS = 1 << 0;
        /// Count in user mode.
        const USR = 1 << 1;
    }
}

/// One profiling request: what to count and where.
#[derive(Copy, Clone, Debug)]
pub struct PmEvent {
    pub evid: PmEventId,
    pub flags: PmFlags,
}

/// The profiling contract the syscall layer programs against.
pub trait ProfHw {
    /// Start one counter per event. All-or-nothing: if the full set cannot
    /// be allocated, nothing starts.
    fn start_pmc(&self, evs: &[PmEvent]) -> Option<Vec<usize>>;
    /// Stop counters by index, returning their final counts.
    fn stop_pmc(&self, idxs: &[usize]) -> Vec<u64>;
    /// Arm NMI (overflow) profiling on counter 0.
    fn start_nmi(&self, evid: PmEventId, flags: PmFlags, min: u64, max: u64) -> bool;
    /// Disarm NMI profiling.
    fn stop_nmi(&self);
}

/// The stand-in when no usable perfmon unit exists.
pub struct NilProf;

impl ProfHw for NilProf {
    fn start_pmc(&self, _evs: &[PmEvent]) -> Option<Vec<usize>> {
        None
    }

    fn stop_pmc(&self, idxs: &[usize]) -> Vec<u64> {
        alloc::vec![0; idxs.len()]
    }

    fn start_nmi(&self, _evid: PmEventId, _flags: PmFlags, _min: u64, _max: u64) -> bool {
        false
    }

    fn stop_nmi(&self) {}
}

/// (event select, unit mask) pairs for the events a part supports.
type EventTable = BTreeMap<PmEventId, (u8, u8)>;

#[derive(Copy, Clone, Default)]
struct Pmc {
    busy: bool,
    evid: Option<PmEventId>,
}

struct IntelInner {
    pmcs: Vec<Pmc>,
    events: EventTable,
}

pub struct IntelProf {
    inner: Mutex<IntelInner>,
}

/// PERFEVTSEL bits.
const EVTSEL_USR: u64 = 1 << 16;
const EVTSEL_OS: u64 = 1 << 17;
const EVTSEL_INT: u64 = 1 << 20;
const EVTSEL_EN: u64 = 1 << 22;

impl IntelProf {
    pub fn new(npmc: usize, fm: cpuid::FamilyModel) -> IntelProf {
        let mut events: EventTable = BTreeMap::new();
        // architectural events, stable across parts
        events.insert(PmEventId::UnhaltedCoreCycles, (0x3C, 0x00));
        events.insert(PmEventId::LlcMisses, (0x2E, 0x41));
        events.insert(PmEventId::LlcRefs, (0x2E, 0x4F));
        events.insert(PmEventId::BranchInstrRetired, (0xC4, 0x00));
        events.insert(PmEventId::BranchMissRetired, (0xC5, 0x00));
        events.insert(PmEventId::InstrRetired, (0xC0, 0x00));

        // Nehalem-class parts grow the TLB and L2 events
        if fm.family == 0x6 && fm.model == 0x1E {
            events.insert(PmEventId::DtlbLoadMissAny, (0x08, 0x01));
            events.insert(PmEventId::DtlbLoadMissStlb, (0x08, 0x02));
            events.insert(PmEventId::StoreDtlbMiss, (0x0C, 0x01));
            events.insert(PmEventId::ItlbLoadMissAny, (0x85, 0x01));
            events.insert(PmEventId::L2LdHits, (0x24, 0x01));
        }

        IntelProf {
            inner: Mutex::new(IntelInner {
                pmcs: alloc::vec![Pmc::default(); npmc],
                events,
            }),
        }
    }

    fn evtsel_value(events: &EventTable, evid: PmEventId, flags: PmFlags) -> Option<u64> {
        let &(event, umask) = events.get(&evid)?;
        let mut v = (umask as u64) << 8 | event as u64 | EVTSEL_EN;
        if flags.contains(PmFlags::OS) {
            v |= EVTSEL_OS;
        }
        if flags.contains(PmFlags::USR) {
            v |= EVTSEL_USR;
        }
        if flags.is_empty() {
            v |= EVTSEL_OS | EVTSEL_USR;
        }
        Some(v)
    }

    /// Program and start counter `cid`.
    unsafe fn pmc_start(cid: usize, evtsel: u64) {
        // disable before clearing so no stale count leaks in
        msr::IA32_PERFEVTSEL0.plus(cid as u32).write(0);
        msr::IA32_PMC0.plus(cid as u32).write(0);
        msr::IA32_PERFEVTSEL0.plus(cid as u32).write(evtsel);
    }

    /// Stop counter `cid` and read its final count.
    unsafe fn pmc_stop(cid: usize) -> u64 {
        let count = msr::IA32_PMC0.plus(cid as u32).read();
        msr::IA32_PERFEVTSEL0.plus(cid as u32).write(0);
        count
    }

    /// Nudge every CPU (self included) so the per-CPU counter state is
    /// reprogrammed. A bare fixed IPI on the perf-mask vector.
    fn perfmask_ipi(&self) {
        const TRAP_PERFMASK: u32 = 72;
        let low = (2 << 18) | (1 << 14) | TRAP_PERFMASK;
        unsafe {
            crate::globals::APIC.write_reg(ApicRegisters::ICR_LOW, low);
            while crate::globals::APIC.read_reg(ApicRegisters::ICR_LOW) & (1 << 12) != 0 {
                core::hint::spin_loop();
            }
        }
    }
}

impl ProfHw for IntelProf {
    fn start_pmc(&self, evs: &[PmEvent]) -> Option<Vec<usize>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        // every event must be supported on this part
        for ev in evs {
            if !inner.events.contains_key(&ev.evid) {
                return None;
            }
        }
        // and the whole set must fit in the free counters
        let free = inner.pmcs.iter().filter(|p| !p.busy).count();
        if free < evs.len() {
            return None;
        }

        let mut out = Vec::with_capacity(evs.len());
        for ev in evs {
            let cid = inner
                .pmcs
                .iter()
                .position(|p| !p.busy)
                .expect("free counter counted above");
            inner.pmcs[cid].busy = true;
            inner.pmcs[cid].evid = Some(ev.evid);
            let evtsel = Self::evtsel_value(&inner.events, ev.evid, ev.flags)
                .expect("support checked above");
            unsafe { Self::pmc_start(cid, evtsel) };
            out.push(cid);
        }
        Some(out)
    }

    fn stop_pmc(&self, idxs: &[usize]) -> Vec<u64> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(idxs.len());
        for &cid in idxs {
            if !inner.pmcs[cid].busy {
                out.push(0);
                continue;
            }
            inner.pmcs[cid].busy = false;
            inner.pmcs[cid].evid = None;
            out.push(unsafe { Self::pmc_stop(cid) });
        }
        out
    }

    fn start_nmi(&self, evid: PmEventId, flags: PmFlags, _min: u64, _max: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.pmcs[0].busy {
            return false;
        }
        let evtsel = match Self::evtsel_value(&inner.events, evid, flags) {
            Some(v) => v | EVTSEL_INT,
            None => return false,
        };
        // NMI profiling owns counter 0
        inner.pmcs[0].busy = true;
        inner.pmcs[0].evid = Some(evid);
        unsafe { Self::pmc_start(0, evtsel) };
        drop(inner);
        self.perfmask_ipi();
        true
    }

    fn stop_nmi(&self) {
        let mut inner = self.inner.lock();
        if inner.pmcs[0].busy {
            unsafe { Self::pmc_stop(0) };
            inner.pmcs[0].busy = false;
            inner.pmcs[0].evid = None;
        }
        drop(inner);
        self.perfmask_ipi();
    }
}

/// Probe CPUID leaf 0xA and pick the driver.
pub fn probe() -> Box<dyn ProfHw + Send + Sync> {
    let pm = cpuid::perfmon();
    if pm.pdcm
        && (2..=3).contains(&pm.version)
        && pm.num_pmc >= 1
        && pm.events_len >= 1
        && pm.cycle_event
        && pm.pmc_width >= 32
    {
        log::info!("hardware performance monitoring: {} counters", pm.num_pmc);
        Box::new(IntelProf::new(pm.num_pmc as usize, cpuid::family_model()))
    } else {
        log::info!("no hardware performance monitoring");
        Box::new(NilProf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nehalem() -> cpuid::FamilyModel {
        cpuid::FamilyModel {
            family: 0x6,
            model: 0x1E,
            stepping: 2,
        }
    }

    fn generic() -> cpuid::FamilyModel {
        cpuid::FamilyModel {
            family: 0x6,
            model: 0x2A,
            stepping: 0,
        }
    }

    #[test]
    fn evtsel_encoding() {
        let prof = IntelProf::new(4, generic());
        let inner = prof.inner.lock();
        // LLC misses: event 0x2E, umask 0x41, enabled, OS only
        let v = IntelProf::evtsel_value(&inner.events, PmEventId::LlcMisses, PmFlags::OS).unwrap();
        assert_eq!(v, (0x41 << 8) | 0x2E | EVTSEL_EN | EVTSEL_OS);
        // empty flags count everywhere
        let v =
            IntelProf::evtsel_value(&inner.events, PmEventId::InstrRetired, PmFlags::empty())
                .unwrap();
        assert!(v & EVTSEL_OS != 0 && v & EVTSEL_USR != 0);
    }

    #[test]
    fn part_specific_events_need_the_part() {
        let generic_prof = IntelProf::new(2, generic());
        let inner = generic_prof.inner.lock();
        assert!(IntelProf::evtsel_value(&inner.events, PmEventId::L2LdHits, PmFlags::OS).is_none());
        drop(inner);

        let nehalem_prof = IntelProf::new(2, nehalem());
        let inner = nehalem_prof.inner.lock();
        assert!(IntelProf::evtsel_value(&inner.events, PmEventId::L2LdHits, PmFlags::OS).is_some());
    }

    #[test]
    fn nil_prof_refuses_everything() {
        let nil = NilProf;
        assert!(nil
            .start_pmc(&[PmEvent {
                evid: PmEventId::InstrRetired,
                flags: PmFlags::empty(),
            }])
            .is_none());
        assert_eq!(nil.stop_pmc(&[0, 1]), alloc::vec![0, 0]);
        assert!(!nil.start_nmi(PmEventId::InstrRetired, PmFlags::empty(), 0, 0));
    }
}
