//! Virtual-memory unit: the Sv32/Sv39/Sv48 page-table walker and the
//! per-hart software TLBs.
//!
//! The TLBs are split by access type (fetch/load/store) and directly
//! indexed by the low bits of the virtual page number. An entry is filled
//! only by a successful walk for that access type, so a hit implies the
//! permission check already passed. Anything that can change the meaning
//! of a translation (satp writes, protection-bit writes, traps, privilege
//! returns, sfence.vma) flushes.

use crate::exception::Exception;
use crate::hart::{Access, Hart, Mode};
use crate::primitives::constants::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, TLB_SIZE};
use crate::reg::csr::{MSTATUS_MXR, MSTATUS_SUM, SATP};

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

/// One direct-mapped translation cache.
pub(crate) struct Tlb {
    tags: Box<[u64; TLB_SIZE]>,
    page_base: Box<[u64; TLB_SIZE]>,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            tags: Box::new([u64::MAX; TLB_SIZE]),
            page_base: Box::new([0; TLB_SIZE]),
        }
    }

    #[inline]
    fn index(vpn: u64) -> usize {
        (vpn as usize) & (TLB_SIZE - 1)
    }

    #[inline]
    fn lookup(&self, vpn: u64) -> Option<u64> {
        let idx = Self::index(vpn);
        if self.tags[idx] == vpn {
            Some(self.page_base[idx])
        } else {
            None
        }
    }

    #[inline]
    fn insert(&mut self, vpn: u64, page_base: u64) {
        let idx = Self::index(vpn);
        self.tags[idx] = vpn;
        self.page_base[idx] = page_base;
    }

    pub(crate) fn flush(&mut self) {
        self.tags.fill(u64::MAX);
    }

    pub(crate) fn flush_page(&mut self, va: u64) {
        let vpn = va >> PAGE_SHIFT;
        let idx = Self::index(vpn);
        if self.tags[idx] == vpn {
            self.tags[idx] = u64::MAX;
        }
    }
}

/// Shape of the active translation scheme.
struct VmScheme {
    levels: i32,
    pte_size: u64,
    vpn_bits: u32,
    va_bits: u32,
    root: u64,
}

fn page_fault(access: Access, va: u64) -> Exception {
    match access {
        Access::Fetch => Exception::InstructionPageFault(va),
        Access::Load => Exception::LoadPageFault(va),
        Access::Store => Exception::StoreAMOPageFault(va),
    }
}

fn access_fault(access: Access, va: u64) -> Exception {
    match access {
        Access::Fetch => Exception::InstructionAccessFault(va),
        Access::Load => Exception::LoadAccessFault(va),
        Access::Store => Exception::StoreAccessFault(va),
    }
}

impl Hart {
    fn vm_scheme(&self) -> Option<VmScheme> {
        let satp = self.csr.read(SATP);
        if self.rv64 {
            let root = (satp & 0xfff_ffff_ffff) * PAGE_SIZE;
            match satp >> 60 {
                8 => Some(VmScheme {
                    levels: 3,
                    pte_size: 8,
                    vpn_bits: 9,
                    va_bits: 39,
                    root,
                }),
                9 => Some(VmScheme {
                    levels: 4,
                    pte_size: 8,
                    vpn_bits: 9,
                    va_bits: 48,
                    root,
                }),
                _ => None,
            }
        } else if satp >> 31 == 1 {
            Some(VmScheme {
                levels: 2,
                pte_size: 4,
                vpn_bits: 10,
                va_bits: 32,
                root: (satp & 0x3f_ffff) * PAGE_SIZE,
            })
        } else {
            None
        }
    }

    /// Translate a virtual address to a physical address, consulting the
    /// TLB for the given access type first. Machine mode (without an MPRV
    /// override) and Bare mode pass addresses through.
    pub fn translate(&mut self, va: u64, access: Access) -> Result<u64, Exception> {
        let mode = self.effective_mode(access);
        if mode == Mode::Machine {
            return Ok(va);
        }
        if self.vm_scheme().is_none() {
            return Ok(va);
        }
        let vpn = va >> PAGE_SHIFT;
        let cached = match access {
            Access::Fetch => self.tlb_fetch.lookup(vpn),
            Access::Load => self.tlb_load.lookup(vpn),
            Access::Store => self.tlb_store.lookup(vpn),
        };
        if let Some(base) = cached {
            return Ok(base | (va & PAGE_MASK));
        }
        let pa = self.walk(va, access, mode)?;
        let tlb = match access {
            Access::Fetch => &mut self.tlb_fetch,
            Access::Load => &mut self.tlb_load,
            Access::Store => &mut self.tlb_store,
        };
        tlb.insert(vpn, pa & !PAGE_MASK);
        Ok(pa)
    }

    /// The multi-level walk of the privileged architecture, with the
    /// permission checks for `mode` and atomic A/D updates. A failing walk
    /// never touches the TLB. The step numbers below follow section 4.3.2
    /// (Virtual Address Translation Process) of the privileged spec.
    fn walk(&mut self, va: u64, access: Access, mode: Mode) -> Result<u64, Exception> {
        let scheme = match self.vm_scheme() {
            Some(s) => s,
            None => return Ok(va),
        };
        // "Sv39 implementations must check that all of bits 63-39 of the
        // virtual address are equal to bit 38, or else generate a
        // page-fault exception." (Likewise Sv48 with bit 47.)
        if scheme.va_bits < 64 {
            let shift = 64 - scheme.va_bits;
            if (((va << shift) as i64) >> shift) as u64 != va {
                return Err(page_fault(access, va));
            }
        }
        let vpn_field = |i: i32| -> u64 {
            (va >> (PAGE_SHIFT as u32 + scheme.vpn_bits * i as u32))
                & ((1 << scheme.vpn_bits) - 1)
        };
        let ppn_of = |pte: u64| -> u64 {
            if scheme.pte_size == 8 {
                (pte >> 10) & 0xfff_ffff_ffff
            } else {
                (pte >> 10) & 0x3f_ffff
            }
        };

        // 1. Let a be satp.ppn x PAGESIZE, and let i = LEVELS - 1.
        let mut a = scheme.root;
        let mut i = scheme.levels - 1;
        let (pte_addr, mut pte) = loop {
            // 2. Let pte be the value of the PTE at address
            //    a + va.vpn[i] x PTESIZE. "If accessing pte violates a PMA
            //    or PMP check, raise an access exception corresponding to
            //    the original access type." Page tables live in RAM here;
            //    a table pointer into device space is such a violation.
            let pte_addr = a.wrapping_add(vpn_field(i).wrapping_mul(scheme.pte_size));
            if !self.bus().is_ram(pte_addr, scheme.pte_size) {
                return Err(access_fault(access, va));
            }
            let pte = if scheme.pte_size == 8 {
                self.bus().dram().load_u64_acquire(pte_addr)
            } else {
                self.bus().dram().load_u32_acquire(pte_addr) as u64
            };
            // 3. "If pte.v = 0, or if pte.r = 0 and pte.w = 1, stop and
            //    raise a page-fault exception corresponding to the
            //    original access type."
            if pte & PTE_V == 0 || (pte & PTE_R == 0 && pte & PTE_W != 0) {
                return Err(page_fault(access, va));
            }
            // 4. If pte.r = 1 or pte.x = 1, the PTE is a leaf; go to
            //    step 5. Otherwise it points to the next table level.
            if pte & (PTE_R | PTE_X) != 0 {
                break (pte_addr, pte);
            }
            i -= 1;
            if i < 0 {
                return Err(page_fault(access, va));
            }
            a = ppn_of(pte).wrapping_mul(PAGE_SIZE);
        };

        // 5. A leaf PTE has been found. "Determine if the requested memory
        //    access is allowed by the pte.r, pte.w, pte.x, and pte.u bits,
        //    given the current privilege mode and the value of the SUM and
        //    MXR fields of the mstatus register."
        let user_page = pte & PTE_U != 0;
        match mode {
            Mode::User => {
                if !user_page {
                    return Err(page_fault(access, va));
                }
            }
            Mode::Supervisor => {
                if user_page {
                    let sum = self.csr.read_mstatus(MSTATUS_SUM) == 1;
                    if access == Access::Fetch || !sum {
                        return Err(page_fault(access, va));
                    }
                }
            }
            Mode::Machine => {}
        }
        let permitted = match access {
            Access::Fetch => pte & PTE_X != 0,
            Access::Load => {
                let mxr = self.csr.read_mstatus(MSTATUS_MXR) == 1;
                pte & PTE_R != 0 || (mxr && pte & PTE_X != 0)
            }
            Access::Store => pte & PTE_W != 0,
        };
        if !permitted {
            return Err(page_fault(access, va));
        }

        // 6. "If i > 0 and pte.ppn[i-1:0] != 0, this is a misaligned
        //    superpage; stop and raise a page-fault exception."
        if i > 0 {
            let low_ppn_mask = (1u64 << (scheme.vpn_bits * i as u32)) - 1;
            if ppn_of(pte) & low_ppn_mask != 0 {
                return Err(page_fault(access, va));
            }
        }

        // 7. Set pte.a to 1 and, for a store, pte.d to 1. "This update and
        //    the loading of pte in step 2 must be atomic; in particular, no
        //    intervening store to the PTE may be perceived to have occurred
        //    in-between."
        let want_bits = PTE_A | if access == Access::Store { PTE_D } else { 0 };
        while pte & want_bits != want_bits {
            let new = pte | want_bits;
            let result = if scheme.pte_size == 8 {
                self.bus().dram().cas_u64(pte_addr, pte, new).err()
            } else {
                self.bus()
                    .dram()
                    .cas_u32(pte_addr, pte as u32, new as u32)
                    .err()
                    .map(|v| v as u64)
            };
            match result {
                None => break,
                Some(observed) => {
                    // Someone rewrote the PTE under us; if it is no longer
                    // a valid leaf the walk has to fail.
                    if observed & PTE_V == 0 {
                        return Err(page_fault(access, va));
                    }
                    pte = observed;
                }
            }
        }

        // 8. The translation is successful: pa.pgoff = va.pgoff, and for a
        //    superpage pa.ppn[i-1:0] = va.vpn[i-1:0].
        let mut ppn = ppn_of(pte);
        for j in 0..i {
            let mask = ((1u64 << scheme.vpn_bits) - 1) << (scheme.vpn_bits * j as u32);
            ppn = (ppn & !mask) | (vpn_field(j) << (scheme.vpn_bits * j as u32));
        }
        Ok((ppn << PAGE_SHIFT) | (va & PAGE_MASK))
    }
}
