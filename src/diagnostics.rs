//! Self-checks driven by the `carat` binary.
use std::fmt::Write as _;

use rand::Rng;

use crate::{
    aspace::AddressSpace,
    error::{Error, Result},
    region::{Protection, Region},
    relocation::RelocationEngine,
    runtime::CaratRuntime,
    mutator::Register,
    statistics::{formatted_size, RelocationStatistics},
    Carat,
};

/// Renders every tracked allocation with its size and escape count.
pub fn dump_allocation_map(runtime: &CaratRuntime) -> String {
    let mut out = String::new();
    let map = runtime.lock_map();
    let _ = writeln!(
        out,
        "carat: allocation map ({} entries, {} pending escapes)",
        map.len(),
        runtime.pending_escapes()
    );
    for entry in map.iter() {
        let _ = writeln!(
            out,
            "  {:#018x} {:>8} ({:#x} bytes) escapes {}",
            entry.base,
            formatted_size(entry.size).to_string(),
            entry.size,
            entry.escapes.len()
        );
    }
    out
}

#[derive(Clone, Debug, Default)]
pub struct StressReport {
    pub iterations: usize,
    pub moves: usize,
    pub escapes_patched: usize,
    pub failures: Vec<String>,
}

impl StressReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Live {
    base: usize,
    size: usize,
    /// Offset of the interior pointer held in this allocation's slot.
    offset: usize,
    tag: u8,
}

fn pattern(tag: u8, index: usize) -> u8 {
    tag.wrapping_add((index as u8).wrapping_mul(31))
}

unsafe fn fill(live: &Live) {
    let bytes = std::slice::from_raw_parts_mut(live.base as *mut u8, live.size);
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = pattern(live.tag, i);
    }
}

unsafe fn verify(live: &Live) -> bool {
    let bytes = std::slice::from_raw_parts(live.base as *const u8, live.size);
    bytes
        .iter()
        .enumerate()
        .all(|(i, b)| *b == pattern(live.tag, i))
}

/// Moves randomly chosen live allocations `iterations` times and checks after
/// each move that the contents survived, the escape slot was patched and the
/// map follows the allocation.
pub fn stress(engine: &RelocationEngine, iterations: usize, rng: &mut impl Rng) -> StressReport {
    const LIVE: usize = 32;
    let runtime = engine.runtime();
    let mut report = StressReport {
        iterations,
        ..Default::default()
    };

    // Written behind our back by the engine, so only touched through a raw
    // pointer.
    let mut slot_table = vec![0usize; LIVE];
    let slots = slot_table.as_mut_ptr();
    let slot = |i: usize| unsafe { slots.add(i) };
    let mut live = Vec::with_capacity(LIVE);
    for i in 0..LIVE {
        let size = rng.gen_range(1..=32usize) * 8;
        let base = unsafe { libc::malloc(size) } as usize;
        if base == 0 {
            report.failures.push(format!("malloc of {} bytes failed", size));
            break;
        }
        runtime.on_allocate(base, size);
        let entry = Live {
            base,
            size,
            offset: rng.gen_range(0..size),
            tag: rng.gen(),
        };
        unsafe { fill(&entry) };
        unsafe { slot(i).write_volatile(base + entry.offset) };
        runtime.on_escaping_store(slot(i) as usize, base + entry.offset);
        live.push(entry);
    }

    for iteration in 0..iterations {
        if live.is_empty() {
            break;
        }
        let i = rng.gen_range(0..live.len());

        if rng.gen_bool(0.25) {
            live[i].offset = rng.gen_range(0..live[i].size);
            let value = live[i].base + live[i].offset;
            unsafe { slot(i).write_volatile(value) };
            runtime.on_escaping_store(slot(i) as usize, value);
        }

        let (old, size) = (live[i].base, live[i].size);
        let new = unsafe { libc::malloc(size) } as usize;
        if new == 0 {
            report.failures.push(format!("malloc of {} bytes failed", size));
            break;
        }
        match engine.move_allocation(old, new) {
            Ok(moved) => {
                report.moves += 1;
                report.escapes_patched += moved.escapes_patched;
                unsafe { libc::free(old as *mut libc::c_void) };
                live[i].base = new;
            }
            Err(e) => {
                report
                    .failures
                    .push(format!("iteration {}: move {:#x} failed: {}", iteration, old, e));
                unsafe { libc::free(new as *mut libc::c_void) };
                continue;
            }
        }

        let entry = &live[i];
        if !unsafe { verify(entry) } {
            report
                .failures
                .push(format!("iteration {}: contents of {:#x} corrupted", iteration, new));
        }
        let held = unsafe { slot(i).read_volatile() };
        if held != entry.base + entry.offset {
            report.failures.push(format!(
                "iteration {}: slot holds {:#x}, expected {:#x}",
                iteration,
                held,
                entry.base + entry.offset
            ));
        }
        if runtime.find_allocation(new).map(|e| e.size) != Some(size) {
            report
                .failures
                .push(format!("iteration {}: {:#x} not tracked after move", iteration, new));
        }
        if runtime.find_allocation(old).is_some() {
            report
                .failures
                .push(format!("iteration {}: {:#x} still tracked", iteration, old));
        }
    }

    for entry in live {
        runtime.on_deallocate(entry.base);
        unsafe { libc::free(entry.base as *mut libc::c_void) };
    }
    drop(slot_table);
    log::info!(
        "carat: stress finished ({} moves, {} failures)",
        report.moves,
        report.failures.len()
    );
    report
}

fn check_step(step: &str, result: Result<()>, pass: bool) -> std::result::Result<(), String> {
    match (&result, pass) {
        (Ok(()), true) | (Err(_), false) => {
            log::info!("carat-protect-sanity: {} ok ({:?})", step, result);
            Ok(())
        }
        _ => Err(format!(
            "{}: expected {}, got {:?}",
            step,
            if pass { "success" } else { "failure" },
            result
        )),
    }
}

/// Runs the region-tracker protection scenario on a fresh address space and
/// destroys it afterwards. No memory inside the regions is touched.
pub fn protection_sanity(carat: &Carat) -> std::result::Result<(), String> {
    let aspace = carat.create_aspace("carat-protect-sanity");
    let result = protection_steps(&*aspace);
    aspace.destroy();
    result
}

fn protection_steps(aspace: &dyn AddressSpace) -> std::result::Result<(), String> {
    const GIB4: usize = 0x1_0000_0000;
    let all = Protection::READ
        | Protection::WRITE
        | Protection::EXEC
        | Protection::PIN
        | Protection::KERN
        | Protection::EAGER;
    let kernel_only = Protection::PIN | Protection::KERN | Protection::EAGER;

    let r0 = Region::identity(0, GIB4, Protection::from_flags(all));
    check_step("add r0", aspace.add_region(&r0), true)?;

    let mut r1 = r0;
    check_step("re-add r0", aspace.add_region(&r1), false)?;
    r1.va_start = 0x2_0000_0000;
    match aspace.add_region(&r1) {
        Err(Error::IdentityViolation { .. }) => {}
        other => return Err(format!("non-identity r1: expected identity violation, got {:?}", other)),
    }
    r1.pa_start = r1.va_start;
    check_step("add r1", aspace.add_region(&r1), true)?;
    match aspace.remove_region(&r1) {
        Err(Error::PinnedViolation(_)) => {}
        other => return Err(format!("remove pinned r1: expected pin violation, got {:?}", other)),
    }

    let r2 = Region::identity(0x3_0000_0000, GIB4, Protection::from_flags(kernel_only));
    check_step("add r2", aspace.add_region(&r2), true)?;
    check_step("check r2", aspace.protection_check(&r2), true)?;

    let shifted = |base: usize, len: usize, flags: u8| {
        Region::identity(base, len, Protection::from_flags(flags))
    };
    check_step(
        "check r2 shifted by 2GiB",
        aspace.protection_check(&shifted(r2.va_start + 0x8000_0000, GIB4, kernel_only)),
        false,
    )?;
    check_step(
        "check range straddling r1 and r2",
        aspace.protection_check(&shifted(r1.va_start + 0x8000_0000, GIB4, kernel_only)),
        false,
    )?;
    check_step(
        "check range past r2",
        aspace.protection_check(&shifted(r2.va_start + GIB4, GIB4, kernel_only)),
        false,
    )?;

    let r4 = r2.va_start + 0x8000_0000;
    let r4_len = 0x2000_0000;
    check_step(
        "check r4 inside r2",
        aspace.protection_check(&shifted(r4, r4_len, kernel_only)),
        true,
    )?;
    for (step, access) in [
        ("check r4 read", Protection::READ),
        ("check r4 write", Protection::WRITE),
        ("check r4 exec", Protection::EXEC),
    ] {
        check_step(
            step,
            aspace.protection_check(&shifted(r4, r4_len, access | kernel_only)),
            false,
        )?;
    }
    check_step(
        "check r4 from user mode",
        aspace.protection_check(&shifted(r4, r4_len, Protection::PIN | Protection::EAGER)),
        false,
    )?;
    Ok(())
}

/// Runs the address and stack guards `iterations` times each against a fresh
/// address space and returns the counters they left behind.
pub fn protection_profile(
    carat: &Carat,
    iterations: usize,
) -> std::result::Result<RelocationStatistics, String> {
    const FRAME: usize = 256;
    let arena = vec![0u64; 512];
    let base = arena.as_ptr() as usize;
    let len = arena.len() * std::mem::size_of::<u64>();
    let stack = vec![0u8; 64 * 1024];

    let aspace = carat.create_aspace("carat-protection-profile");
    let region = Region::identity(
        base,
        len,
        Protection::from_flags(Protection::READ | Protection::WRITE),
    );
    if let Err(e) = aspace.add_region(&region) {
        aspace.destroy();
        return Err(format!("add {}: {}", region, e));
    }
    let context = carat.safepoint().attach("protection-profile");
    context.set_stack(stack.as_ptr() as usize, stack.len());
    context.store(Register::Rsp, stack.as_ptr() as usize + stack.len() / 2);

    for i in 0..iterations {
        aspace.guard_address(base + (i * 8) % len, i % 2 == 0);
        aspace.guard_callee_stack(&context, FRAME);
    }

    carat.safepoint().detach(&context);
    aspace.destroy();
    drop(arena);
    drop(stack);
    Ok(carat.runtime().statistics())
}
