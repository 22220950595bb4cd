use clap::{App, Arg};
use kmem::{
    FrameAllocator, Heap, MapError, PTEFlags, PageTableManager, PhysAddr, PhysMemory, SimMemory,
    VirtAddr, PAGE_SIZE,
};
use log::{info, Level, LevelFilter, Log, Metadata, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// where the kernel image would sit below the frame heap
const KERNEL_BASE: usize = 0x8020_0000;

const UART0: (usize, usize) = (0x1000_0000, 0x100);
const VIRTIO0: (usize, usize) = (0x1000_1000, 0x1000);
const CLINT: (usize, usize) = (0x0200_0000, 0x1_0000);
const PLIC: (usize, usize) = (0x0c00_0000, 0x60_0000);

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31,
            Level::Warn => 93,
            Level::Info => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        eprintln!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            color,
            record.level(),
            record.args()
        );
    }
    fn flush(&self) {}
}

fn init_logger(level: &str) {
    static LOGGER: StderrLogger = StderrLogger;
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(match level {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}

fn parse_num(arg: &str) -> Result<usize, String> {
    let parsed = match arg.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => arg.replace('_', "").parse(),
    };
    parsed.map_err(|err| format!("bad number {:?}: {}", arg, err))
}

fn main() {
    kmem_boot().expect("Error when booting the simulated memory core!");
}

fn kmem_boot() -> Result<(), String> {
    let matches = App::new("kmem simulated boot")
        .arg(
            Arg::with_name("heap-start")
                .long("heap-start")
                .takes_value(true)
                .default_value("0x80400000")
                .help("Physical address where the frame heap begins"),
        )
        .arg(
            Arg::with_name("heap-size")
                .long("heap-size")
                .takes_value(true)
                .default_value("0x800000")
                .help("Bytes of RAM handed to the frame allocator"),
        )
        .arg(
            Arg::with_name("arena-pages")
                .long("arena-pages")
                .takes_value(true)
                .default_value("512")
                .help("Frames given to the sub-page heap"),
        )
        .arg(
            Arg::with_name("rounds")
                .long("rounds")
                .takes_value(true)
                .default_value("10000")
                .help("Random malloc/free operations in the stress run"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("42")
                .help("Seed of the stress run"),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .takes_value(true)
                .default_value("INFO")
                .possible_values(&["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
                .help("Log level"),
        )
        .get_matches();
    let machine = Machine {
        heap_start: parse_num(matches.value_of("heap-start").unwrap())?,
        heap_size: parse_num(matches.value_of("heap-size").unwrap())?,
        arena_pages: parse_num(matches.value_of("arena-pages").unwrap())?,
        rounds: parse_num(matches.value_of("rounds").unwrap())?,
        seed: parse_num(matches.value_of("seed").unwrap())? as u64,
    };
    init_logger(matches.value_of("log").unwrap());
    boot(&machine)
}

/// the simulated board and the stress run to put it through
struct Machine {
    heap_start: usize,
    heap_size: usize,
    arena_pages: usize,
    rounds: usize,
    seed: u64,
}

fn boot(machine: &Machine) -> Result<(), String> {
    let Machine {
        heap_start,
        heap_size,
        arena_pages,
        rounds,
        seed,
    } = *machine;
    if heap_start % 8 != 0 || heap_size % 8 != 0 || heap_start < KERNEL_BASE + 4 * PAGE_SIZE {
        return Err(format!(
            "heap [{:#x}, {:#x}) must be word aligned and leave room for the kernel image at {:#x}",
            heap_start,
            heap_start + heap_size,
            KERNEL_BASE
        ));
    }
    let ram = SimMemory::new(heap_start, heap_size);
    let mut frames = FrameAllocator::new(&ram, heap_start, heap_size);
    if arena_pages + 1 > frames.num_pages() {
        return Err(format!(
            "{} arena pages do not fit in {} frames",
            arena_pages,
            frames.num_pages()
        ));
    }
    let mut heap = Heap::with_pages(&mut frames, arena_pages);
    let kernel_table = heap.kernel_table();

    // a pretend image: four sections of one page each below the heap
    let text = (KERNEL_BASE, KERNEL_BASE + PAGE_SIZE);
    let rodata = (text.1, text.1 + PAGE_SIZE);
    let data = (rodata.1, rodata.1 + PAGE_SIZE);
    let bss = (data.1, heap_start);
    let heap_end = heap_start + heap_size;
    {
        let mut pt = PageTableManager::new(&mut frames);
        let sections = [
            (".text", text, PTEFlags::R | PTEFlags::X),
            (".rodata", rodata, PTEFlags::R),
            (".data", data, PTEFlags::R | PTEFlags::W),
            (".bss", bss, PTEFlags::R | PTEFlags::W),
            ("heap", (heap_start, heap_end), PTEFlags::R | PTEFlags::W),
            ("UART0", (UART0.0, UART0.0 + UART0.1), PTEFlags::R | PTEFlags::W),
            ("VIRTIO0", (VIRTIO0.0, VIRTIO0.0 + VIRTIO0.1), PTEFlags::R | PTEFlags::W),
            ("CLINT", (CLINT.0, CLINT.0 + CLINT.1), PTEFlags::R | PTEFlags::W),
            ("PLIC", (PLIC.0, PLIC.0 + PLIC.1), PTEFlags::R | PTEFlags::W),
        ];
        for (name, (start, end), flags) in sections.iter() {
            info!("mapping {} [{:#x}, {:#x})", name, start, end);
            pt.identity_map_range(&kernel_table, PhysAddr(*start), PhysAddr(*end), *flags)
                .map_err(|err: MapError| format!("mapping {}: {}", name, err))?;
        }
        for (_, (start, end), _) in sections.iter() {
            for va in [*start, end - 1] {
                let pa = pt.translate(&kernel_table, VirtAddr::from(va));
                if pa != Some(PhysAddr(va)) {
                    return Err(format!("{:#x} translates to {:?}", va, pa));
                }
            }
        }
        if let Some(pa) = pt.translate(&kernel_table, VirtAddr::from(heap_end + PAGE_SIZE)) {
            return Err(format!("unmapped address translates to {:?}", pa));
        }
        let text_leaf = kernel_table
            .find_leaf(pt.frames().memory(), VirtAddr::from(text.0))
            .map(|(pte, _)| pte);
        let data_leaf = kernel_table
            .find_leaf(pt.frames().memory(), VirtAddr::from(data.0))
            .map(|(pte, _)| pte);
        match (text_leaf, data_leaf) {
            (Some(text), Some(data)) if !text.writable() && !data.executable() => {
                info!("remap_test passed!")
            }
            other => return Err(format!("kernel sections mapped wrongly: {:?}", other)),
        }
        info!("satp would be {:#x}", kernel_table.token());
    }
    frames.print_page_allocations();

    stress(&ram, &mut heap, rounds, seed)?;
    heap.print_blocks();

    PageTableManager::new(&mut frames).unmap(&kernel_table);
    let stats = frames.stats();
    // the arena and the kernel root are all that stay allocated
    if stats.allocated != arena_pages + 1 {
        return Err(format!(
            "{} frames still allocated after unmap, expected {}",
            stats.allocated,
            arena_pages + 1
        ));
    }
    frames.print_page_allocations();
    Ok(())
}

/// Random malloc/free traffic, checking that live blocks keep their contents
/// and that the arena is one free block again at the end.
fn stress<M: PhysMemory>(
    ram: &SimMemory,
    heap: &mut Heap<M>,
    rounds: usize,
    seed: u64,
) -> Result<(), String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(PhysAddr, usize, u8)> = Vec::new();
    let mut failed = 0usize;
    for round in 0..rounds {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=2 * PAGE_SIZE);
            let tag = (round % 255) as u8 + 1;
            match heap.malloc(size) {
                Some(ptr) => {
                    ram.write_u8(ptr, tag);
                    ram.write_u8(ptr + (size - 1), tag);
                    live.push((ptr, size, tag));
                }
                None => failed += 1,
            }
        } else {
            let (ptr, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
            if ram.read_u8(ptr) != tag || ram.read_u8(ptr + (size - 1)) != tag {
                return Err(format!("block at {:?} was overwritten", ptr));
            }
            heap.free(ptr);
        }
    }
    info!(
        "stress: {} rounds, {} live blocks, {} failed mallocs",
        rounds,
        live.len(),
        failed
    );
    for (ptr, _, _) in live.drain(..) {
        heap.free(ptr);
    }
    heap.coalesce().map_err(|err| err.to_string())?;
    let blocks: Vec<_> = heap.blocks().collect::<Result<_, _>>().map_err(|err| err.to_string())?;
    match blocks.as_slice() {
        [block] if !block.taken && block.size == heap.arena_len() => Ok(()),
        _ => Err(format!("arena left in {} blocks", blocks.len())),
    }
}

#[test]
fn simulated_boot_maps_stresses_and_tears_down() {
    boot(&Machine {
        heap_start: 0x8040_0000,
        heap_size: 0x40_0000,
        arena_pages: 64,
        rounds: 5000,
        seed: 7,
    })
    .unwrap();
}

#[test]
fn unaligned_heap_window_is_refused() {
    let err = boot(&Machine {
        heap_start: 0x8040_0004,
        heap_size: 0x40_0000,
        arena_pages: 64,
        rounds: 0,
        seed: 0,
    })
    .unwrap_err();
    assert!(err.contains("word aligned"), "{}", err);
}

#[test]
fn arena_larger_than_the_heap_is_refused() {
    let err = boot(&Machine {
        heap_start: 0x8040_0000,
        heap_size: 0x10_0000,
        arena_pages: 512,
        rounds: 0,
        seed: 0,
    })
    .unwrap_err();
    assert!(err.contains("do not fit"), "{}", err);
}
