use clap::Parser;
use pheap::{FREE_TABLE_SIZE, Heap, HeapArgs, HeapError, HeapStats, configuration_error, fatal};

/// Opens, creates or inspects a persistent heap.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    heap: HeapArgs,

    /// Allocate BYTES inside one committed transaction (repeatable)
    #[arg(long = "alloc", value_name = "BYTES")]
    alloc: Vec<usize>,
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match configuration_error(&err) {
            Some(heap_err) => fatal(&heap_err),
            None => err.exit(),
        },
    };

    if let Err(err) = run(&cli) {
        fatal(&err);
    }
}

fn run(cli: &Cli) -> Result<(), HeapError> {
    let mode = cli.heap.mode()?;
    let heap = Heap::open(&mode, &cli.heap.settings())?;
    log::info!("opened {:?}", mode);

    let mut tx = heap.stage()?;
    for &size in &cli.alloc {
        let ptr = tx.allocate(size)?;
        println!("allocated {size} bytes at {ptr:p}");
    }
    let stats = tx.stats();
    tx.commit()?;

    print_stats(&heap, &stats);
    println!("gensym     {}", heap.gensym());
    Ok(())
}

fn print_stats(heap: &Heap, stats: &HeapStats) {
    match heap.path() {
        Some(path) => println!("heap       {}", path.display()),
        None => println!("heap       transient"),
    }
    if !heap.is_persistent() {
        println!("allocated  {} bytes", stats.allocated);
        return;
    }

    println!("range      {:#x}..{:#x}", stats.begin, stats.end);
    println!("bumped     {} bytes", stats.bumped());
    println!("remaining  {} bytes", stats.remaining());
    for bucket in 0..FREE_TABLE_SIZE {
        let chunks = stats.free_chunks[bucket];
        if chunks > 0 {
            println!("free       {} x {} bytes", chunks, 1usize << bucket);
        }
    }
}
