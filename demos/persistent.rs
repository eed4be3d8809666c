use pheap::{Heap, HeapError, HeapSettings};

fn main() -> Result<(), HeapError> {
    env_logger::init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("heap.img");
    let settings = HeapSettings {
        region_size: 64 * 1024 * 1024,
        ..Default::default()
    };

    let heap = Heap::create(&path, &settings)?;

    let mut tx = heap.stage()?;
    let cell = tx.allocate(64)?;
    unsafe { cell.as_ptr().cast::<u64>().write(42) };
    tx.set_context(Some(cell));
    tx.commit()?;
    println!("Stored 42 at {cell:p}, identifier {}", heap.gensym());

    // Unmap, then bring the region back at the same address.
    drop(heap);
    let heap = Heap::load(&path)?;

    let context = heap.context(|_| {})?;
    match context {
        Some(ptr) => {
            let value = unsafe { ptr.as_ptr().cast::<u64>().read() };
            println!("Reloaded context {ptr:p} holding {value}");
        }
        None => println!("No context after reload"),
    }
    println!("Next identifier {}", heap.gensym());

    Ok(())
}
