#![no_main]

use std::ptr::NonNull;
use std::sync::Arc;

use metaspace::*;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

type Context = MetaspaceContext<HeapMemory, spin::Mutex<()>>;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Create a metaspace of the given space type
    Create { space_type: u8 },
    /// Drop the ith metaspace along with its allocations
    Destroy { index: u8 },
    /// Allocate from the ith metaspace
    Alloc { index: u8, words: u16, class: bool, huge: bool },
    /// Deallocate the ith allocation
    Dealloc { index: u8 },
    /// Release idle segments
    Purge,
}
use Actions::*;

const ROOT_BYTES: usize = ROOT_CHUNK_WORDS * std::mem::size_of::<MetaWord>();

fuzz_target!(|data: (u8, Vec<Actions>)| {
    let (budget_roots, actions) = data;

    let settings = Settings::default()
        .with_segment_default_bytes(ROOT_BYTES)
        .with_class_space_bytes(Some(ROOT_BYTES * 2))
        .with_max_commit_budget(ROOT_BYTES * (budget_roots as usize % 16 + 1));
    let context = Arc::new(Context::new(HeapMemory::new(), settings).unwrap());

    let mut metaspaces: Vec<Metaspace<HeapMemory, spin::Mutex<()>>> = vec![];
    // (owner, block, words, kind)
    let mut allocations: Vec<(usize, NonNull<MetaWord>, usize, MetadataKind)> = vec![];

    for action in actions {
        match action {
            Create { space_type } => {
                let space_type = SpaceType::ALL[space_type as usize % SpaceType::ALL.len()];
                metaspaces.push(Metaspace::new(&context, space_type));
            }
            Destroy { index } => {
                let index = index as usize;
                if index >= metaspaces.len() { continue; }

                metaspaces.swap_remove(index);
                let moved = metaspaces.len();
                allocations.retain(|&(owner, ..)| owner != index);
                for allocation in &mut allocations {
                    if allocation.0 == moved { allocation.0 = index; }
                }
            }
            Alloc { index, words, class, huge } => {
                let index = index as usize;
                if index >= metaspaces.len() { continue; }

                let kind = if class { MetadataKind::Class } else { MetadataKind::NonClass };
                let words = if huge { ROOT_CHUNK_WORDS + words as usize * 64 } else { words as usize };

                if let Ok(block) = metaspaces[index].allocate_or_reclaim(words, kind) {
                    unsafe { block.as_ptr().write_bytes(0xab, words.max(1)); }
                    allocations.push((index, block, words, kind));
                }
            }
            Dealloc { index } => {
                let index = index as usize;
                if index >= allocations.len() { continue; }

                let (owner, block, words, kind) = allocations.swap_remove(index);
                unsafe { metaspaces[owner].deallocate(block, words, kind); }
            }
            Purge => {
                context.purge();
            }
        }
    }

    for metaspace in &metaspaces {
        metaspace.verify();
    }
    drop(metaspaces);

    context.verify();
    assert_eq!(context.total_usage().used_words, 0);
});
