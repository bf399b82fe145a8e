mod common;

use common::{Machine, data};
use kernel_alloc::FrameState;
use kernel_vmem::{AddressSpace, PageState};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const FRAMES: u32 = 12;
const RESERVED: u32 = 3;
const PAGES: u32 = 8;

#[derive(Clone, Debug)]
enum Op {
    Store { space: usize, page: u32, value: u32 },
    Load { space: usize, page: u32 },
    Evict { space: usize, page: u32 },
    SwapOut,
    Kernel(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..2usize, 0..PAGES, any::<u32>())
            .prop_map(|(space, page, value)| Op::Store { space, page, value }),
        3 => (0..2usize, 0..PAGES).prop_map(|(space, page)| Op::Load { space, page }),
        1 => (0..2usize, 0..PAGES).prop_map(|(space, page)| Op::Evict { space, page }),
        1 => Just(Op::SwapOut),
        1 => (1u32..3).prop_map(Op::Kernel),
    ]
}

fn check_invariants(m: &Machine, spaces: &[Arc<AddressSpace>]) -> Result<(), TestCaseError> {
    let snapshot = m.vm.coremap().snapshot();
    prop_assert_eq!(snapshot.stats.total(), FRAMES as usize);
    prop_assert_eq!(snapshot.stats.pinned, 0);

    let mut frames = HashSet::new();
    let mut slots = HashSet::new();
    for space in spaces {
        for (page, state) in space.lock().page_table.mappings() {
            match state {
                PageState::Resident { frame, dirty } => {
                    prop_assert!(frames.insert(frame), "{} mapped twice", frame);
                    let info = snapshot.frames[frame.index()];
                    prop_assert_eq!(info.owner, Some(space.id()));
                    prop_assert_eq!(info.vpage, Some(page));
                    prop_assert_eq!(info.map_count, 1);
                    prop_assert_eq!(info.state == FrameState::UserDirty, dirty);
                }
                PageState::Swapped(slot) => {
                    prop_assert!(slots.insert(slot), "{} used twice", slot);
                    prop_assert!(m.vm.swap().is_in_use(slot));
                }
                PageState::Unmapped => {}
            }
        }
    }
    prop_assert_eq!(frames.len(), snapshot.stats.user());
    prop_assert_eq!(slots.len(), m.vm.swap().slots_in_use() as usize);
    Ok(())
}

proptest! {
    #[test]
    fn paging_preserves_contents_and_accounting(ops in prop::collection::vec(arb_op(), 1..60)) {
        let m = Machine::new(FRAMES, RESERVED, 2 * PAGES);
        let spaces = [m.data_space(PAGES), m.data_space(PAGES)];
        let mut model: HashMap<(usize, u32), u32> = HashMap::new();
        let mut kernel = Vec::new();

        for op in ops {
            match op {
                Op::Store { space, page, value } => {
                    m.store(&spaces[space], data(page, 0), value);
                    model.insert((space, page), value);
                }
                Op::Load { space, page } => {
                    let expected = model.get(&(space, page)).copied().unwrap_or(0);
                    prop_assert_eq!(m.load(&spaces[space], data(page, 0)), expected);
                }
                Op::Evict { space, page } => {
                    m.vm.evict_page(&spaces[space], data(page, 0)).unwrap();
                }
                Op::SwapOut => {
                    let _ = m.vm.swap_out();
                }
                Op::Kernel(count) => {
                    if kernel.len() < 2 {
                        kernel.push(m.vm.alloc_kpages(count).unwrap());
                    } else {
                        for kva in kernel.drain(..) {
                            m.vm.free_kpages(kva);
                        }
                    }
                }
            }
            check_invariants(&m, &spaces)?;
        }

        for ((space, page), value) in &model {
            prop_assert_eq!(m.load(&spaces[*space], data(*page, 0)), *value);
        }
        for space in &spaces {
            m.vm.destroy_space(space);
        }
        prop_assert_eq!(m.vm.stats().user(), 0);
        prop_assert_eq!(m.vm.swap().slots_in_use(), 0);
    }
}
