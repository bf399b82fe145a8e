mod common;

use common::{Machine, data};
use kernel_alloc::FrameState;
use kernel_vmem::{FaultType, PageState};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: u32 = 4;

#[test]
fn racing_faults_on_one_page_share_a_frame() {
    let m = Arc::new(Machine::new(32, 2, 8));
    let space = m.data_space(1);
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let (m, space, barrier) = (m.clone(), space.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                m.vm
                    .handle_fault(&space, FaultType::Write, data(0, 0))
                    .unwrap()
                    .frame()
            })
        })
        .collect();
    let frames: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(frames.len(), 1, "every thread sees the same frame");
    let stats = m.vm.stats();
    assert_eq!(stats.user(), 1, "losers gave their frames back");
    assert_eq!(stats.pinned, 0);
}

#[test]
fn threads_under_pressure_keep_their_data() {
    // 8 user frames for 4 spaces of 6 pages each.
    let m = Arc::new(Machine::new(10, 2, 64));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let (m, barrier) = (m.clone(), barrier.clone());
            thread::spawn(move || {
                let space = m.data_space(6);
                barrier.wait();
                for round in 0..5 {
                    for n in 0..6 {
                        m.store(&space, data(n, 0), t << 16 | round << 8 | n);
                    }
                    for n in 0..6 {
                        assert_eq!(m.load(&space, data(n, 0)), t << 16 | round << 8 | n);
                    }
                }
                space
            })
        })
        .collect();
    let spaces: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let snapshot = m.vm.coremap().snapshot();
    assert_eq!(snapshot.stats.total(), 10);
    assert_eq!(snapshot.stats.pinned, 0);

    // Every user frame is mapped by exactly the page the coremap names, and
    // every swapped page holds its own slot.
    let mut resident = 0;
    let mut slots = HashSet::new();
    for space in &spaces {
        for (page, state) in space.lock().page_table.mappings() {
            match state {
                PageState::Resident { frame, dirty } => {
                    let info = m.vm.coremap().info(frame).unwrap();
                    assert_eq!(info.owner, Some(space.id()));
                    assert_eq!(info.vpage, Some(page));
                    assert_eq!(info.state == FrameState::UserDirty, dirty);
                    resident += 1;
                }
                PageState::Swapped(slot) => assert!(slots.insert(slot)),
                PageState::Unmapped => unreachable!(),
            }
        }
    }
    assert_eq!(resident, snapshot.stats.user());
    assert_eq!(slots.len(), m.vm.swap().slots_in_use() as usize);

    for space in &spaces {
        m.vm.destroy_space(space);
    }
    assert_eq!(m.vm.stats().free, 8);
    assert_eq!(m.vm.swap().slots_in_use(), 0);
}
