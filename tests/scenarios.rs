// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios against a mock heap/object-model pair, exercising
//! `mark_loop` the way a host collector would: real OS threads, a shared
//! `QueueSet` and `Terminator`, and a graph built entirely out of atomic
//! heap words so slots can be raced against by a concurrent mutator.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as StdOrdering};
use std::sync::Mutex;
use std::time::Duration;

use markwork::{
    mark_loop, CasUpdate, Heap, MarkLoopFlags, MarkTask, NoUpdate, ObjAddr, ObjectModel,
    QueueSet, RegionId, Slot, Terminator, NULL,
};

/// One node in the mock heap: either a plain object or a reference array,
/// its outgoing references stored as real atomic words so `Slot` can load,
/// store, and CAS them exactly as it would real heap memory.
struct TestObject {
    fields: Vec<AtomicU64>,
    marked: AtomicBool,
    is_array: bool,
    is_ref_array: bool,
    /// Extra references reachable only through class-metadata iteration,
    /// not `fields`/`iterate_refs` -- exercises `UNLOAD_CLASSES`.
    class_fields: Vec<AtomicU64>,
    /// Whether this object should be offered to the dedup queue when
    /// `DEDUP_STRINGS` is set and marking succeeds.
    dedup_candidate: bool,
}

/// A tiny mock `Heap`/`ObjectModel` implementation. Object ids are 1-based
/// indices into `objects`; id `0` is never assigned, so it doubles as the
/// [`NULL`] sentinel.
struct TestHeap {
    objects: Vec<TestObject>,
    region_words: Vec<AtomicU64>,
    region_count: usize,
    forward: Mutex<HashMap<u64, u64>>,
    cancelled: AtomicBool,
    barriers: Mutex<Vec<Vec<Slot>>>,
}

impl TestHeap {
    fn new(region_count: usize) -> Self {
        Self {
            objects: vec![TestObject {
                fields: Vec::new(),
                marked: AtomicBool::new(false),
                is_array: false,
                is_ref_array: false,
                class_fields: Vec::new(),
                dedup_candidate: false,
            }],
            region_words: (0..region_count).map(|_| AtomicU64::new(0)).collect(),
            region_count,
            forward: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            barriers: Mutex::new(Vec::new()),
        }
    }

    fn add_plain(&mut self, children: &[u64]) -> u64 {
        let idx = self.objects.len() as u64;
        self.objects.push(TestObject {
            fields: children.iter().map(|&c| AtomicU64::new(c)).collect(),
            marked: AtomicBool::new(false),
            is_array: false,
            is_ref_array: false,
            class_fields: Vec::new(),
            dedup_candidate: false,
        });
        idx
    }

    fn add_ref_array(&mut self, children: &[u64]) -> u64 {
        let idx = self.objects.len() as u64;
        self.objects.push(TestObject {
            fields: children.iter().map(|&c| AtomicU64::new(c)).collect(),
            marked: AtomicBool::new(false),
            is_array: true,
            is_ref_array: true,
            class_fields: Vec::new(),
            dedup_candidate: false,
        });
        idx
    }

    /// A plain object whose `class_refs` are reachable only through
    /// `UNLOAD_CLASSES` iteration, distinct from its instance fields.
    fn add_plain_with_class_refs(&mut self, fields: &[u64], class_refs: &[u64]) -> u64 {
        let idx = self.objects.len() as u64;
        self.objects.push(TestObject {
            fields: fields.iter().map(|&c| AtomicU64::new(c)).collect(),
            marked: AtomicBool::new(false),
            is_array: false,
            is_ref_array: false,
            class_fields: class_refs.iter().map(|&c| AtomicU64::new(c)).collect(),
            dedup_candidate: false,
        });
        idx
    }

    fn mark_dedup_candidate(&mut self, obj: u64) {
        self.objects[obj as usize].dedup_candidate = true;
    }

    fn object_count(&self) -> usize {
        self.objects.len() - 1
    }

    fn marked_count(&self) -> usize {
        self.objects[1..]
            .iter()
            .filter(|o| o.marked.load(StdOrdering::Relaxed))
            .count()
    }

    fn region_total(&self, region: usize) -> u64 {
        self.region_words[region].load(StdOrdering::Relaxed)
    }

    fn cancel(&self) {
        self.cancelled.store(true, StdOrdering::Release);
    }

    fn forward_to(&self, from: u64, to: u64) {
        self.forward.lock().unwrap().insert(from, to);
    }

    fn read_slot(&self, obj: u64, idx: usize) -> u64 {
        self.objects[obj as usize].fields[idx].load(StdOrdering::Relaxed)
    }

    fn write_slot(&self, obj: u64, idx: usize, value: u64) {
        self.objects[obj as usize].fields[idx].store(value, StdOrdering::Relaxed);
    }
}

impl Heap for TestHeap {
    fn try_mark(&self, obj: ObjAddr) -> bool {
        !self.objects[obj.get() as usize]
            .marked
            .swap(true, StdOrdering::AcqRel)
    }

    fn resolve_forwarding(&self, obj: ObjAddr) -> ObjAddr {
        match self.forward.lock().unwrap().get(&obj.get()) {
            Some(&to) => ObjAddr::new(to),
            None => obj,
        }
    }

    fn region_of(&self, addr: ObjAddr) -> RegionId {
        (addr.get() as usize % self.region_count) as RegionId
    }

    fn region_count(&self) -> usize {
        self.region_count
    }

    fn region_live_add(&self, region: RegionId, words: u64) {
        self.region_words[region as usize].fetch_add(words, StdOrdering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(StdOrdering::Acquire)
    }

    fn apply_closure_to_one_completed_buffer(&self, cl: &mut dyn FnMut(Slot)) -> bool {
        let Some(buf) = self.barriers.lock().unwrap().pop() else {
            return false;
        };
        for slot in buf {
            cl(slot);
        }
        true
    }
}

impl ObjectModel for TestHeap {
    fn is_array(&self, obj: ObjAddr) -> bool {
        self.objects[obj.get() as usize].is_array
    }

    fn is_reference_array(&self, obj: ObjAddr) -> bool {
        self.objects[obj.get() as usize].is_ref_array
    }

    fn array_length(&self, obj: ObjAddr) -> usize {
        self.objects[obj.get() as usize].fields.len()
    }

    fn iterate_refs(&self, obj: ObjAddr, cl: &mut dyn FnMut(Slot)) {
        for field in &self.objects[obj.get() as usize].fields {
            cl(Slot::from_raw(field as *const AtomicU64 as u64));
        }
    }

    fn iterate_ref_range(&self, obj: ObjAddr, range: Range<usize>, cl: &mut dyn FnMut(Slot)) {
        for field in &self.objects[obj.get() as usize].fields[range] {
            cl(Slot::from_raw(field as *const AtomicU64 as u64));
        }
    }

    fn size_in_words(&self, obj: ObjAddr) -> u64 {
        self.objects[obj.get() as usize].fields.len() as u64
    }

    fn is_dedup_candidate(&self, obj: ObjAddr) -> bool {
        self.objects[obj.get() as usize].dedup_candidate
    }

    fn iterate_class_refs(&self, obj: ObjAddr, cl: &mut dyn FnMut(Slot)) {
        for field in &self.objects[obj.get() as usize].class_fields {
            cl(Slot::from_raw(field as *const AtomicU64 as u64));
        }
    }
}

/// Builds a full binary tree of the given `depth` (leaves hold no
/// references; every internal node holds exactly its two children).
/// Returns the heap, the root's address, and the total node count.
fn build_binary_tree(depth: u32, region_count: usize) -> (TestHeap, ObjAddr, usize) {
    let mut heap = TestHeap::new(region_count);
    let mut level: Vec<u64> = (0..(1usize << depth)).map(|_| heap.add_plain(&[])).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| heap.add_plain(pair))
            .collect();
    }
    let root = level[0];
    let total = heap.object_count();
    (heap, ObjAddr::new(root), total)
}

/// Scenario 1: single worker, single object with no outgoing references.
#[test]
fn single_worker_single_object() {
    let mut heap = TestHeap::new(4);
    let o1 = heap.add_plain(&[]);
    let heap = heap;

    let qs = QueueSet::new(1).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(o1)));
    let term = Terminator::new(1);

    mark_loop(
        &heap,
        &heap,
        &NoUpdate,
        &qs,
        &term,
        0,
        MarkLoopFlags::COUNT_LIVENESS,
    );

    assert!(qs.queue(0).is_empty());
    assert_eq!(heap.marked_count(), 1);
    let region = o1 as usize % 4;
    // a zero-field object contributes exactly the engine's one metadata word.
    assert_eq!(heap.region_total(region), 1);
}

/// Scenario 2 (adapted): a branching tree, not a strict chain, so that the
/// speculative single-slot buffer (the engine's fast path) actually spills
/// into the shared deque and a peer worker has something to steal. A pure
/// one-child-per-node chain never touches the deque at all -- by design,
/// per the engine's own "hottest push/pop path" rationale -- so it can't
/// exercise the steal path.
#[test]
fn multiple_workers_exercise_the_steal_path() {
    let (heap, root, total) = build_binary_tree(10, 8);
    let qs = QueueSet::new(4).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(root));
    let term = Terminator::new(4);

    std::thread::scope(|scope| {
        for worker_id in 0..4 {
            let heap = &heap;
            let qs = &qs;
            let term = &term;
            scope.spawn(move || {
                mark_loop(heap, heap, &NoUpdate, qs, term, worker_id, MarkLoopFlags::empty());
            });
        }
    });

    assert_eq!(heap.marked_count(), total);
    for i in 0..4 {
        assert!(qs.queue(i).is_empty());
    }
    let total_steals: u64 = (0..4).map(|i| qs.queue(i).stats.steal).sum();
    assert!(
        total_steals > 0,
        "expected at least one successful steal across the pool"
    );
}

/// Scenario 3: a large reference array is split into balanced chunks that
/// more than one worker ends up processing.
#[test]
fn array_splitting_spreads_work_across_workers() {
    const LEN: usize = 200_000;
    let mut heap = TestHeap::new(16);
    let leaves: Vec<u64> = (0..LEN).map(|_| heap.add_plain(&[])).collect();
    let array = heap.add_ref_array(&leaves);
    let heap = heap;

    let qs = QueueSet::new(4).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(array)));
    let term = Terminator::new(4);

    std::thread::scope(|scope| {
        for worker_id in 0..4 {
            let heap = &heap;
            let qs = &qs;
            let term = &term;
            scope.spawn(move || {
                mark_loop(heap, heap, &NoUpdate, qs, term, worker_id, MarkLoopFlags::empty());
            });
        }
    });

    // every leaf, plus the array itself, got marked exactly once.
    assert_eq!(heap.marked_count(), LEN + 1);
    for i in 0..4 {
        assert!(qs.queue(i).is_empty());
    }

    let active_workers = (0..4)
        .filter(|&i| {
            let s = &qs.queue(i).stats;
            s.pop > 0 || s.steal > 0
        })
        .count();
    assert!(
        active_workers >= 2,
        "expected the chunk splitter to spread work across more than one worker"
    );
}

/// Scenario 4: many workers, a bursty root with fan-out, all racing to
/// offer termination together. No worker may report done while another
/// still holds work, and the phase must not deadlock.
#[test]
fn termination_agrees_under_bursty_fan_out() {
    let mut heap = TestHeap::new(8);
    let mids: Vec<u64> = (0..10)
        .map(|_| {
            let leaves: Vec<u64> = (0..100).map(|_| heap.add_plain(&[])).collect();
            heap.add_plain(&leaves)
        })
        .collect();
    let root = heap.add_plain(&mids);
    let total = heap.object_count();
    let heap = heap;

    let qs = QueueSet::new(8).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(root)));
    let term = Terminator::new(8);

    std::thread::scope(|scope| {
        for worker_id in 0..8 {
            let heap = &heap;
            let qs = &qs;
            let term = &term;
            scope.spawn(move || {
                mark_loop(heap, heap, &NoUpdate, qs, term, worker_id, MarkLoopFlags::empty());
            });
        }
    });

    assert_eq!(heap.marked_count(), total);
    for i in 0..8 {
        assert!(
            qs.queue(i).is_empty(),
            "queue {i} must be fully drained once every worker has terminated"
        );
    }
}

/// Scenario 5: cancellation fires mid-phase. Every worker must observe it
/// and return promptly, without panicking or deadlocking, regardless of how
/// much of the graph it had left to trace.
#[test]
fn cancellation_stops_every_worker_without_deadlock() {
    let (heap, root, total) = build_binary_tree(14, 32);
    let qs = QueueSet::new(4).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(root));
    let term = Terminator::new(4);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(5));
            heap.cancel();
        });
        for worker_id in 0..4 {
            let heap = &heap;
            let qs = &qs;
            let term = &term;
            scope.spawn(move || {
                mark_loop(
                    heap,
                    heap,
                    &NoUpdate,
                    qs,
                    term,
                    worker_id,
                    MarkLoopFlags::CANCELLABLE,
                );
            });
        }
    });

    // Partial progress is fine; over-counting is not.
    assert!(heap.marked_count() <= total);
}

/// Scenario 6: a mutator thread overwrites array slots with other valid
/// targets while the pool races through them under `CasUpdate`. No torn or
/// out-of-range value may land in a slot; every slot ends up holding either
/// this run's forwarded image or the mutator's own overwrite.
#[test]
fn cas_update_is_safe_under_concurrent_mutation() {
    const LEN: usize = 2_000;
    let mut heap = TestHeap::new(8);
    let targets: Vec<u64> = (0..LEN).map(|_| heap.add_plain(&[])).collect();
    let array = heap.add_ref_array(&targets);
    for (i, &t) in targets.iter().enumerate() {
        if i % 2 == 0 {
            heap.forward_to(t, targets[(i + 1) % LEN]);
        }
    }
    let heap = heap;

    let qs = QueueSet::new(2).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(array)));
    let term = Terminator::new(2);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..LEN {
                if i % 7 == 0 {
                    heap.write_slot(array, i, targets[(i + 3) % LEN]);
                }
            }
        });
        for worker_id in 0..2 {
            let heap = &heap;
            let qs = &qs;
            let term = &term;
            scope.spawn(move || {
                mark_loop(
                    heap,
                    heap,
                    &CasUpdate,
                    qs,
                    term,
                    worker_id,
                    MarkLoopFlags::empty(),
                );
            });
        }
    });

    for i in 0..LEN {
        let raw = heap.read_slot(array, i);
        assert!(
            raw != NULL && raw as usize <= heap.object_count(),
            "slot {i} holds invalid value {raw}"
        );
    }
}

/// Scenario: class-metadata references are only traced when
/// `UNLOAD_CLASSES` is set, and are traced in addition to (not instead of)
/// instance fields when it is.
#[test]
fn unload_classes_flag_reaches_class_metadata_only_when_set() {
    let mut heap = TestHeap::new(4);
    let class_only = heap.add_plain(&[]);
    let instance_only = heap.add_plain(&[]);
    let root = heap.add_plain_with_class_refs(&[instance_only], &[class_only]);
    let heap = heap;

    let qs = QueueSet::new(1).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(root)));
    let term = Terminator::new(1);
    mark_loop(&heap, &heap, &NoUpdate, &qs, &term, 0, MarkLoopFlags::empty());

    assert_eq!(heap.marked_count(), 2, "root and its instance field only");

    let mut heap = TestHeap::new(4);
    let class_only = heap.add_plain(&[]);
    let instance_only = heap.add_plain(&[]);
    let root = heap.add_plain_with_class_refs(&[instance_only], &[class_only]);
    let heap = heap;

    let qs = QueueSet::new(1).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(ObjAddr::new(root)));
    let term = Terminator::new(1);
    mark_loop(
        &heap,
        &heap,
        &NoUpdate,
        &qs,
        &term,
        0,
        MarkLoopFlags::UNLOAD_CLASSES,
    );

    assert_eq!(
        heap.marked_count(),
        3,
        "root, its instance field, and its class-metadata reference"
    );
}

/// Setting `DEDUP_STRINGS` and flagging some objects as dedup candidates
/// must not change which objects end up marked; the dedup queue is purely
/// a side channel consulted internally by the marking loop.
#[test]
fn dedup_strings_flag_does_not_disturb_marking() {
    let (mut heap, root, total) = build_binary_tree(6, 4);
    for i in 1..=heap.object_count() as u64 {
        if i % 3 == 0 {
            heap.mark_dedup_candidate(i);
        }
    }
    let heap = heap;

    let qs = QueueSet::new(1).unwrap();
    qs.queue_mut(0).push(MarkTask::from_obj(root));
    let term = Terminator::new(1);
    mark_loop(
        &heap,
        &heap,
        &NoUpdate,
        &qs,
        &term,
        0,
        MarkLoopFlags::DEDUP_STRINGS,
    );

    assert_eq!(heap.marked_count(), total);
}
