//! Partition state (§4.C): attribute store, person table, triggers, and the
//! cooperative loop's cell queue. Owned by exactly one worker for its
//! lifetime (§5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use log::{debug, trace};

use crate::index::AttributeStore;
use crate::person::PersonData;
use crate::scheduler::cell::{Cell, CellStatus, ScheduledCell};

pub type PartitionId = u64;

pub struct PartitionState {
    id: PartitionId,
    pub attributes: Mutex<AttributeStore>,
    persons: RwLock<HashMap<u32, PersonData>>,
    external_ids: Mutex<HashMap<String, u32>>,
    next_linear_id: AtomicU32,
    marked_for_deletion: AtomicBool,
    realtime_cells: AtomicUsize,
    cells: Mutex<VecDeque<ScheduledCell>>,
}

impl PartitionState {
    pub fn new(id: PartitionId) -> PartitionState {
        PartitionState {
            id,
            attributes: Mutex::new(AttributeStore::new()),
            persons: RwLock::new(HashMap::new()),
            external_ids: Mutex::new(HashMap::new()),
            next_linear_id: AtomicU32::new(0),
            marked_for_deletion: AtomicBool::new(false),
            realtime_cells: AtomicUsize::new(0),
            cells: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn mark_for_deletion(&self) {
        debug!("partition {} marked for deletion", self.id);
        self.marked_for_deletion.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    /// Dense ordinal assigned on first sight of `external_id`. Never reused
    /// within this partition's lifetime.
    pub fn linear_id_for(&self, external_id: &str) -> u32 {
        let mut ids = self.external_ids.lock().unwrap();
        if let Some(&id) = ids.get(external_id) {
            return id;
        }
        let id = self.next_linear_id.fetch_add(1, Ordering::SeqCst);
        ids.insert(external_id.to_string(), id);
        id
    }

    pub fn existing_linear_id(&self, external_id: &str) -> Option<u32> {
        self.external_ids.lock().unwrap().get(external_id).copied()
    }

    pub fn get_person(&self, linear_id: u32) -> Option<PersonData> {
        self.persons.read().unwrap().get(&linear_id).cloned()
    }

    pub fn put_person(&self, linear_id: u32, data: PersonData) {
        self.persons.write().unwrap().insert(linear_id, data);
    }

    pub fn person_count(&self) -> usize {
        self.persons.read().unwrap().len()
    }

    pub fn max_linear_id(&self) -> u32 {
        self.next_linear_id.load(Ordering::SeqCst)
    }

    pub fn realtime_cell_count(&self) -> usize {
        self.realtime_cells.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, cell: Box<dyn Cell>) {
        if cell.is_realtime() {
            self.realtime_cells.fetch_add(1, Ordering::SeqCst);
        }
        self.cells.lock().unwrap().push_back(ScheduledCell::new(cell));
    }

    pub fn pending_cells(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    /// Run the cell at the head of the FIFO for one step. Returns `true` if
    /// the partition has more runnable work (should be revisited promptly).
    pub fn run_one(&self) -> bool {
        let mut scheduled = match self.cells.lock().unwrap().pop_front() {
            Some(s) => s,
            None => return false,
        };

        if self.is_marked_for_deletion() {
            scheduled.cell.partition_removed();
            self.finish(scheduled.cell.as_ref());
            return !self.cells.lock().unwrap().is_empty();
        }

        if !scheduled.prepared {
            trace!("partition {} preparing cell {}", self.id, scheduled.cell.name());
            scheduled.cell.prepare();
            scheduled.prepared = true;
        }

        trace!("partition {} running cell {}", self.id, scheduled.cell.name());
        match scheduled.cell.run() {
            CellStatus::Continue => {
                self.cells.lock().unwrap().push_back(scheduled);
            }
            CellStatus::Done => {
                self.finish(scheduled.cell.as_ref());
            }
        }
        !self.cells.lock().unwrap().is_empty()
    }

    fn finish(&self, cell: &dyn Cell) {
        if cell.is_realtime() {
            self.realtime_cells.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
