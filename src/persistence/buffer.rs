use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::record::{apply_formulas, merge_record, CompositeKey, Record};

/// Two generations of a keyed record map. Writers merge into the current
/// generation; `switch` retires it and hands it over once its writers
/// have left.
pub struct DoubleBuffer<R> {
    generations: [Mutex<HashMap<CompositeKey, R>>; 2],
    writers: [AtomicUsize; 2],
    /// Low bit selects the current generation.
    pointer: AtomicUsize,
}

/// Decrements a generation's writer count when the merge ends.
struct WriterGuard<'a>(&'a AtomicUsize);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R> Default for DoubleBuffer<R> {
    fn default() -> Self {
        Self {
            generations: [Mutex::new(HashMap::new()), Mutex::new(HashMap::new())],
            writers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            pointer: AtomicUsize::new(0),
        }
    }
}

impl<R: Record> DoubleBuffer<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> usize {
        self.pointer.load(Ordering::SeqCst) & 1
    }

    /// Merges `record` into the current generation.
    pub fn write(&self, record: R) {
        let idx = self.enter();
        let _guard = WriterGuard(&self.writers[idx]);

        let mut generation = self.generations[idx].lock();
        match generation.entry(record.composite_key()) {
            Entry::Occupied(mut existing) => merge_record(existing.get_mut(), &record),
            Entry::Vacant(slot) => {
                let mut record = record;
                apply_formulas(&mut record);
                slot.insert(record);
            }
        }
    }

    /// Registers as a writer of the current generation. Retries when a
    /// switch lands between reading the pointer and registering, so a
    /// registered writer is always waited for by the switch that retires
    /// its generation.
    fn enter(&self) -> usize {
        loop {
            let idx = self.current();
            self.writers[idx].fetch_add(1, Ordering::SeqCst);
            if self.current() == idx {
                return idx;
            }
            self.writers[idx].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Flips the current generation, waits for the retired one's writers to
    /// finish, and takes its contents.
    pub async fn switch(&self, drain_poll: Duration) -> HashMap<CompositeKey, R> {
        let retired = self.pointer.fetch_add(1, Ordering::SeqCst) & 1;

        while self.writers[retired].load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(drain_poll).await;
        }

        std::mem::take(&mut *self.generations[retired].lock())
    }

    /// Keys in the current generation.
    pub fn pending(&self) -> usize {
        self.generations[self.current()].lock().len()
    }
}
