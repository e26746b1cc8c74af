/// Generational slot arena for reactor channel entries.
///
/// Entries are addressed across threads by `(index, generation)` pairs; the
/// generation is bumped when a slot is released, so a stale pair can never
/// reach a recycled slot. Released slots sit in quarantine until `reclaim`,
/// which keeps an index from being reused while a readiness batch that may
/// still reference it is in flight.
pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    quarantine: Vec<usize>,
}

struct Slot<T> {
    value: Option<T>,
    generation: u64,
}

impl<T> Slab<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            quarantine: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> (usize, u64) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    value: None,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        debug_assert!(slot.value.is_none(), "inserting into an occupied slot");
        slot.value = Some(value);

        (index, slot.generation)
    }

    pub(crate) fn get_mut(&mut self, index: usize, generation: u64) -> Option<&mut T> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }

        slot.value.as_mut()
    }

    /// Removes the value at `index`, leaving the slot reserved until it is
    /// either `put_back` or `release`d.
    pub(crate) fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index)?.value.take()
    }

    pub(crate) fn take_checked(&mut self, index: usize, generation: u64) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }

        slot.value.take()
    }

    pub(crate) fn put_back(&mut self, index: usize, value: T) {
        let slot = &mut self.slots[index];
        debug_assert!(slot.value.is_none(), "putting back into an occupied slot");
        slot.value = Some(value);
    }

    /// Frees a reserved slot. The index stays quarantined until `reclaim`.
    pub(crate) fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert!(slot.value.is_none(), "releasing an occupied slot");
        slot.generation += 1;
        self.quarantine.push(index);
    }

    /// Returns quarantined indices to the free list.
    pub(crate) fn reclaim(&mut self) {
        self.free.append(&mut self.quarantine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_misses_recycled_slot() {
        let mut slab: Slab<&str> = Slab::with_capacity(4);

        let (index, generation) = slab.insert("first");
        assert!(slab.take(index).is_some());
        slab.release(index);
        slab.reclaim();

        let (index2, generation2) = slab.insert("second");
        assert_eq!(index, index2, "freed slot should be reused");
        assert_ne!(generation, generation2);
        assert!(slab.get_mut(index, generation).is_none());
        assert_eq!(slab.get_mut(index2, generation2), Some(&mut "second"));
    }

    #[test]
    fn quarantined_slot_is_not_reused_before_reclaim() {
        let mut slab: Slab<u32> = Slab::with_capacity(4);

        let (index, _) = slab.insert(1);
        slab.take(index);
        slab.release(index);

        let (index2, _) = slab.insert(2);
        assert_ne!(index, index2);

        slab.reclaim();
        let (index3, _) = slab.insert(3);
        assert_eq!(index, index3);
    }

    #[test]
    fn take_leaves_slot_reserved() {
        let mut slab: Slab<u32> = Slab::with_capacity(2);

        let (index, generation) = slab.insert(7);
        let value = slab.take_checked(index, generation).expect("value present");
        assert_eq!(value, 7);
        assert!(slab.take(index).is_none());

        slab.put_back(index, 8);
        assert_eq!(slab.get_mut(index, generation), Some(&mut 8));
    }
}
