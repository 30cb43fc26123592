//! Fragment cache.
//!
//! Raw blocks and verified fragments live in generational arenas and are
//! addressed by typed handles. A removed entry bumps its slot's generation,
//! so a handle kept past eviction resolves to `None` instead of aliasing a
//! newer entry. Each arena is paired with a handle list sorted by `begin`
//! for offset-order iteration.

use std::{fmt, hash, marker::PhantomData};

use tracing::{debug, trace};

use crate::{
    block::{CBlock, RootBlock, VFragment},
    constants::{CD_FRAMEWORDS, MAX_SECTOR_OVERLAP, MIN_WORDS_OVERLAP},
    types::{ParanoiaCallback, Progress},
};

/// Typed index into an [`Arena`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> hash::Hash for Handle<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

pub type BlockHandle = Handle<CBlock>;
pub type FragmentHandle = Handle<VFragment>;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with free-list reuse.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
                _marker: PhantomData,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove everything, invalidating all outstanding handles.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }
}

/// Raw blocks, verified fragments and the root of one session.
#[derive(Debug, Default)]
pub struct FragmentCache {
    blocks: Arena<CBlock>,
    block_order: Vec<BlockHandle>,
    fragments: Arena<VFragment>,
    fragment_order: Vec<FragmentHandle>,
    root: RootBlock,
}

impl FragmentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw block, keeping offset order. Equal begins keep insertion order.
    pub fn insert_block(&mut self, block: CBlock) -> BlockHandle {
        let begin = block.begin;
        let handle = self.blocks.insert(block);
        let blocks = &self.blocks;
        let at = self
            .block_order
            .partition_point(|&h| blocks.get(h).is_some_and(|b| b.begin <= begin));
        self.block_order.insert(at, handle);
        handle
    }

    /// Add a verified fragment, keeping offset order.
    pub fn insert_fragment(&mut self, fragment: VFragment) -> FragmentHandle {
        let begin = fragment.begin;
        let handle = self.fragments.insert(fragment);
        let fragments = &self.fragments;
        let at = self
            .fragment_order
            .partition_point(|&h| fragments.get(h).is_some_and(|v| v.begin <= begin));
        self.fragment_order.insert(at, handle);
        handle
    }

    #[must_use]
    pub fn block(&self, handle: BlockHandle) -> Option<&CBlock> {
        self.blocks.get(handle)
    }

    #[must_use]
    pub fn fragment(&self, handle: FragmentHandle) -> Option<&VFragment> {
        self.fragments.get(handle)
    }

    /// Raw blocks in offset order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockHandle, &CBlock)> + '_ {
        self.block_order
            .iter()
            .filter_map(|&h| self.blocks.get(h).map(|b| (h, b)))
    }

    /// Verified fragments in offset order.
    pub fn fragments(&self) -> impl Iterator<Item = (FragmentHandle, &VFragment)> + '_ {
        self.fragment_order
            .iter()
            .filter_map(|&h| self.fragments.get(h).map(|v| (h, v)))
    }

    /// Snapshot of fragment handles in offset order, for loops that mutate.
    #[must_use]
    pub fn fragment_handles(&self) -> Vec<FragmentHandle> {
        self.fragment_order.clone()
    }

    pub fn remove_block(&mut self, handle: BlockHandle) -> Option<CBlock> {
        let block = self.blocks.remove(handle)?;
        self.block_order.retain(|&h| h != handle);
        Some(block)
    }

    pub fn remove_fragment(&mut self, handle: FragmentHandle) -> Option<VFragment> {
        let fragment = self.fragments.remove(handle)?;
        self.fragment_order.retain(|&h| h != handle);
        Some(fragment)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn root(&self) -> &RootBlock {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut RootBlock {
        &mut self.root
    }

    /// Evict everything that can no longer contribute to output at
    /// `begin_word` and beyond.
    pub fn trim(&mut self, begin_word: i64, end_word: i64) {
        let target = begin_word - MAX_SECTOR_OVERLAP * CD_FRAMEWORDS as i64;

        if !self.root.is_empty() && self.root.begin < begin_word && self.root.begin < target {
            if target + MIN_WORDS_OVERLAP > self.root.end() {
                debug!(begin_word, root_end = self.root.end(), "discarding stale root");
                self.root.clear();
            } else {
                self.root.remove_prefix(target);
            }
        }

        let stale_blocks: Vec<BlockHandle> = self
            .blocks()
            .filter(|(_, b)| b.end() < target)
            .map(|(h, _)| h)
            .collect();
        let stale_fragments: Vec<FragmentHandle> = self
            .fragments()
            .filter(|(_, v)| v.end() < target)
            .map(|(h, _)| h)
            .collect();
        if !stale_blocks.is_empty() || !stale_fragments.is_empty() {
            trace!(
                begin_word,
                end_word,
                blocks = stale_blocks.len(),
                fragments = stale_fragments.len(),
                "trimming cache"
            );
        }
        for h in stale_blocks {
            self.remove_block(h);
        }
        for h in stale_fragments {
            self.remove_fragment(h);
        }
    }

    /// Drop every raw block and verified fragment.
    pub fn reset_cache(&mut self) {
        self.blocks.clear();
        self.block_order.clear();
        self.fragments.clear();
        self.fragment_order.clear();
    }

    /// Drop all fragments and the root.
    pub fn reset_all(&mut self) {
        self.reset_cache();
        self.root.clear();
    }

    /// Shift every live fragment by `-av` after a drift correction.
    ///
    /// Fragments that would be pushed before the start of the disc are
    /// released (reported as `CacheError`) so the region gets read again.
    /// Returns the number of entries released.
    pub fn rebase(&mut self, av: i64, progress: &mut Progress<'_>) -> usize {
        let mut released = 0;

        for h in self.fragment_handles() {
            let Some(v) = self.fragments.get(h) else { continue };
            let linked_begin = v.one.and_then(|one| self.blocks.get(one)).map(|b| b.begin);
            if v.begin < av || linked_begin.is_some_and(|b| b < av) {
                let begin = v.begin;
                self.remove_fragment(h);
                progress.report(begin, ParanoiaCallback::CacheError);
                released += 1;
            } else if let Some(v) = self.fragments.get_mut(h) {
                v.begin -= av;
            }
        }

        for h in self.block_order.clone() {
            let Some(b) = self.blocks.get_mut(h) else { continue };
            if b.begin < av {
                let begin = b.begin;
                self.remove_block(h);
                progress.report(begin, ParanoiaCallback::CacheError);
                released += 1;
            } else {
                b.begin -= av;
            }
        }

        if released > 0 {
            debug!(av, released, "released fragments during drift correction");
        }
        released
    }
}
