//! DenseMap — Robin Hood open addressing with two-choice windowed probing.
//!
//! # Layout
//! ```text
//! dst: [size + 32] metadata bytes    (selector + in-window distance)
//! fp:  [size + 32] fingerprint bytes (low 8 bits of the key hash)
//! kv:  [size]      key/value pairs   (initialized exactly at occupied slots)
//! ```
//! The trailing 32 bytes of `dst`/`fp` mirror the first 32, so an unaligned
//! 32-byte load starting at any slot sees a correctly wrapped window. `kv`
//! has no mirror; slot indices wrap explicitly.
//!
//! Every key probes two fixed 32-slot windows: one at the reduced hash, one
//! at the reduced 32-bit rotation of the hash. Secondary placements carry
//! strictly greater metadata than any primary placement, so a single unsigned
//! byte comparison drives the Robin Hood discipline across both hash spaces.
//! That discipline is what lets the table fill to every last slot when
//! configured with a 100% fill threshold — at which point `get_index` is a
//! minimal perfect hash over the live keys.

use std::mem::MaybeUninit;

use crate::context::HashContext;
use crate::error::MapError;
use crate::iter::Iter;
use crate::meta::{self, WINDOW};
use crate::simd;

/// Smallest non-empty table: one full probe window.
const MIN_SIZE: usize = WINDOW;

/// Fill threshold used by the plain constructors, in percent.
pub const DEFAULT_GROW_AT_PERCENT: u8 = 80;

/// Expected metadata per window offset: `(sel | 0, sel | 1, ..., sel | 31)`.
const fn expect_vec(sel: u8) -> [u8; 32] {
    let mut e = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        e[i] = sel | i as u8;
        i += 1;
    }
    e
}

const EXPECT_PRIMARY: [u8; 32] = expect_vec(meta::SEL_PRIMARY);
const EXPECT_SECONDARY: [u8; 32] = expect_vec(meta::SEL_SECONDARY);

#[inline(always)]
fn expect_of(sel: u8) -> &'static [u8; 32] {
    if sel == meta::SEL_PRIMARY {
        &EXPECT_PRIMARY
    } else {
        &EXPECT_SECONDARY
    }
}

/// Among the displaceable lanes (`mask`), the one holding the lowest-ranked
/// occupant, earliest on ties. `mask` must be non-zero.
#[inline]
fn lowest_victim(w: &[u8; 32], mask: u32) -> (usize, u8) {
    let mut rest = mask;
    let mut vi = rest.trailing_zeros() as usize;
    let mut vm = w[vi];
    rest &= rest - 1;
    while rest != 0 {
        let i = rest.trailing_zeros() as usize;
        if w[i] < vm {
            vm = w[i];
            vi = i;
        }
        rest &= rest - 1;
    }
    (vi, vm)
}

fn alloc_bytes(n: usize) -> Result<Box<[u8]>, MapError> {
    let mut v: Vec<u8> = Vec::new();
    v.try_reserve_exact(n).map_err(|_| MapError::Alloc { bytes: n })?;
    v.resize(n, 0);
    Ok(v.into_boxed_slice())
}

fn alloc_pairs<K, V>(n: usize) -> Result<Box<[MaybeUninit<(K, V)>]>, MapError> {
    let mut v: Vec<MaybeUninit<(K, V)>> = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|_| MapError::Alloc { bytes: n.saturating_mul(std::mem::size_of::<(K, V)>()) })?;
    v.resize_with(n, MaybeUninit::uninit);
    Ok(v.into_boxed_slice())
}

#[inline]
fn threshold(size: usize, percent: u8) -> usize {
    std::cmp::max(1, ((size as u128 * percent as u128) / 100) as usize)
}

/// Outcome of one window attempt for a pending entry.
enum Attempt<K, V> {
    /// Entry placed, or an existing key's value overwritten.
    Done,
    /// The window offered neither an empty slot nor a displaceable victim.
    NoRoom(K, V),
    /// A displaced entry ran past the end of its own window and must restart
    /// placement from scratch.
    Evicted(K, V),
    /// Settle mode only: the chain landed on an unplaced slot and swapped its
    /// pair out as the next entry to settle.
    Reclaimed(K, V),
}

/// Bookkeeping flavor for placement.
///
/// `Fresh` placements consume empties and dead tombstones, updating `len`
/// and `tombstones`. `Settle` is the in-place rehash: counters stay put, and
/// a `0x80` byte marks a live pair awaiting placement rather than a dead
/// tombstone.
#[derive(Clone, Copy, PartialEq)]
enum PlaceMode {
    Fresh,
    Settle,
}

pub struct DenseMap<K, V, C = crate::context::SeaContext> {
    ctx: C,
    size: usize,
    len: usize,
    tombstones: usize,
    grow_at: usize,
    grow_at_percent: u8,
    dst: Box<[u8]>,
    fp: Box<[u8]>,
    /// Initialized exactly where `dst` says occupied — and, transiently
    /// during an in-place rehash, where `dst` carries the unplaced marker.
    kv: Box<[MaybeUninit<(K, V)>]>,
}

impl<K, V, C: HashContext<K>> DenseMap<K, V, C> {
    /// Empty map; the first insertion allocates.
    pub fn new(ctx: C) -> Self {
        Self::with_grow_at(ctx, DEFAULT_GROW_AT_PERCENT)
    }

    /// Empty map with a custom fill threshold in `[1, 100]`.
    pub fn with_grow_at(ctx: C, grow_at_percent: u8) -> Self {
        assert!(
            (1..=100).contains(&grow_at_percent),
            "grow_at_percent must be in 1..=100, got {grow_at_percent}"
        );
        Self {
            ctx,
            size: 0,
            len: 0,
            tombstones: 0,
            grow_at: 0,
            grow_at_percent,
            dst: Box::default(),
            fp: Box::default(),
            kv: Box::default(),
        }
    }

    /// Pre-sized map with `n` slots (at least one window). Allocates
    /// immediately.
    pub fn with_capacity(ctx: C, n: usize) -> Result<Self, MapError> {
        Self::with_capacity_grow_at(ctx, n, DEFAULT_GROW_AT_PERCENT)
    }

    pub fn with_capacity_grow_at(ctx: C, n: usize, grow_at_percent: u8) -> Result<Self, MapError> {
        let mut map = Self::with_grow_at(ctx, grow_at_percent);
        map.grow_to(n.max(MIN_SIZE))?;
        Ok(map)
    }

    /// Map sized to hold `expected` entries without growing, honoring the
    /// fill threshold: `size = ceil(expected * 100 / grow_at_percent)`.
    pub fn for_len(ctx: C, expected: usize) -> Result<Self, MapError> {
        Self::for_len_grow_at(ctx, expected, DEFAULT_GROW_AT_PERCENT)
    }

    pub fn for_len_grow_at(ctx: C, expected: usize, grow_at_percent: u8) -> Result<Self, MapError> {
        let scaled = expected
            .checked_mul(100)
            .ok_or(MapError::CapacityOverflow)?;
        let size = scaled.div_ceil(grow_at_percent as usize);
        Self::with_capacity_grow_at(ctx, size, grow_at_percent)
    }

    /// Live entry count.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot count. `get_index` values are in `[0, capacity())`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Current tombstone count. Reaching `capacity() / 4` triggers an
    /// in-place rehash on the next insertion that needs room.
    #[inline]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// O(1) lookup: at most two 32-slot window scans.
    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = self.get_index(key)?;
        Some(unsafe { &self.pair(slot).1 })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.get_index(key)?;
        Some(unsafe { &mut self.kv[slot].assume_init_mut().1 })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get_index(key).is_some()
    }

    /// Slot index of `key`, stable until the next rehash or growth. On a map
    /// filled to a 100% threshold this is a minimal perfect hash: the `len`
    /// live keys map onto distinct indices in `[0, len)`.
    pub fn get_index(&self, key: &K) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let h = self.ctx.hash(key);
        self.find(h, h as u8, key)
    }

    /// Insert or update. Reports allocation failure (map unchanged) or size
    /// overflow; an update never allocates.
    pub fn put(&mut self, key: K, value: V) -> Result<(), MapError> {
        if self.size == 0 {
            self.grow_to(MIN_SIZE)?;
        }
        let h = self.ctx.hash(&key);

        if self.len >= self.grow_at {
            // At the fill threshold only a genuinely new key forces growth;
            // an existing key in either window is updated in place.
            if let Some(slot) = self.find(h, h as u8, &key) {
                unsafe { self.kv[slot].assume_init_mut().1 = value };
                return Ok(());
            }
            self.grow_to(self.next_size()?)?;
            return self.place_retrying(key, value);
        }

        match self.place(h, key, value, true, PlaceMode::Fresh) {
            Ok(()) => Ok(()),
            Err((k, v)) => {
                // Neither window admitted placement; absence is confirmed,
                // so retries skip the equality scans.
                self.make_room()?;
                self.place_retrying(k, v)
            }
        }
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.get_index(key)?;
        let dw: [u8; 32] = self.dst[slot..slot + WINDOW].try_into().unwrap();
        let (_, v) = unsafe { self.take_pair(slot) };
        // If every neighbor was placed by the primary hash short of the
        // window edge, no probe routed past this slot can depend on it and
        // the slot may go straight back to empty. Otherwise a tombstone
        // keeps secondary-window probes alive.
        if simd::lt_mask(&dw, &[0x5F; 32]) == u32::MAX {
            self.set_meta(slot, meta::EMPTY);
        } else {
            self.set_meta(slot, meta::TOMBSTONE);
            self.tombstones += 1;
        }
        self.len -= 1;
        Some(v)
    }

    /// Rebuild every entry's placement in the existing arrays, clearing all
    /// tombstones. Runs implicitly when tombstones reach a quarter of the
    /// table; exposed for callers that want to schedule it themselves.
    pub fn rehash(&mut self) {
        if self.size > 0 {
            self.rehash_in_place();
        }
    }

    /// Drop all entries, keeping the allocation.
    pub fn clear(&mut self) {
        if std::mem::needs_drop::<(K, V)>() {
            for i in 0..self.size {
                if meta::is_occupied(self.dst[i]) {
                    unsafe { self.kv[i].assume_init_drop() };
                }
            }
        }
        self.dst.fill(meta::EMPTY);
        self.len = 0;
        self.tombstones = 0;
    }

    /// Iterate occupied slots in slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.dst, &self.kv, self.size, self.len)
    }

    // ── probing ──────────────────────────────────────────────────────────

    #[inline(always)]
    fn reduce(&self, h: u64) -> usize {
        // Multiplicative reduction onto [0, size): take the high half of the
        // 128-bit product instead of a modulo.
        ((h as u128 * self.size as u128) >> 64) as usize
    }

    #[inline(always)]
    fn base(&self, h: u64, sel: u8) -> usize {
        if sel == meta::SEL_PRIMARY {
            self.reduce(h)
        } else {
            self.reduce(h.rotate_left(32))
        }
    }

    #[inline(always)]
    fn wrap(&self, i: usize) -> usize {
        if i >= self.size {
            i - self.size
        } else {
            i
        }
    }

    #[inline]
    fn window(&self, base: usize) -> ([u8; 32], [u8; 32]) {
        let dw = self.dst[base..base + WINDOW].try_into().unwrap();
        let fw = self.fp[base..base + WINDOW].try_into().unwrap();
        (dw, fw)
    }

    /// Write a slot's metadata, keeping the mirror tail in sync.
    #[inline]
    fn set_meta(&mut self, slot: usize, m: u8) {
        self.dst[slot] = m;
        if slot < WINDOW {
            self.dst[self.size + slot] = m;
        }
    }

    /// Write a slot's metadata and fingerprint, keeping the mirror in sync.
    #[inline]
    fn stamp(&mut self, slot: usize, m: u8, f: u8) {
        self.dst[slot] = m;
        self.fp[slot] = f;
        if slot < WINDOW {
            self.dst[self.size + slot] = m;
            self.fp[self.size + slot] = f;
        }
    }

    fn refresh_mirror(&mut self) {
        let (head, tail) = self.dst.split_at_mut(self.size);
        tail.copy_from_slice(&head[..WINDOW]);
        let (head, tail) = self.fp.split_at_mut(self.size);
        tail.copy_from_slice(&head[..WINDOW]);
    }

    /// # Safety
    /// `slot` must be occupied (or carry the unplaced marker during rehash).
    #[inline]
    unsafe fn pair(&self, slot: usize) -> &(K, V) {
        self.kv[slot].assume_init_ref()
    }

    /// # Safety
    /// Same as [`pair`]; the slot's metadata must be overwritten before the
    /// pair is observed again.
    #[inline]
    unsafe fn take_pair(&mut self, slot: usize) -> (K, V) {
        self.kv[slot].assume_init_read()
    }

    /// Dual-window lookup with Robin Hood early exit.
    fn find(&self, h: u64, fpb: u8, key: &K) -> Option<usize> {
        for sel in [meta::SEL_PRIMARY, meta::SEL_SECONDARY] {
            let base = self.base(h, sel);
            let (dw, fw) = self.window(base);
            let expect = expect_of(sel);

            let mut m = simd::eq_mask(&dw, expect) & simd::eq_splat_mask(&fw, fpb);
            while m != 0 {
                let i = m.trailing_zeros() as usize;
                let slot = self.wrap(base + i);
                let k = unsafe { &self.pair(slot).0 };
                if self.ctx.eq(k, key) {
                    return Some(slot);
                }
                m &= m - 1;
            }
            // A slot outranking the key's would-be placement proves the key
            // cannot live at or past it under this hash.
            if simd::lt_mask(&dw, expect) != 0 {
                return None;
            }
        }
        None
    }

    // ── placement ────────────────────────────────────────────────────────

    /// Drive a pending entry to rest, following displaced entries through
    /// their own windows. `Err` returns an entry (not necessarily the one
    /// passed in) for which neither window admitted placement.
    fn place(
        &mut self,
        mut h: u64,
        mut key: K,
        mut value: V,
        check_eq: bool,
        mode: PlaceMode,
    ) -> Result<(), (K, V)> {
        let mut fpb = h as u8;
        let mut sel = meta::SEL_PRIMARY;
        let mut check = check_eq;
        loop {
            match self.window_attempt(h, fpb, sel, key, value, check, mode) {
                Attempt::Done => return Ok(()),
                Attempt::NoRoom(k, v) => {
                    if sel == meta::SEL_SECONDARY {
                        return Err((k, v));
                    }
                    key = k;
                    value = v;
                    sel = meta::SEL_SECONDARY;
                }
                // A displaced or reclaimed pair is a new pending entry; it
                // restarts from its own primary window, and only falls to its
                // secondary one if that window offers no lesser slot. Known
                // distinct from every other live key, so no equality scans.
                Attempt::Evicted(k, v) | Attempt::Reclaimed(k, v) => {
                    key = k;
                    value = v;
                    h = self.ctx.hash(&key);
                    fpb = h as u8;
                    sel = meta::SEL_PRIMARY;
                    check = false;
                }
            }
        }
    }

    /// One window of the placement procedure: match scan, first-empty
    /// placement, then Robin Hood displacement from the lowest-ranked slot.
    fn window_attempt(
        &mut self,
        h: u64,
        fpb: u8,
        sel: u8,
        key: K,
        value: V,
        check_eq: bool,
        mode: PlaceMode,
    ) -> Attempt<K, V> {
        let base = self.base(h, sel);
        let (dw, fw) = self.window(base);
        let expect = expect_of(sel);

        if check_eq {
            let mut m = simd::eq_mask(&dw, expect) & simd::eq_splat_mask(&fw, fpb);
            while m != 0 {
                let i = m.trailing_zeros() as usize;
                let slot = self.wrap(base + i);
                let found = {
                    let k = unsafe { &self.pair(slot).0 };
                    self.ctx.eq(k, &key)
                };
                if found {
                    unsafe { self.kv[slot].assume_init_mut().1 = value };
                    return Attempt::Done;
                }
                m &= m - 1;
            }
        }

        // First empty wins: position-agnostic placement keeps lookups honest
        // (they match on metadata + fingerprint, not order) and avoids most
        // eviction cascades at moderate loads.
        let em = simd::eq_splat_mask(&dw, meta::EMPTY);
        if em != 0 {
            let i = em.trailing_zeros() as usize;
            let slot = self.wrap(base + i);
            self.stamp(slot, meta::pack(sel, i as u8), fpb);
            self.kv[slot].write((key, value));
            if mode == PlaceMode::Fresh {
                self.len += 1;
            }
            return Attempt::Done;
        }

        // Robin Hood: only slots ranked below the metadata we would carry at
        // their offset may be displaced. No such slot means this window is
        // exhausted — the same condition that lets lookups exit early, so a
        // key settled past this point stays reachable. While rehashing,
        // unplaced pairs are displacement targets on either pass.
        let mut lt = simd::lt_mask(&dw, expect);
        if mode == PlaceMode::Settle {
            lt |= simd::eq_splat_mask(&dw, meta::TOMBSTONE);
        }
        if lt == 0 {
            return Attempt::NoRoom(key, value);
        }
        let (vi, vm) = lowest_victim(&dw, lt);
        let slot = self.wrap(base + vi);
        if vm == meta::TOMBSTONE {
            // A dead tombstone is displaceable on the secondary pass only;
            // an unplaced rehash pair on either.
            return self.land_on_marker(slot, meta::pack(sel, vi as u8), fpb, key, value, mode);
        }

        // Swap in, then push the displaced entry outward through its own
        // window. Inclusive `<=` on the handoff shifts older entries toward
        // higher distances.
        let cfp = self.fp[slot];
        let (ck, cv) = unsafe { self.take_pair(slot) };
        self.stamp(slot, meta::pack(sel, vi as u8), fpb);
        self.kv[slot].write((key, value));
        self.chain(slot, ck, cv, cfp, meta::sel(vm), meta::dist(vm) as usize, mode)
    }

    /// Continue an eviction chain from `slot`, carrying a displaced entry.
    fn chain(
        &mut self,
        mut slot: usize,
        mut ck: K,
        mut cv: V,
        mut cfp: u8,
        mut csel: u8,
        mut cd: usize,
        mode: PlaceMode,
    ) -> Attempt<K, V> {
        loop {
            cd += 1;
            if cd >= WINDOW {
                return Attempt::Evicted(ck, cv);
            }
            slot = self.wrap(slot + 1);
            let m = self.dst[slot];
            let cm = meta::pack(csel, cd as u8);
            let unplaced = mode == PlaceMode::Settle && m == meta::TOMBSTONE;
            if m > cm && !unplaced {
                continue;
            }
            if m == meta::EMPTY {
                self.stamp(slot, cm, cfp);
                self.kv[slot].write((ck, cv));
                if mode == PlaceMode::Fresh {
                    self.len += 1;
                }
                return Attempt::Done;
            }
            if m == meta::TOMBSTONE {
                return self.land_on_marker(slot, cm, cfp, ck, cv, mode);
            }
            let nfp = self.fp[slot];
            let (nk, nv) = unsafe { self.take_pair(slot) };
            self.stamp(slot, cm, cfp);
            self.kv[slot].write((ck, cv));
            ck = nk;
            cv = nv;
            cfp = nfp;
            csel = meta::sel(m);
            cd = meta::dist(m) as usize;
        }
    }

    /// Land an entry on a `0x80` slot: a dead tombstone when placing fresh,
    /// a live unplaced pair to swap out during an in-place rehash.
    fn land_on_marker(
        &mut self,
        slot: usize,
        m: u8,
        fpb: u8,
        key: K,
        value: V,
        mode: PlaceMode,
    ) -> Attempt<K, V> {
        match mode {
            PlaceMode::Fresh => {
                self.stamp(slot, m, fpb);
                self.kv[slot].write((key, value));
                self.tombstones -= 1;
                self.len += 1;
                Attempt::Done
            }
            PlaceMode::Settle => {
                let old = unsafe { self.take_pair(slot) };
                self.stamp(slot, m, fpb);
                self.kv[slot].write((key, value));
                Attempt::Reclaimed(old.0, old.1)
            }
        }
    }

    /// Placement retry loop for a key already confirmed absent.
    fn place_retrying(&mut self, mut key: K, mut value: V) -> Result<(), MapError> {
        loop {
            let h = self.ctx.hash(&key);
            match self.place(h, key, value, false, PlaceMode::Fresh) {
                Ok(()) => return Ok(()),
                Err((k, v)) => {
                    self.make_room()?;
                    key = k;
                    value = v;
                }
            }
        }
    }

    /// Make room after both windows refused a placement: reclaim tombstones
    /// in place when a quarter of the table is dead, grow otherwise.
    fn make_room(&mut self) -> Result<(), MapError> {
        if self.tombstones >= self.size / 4 {
            self.rehash_in_place();
            Ok(())
        } else {
            self.grow_to(self.next_size()?)
        }
    }

    fn next_size(&self) -> Result<usize, MapError> {
        if self.size == 0 {
            Ok(MIN_SIZE)
        } else {
            self.size.checked_mul(2).ok_or(MapError::CapacityOverflow)
        }
    }

    // ── rehash & growth ──────────────────────────────────────────────────

    /// Reclaim tombstones without reallocating: flip tombstones to empty,
    /// flag every occupied slot as unplaced, then settle each flagged pair
    /// with the regular dual-window procedure, swapping through other
    /// unplaced pairs as they are hit.
    fn rehash_in_place(&mut self) {
        for i in 0..self.size {
            let m = self.dst[i];
            self.dst[i] = if meta::is_occupied(m) {
                meta::TOMBSTONE
            } else {
                meta::EMPTY
            };
        }
        self.refresh_mirror();
        self.tombstones = 0;

        let mut base = 0;
        while base < self.size {
            let live = simd::low_bits(self.size - base);
            loop {
                let (dw, _) = self.window(base);
                let m = simd::eq_splat_mask(&dw, meta::TOMBSTONE) & live;
                if m == 0 {
                    break;
                }
                let slot = base + m.trailing_zeros() as usize;
                let (k, v) = unsafe { self.take_pair(slot) };
                self.set_meta(slot, meta::EMPTY);
                let h = self.ctx.hash(&k);
                if self.place(h, k, v, false, PlaceMode::Settle).is_err() {
                    unreachable!("entry displaced out of both windows below full load");
                }
            }
            base += WINDOW;
        }
    }

    /// Reallocate at `new_size` slots and reinsert every entry. The map is
    /// untouched if any allocation fails.
    fn grow_to(&mut self, new_size: usize) -> Result<(), MapError> {
        debug_assert!(new_size >= MIN_SIZE && new_size >= self.size);
        let bytes = new_size
            .checked_add(WINDOW)
            .ok_or(MapError::CapacityOverflow)?;
        let dst = alloc_bytes(bytes)?;
        let fp = alloc_bytes(bytes)?;
        let kv = alloc_pairs::<K, V>(new_size)?;

        let old_size = self.size;
        let old_len = self.len;
        let old_dst = std::mem::replace(&mut self.dst, dst);
        let _old_fp = std::mem::replace(&mut self.fp, fp);
        let mut old_kv = std::mem::replace(&mut self.kv, kv);
        self.size = new_size;
        self.grow_at = threshold(new_size, self.grow_at_percent);
        self.len = 0;
        self.tombstones = 0;

        for i in 0..old_size {
            if meta::is_occupied(old_dst[i]) {
                let (k, v) = unsafe { old_kv[i].assume_init_read() };
                let h = self.ctx.hash(&k);
                if self.place(h, k, v, false, PlaceMode::Fresh).is_err() {
                    unreachable!("entry displaced out of both windows below full load");
                }
            }
        }
        debug_assert_eq!(self.len, old_len);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut occupied = 0;
        let mut tombs = 0;
        for i in 0..self.size {
            let m = self.dst[i];
            match m {
                meta::EMPTY => {}
                meta::TOMBSTONE => tombs += 1,
                _ => {
                    assert!(meta::is_occupied(m), "slot {i}: bad metadata {m:#04x}");
                    occupied += 1;
                    let (k, _) = unsafe { self.pair(i) };
                    let h = self.ctx.hash(k);
                    let base = self.base(h, meta::sel(m));
                    assert_eq!(
                        self.wrap(base + meta::dist(m) as usize),
                        i,
                        "slot {i}: metadata {m:#04x} disagrees with the key's base"
                    );
                    assert_eq!(self.fp[i], h as u8, "slot {i}: stale fingerprint");
                }
            }
        }
        assert_eq!(occupied, self.len);
        assert_eq!(tombs, self.tombstones);
        if self.size > 0 {
            assert_eq!(&self.dst[self.size..], &self.dst[..WINDOW], "metadata mirror out of sync");
            assert_eq!(&self.fp[self.size..], &self.fp[..WINDOW], "fingerprint mirror out of sync");
        }
    }
}

impl<K, V, C> Drop for DenseMap<K, V, C> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<(K, V)>() {
            for i in 0..self.size {
                if meta::is_occupied(self.dst[i]) {
                    unsafe { self.kv[i].assume_init_drop() };
                }
            }
        }
    }
}

impl<K: Clone, V: Clone, C: Clone + HashContext<K>> Clone for DenseMap<K, V, C> {
    fn clone(&self) -> Self {
        let mut out = Self {
            ctx: self.ctx.clone(),
            size: self.size,
            len: 0,
            tombstones: 0,
            grow_at: self.grow_at,
            grow_at_percent: self.grow_at_percent,
            dst: vec![0u8; self.dst.len()].into_boxed_slice(),
            fp: self.fp.to_vec().into_boxed_slice(),
            kv: {
                let mut v = Vec::with_capacity(self.size);
                v.resize_with(self.size, MaybeUninit::uninit);
                v.into_boxed_slice()
            },
        };
        // Tombstones carry probe-routing information and must survive the
        // copy. Occupied metadata is published per slot only after the pair
        // clone lands, so a panicking clone never leaves a slot claiming an
        // uninitialized pair.
        for i in 0..self.size {
            let m = self.dst[i];
            if m == meta::TOMBSTONE {
                out.dst[i] = m;
            } else if meta::is_occupied(m) {
                let pair = unsafe { self.pair(i) };
                out.kv[i].write(pair.clone());
                out.dst[i] = m;
            }
        }
        if self.size > 0 {
            out.refresh_mirror();
        }
        out.len = self.len;
        out.tombstones = self.tombstones;
        out
    }
}

impl<'a, K, V, C: HashContext<K>> IntoIterator for &'a DenseMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SeaContext;

    fn map100(n: usize) -> DenseMap<u64, u64> {
        DenseMap::with_capacity_grow_at(SeaContext, n, 100).unwrap()
    }

    #[test]
    fn test_basic_insert_get() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        m.put(42, 7).unwrap();
        m.put(100, 99).unwrap();

        assert_eq!(m.get(&42), Some(&7));
        assert_eq!(m.get(&100), Some(&99));
        assert_eq!(m.get(&999), None);
        assert!(m.contains_key(&42));
        assert!(!m.contains_key(&999));
        assert_eq!(m.len(), 2);
        m.assert_invariants();
    }

    #[test]
    fn test_update() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        m.put(1, 10).unwrap();
        m.put(1, 20).unwrap();
        assert_eq!(m.get(&1), Some(&20));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        m.put(1, 10).unwrap();
        m.put(2, 20).unwrap();
        assert_eq!(m.remove(&1), Some(10));

        assert_eq!(m.get(&1), None);
        assert_eq!(m.get(&2), Some(&20));
        assert_eq!(m.len(), 1);
        assert_eq!(m.remove(&1), None);
        m.assert_invariants();
    }

    #[test]
    fn test_reinsert_after_remove() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        m.put(1, 10).unwrap();
        m.remove(&1);
        m.put(1, 30).unwrap();

        assert_eq!(m.get(&1), Some(&30));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_get_mut_writes_through() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        m.put(7, 1).unwrap();
        *m.get_mut(&7).unwrap() += 41;
        assert_eq!(m.get(&7), Some(&42));
        assert_eq!(m.get_mut(&8), None);
    }

    #[test]
    fn test_growth_from_empty() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        for i in 0..1000 {
            m.put(i, i * 3).unwrap();
        }
        assert_eq!(m.len(), 1000);
        for i in 0..1000 {
            assert_eq!(m.get(&i), Some(&(i * 3)), "missing key {i}");
        }
        m.assert_invariants();
    }

    #[test]
    fn test_fill_to_every_slot() {
        let n = 200;
        let mut m = map100(n);
        for i in 0..n as u64 {
            m.put(i, i).unwrap();
        }
        assert_eq!(m.len(), n);
        assert_eq!(m.capacity(), n, "a full-threshold map must not grow while filling");
        for i in 0..n as u64 {
            assert_eq!(m.get(&i), Some(&i));
        }
        m.assert_invariants();
    }

    #[test]
    fn test_perfect_index_at_full_load() {
        let n = 500;
        let mut m = map100(n);
        for i in 0..n as u64 {
            m.put(i, i).unwrap();
        }
        let mut seen = vec![false; n];
        for i in 0..n as u64 {
            let idx = m.get_index(&i).unwrap();
            assert!(!seen[idx], "index {idx} assigned twice");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_threshold_80_grows_before_overfilling() {
        let mut m: DenseMap<u64, u64> =
            DenseMap::with_capacity_grow_at(SeaContext, 100, 80).unwrap();
        for i in 0..90 {
            m.put(i, i).unwrap();
        }
        assert_eq!(m.len(), 90);
        assert!(m.capacity() > 100, "80% threshold should have doubled by 90 entries");
        for i in 0..90 {
            assert_eq!(m.get(&i), Some(&i));
        }
        m.assert_invariants();
    }

    #[test]
    fn test_tombstone_rehash_reclaims_space() {
        let n = 256;
        let mut m = map100(n);
        for i in 0..n as u64 {
            m.put(i, i).unwrap();
        }
        // Heavy churn over a fixed key set must be absorbed by in-place
        // rehashes; a single doubling is the most growth allowed.
        for round in 0..50u64 {
            for k in (0..n as u64).step_by(7) {
                assert!(m.remove(&k).is_some());
                m.put(k, round).unwrap();
            }
        }
        assert_eq!(m.len(), n);
        assert!(m.capacity() <= 2 * n, "churn grew the table to {}", m.capacity());
        for k in (0..n as u64).step_by(7) {
            assert_eq!(m.get(&k), Some(&49));
        }
        m.assert_invariants();
    }

    #[test]
    fn test_explicit_rehash_clears_tombstones() {
        let mut m = map100(128);
        for i in 0..128u64 {
            m.put(i, i).unwrap();
        }
        for i in 0..64u64 {
            m.remove(&i);
        }
        m.rehash();
        assert_eq!(m.tombstones(), 0);
        for i in 64..128u64 {
            assert_eq!(m.get(&i), Some(&i), "key {i} lost across rehash");
        }
        m.assert_invariants();
    }

    #[test]
    fn test_for_len_never_grows() {
        for percent in [80u8, 99, 100] {
            let mut m: DenseMap<u64, u64> =
                DenseMap::for_len_grow_at(SeaContext, 500, percent).unwrap();
            let cap = m.capacity();
            for i in 0..500 {
                m.put(i, i).unwrap();
            }
            assert_eq!(m.capacity(), cap, "for_len({percent}%) map grew");
            m.assert_invariants();
        }
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut m = map100(100);
        for i in 0..100u64 {
            m.put(i, i).unwrap();
        }
        m.clear();
        assert_eq!(m.len(), 0);
        assert_eq!(m.capacity(), 100);
        assert_eq!(m.get(&5), None);
        for i in 0..100u64 {
            m.put(i, i + 1).unwrap();
        }
        assert_eq!(m.get(&5), Some(&6));
        m.assert_invariants();
    }

    #[test]
    fn test_clone_is_independent_and_equal() {
        let mut m = map100(100);
        for i in 0..100u64 {
            m.put(i, i).unwrap();
        }
        for i in 0..30u64 {
            m.remove(&i);
        }
        let c = m.clone();
        assert_eq!(c.len(), m.len());
        assert_eq!(c.tombstones(), m.tombstones());
        for i in 30..100u64 {
            assert_eq!(c.get(&i), Some(&i));
        }
        for i in 0..30u64 {
            assert_eq!(c.get(&i), None);
        }
        c.assert_invariants();

        m.put(1000, 1).unwrap();
        assert_eq!(c.get(&1000), None);
    }

    #[test]
    fn test_clone_with_owned_values() {
        let mut m: DenseMap<String, String, crate::context::BytesContext> =
            DenseMap::new(crate::context::BytesContext);
        m.put("jakarta".to_string(), "capital".to_string()).unwrap();
        m.put("bandung".to_string(), "mountains".to_string()).unwrap();
        let c = m.clone();
        assert_eq!(c.get(&"jakarta".to_string()).map(String::as_str), Some("capital"));
        drop(m);
        assert_eq!(c.get(&"bandung".to_string()).map(String::as_str), Some("mountains"));
    }

    #[test]
    #[should_panic(expected = "grow_at_percent")]
    fn test_zero_threshold_asserts() {
        let _: DenseMap<u64, u64> = DenseMap::with_grow_at(SeaContext, 0);
    }

    #[test]
    fn test_overflowing_for_len_reports() {
        let r: Result<DenseMap<u64, u64>, _> = DenseMap::for_len(SeaContext, usize::MAX / 2);
        assert_eq!(r.err(), Some(MapError::CapacityOverflow));
    }

    #[test]
    fn test_empty_map_queries() {
        let mut m: DenseMap<u64, u64> = DenseMap::new(SeaContext);
        assert_eq!(m.get(&1), None);
        assert_eq!(m.get_index(&1), None);
        assert_eq!(m.remove(&1), None);
        assert!(m.is_empty());
        assert_eq!(m.capacity(), 0);
    }
}
