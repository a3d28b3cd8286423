//! The run-detecting, galloping merge sort engine behind the crate's entry
//! points.
//!
//! All functions here take an `is_less` predicate instead of a three-way
//! comparator. Every ordering decision the algorithm makes is a strict
//! less-than test, and keeping ties on the "not less" side of each test is
//! what makes the whole sort stable.

use std::cmp;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;
use std::slice;

use crate::SortError;

/// Inputs shorter than this are handled by a single binary insertion sort,
/// with no run stack and no merge buffer.
const MIN_MERGE: usize = 32;

/// Initial number of consecutive wins one run needs before a merge switches
/// into galloping mode. Adjusted per merge, see `merge_lo`/`merge_hi`.
const MIN_GALLOP: usize = 7;

/// Merge buffer slots allocated up front for large inputs. Smaller inputs
/// get `len / 2` slots, which can never be outgrown.
const INITIAL_SCRATCH_LEN: usize = 256;

/// A pending run: `len` ascending elements starting at `start`.
///
/// Adjacent stack entries are contiguous, `start + len` of one entry is the
/// `start` of the next.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    len: usize,
}

////////////////////////////////////////////////////////////////////////////////
// Driver
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn merge_sort<T, F>(
    v: &mut [T],
    is_less: &mut F,
    external: &mut [MaybeUninit<T>],
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    // Sorting has no meaningful behavior on zero-sized types.
    if mem::size_of::<T>() == 0 {
        return Ok(());
    }

    let len = v.len();
    if len < 2 {
        return Ok(());
    }

    if len < MIN_MERGE {
        let run_len = find_ascending_run(v, is_less);
        binary_insertion_sort(v, run_len, is_less);
        return Ok(());
    }

    let mut scratch = ScratchBuf::new(external, len);
    let mut runs: Vec<Run> = Vec::with_capacity(max_run_stack_len(len));
    let mut min_gallop = MIN_GALLOP;
    let min_run = min_run_length(len);

    let mut start = 0;
    while start < len {
        let mut run_len = find_ascending_run(&mut v[start..], is_less);

        // Natural run too short, extend it to min(min_run, what is left).
        if run_len < min_run {
            let force = cmp::min(len - start, min_run);
            binary_insertion_sort(&mut v[start..start + force], run_len, is_less);
            run_len = force;
        }

        runs.push(Run { start, len: run_len });
        merge_collapse(v, &mut runs, &mut scratch, &mut min_gallop, is_less)?;

        start += run_len;
    }

    merge_force_collapse(v, &mut runs, &mut scratch, &mut min_gallop, is_less)?;

    debug_assert!(runs.len() == 1 && runs[0].start == 0 && runs[0].len == len);
    Ok(())
}

/// Upper estimate for how many runs can be pending at once given the stack
/// invariant, which makes run lengths grow at least like Fibonacci numbers.
/// Only an allocation hint, the stack itself can grow.
fn max_run_stack_len(len: usize) -> usize {
    if len < 120 {
        5
    } else if len < 1542 {
        10
    } else if len < 119_151 {
        24
    } else {
        49
    }
}

/// Returns the minimum run length for an input of length `n`.
///
/// Keeps shifting `n` right until it fits below `MIN_MERGE`, remembering in
/// the low bit whether any shifted-out bit was set. The result is in
/// `[MIN_MERGE / 2, MIN_MERGE]` for `n >= MIN_MERGE` and chosen so that
/// `n / result` is a power of two or slightly below one, which balances the
/// final merge tree.
fn min_run_length(mut n: usize) -> usize {
    let mut r = 0;
    while n >= MIN_MERGE {
        r |= n & 1;
        n >>= 1;
    }
    n + r
}

////////////////////////////////////////////////////////////////////////////////
// Run detection and binary insertion sort
////////////////////////////////////////////////////////////////////////////////

/// Returns the length of the maximal run starting at `v[0]`, reversing it in
/// place first if it is strictly descending.
///
/// Only strictly descending stretches take the reversal path. Equal
/// neighbors always extend the ascending branch, so reversing never swaps
/// elements that compare equal.
fn find_ascending_run<T, F>(v: &mut [T], is_less: &mut F) -> usize
where
    F: FnMut(&T, &T) -> bool,
{
    let len = v.len();
    if len < 2 {
        return len;
    }

    let mut end = 2;
    if is_less(&v[1], &v[0]) {
        while end < len && is_less(&v[end], &v[end - 1]) {
            end += 1;
        }
        v[..end].reverse();
    } else {
        while end < len && !is_less(&v[end], &v[end - 1]) {
            end += 1;
        }
    }

    end
}

/// Sorts `v` given that `v[..sorted]` is already sorted.
///
/// Binary search keeps advancing past elements equal to the pivot, so an
/// element is always inserted after its equals and stability is preserved.
/// O(n log n) comparisons but O(n^2) moves, only used below `MIN_MERGE`.
fn binary_insertion_sort<T, F>(v: &mut [T], sorted: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let len = v.len();
    debug_assert!(sorted > 0 && sorted <= len);

    for i in cmp::max(sorted, 1)..len {
        // SAFETY: `i` is in bounds and the hole guard below keeps every
        // element present exactly once even if `is_less` panics. The pivot
        // is read out once, its old slot is overwritten by the shift, and
        // the guard writes the pivot back into the slot left open at `lo`.
        unsafe {
            let v_ptr = v.as_mut_ptr();
            let pivot = ManuallyDrop::new(ptr::read(v_ptr.add(i)));
            let mut hole = InsertionHole {
                src: &*pivot,
                dest: v_ptr.add(i),
            };

            let mut lo = 0;
            let mut hi = i;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if is_less(&*pivot, &*v_ptr.add(mid)) {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }

            ptr::copy(v_ptr.add(lo), v_ptr.add(lo + 1), i - lo);
            hole.dest = v_ptr.add(lo);
            // `hole` drops here and fills the open slot with the pivot.
        }
    }

    // When dropped, copies from `src` into `dest`.
    struct InsertionHole<T> {
        src: *const T,
        dest: *mut T,
    }

    impl<T> Drop for InsertionHole<T> {
        fn drop(&mut self) {
            unsafe {
                ptr::copy_nonoverlapping(self.src, self.dest, 1);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Run stack
////////////////////////////////////////////////////////////////////////////////

/// Re-establishes the stack invariant after a push:
///
/// - `runs[i].len > runs[i + 1].len + runs[i + 2].len`
/// - `runs[i].len > runs[i + 1].len`
///
/// While the top of the stack violates either rule, the offending adjacent
/// pair is merged. When both `runs[n - 1]` and `runs[n + 1]` are candidates
/// to absorb `runs[n]`, the smaller neighbor wins. That exact tie-break is
/// load-bearing for the O(n log n) bound and must not be "simplified".
fn merge_collapse<T, F>(
    v: &mut [T],
    runs: &mut Vec<Run>,
    scratch: &mut ScratchBuf<'_, T>,
    min_gallop: &mut usize,
    is_less: &mut F,
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    while runs.len() > 1 {
        let mut n = runs.len() - 2;
        if (n > 0 && runs[n - 1].len <= runs[n].len + runs[n + 1].len)
            || (n > 1 && runs[n - 2].len <= runs[n - 1].len + runs[n].len)
        {
            if runs[n - 1].len < runs[n + 1].len {
                n -= 1;
            }
        } else if runs[n].len > runs[n + 1].len {
            break;
        }

        merge_at(v, runs, n, scratch, min_gallop, is_less)?;
    }

    Ok(())
}

/// Merges everything down to a single run. Called once at the very end.
fn merge_force_collapse<T, F>(
    v: &mut [T],
    runs: &mut Vec<Run>,
    scratch: &mut ScratchBuf<'_, T>,
    min_gallop: &mut usize,
    is_less: &mut F,
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    while runs.len() > 1 {
        let mut n = runs.len() - 2;
        if n > 0 && runs[n - 1].len < runs[n + 1].len {
            n -= 1;
        }

        merge_at(v, runs, n, scratch, min_gallop, is_less)?;
    }

    Ok(())
}

/// Merges the adjacent runs `runs[i]` and `runs[i + 1]`.
fn merge_at<T, F>(
    v: &mut [T],
    runs: &mut Vec<Run>,
    i: usize,
    scratch: &mut ScratchBuf<'_, T>,
    min_gallop: &mut usize,
    is_less: &mut F,
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    let total_len = v.len();
    let run1 = runs[i];
    let run2 = runs[i + 1];
    debug_assert!(run1.len > 0 && run2.len > 0);
    debug_assert!(run1.start + run1.len == run2.start);
    debug_assert!(i + 2 == runs.len() || i + 3 == runs.len());

    // The surviving entry covers the combined span no matter how much of the
    // physical merge below gets trimmed away.
    runs[i].len = run1.len + run2.len;
    runs.remove(i + 1);

    let within = &mut v[run1.start..run2.start + run2.len];

    // The leading part of the left run that is already <= the first element
    // of the right run is in its final place. Likewise the trailing part of
    // the right run that is >= the last element of the left run.
    let (left, right) = within.split_at(run1.len);
    let lead = gallop_right(&right[0], left, 0, is_less);
    let len1 = run1.len - lead;
    if len1 == 0 {
        return Ok(());
    }

    let len2 = gallop_left(&left[run1.len - 1], right, run2.len - 1, is_less);
    if len2 == 0 {
        return Ok(());
    }

    let span = &mut within[lead..run1.len + len2];

    // Copy the smaller run and merge towards it. This caps scratch usage at
    // min(len1, len2) and with it at half the input.
    if len1 <= len2 {
        let buf = scratch.ensure(len1, total_len);
        // SAFETY: `ensure` returned space for at least `len1` elements.
        unsafe { merge_lo(span, len1, buf, min_gallop, is_less) }
    } else {
        let buf = scratch.ensure(len2, total_len);
        // SAFETY: `ensure` returned space for at least `len2` elements.
        unsafe { merge_hi(span, len1, buf, min_gallop, is_less) }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Galloping search
////////////////////////////////////////////////////////////////////////////////

/// Returns the number of elements of the sorted slice `a` that are strictly
/// less than `key`, equivalently the leftmost insertion point for `key`.
///
/// Starts probing at `hint` and grows the offset exponentially in the
/// promising direction, then binary-searches the bracketed window. Runtime
/// is O(log n) in the distance between `hint` and the result, which is what
/// makes galloping profitable for long one-sided stretches.
fn gallop_left<T, F>(key: &T, a: &[T], hint: usize, is_less: &mut F) -> usize
where
    F: FnMut(&T, &T) -> bool,
{
    debug_assert!(hint < a.len());
    let len = a.len();

    let (mut lo, mut hi) = if is_less(&a[hint], key) {
        // Gallop up until a[hint + last_ofs] < key <= a[hint + ofs].
        let max_ofs = len - hint;
        let mut last_ofs = 0;
        let mut ofs = 1;
        while ofs < max_ofs && is_less(&a[hint + ofs], key) {
            last_ofs = ofs;
            ofs = ofs * 2 + 1;
        }
        if ofs > max_ofs {
            ofs = max_ofs;
        }
        (hint + last_ofs + 1, hint + ofs)
    } else {
        // key <= a[hint]. Gallop down until a[hint - ofs] < key <= a[hint - last_ofs].
        let max_ofs = hint + 1;
        let mut last_ofs = 0;
        let mut ofs = 1;
        while ofs < max_ofs && !is_less(&a[hint - ofs], key) {
            last_ofs = ofs;
            ofs = ofs * 2 + 1;
        }
        if ofs > max_ofs {
            ofs = max_ofs;
        }
        (hint + 1 - ofs, hint - last_ofs)
    };

    // a[lo - 1] < key <= a[hi] holds with virtual out-of-range endpoints.
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if is_less(&a[mid], key) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    lo
}

/// Returns the number of elements of the sorted slice `a` that are less than
/// or equal to `key`, equivalently the rightmost insertion point for `key`.
///
/// The mirror image of [`gallop_left`]. Which variant a merge uses for which
/// run decides where equal elements split, so the two are not interchangeable
/// without breaking stability.
fn gallop_right<T, F>(key: &T, a: &[T], hint: usize, is_less: &mut F) -> usize
where
    F: FnMut(&T, &T) -> bool,
{
    debug_assert!(hint < a.len());
    let len = a.len();

    let (mut lo, mut hi) = if is_less(key, &a[hint]) {
        // key < a[hint]. Gallop down until a[hint - ofs] <= key < a[hint - last_ofs].
        let max_ofs = hint + 1;
        let mut last_ofs = 0;
        let mut ofs = 1;
        while ofs < max_ofs && is_less(key, &a[hint - ofs]) {
            last_ofs = ofs;
            ofs = ofs * 2 + 1;
        }
        if ofs > max_ofs {
            ofs = max_ofs;
        }
        (hint + 1 - ofs, hint - last_ofs)
    } else {
        // a[hint] <= key. Gallop up until a[hint + last_ofs] <= key < a[hint + ofs].
        let max_ofs = len - hint;
        let mut last_ofs = 0;
        let mut ofs = 1;
        while ofs < max_ofs && !is_less(key, &a[hint + ofs]) {
            last_ofs = ofs;
            ofs = ofs * 2 + 1;
        }
        if ofs > max_ofs {
            ofs = max_ofs;
        }
        (hint + last_ofs + 1, hint + ofs)
    };

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if is_less(key, &a[mid]) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    lo
}

////////////////////////////////////////////////////////////////////////////////
// Merging
////////////////////////////////////////////////////////////////////////////////

/// Merges the adjacent sorted runs `v[..len1]` and `v[len1..]`, with the left
/// run staged in `buf`, filling the combined span front to back.
///
/// Call this when the left run is the smaller one. The caller has already
/// trimmed the runs, so the first right element is known to be less than the
/// first left element and the last left element greater than the last right
/// element.
///
/// # Safety
///
/// `buf` must provide space for at least `len1` elements and must not overlap
/// `v`. Both runs must be non-empty and sorted under `is_less`.
unsafe fn merge_lo<T, F>(
    v: &mut [T],
    len1: usize,
    buf: *mut T,
    min_gallop: &mut usize,
    is_less: &mut F,
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    let len = v.len();
    let mut len2 = len - len1;
    debug_assert!(len1 > 0 && len2 > 0);

    let v_base = v.as_mut_ptr();

    // Move the left run out of the way. From here on the open slots in `v`
    // are exactly [hole.dest, cursor2), and their count always equals the
    // number of unconsumed buffer elements [hole.start, hole.end). If
    // `is_less` panics, dropping `hole` moves the buffer remainder back and
    // `v` again holds every element exactly once.
    let mut hole;
    let mut cursor2;
    unsafe {
        ptr::copy_nonoverlapping(v_base, buf, len1);
        hole = MergeHole {
            start: buf,
            end: buf.add(len1),
            dest: v_base,
        };
        cursor2 = v_base.add(len1);
    }
    let mut rem1 = len1;

    // The first right element wins by the pre-merge trimming.
    unsafe {
        ptr::copy_nonoverlapping(cursor2, hole.dest, 1);
        hole.dest = hole.dest.add(1);
        cursor2 = cursor2.add(1);
    }
    len2 -= 1;
    if len2 == 0 {
        // Dropping `hole` flushes the buffered left run into place.
        return Ok(());
    }
    if rem1 == 1 {
        unsafe {
            ptr::copy(cursor2, hole.dest, len2);
            hole.dest = hole.dest.add(len2);
        }
        // The single buffered element belongs after the right run.
        return Ok(());
    }

    let mut min_gallop_local = *min_gallop;
    'outer: loop {
        let mut count1: usize = 0; // consecutive wins of the left run
        let mut count2: usize = 0; // consecutive wins of the right run

        // One element at a time until one side keeps winning.
        loop {
            unsafe {
                if is_less(&*cursor2, &*hole.start) {
                    ptr::copy_nonoverlapping(cursor2, hole.dest, 1);
                    hole.dest = hole.dest.add(1);
                    cursor2 = cursor2.add(1);
                    count2 += 1;
                    count1 = 0;
                    len2 -= 1;
                    if len2 == 0 {
                        break 'outer;
                    }
                } else {
                    ptr::copy_nonoverlapping(hole.start, hole.dest, 1);
                    hole.dest = hole.dest.add(1);
                    hole.start = hole.start.add(1);
                    count1 += 1;
                    count2 = 0;
                    rem1 -= 1;
                    if rem1 == 1 {
                        break 'outer;
                    }
                }
            }
            // One of the counts is always zero, so the OR is the other one.
            if (count1 | count2) >= min_gallop_local {
                break;
            }
        }

        // Galloping mode. Bulk-copy whole stretches from one run until
        // neither side sustains a streak anymore.
        loop {
            unsafe {
                count1 = gallop_right(
                    &*cursor2,
                    slice::from_raw_parts(hole.start, rem1),
                    0,
                    is_less,
                );
                if count1 != 0 {
                    ptr::copy_nonoverlapping(hole.start, hole.dest, count1);
                    hole.dest = hole.dest.add(count1);
                    hole.start = hole.start.add(count1);
                    rem1 -= count1;
                    // rem1 == 0 here means the comparison function lied
                    // earlier about the last left element. Detected below.
                    if rem1 <= 1 {
                        break 'outer;
                    }
                }
                ptr::copy_nonoverlapping(cursor2, hole.dest, 1);
                hole.dest = hole.dest.add(1);
                cursor2 = cursor2.add(1);
                len2 -= 1;
                if len2 == 0 {
                    break 'outer;
                }

                count2 = gallop_left(
                    &*hole.start,
                    slice::from_raw_parts(cursor2, len2),
                    0,
                    is_less,
                );
                if count2 != 0 {
                    // Within `v`, the block may overlap the open slots.
                    ptr::copy(cursor2, hole.dest, count2);
                    hole.dest = hole.dest.add(count2);
                    cursor2 = cursor2.add(count2);
                    len2 -= count2;
                    if len2 == 0 {
                        break 'outer;
                    }
                }
                ptr::copy_nonoverlapping(hole.start, hole.dest, 1);
                hole.dest = hole.dest.add(1);
                hole.start = hole.start.add(1);
                rem1 -= 1;
                if rem1 == 1 {
                    break 'outer;
                }
            }
            min_gallop_local = min_gallop_local.saturating_sub(1);
            if count1 < MIN_GALLOP && count2 < MIN_GALLOP {
                break;
            }
        }
        // Leaving galloping mode was not worth it, raise the entry bar.
        min_gallop_local += 2;
    }
    *min_gallop = cmp::max(min_gallop_local, 1);

    if rem1 == 1 {
        unsafe {
            ptr::copy(cursor2, hole.dest, len2);
            hole.dest = hole.dest.add(len2);
        }
        // The last left element is flushed behind the right run by `hole`.
        Ok(())
    } else if rem1 == 0 {
        // All open slots are filled, `hole` is empty. The left run ran dry
        // in a place the run invariants rule out for any total order.
        Err(SortError::InconsistentComparator)
    } else {
        debug_assert!(len2 == 0);
        // Dropping `hole` flushes the buffered left remainder into place.
        Ok(())
    }
}

/// Merges the adjacent sorted runs `v[..len1]` and `v[len1..]`, with the
/// right run staged in `buf`, filling the combined span back to front.
///
/// The mirror image of [`merge_lo`], for when the right run is the smaller
/// one. Same trimming preconditions.
///
/// # Safety
///
/// `buf` must provide space for at least `v.len() - len1` elements and must
/// not overlap `v`. Both runs must be non-empty and sorted under `is_less`.
unsafe fn merge_hi<T, F>(
    v: &mut [T],
    len1: usize,
    buf: *mut T,
    min_gallop: &mut usize,
    is_less: &mut F,
) -> Result<(), SortError>
where
    F: FnMut(&T, &T) -> bool,
{
    let len = v.len();
    let len2 = len - len1;
    debug_assert!(len1 > 0 && len2 > 0);

    let v_base = v.as_mut_ptr();

    // Move the right run out of the way. The open slots in `v` are
    // [hole.dest, dest], one slot per unconsumed buffer element, and both
    // shrink leftwards together. `hole.dest - 1` is the last unconsumed left
    // element, `dest` the slot the next loser of a comparison goes into.
    let mut hole;
    let mut dest;
    unsafe {
        ptr::copy_nonoverlapping(v_base.add(len1), buf, len2);
        hole = MergeHole {
            start: buf,
            end: buf.add(len2),
            dest: v_base.add(len1),
        };
        dest = v_base.add(len - 1);
    }
    let mut rem1 = len1;
    let mut rem2 = len2;

    // The last left element wins by the pre-merge trimming.
    unsafe {
        ptr::copy_nonoverlapping(hole.dest.sub(1), dest, 1);
        dest = dest.sub(1);
        hole.dest = hole.dest.sub(1);
    }
    rem1 -= 1;
    if rem1 == 0 {
        // Dropping `hole` flushes the buffered right run into place.
        return Ok(());
    }
    if rem2 == 1 {
        unsafe {
            ptr::copy(hole.dest.sub(rem1), dest.add(1).sub(rem1), rem1);
            hole.dest = hole.dest.sub(rem1);
        }
        // The single buffered element belongs before the left run.
        return Ok(());
    }

    let mut min_gallop_local = *min_gallop;
    'outer: loop {
        let mut count1: usize = 0; // consecutive wins of the left run
        let mut count2: usize = 0; // consecutive wins of the right run

        loop {
            unsafe {
                if is_less(&*hole.end.sub(1), &*hole.dest.sub(1)) {
                    ptr::copy_nonoverlapping(hole.dest.sub(1), dest, 1);
                    dest = dest.sub(1);
                    hole.dest = hole.dest.sub(1);
                    count1 += 1;
                    count2 = 0;
                    rem1 -= 1;
                    if rem1 == 0 {
                        break 'outer;
                    }
                } else {
                    ptr::copy_nonoverlapping(hole.end.sub(1), dest, 1);
                    dest = dest.sub(1);
                    hole.end = hole.end.sub(1);
                    count2 += 1;
                    count1 = 0;
                    rem2 -= 1;
                    if rem2 == 1 {
                        break 'outer;
                    }
                }
            }
            if (count1 | count2) >= min_gallop_local {
                break;
            }
        }

        loop {
            unsafe {
                count1 = rem1
                    - gallop_right(
                        &*hole.end.sub(1),
                        slice::from_raw_parts(v_base, rem1),
                        rem1 - 1,
                        is_less,
                    );
                if count1 != 0 {
                    dest = dest.sub(count1);
                    hole.dest = hole.dest.sub(count1);
                    rem1 -= count1;
                    // Within `v`, the block may overlap the open slots.
                    ptr::copy(hole.dest, dest.add(1), count1);
                    if rem1 == 0 {
                        break 'outer;
                    }
                }
                ptr::copy_nonoverlapping(hole.end.sub(1), dest, 1);
                dest = dest.sub(1);
                hole.end = hole.end.sub(1);
                rem2 -= 1;
                if rem2 == 1 {
                    break 'outer;
                }

                count2 = rem2
                    - gallop_left(
                        &*hole.dest.sub(1),
                        slice::from_raw_parts(hole.start, rem2),
                        rem2 - 1,
                        is_less,
                    );
                if count2 != 0 {
                    dest = dest.sub(count2);
                    hole.end = hole.end.sub(count2);
                    rem2 -= count2;
                    ptr::copy_nonoverlapping(hole.end, dest.add(1), count2);
                    // rem2 == 0 here means the comparison function lied
                    // earlier about the first right element. Detected below.
                    if rem2 <= 1 {
                        break 'outer;
                    }
                }
                ptr::copy_nonoverlapping(hole.dest.sub(1), dest, 1);
                dest = dest.sub(1);
                hole.dest = hole.dest.sub(1);
                rem1 -= 1;
                if rem1 == 0 {
                    break 'outer;
                }
            }
            min_gallop_local = min_gallop_local.saturating_sub(1);
            if count1 < MIN_GALLOP && count2 < MIN_GALLOP {
                break;
            }
        }
        min_gallop_local += 2;
    }
    *min_gallop = cmp::max(min_gallop_local, 1);

    if rem2 == 1 {
        unsafe {
            ptr::copy(hole.dest.sub(rem1), dest.add(1).sub(rem1), rem1);
            hole.dest = hole.dest.sub(rem1);
        }
        // The first right element is flushed before the left run by `hole`.
        Ok(())
    } else if rem2 == 0 {
        Err(SortError::InconsistentComparator)
    } else {
        debug_assert!(rem1 == 0);
        // Dropping `hole` flushes the buffered right remainder into place.
        Ok(())
    }
}

/// When dropped, moves the buffered range `start..end` into the open slots
/// starting at `dest`. Keeping the cursors inside this guard is what makes
/// the merges panic safe, any unwind from `is_less` lands the unconsumed
/// buffer elements back into `v`.
struct MergeHole<T> {
    start: *mut T,
    end: *mut T,
    dest: *mut T,
}

impl<T> Drop for MergeHole<T> {
    fn drop(&mut self) {
        unsafe {
            let remaining = self.end.offset_from(self.start) as usize;
            ptr::copy_nonoverlapping(self.start, self.dest, remaining);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scratch buffer
////////////////////////////////////////////////////////////////////////////////

/// Merge scratch space: the caller-provided slice when it is big enough for
/// the merge at hand, an owned allocation otherwise.
///
/// The owned vector never holds initialized elements, its length stays zero
/// and only the allocation is used. Element copies living in the spare
/// capacity mid-merge are tracked by [`MergeHole`], so unwinding can never
/// double-drop them.
struct ScratchBuf<'a, T> {
    external: &'a mut [MaybeUninit<T>],
    owned: Vec<T>,
}

impl<'a, T> ScratchBuf<'a, T> {
    fn new(external: &'a mut [MaybeUninit<T>], sort_len: usize) -> Self {
        // Usual-case allocation made eagerly, so that early small merges do
        // not each bump the capacity by a little.
        let initial = if sort_len < 2 * INITIAL_SCRATCH_LEN {
            sort_len / 2
        } else {
            INITIAL_SCRATCH_LEN
        };

        let owned = if external.len() >= initial {
            Vec::new()
        } else {
            Vec::with_capacity(initial)
        };

        Self { external, owned }
    }

    /// Returns scratch space for at least `min_len` elements. Grows but
    /// never shrinks, and caps growth at `sort_len / 2`, which no merge can
    /// exceed because it always buffers the smaller run.
    fn ensure(&mut self, min_len: usize, sort_len: usize) -> *mut T {
        if self.external.len() >= min_len {
            return self.external.as_mut_ptr() as *mut T;
        }

        if self.owned.capacity() < min_len {
            let rounded = min_len.checked_next_power_of_two().unwrap_or(min_len);
            let new_cap = cmp::max(min_len, cmp::min(rounded, sort_len / 2));
            self.owned = Vec::with_capacity(new_cap);
        }

        self.owned.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn less(a: &i32, b: &i32) -> bool {
        a < b
    }

    #[test]
    fn min_run_length_values() {
        for n in 0..MIN_MERGE {
            assert_eq!(min_run_length(n), n);
        }
        assert_eq!(min_run_length(32), 16);
        assert_eq!(min_run_length(33), 17);
        assert_eq!(min_run_length(64), 16);
        assert_eq!(min_run_length(65), 17);
        assert_eq!(min_run_length(100), 25);
        assert_eq!(min_run_length(127), 32);
        assert_eq!(min_run_length(128), 16);

        for n in MIN_MERGE..50_000 {
            let r = min_run_length(n);
            assert!(r >= MIN_MERGE / 2 && r <= MIN_MERGE, "n: {n} r: {r}");
        }
    }

    #[test]
    fn run_detection() {
        let mut is_less = less;

        let mut v = [1];
        assert_eq!(find_ascending_run(&mut v, &mut is_less), 1);

        let mut v = [1, 2, 2, 3, 1];
        assert_eq!(find_ascending_run(&mut v, &mut is_less), 4);
        assert_eq!(v, [1, 2, 2, 3, 1]);

        let mut v = [5, 4, 3, 9];
        assert_eq!(find_ascending_run(&mut v, &mut is_less), 3);
        assert_eq!(v, [3, 4, 5, 9]);

        // Equal neighbors terminate the strictly descending branch, so
        // reversal cannot reorder them.
        let mut v = [2, 2, 1];
        assert_eq!(find_ascending_run(&mut v, &mut is_less), 2);
        assert_eq!(v, [2, 2, 1]);
    }

    #[test]
    fn binary_insertion_extends_sorted_prefix() {
        let mut is_less = less;

        let mut v = [1, 3, 7, 2, 9, 0];
        binary_insertion_sort(&mut v, 3, &mut is_less);
        assert_eq!(v, [0, 1, 2, 3, 7, 9]);

        let mut v = [4, 2];
        binary_insertion_sort(&mut v, 1, &mut is_less);
        assert_eq!(v, [2, 4]);
    }

    #[test]
    fn gallop_bounds() {
        let mut is_less = less;
        let a = [1, 1, 2, 3, 5, 5, 8];

        for hint in 0..a.len() {
            assert_eq!(gallop_left(&5, &a, hint, &mut is_less), 4, "hint: {hint}");
            assert_eq!(gallop_right(&5, &a, hint, &mut is_less), 6, "hint: {hint}");
            assert_eq!(gallop_left(&0, &a, hint, &mut is_less), 0, "hint: {hint}");
            assert_eq!(gallop_right(&9, &a, hint, &mut is_less), 7, "hint: {hint}");
            assert_eq!(gallop_left(&1, &a, hint, &mut is_less), 0, "hint: {hint}");
            assert_eq!(gallop_right(&1, &a, hint, &mut is_less), 2, "hint: {hint}");
        }
    }

    #[test]
    fn gallop_matches_linear_scan() {
        let mut is_less = less;
        let a: Vec<i32> = (0..200).map(|x| x / 3).collect();

        for key in -1..70 {
            let expected_left = a.iter().filter(|&&x| x < key).count();
            let expected_right = a.iter().filter(|&&x| x <= key).count();
            for hint in [0, 1, a.len() / 2, a.len() - 1] {
                assert_eq!(gallop_left(&key, &a, hint, &mut is_less), expected_left);
                assert_eq!(gallop_right(&key, &a, hint, &mut is_less), expected_right);
            }
        }
    }

    #[test]
    fn scratch_growth_is_capped() {
        let mut scratch: ScratchBuf<'_, i32> = ScratchBuf::new(&mut [], 1000);
        assert!(scratch.owned.capacity() >= 256);

        scratch.ensure(300, 1000);
        assert!(scratch.owned.capacity() >= 300);
        assert!(scratch.owned.capacity() <= 512);

        // Never shrinks.
        scratch.ensure(10, 1000);
        assert!(scratch.owned.capacity() >= 300);
    }
}
