//! Input patterns for testing and benchmarking the sort. Limited to i32
//! values, the tests map them into other types where needed.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::prelude::*;

use zipf::ZipfDistribution;

use once_cell::sync::OnceCell;

// --- Public ---

pub fn random(size: usize) -> Vec<i32> {
    //     .
    // : . : :
    // :.:::.::

    random_vec(size)
}

pub fn random_uniform<R>(size: usize, range: R) -> Vec<i32>
where
    R: Into<rand::distributions::Uniform<i32>>,
{
    // :.:.:.::
    let mut rng = new_rng();
    let dist: rand::distributions::Uniform<i32> = range.into();

    (0..size).map(|_| dist.sample(&mut rng)).collect()
}

/// Zipf-distributed values, a handful of values make up most of the input.
/// Good for exercising duplicate-heavy merges.
pub fn random_zipf(size: usize, exponent: f64) -> Vec<i32> {
    let mut rng = new_rng();
    let dist = ZipfDistribution::new(size, exponent).unwrap();

    (0..size).map(|_| dist.sample(&mut rng) as i32).collect()
}

pub fn all_equal(size: usize) -> Vec<i32> {
    // ......
    // ::::::

    (0..size).map(|_| 66).collect::<Vec<_>>()
}

pub fn ascending(size: usize) -> Vec<i32> {
    //     .:
    //   .:::
    // .:::::

    (0..size as i32).collect::<Vec<_>>()
}

pub fn descending(size: usize) -> Vec<i32> {
    // :.
    // :::.
    // :::::.

    (0..size as i32).rev().collect::<Vec<_>>()
}

pub fn ascending_saw(size: usize, saw_count: usize) -> Vec<i32> {
    //   .:  .:
    // .:::.:::

    let mut vals = random_vec(size);
    for chunk in chunks_for(&mut vals, saw_count) {
        chunk.sort_unstable();
    }

    vals
}

pub fn descending_saw(size: usize, saw_count: usize) -> Vec<i32> {
    // :.  :.
    // :::.:::.

    let mut vals = random_vec(size);
    for chunk in chunks_for(&mut vals, saw_count) {
        chunk.sort_unstable_by_key(|&e| std::cmp::Reverse(e));
    }

    vals
}

pub fn saw_mixed(size: usize, saw_count: usize) -> Vec<i32> {
    // :.  :.    .::.    .:
    // :::.:::..::::::..:::

    if size == 0 {
        return Vec::new();
    }

    let mut vals = random_vec(size);
    let directions = random_uniform(saw_count + 1, 0..=1);

    for (i, chunk) in chunks_for(&mut vals, saw_count).enumerate() {
        if directions[i % directions.len()] == 0 {
            chunk.sort_unstable();
        } else {
            chunk.sort_unstable_by_key(|&e| std::cmp::Reverse(e));
        }
    }

    vals
}

pub fn pipe_organ(size: usize) -> Vec<i32> {
    //   .:.
    // .:::::.

    let mut vals = random_vec(size);
    let mid = size / 2;

    vals[..mid].sort_unstable();
    vals[mid..].sort_unstable_by_key(|&e| std::cmp::Reverse(e));

    vals
}

/// By default every pattern in a process draws from one fixed seed, so that
/// failures reproduce. Benchmarks call this to get fresh values per call.
pub fn disable_fixed_seed() {
    USE_FIXED_SEED.store(false, Ordering::Release);
}

/// The process-wide seed. Printed by the tests, can be pinned by setting the
/// `OVERRIDE_SEED` env var.
pub fn random_init_seed() -> u64 {
    if USE_FIXED_SEED.load(Ordering::Acquire) {
        static SEED: OnceCell<u64> = OnceCell::new();
        *SEED.get_or_init(initial_seed)
    } else {
        thread_rng().gen()
    }
}

// --- Private ---

static USE_FIXED_SEED: AtomicBool = AtomicBool::new(true);

fn initial_seed() -> u64 {
    if let Ok(val) = std::env::var("OVERRIDE_SEED") {
        u64::from_str(&val).expect("OVERRIDE_SEED must be a u64")
    } else {
        thread_rng().gen()
    }
}

fn new_rng() -> StdRng {
    rand::SeedableRng::seed_from_u64(random_init_seed())
}

fn random_vec(size: usize) -> Vec<i32> {
    let mut rng = new_rng();

    (0..size).map(|_| rng.gen::<i32>()).collect()
}

fn chunks_for(vals: &mut [i32], saw_count: usize) -> std::slice::ChunksMut<'_, i32> {
    let chunk_size = (vals.len() / saw_count.max(1)).max(1);
    vals.chunks_mut(chunk_size)
}
