//! Single seedable random stream shared by initialization, dropout and
//! routing noise. Reproducibility requires the caller to pin the seed and
//! avoid concurrent consumption; each thread owns an independent stream.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0x4d5a));
}

/// Reseeds the stream for the current thread.
pub fn set_seed(seed: u64) {
    RNG.with(|r| *r.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Runs `f` with exclusive access to the thread's generator.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    RNG.with(|r| f(&mut r.borrow_mut()))
}
