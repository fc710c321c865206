//! Environment-variable configuration surface.

/// Reads an unsigned value from the environment, accepting the usual size
/// suffixes: `k`, `m`, `g` (any case), optionally followed by a `b`, so
/// `FORKGC_PTRS_PER_THREAD=64k` and `=65536` mean the same thing.
/// Fractional counts like `1.5m` scale before truncation.
pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let raw = std::env::var(var).ok()?;
    let value = raw.trim().trim_end_matches(['b', 'B']);

    let scale: usize = match value.as_bytes().last()? {
        b'k' | b'K' => 1 << 10,
        b'm' | b'M' => 1 << 20,
        b'g' | b'G' => 1 << 30,
        _ => 1,
    };
    let digits = if scale == 1 {
        value
    } else {
        &value[..value.len() - 1]
    };

    let parsed = digits.parse::<f64>().ok()?;
    Some((parsed * scale as f64) as usize)
}

/// Capacity of each thread's retirement ring, `FORKGC_PTRS_PER_THREAD`.
pub fn ptrs_per_thread() -> usize {
    read_uint_from_env("FORKGC_PTRS_PER_THREAD").unwrap_or(32 * 1024)
}

/// Signal used for the snapshot checkpoint, `FORKGC_SIGNAL`.
pub fn checkpoint_signal() -> i32 {
    read_uint_from_env("FORKGC_SIGNAL")
        .map(|x| x as i32)
        .unwrap_or(libc::SIGUSR1)
}

/// Number of sweep worker threads, `FORKGC_SWEEP_THREADS`.
pub fn sweep_threads() -> usize {
    read_uint_from_env("FORKGC_SWEEP_THREADS").unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    })
}
