//! Environment-driven runtime tunables. Config-file parsing belongs to the
//! embedding application; the engine only reads a handful of knobs.

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|var| var.parse().ok())
}

/// Path of the catalog database. Looked up from `KATALOG_DB`, falling back to
/// a `.env` file in the working directory, then to a local file.
pub fn database_url() -> String {
    const DEFAULT_DATABASE: &str = "katalog.db";
    if std::env::var("KATALOG_DB").is_err() {
        let _ = dotenvy::dotenv();
    }
    std::env::var("KATALOG_DB").unwrap_or_else(|_| DEFAULT_DATABASE.to_owned())
}

/// Number of assets per persistence batch. Both the scan-only write path and
/// the batch processor runner commit one transaction per this many assets.
pub fn batch_size() -> usize {
    const DEFAULT_BATCH_SIZE: usize = 1000;
    env_parse("KATALOG_BATCH_SIZE")
        .filter(|&size| size > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

/// Concurrency limit for tasks enqueued under a single changeset.
pub fn task_concurrency() -> usize {
    const DEFAULT_TASK_CONCURRENCY: usize = 10;
    env_parse("KATALOG_TASK_CONCURRENCY")
        .filter(|&limit| limit > 0)
        .unwrap_or(DEFAULT_TASK_CONCURRENCY)
}

/// Size of the database connection pool.
pub fn pool_size() -> u32 {
    env_parse("KATALOG_POOL_SIZE")
        .filter(|&size| size > 0)
        .unwrap_or_else(|| worker_threads() as u32)
}

/// Sizing for blocking-work executors (thread pool dispatch and the rayon
/// pool used by CPU-bound processors).
pub fn worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| std::cmp::max(4, threads.get()))
        .unwrap_or(4)
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn batch_size_override() {
        unsafe { std::env::set_var("KATALOG_BATCH_SIZE", "25") };
        assert_eq!(batch_size(), 25);
        unsafe { std::env::set_var("KATALOG_BATCH_SIZE", "0") };
        assert_eq!(batch_size(), 1000);
        unsafe { std::env::remove_var("KATALOG_BATCH_SIZE") };
        assert_eq!(batch_size(), 1000);
    }

    #[test]
    #[serial]
    fn task_concurrency_default() {
        unsafe { std::env::remove_var("KATALOG_TASK_CONCURRENCY") };
        assert_eq!(task_concurrency(), 10);
    }
}
