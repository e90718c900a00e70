use crate::WorkerPool;

const DEFAULT_MIN_GRAIN: i64 = 8192;

/// Splits `[begin, end)` into up to `T` contiguous chunks and runs `f` on each, in parallel, via
/// `pool`. Blocks until every chunk has completed.
///
/// `T = clamp(desired_tasks.unwrap_or(pool.size() * 4), 1, max(1, (end - begin) / min_grain))`.
/// When `pool` is `None` or the range is empty, `f` is invoked at most once on the caller's own
/// thread: there is no parallelism to gain from an empty or unparallelizable range.
pub fn parallel_for<F>(
    pool: Option<&WorkerPool>,
    begin: i64,
    end: i64,
    f: F,
    desired_tasks: Option<usize>,
    min_grain: i64,
) where
    F: Fn(i64, i64) + Sync,
{
    let n = end - begin;
    if n <= 0 {
        return;
    }

    let Some(pool) = pool else {
        f(begin, end);
        return;
    };

    let grain = if min_grain <= 0 { DEFAULT_MIN_GRAIN } else { min_grain };
    let max_tasks = std::cmp::max(1, n / grain) as usize;
    let wanted = desired_tasks.filter(|&d| d > 0).unwrap_or(pool.size() * 4);
    let tasks = wanted.clamp(1, max_tasks);

    let chunk = (n + tasks as i64 - 1) / tasks as i64;

    pool.scope(|scope| {
        let f = &f;
        let mut start = begin;
        while start < end {
            let stop = std::cmp::min(start + chunk, end);
            scope.spawn(move || f(start, stop));
            start = stop;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_log::test;

    #[test]
    fn covers_the_whole_range_exactly_once() {
        let pool = WorkerPool::new(4);
        let n = 1_000_003i64;
        let seen = Mutex::new(vec![0u8; n as usize]);
        parallel_for(
            Some(&pool),
            0,
            n,
            |start, stop| {
                let mut seen = seen.lock().unwrap();
                for i in start..stop {
                    seen[i as usize] += 1;
                }
            },
            None,
            1024,
        );
        assert!(seen.into_inner().unwrap().iter().all(|&c| c == 1));
    }

    #[test]
    fn runs_inline_without_a_pool() {
        let touched = std::sync::atomic::AtomicBool::new(false);
        parallel_for(None, 0, 10, |a, b| {
            assert_eq!((a, b), (0, 10));
            touched.store(true, std::sync::atomic::Ordering::SeqCst);
        }, None, 1);
        assert!(touched.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn empty_range_invokes_nothing() {
        let pool = WorkerPool::new(2);
        parallel_for(Some(&pool), 5, 5, |_, _| panic!("must not run"), None, 1);
    }

    #[test]
    fn respects_desired_task_count_upper_bound() {
        let pool = WorkerPool::new(1);
        let chunks = Mutex::new(Vec::new());
        parallel_for(
            Some(&pool),
            0,
            100,
            |a, b| chunks.lock().unwrap().push((a, b)),
            Some(4),
            1,
        );
        assert_eq!(chunks.into_inner().unwrap().len(), 4);
    }
}
