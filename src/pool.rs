use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

pub const DEFAULT_WORKERS: usize = 10;

/// Runs `work` over `items` on at most `width` scoped threads and blocks until
/// every item is done. Results come back in submission order regardless of
/// completion order.
pub fn run_bounded<T, R, F>(items: &[T], width: usize, work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let width = width.clamp(1, items.len());
    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..width {
            let tx = tx.clone();
            let cursor = &cursor;
            let work = &work;
            scope.spawn(move || {
                loop {
                    let i = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(i) else {
                        break;
                    };
                    if tx.send((i, work(i, item))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for (i, result) in rx {
        slots[i] = Some(result);
    }
    slots.into_iter().flatten().collect()
}
