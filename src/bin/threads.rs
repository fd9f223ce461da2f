use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn work(counter: Arc<AtomicU64>, rounds: u64) {
    for _ in 0..rounds {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

fn main() {
    let counter = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || work(counter, 100))
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    println!("count = {}", counter.load(Ordering::SeqCst));
}
