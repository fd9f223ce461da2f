use std::time::Duration;

fn main() {
    let mut ticks: u64 = 0;
    loop {
        std::thread::sleep(Duration::from_millis(50));
        ticks += 1;
        if ticks % 100 == 0 {
            println!("tick {ticks}");
        }
    }
}
