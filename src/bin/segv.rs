fn main() {
    println!("about to crash");
    let ptr: *const i64 = std::ptr::null();
    let value = unsafe { std::ptr::read_volatile(ptr) };
    println!("unreachable: {value}");
}
