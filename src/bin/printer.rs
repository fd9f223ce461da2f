fn add(a: i64, b: i64) -> i64 {
    a + b
}

fn main() {
    let value = add(100, 130);
    println!("compute = {value}");
}
