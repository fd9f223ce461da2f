fn add(a: i64, b: i64) -> i64 {
    let r = a + b;
    r
}

fn compute(x: i64, y: i64) -> i64 {
    let sum = add(x, y);
    let doubled = sum * 2;
    doubled
}

fn main() {
    let mut total: i64 = 0;
    for i in 1..=5i64 {
        total = add(total, i);
    }

    let x: i64 = 10;
    let y: i64 = 20;
    let sum = add(x, y);
    let result = compute(x, y);

    println!("total = {total}");
    println!("sum = {sum}");
    println!("result = {result}");
}
