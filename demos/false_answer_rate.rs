//! Probes the table with keys that were never inserted and compares the
//! measured false-answer rate with the `2^-width` per-row bound.

use countgram::{FingerprintTable, TableConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn main() {
    tracing_subscriber::fmt().init();

    let config = TableConfig {
        budget_mb: 8,
        width: 12,
        bucket_range: 8,
        quant_base: 1.1,
        order: 3,
    };
    let mut rng = StdRng::seed_from_u64(1);
    let mut table = FingerprintTable::new(&config, &mut rng).expect("table should build");

    let keys: u32 = 200_000;
    for i in 0..keys {
        let ids = [i, i ^ 0x5BF0_3635, i.rotate_left(7)];
        let _ = table.insert(&ids, u64::from(i % 1000 + 1));
    }

    // probe ids are disjoint from every inserted key by the high bit
    let probes: u32 = 1_000_000;
    let mut false_answers = 0u64;
    for _ in 0..probes {
        let ids = [rng.gen::<u32>() | 0x8000_0000, rng.gen(), rng.gen()];
        if table.get(&ids).is_some() {
            false_answers += 1;
        }
    }

    let stats = table.stats();
    let measured = false_answers as f64 / f64::from(probes);
    let per_bucket = stats.rows_occupied as f64 / stats.buckets as f64;
    let bound = per_bucket * (0.5f64).powi(config.width as i32);
    println!(
        "inserted {keys} keys, {} rows occupied, {} overflow entries",
        stats.rows_occupied, stats.overflow_entries
    );
    println!("measured false-answer rate  = {measured:.3e}");
    println!("occupancy * 2^-width bound  = {bound:.3e}");
}
