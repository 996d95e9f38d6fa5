use super::*;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

proptest! {
    // Random widths and write sequences against a plain vector model.
    #[test]
    fn packed_array_matches_reference(
        width in 1u32..=32,
        ops in prop::collection::vec((0u64..300, any::<u64>()), 1..200),
    ) {
        let mut arr = PackedArray::new(300, width);
        let mask = (1u64 << width) - 1;
        let mut reference = vec![0u64; 300];
        for (addr, value) in ops {
            arr.write(addr, value & mask);
            reference[addr as usize] = value & mask;
        }
        for (addr, &value) in reference.iter().enumerate() {
            prop_assert_eq!(arr.read(addr as u64), value);
        }
    }

    // A code never decodes above the count it was derived from, and it is
    // the largest such code.
    #[test]
    fn quantizer_code_is_a_tight_floor(value in 1u64..=(1u64 << 30)) {
        let q = LogQuantizer::new(1.3).expect("quantizer should build");
        let code = q.code(value);
        prop_assert!(q.value(code) <= value);
        if code < q.max_code() {
            prop_assert!(q.value(code + 1) > value);
        }
    }

    // Folding ids one position at a time agrees with hashing the whole
    // sequence, for every function of the family.
    #[test]
    fn linear_hash_incremental_agrees(
        ids in prop::collection::vec(any::<u32>(), 1..6),
    ) {
        let mut rng = StdRng::seed_from_u64(9);
        let family = LinearHash::generate(1 << 20, 4, 6, &mut rng);
        for func in 0..family.functions() {
            let mut sum = 0u64;
            for (pos, &id) in ids.iter().enumerate() {
                sum = family.partial(sum, id, pos, func);
            }
            prop_assert_eq!(family.finish(sum), family.hash(&ids, func));
        }
    }

    // Whatever lands in the table stays retrievable, exactly for overflow
    // residents and never above the inserted count otherwise.
    #[test]
    fn inserted_keys_stay_retrievable(
        keys in prop::collection::btree_map(
            prop::collection::vec(0u32..1000, 1..4),
            1u64..10_000,
            1..50,
        ),
    ) {
        let config = TableConfig {
            budget_mb: 1,
            width: 16,
            bucket_range: 4,
            quant_base: 1.0001,
            order: 5,
        };
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut table = FingerprintTable::new(&config, &mut rng).expect("table should build");
        for (ids, &count) in &keys {
            let _ = table.insert(ids, count);
        }
        for (ids, &count) in &keys {
            let got = table.get(ids);
            prop_assert_eq!(got, Some(count), "key {:?} lost", ids);
        }
    }
}
