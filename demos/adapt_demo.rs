//! Builds a small model from counted text, scores phrases, adapts the
//! counts, evicts under pressure and round-trips a snapshot.

use std::collections::HashMap;

use countgram::{ModelConfig, NgramModel, TableConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn main() {
    tracing_subscriber::fmt().init();

    let config = ModelConfig {
        table: TableConfig {
            budget_mb: 4,
            width: 16,
            bucket_range: 8,
            quant_base: 1.0001,
            order: 3,
        },
        adapting: false,
    };
    let mut rng = StdRng::seed_from_u64(42);
    let mut lm = NgramModel::new(&config, &mut rng).expect("model should build");

    let corpus = [
        "<s> the cat sat on the mat",
        "<s> the dog sat on the rug",
        "<s> a cat and a dog sat",
    ];

    let mut counts: HashMap<Vec<&str>, u64> = HashMap::new();
    for line in corpus {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for n in 1..=config.table.order {
            for window in tokens.windows(n) {
                *counts.entry(window.to_vec()).or_insert(0) += 1;
            }
        }
    }
    // shortest first, so longer entries find their contexts in the store
    let mut entries: Vec<(Vec<&str>, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then(a.0.cmp(&b.0)));
    for (ngram, count) in &entries {
        lm.insert(ngram, *count);
    }
    println!(
        "inserted {} distinct n-grams, corpus size {}",
        entries.len(),
        lm.corpus_size()
    );

    for phrase in ["the cat", "the dog", "a dog sat", "the zebra"] {
        let tokens: Vec<&str> = phrase.split_whitespace().collect();
        let ids = lm.lookup_ids(&tokens);
        let (logprob, _state) = lm.prob(&ids);
        println!("log10 p({phrase}) = {logprob:.4}");
    }
    lm.clear_cache();

    // new text arrives
    lm.update(&["the", "cat"], 2);

    let stats = lm.table_stats();
    println!(
        "rows occupied {} of {}, overflow entries {}",
        stats.rows_occupied, stats.cells, stats.overflow_entries
    );

    let evicted = lm.heur_delete(64, 3);
    println!("evicted {evicted} unprotected rows");

    let path = std::env::temp_dir().join("countgram-demo.bin");
    lm.save_to_path(&path).expect("save");
    let mut reloaded = NgramModel::load_from_path(&path).expect("load");
    let ids = reloaded.lookup_ids(&["the", "cat"]);
    let (logprob, _state) = reloaded.prob(&ids);
    println!("after reload: log10 p(the cat) = {logprob:.4}");
}
