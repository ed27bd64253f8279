use criterion::{criterion_group, criterion_main, Criterion};
use dkv::commit_log::CommitLog;
use dkv::hash_table::HashTable;
use rand::Rng;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn hash_table_write_benchmark(c: &mut Criterion) {
    c.bench_function("hash table 1000 sets", |b| {
        b.iter(|| {
            let table = HashTable::new();
            let mut rng = rand::thread_rng();
            for i in 0..1000 {
                let key = format!("key{i}");
                let value: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
                table.set(&key, value, i as i64);
            }
        })
    });
}

fn commit_log_append_benchmark(c: &mut Criterion) {
    c.bench_function("commit log 100 appends", |b| {
        b.iter(|| {
            let rt = Runtime::new().unwrap();
            let tmp_dir = TempDir::new().unwrap();
            let log = CommitLog::new(tmp_dir.path().join("commit.log")).unwrap();
            rt.block_on(async {
                for i in 0..100 {
                    log.append(&format!("set key{i} value{i} {i}")).await.unwrap();
                }
            });
        })
    });
}

criterion_group!(benches, hash_table_write_benchmark, commit_log_append_benchmark);
criterion_main!(benches);
