use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sector_mmap::{BlockDevice, MmapBlockDevice};
use std::io::SeekFrom;
use std::path::Path;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 测试参数
const DEVICE_SIZE: u64 = 1024 * 1024 * 256; // 256MB
const CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4MB
const NUM_WORKERS: usize = 8; // 8个并发协程/线程

fn chunk_offsets() -> Vec<u64> {
    let total_chunks = DEVICE_SIZE as usize / CHUNK_SIZE;
    (0..total_chunks).map(|idx| (idx * CHUNK_SIZE) as u64).collect()
}

/// 创建设备并写满数据
fn prepare_device(path: &Path) -> MmapBlockDevice {
    let (device, _) = MmapBlockDevice::create(path, DEVICE_SIZE).unwrap();
    for (idx, offset) in chunk_offsets().into_iter().enumerate() {
        device.write_at(&vec![idx as u8; CHUNK_SIZE], offset).unwrap();
    }
    device.sync().unwrap();
    device
}

/// 使用 tokio::fs::File 进行分段并发读取
async fn bench_tokio_file(path: &Path) {
    let offsets = chunk_offsets();
    let mut handles = vec![];

    for worker_id in 0..NUM_WORKERS {
        let offsets = offsets.clone();
        let path = path.to_path_buf();

        let handle = tokio::spawn(async move {
            // 每个worker打开自己的文件句柄
            let mut file = tokio::fs::File::open(&path).await.unwrap();
            let mut buf = vec![0u8; CHUNK_SIZE];

            // 使用轮询方式分配任务给不同的worker
            for (idx, &offset) in offsets.iter().enumerate() {
                if idx % NUM_WORKERS != worker_id {
                    continue;
                }
                file.seek(SeekFrom::Start(offset)).await.unwrap();
                file.read_exact(&mut buf).await.unwrap();
            }
        });

        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

/// 使用 MmapBlockDevice + std::thread 进行分段并发读取（受保护拷贝在进程内串行）
fn bench_block_device_threads(device: &MmapBlockDevice) {
    let offsets = chunk_offsets();

    std::thread::scope(|s| {
        for worker_id in 0..NUM_WORKERS {
            let offsets = &offsets;
            let device = device.clone();

            s.spawn(move || {
                let mut buf = vec![0u8; CHUNK_SIZE];
                for (idx, &offset) in offsets.iter().enumerate() {
                    if idx % NUM_WORKERS != worker_id {
                        continue;
                    }
                    device.read_at(&mut buf, offset).unwrap();
                }
            });
        }
    });
}

/// 使用 MmapBlockDevice 进行分段并发写入（写入不加锁）
fn bench_block_device_writes(device: &MmapBlockDevice) {
    let offsets = chunk_offsets();

    std::thread::scope(|s| {
        for worker_id in 0..NUM_WORKERS {
            let offsets = &offsets;
            let device = device.clone();

            s.spawn(move || {
                let data = vec![worker_id as u8; CHUNK_SIZE];
                for (idx, &offset) in offsets.iter().enumerate() {
                    if idx % NUM_WORKERS != worker_id {
                        continue;
                    }
                    device.write_at(&data, offset).unwrap();
                }
            });
        }
    });

    device.sync().unwrap();
}

fn concurrent_read_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_read");

    group.sample_size(10);
    group.measurement_time(std::time::Duration::from_secs(20));

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench_device.bin");
    let device = prepare_device(&path);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let label = format!(
        "{}MB_{}MB_chunks_{}workers",
        DEVICE_SIZE / (1024 * 1024),
        CHUNK_SIZE / (1024 * 1024),
        NUM_WORKERS
    );

    group.bench_function(BenchmarkId::new("tokio_file_read", &label), |b| {
        b.to_async(&runtime).iter(|| bench_tokio_file(&path));
    });

    group.bench_function(BenchmarkId::new("block_device_read", &label), |b| {
        b.iter(|| bench_block_device_threads(&device));
    });

    group.bench_function(BenchmarkId::new("block_device_write_sync", &label), |b| {
        b.iter(|| bench_block_device_writes(&device));
    });

    group.finish();
}

criterion_group!(benches, concurrent_read_benchmark);
criterion_main!(benches);
