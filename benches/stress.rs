use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2024-10-20T00:00:00Z; reservations must fall inside the accepted range.
const BASE: i64 = 1_729_382_400_000;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let password = std::env::var("FUHRPARK_PASSWORD").unwrap_or_else(|_| "fuhrpark".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("fuhrpark")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn add_vehicle(client: &tokio_postgres::Client) -> Ulid {
    let vid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, name) VALUES ('{vid}', 'bench {vid}')"
        ))
        .await
        .unwrap();
    vid
}

async fn reserve(
    client: &tokio_postgres::Client,
    vid: Ulid,
    slot: i64,
) -> Result<u64, tokio_postgres::Error> {
    let rid = Ulid::new();
    let s = BASE + slot * HOUR;
    let e = s + HOUR;
    client
        .execute(
            &format!(
                r#"INSERT INTO reservations (id, vehicle_id, start, "end") VALUES ('{rid}', '{vid}', {s}, {e})"#
            ),
            &[],
        )
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let vid = add_vehicle(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        reserve(&client, vid, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let vid = add_vehicle(&client).await;
            for j in 0..n_per_task {
                reserve(&client, vid, j).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} vehicles x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_checks_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let vid = add_vehicle(&setup).await;
    for i in 0..500 {
        reserve(&setup, vid, i * 2).await.unwrap();
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let own = add_vehicle(&client).await;
            let mut slot = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = reserve(&client, own, slot).await;
                slot += 1;
            }
        }));
    }

    let n_readers = 10;
    let checks_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(checks_per_reader);
            for i in 0..checks_per_reader {
                let s = BASE + ((r * checks_per_reader + i) % 1000) as i64 * HOUR;
                let e = s + 3 * HOUR;
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM conflicts WHERE vehicle_id = '{vid}' AND start = {s} AND "end" = {e}"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("conflict check", &mut all);
}

/// Many dispatchers grab the same slot on the same vehicle; exactly one
/// may win each round.
async fn phase4_contention(host: &str, port: u16) {
    let rounds = 50;
    let contenders = 20;
    let setup = connect(host, port).await;
    let vid = add_vehicle(&setup).await;
    drop(setup);

    let mut clients = Vec::with_capacity(contenders);
    for _ in 0..contenders {
        clients.push(Arc::new(connect(host, port).await));
    }

    let mut double_bookings = 0;
    let start = Instant::now();
    for round in 0..rounds {
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for client in &clients {
            let client = client.clone();
            let winners = winners.clone();
            handles.push(tokio::spawn(async move {
                if reserve(&client, vid, round).await.is_ok() {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        if winners.load(Ordering::Relaxed) != 1 {
            double_bookings += 1;
        }
    }
    println!(
        "  {rounds} rounds x {contenders} contenders in {:.2}s, rounds without exactly one winner: {double_bookings}",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("FUHRPARK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FUHRPARK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FUHRPARK_PORT");

    println!("=== fuhrpark stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent writes, one vehicle per client");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] conflict-check latency under write load");
    phase3_checks_under_load(&host, port).await;

    println!("\n[phase 4] same-slot contention");
    phase4_contention(&host, port).await;
}
