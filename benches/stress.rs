use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("root")
        .password("quorum");

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn setup_rooms(client: &tokio_postgres::Client, count: usize) -> Vec<Ulid> {
    let mut rooms = Vec::new();
    for i in 0..count {
        let room_id = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO rooms (id, name, capacity) VALUES ('{room_id}', 'Room {i}', 12)"
            ))
            .await
            .unwrap();
        rooms.push(room_id);
    }
    println!("  created {count} rooms");
    rooms
}

#[tokio::main]
async fn main() {
    let host = std::env::var("QUORUM_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("QUORUM_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5433);
    let n: usize = std::env::var("QUORUM_BENCH_N")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    println!("quorum stress bench → {host}:{port}, n={n}");

    let client = connect(&host, port).await;
    let rooms = setup_rooms(&client, 10).await;

    let base = Utc.with_ymd_and_hms(2031, 1, 6, 8, 0, 0).unwrap();

    // Non-conflicting booking inserts: every booking gets its own 30-minute
    // slot, round-robin across rooms.
    let mut insert_latencies = Vec::with_capacity(n);
    let mut booking_ids = Vec::with_capacity(n);
    for i in 0..n {
        let room_id = rooms[i % rooms.len()];
        let slot = base + ChronoDuration::minutes(30 * (i / rooms.len()) as i64);
        let end = slot + ChronoDuration::minutes(30);
        let id = Ulid::new();
        let sql = format!(
            r#"INSERT INTO bookings (id, room_id, start, "end", title, participants) VALUES ('{id}', '{room_id}', '{}', '{}', 'bench', 4)"#,
            slot.to_rfc3339(),
            end.to_rfc3339(),
        );
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        insert_latencies.push(t.elapsed());
        booking_ids.push(id);
    }
    print_latency("insert booking", &mut insert_latencies);

    // Conflicting inserts: every request targets an occupied slot and is
    // rejected by the overlap check.
    let mut conflict_latencies = Vec::with_capacity(n / 10);
    for i in 0..n / 10 {
        let room_id = rooms[i % rooms.len()];
        let slot = base + ChronoDuration::minutes(15);
        let end = slot + ChronoDuration::minutes(15);
        let id = Ulid::new();
        let sql = format!(
            r#"INSERT INTO bookings (id, room_id, start, "end", title, participants) VALUES ('{id}', '{room_id}', '{}', '{}', 'bench', 4)"#,
            slot.to_rfc3339(),
            end.to_rfc3339(),
        );
        let t = Instant::now();
        let _ = client.batch_execute(&sql).await;
        conflict_latencies.push(t.elapsed());
    }
    print_latency("rejected conflict", &mut conflict_latencies);

    // Calendar window reads across the booked range.
    let mut select_latencies = Vec::with_capacity(n / 10);
    let window_start = base.to_rfc3339();
    let window_end = (base + ChronoDuration::days(7)).to_rfc3339();
    for i in 0..n / 10 {
        let room_id = rooms[i % rooms.len()];
        let sql = format!(
            r#"SELECT * FROM bookings WHERE room_id = '{room_id}' AND start >= '{window_start}' AND "end" <= '{window_end}'"#
        );
        let t = Instant::now();
        client.simple_query(&sql).await.unwrap();
        select_latencies.push(t.elapsed());
    }
    print_latency("calendar window", &mut select_latencies);

    // Cancellations.
    let mut cancel_latencies = Vec::with_capacity(n / 10);
    for id in booking_ids.iter().take(n / 10) {
        let sql = format!("DELETE FROM bookings WHERE id = '{id}'");
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        cancel_latencies.push(t.elapsed());
    }
    print_latency("cancel booking", &mut cancel_latencies);

    println!("done");
}
