use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{Duration as Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use gymbook::clock::ManualClock;
use gymbook::config::EngineConfig;
use gymbook::engine::{BlockRequest, BookingRequest, CallerContext, Engine, TimedRequest};
use gymbook::model::{ClassType, SessionSlot};
use gymbook::notify::NotifyHub;
use gymbook::services::{InMemoryDirectory, MembershipQuota, Services, TrainerProfile};
use gymbook::time;

/// Ten 1h sessions a day, 90 minutes apart so the 10-minute buffer never bites.
const SLOTS_PER_DAY: u32 = 10;

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

struct Bench {
    engine: Arc<Engine>,
    dir: Arc<InMemoryDirectory>,
    first_day: NaiveDate,
}

impl Bench {
    fn new(first_day: NaiveDate) -> Self {
        let clock = Arc::new(ManualClock::new(time::at(first_day, time::clock(6, 0))));
        let dir = Arc::new(InMemoryDirectory::new(clock.clone()));
        let services = Services {
            membership: dir.clone(),
            trainers: dir.clone(),
            notifications: Arc::new(NotifyHub::new()),
            clock,
        };
        let config = EngineConfig {
            booking_horizon_days: 366,
            ..EngineConfig::default()
        };
        let wal_dir = std::env::temp_dir().join("gymbook_bench");
        std::fs::create_dir_all(&wal_dir).expect("create bench dir");
        let wal_path = wal_dir.join(format!("{}.wal", Ulid::new()));
        let engine = Engine::new(wal_path, services, config).expect("open engine");
        Self {
            engine: Arc::new(engine),
            dir,
            first_day,
        }
    }

    fn trainer(&self, name: String) -> Ulid {
        let id = Ulid::new();
        self.dir.put_trainer(TrainerProfile {
            id,
            name,
            specialization: ClassType::Boxing,
            active: true,
        });
        id
    }

    fn member(&self) -> Ulid {
        let user_id = Ulid::new();
        self.dir.put_membership(MembershipQuota {
            user_id,
            weekly_hour_limit: Some(168),
            plan_name: "Bench".into(),
            start_date: self.first_day,
            end_date: self.first_day + Days::days(400),
            grace_days: 0,
        });
        user_id
    }
}

/// The i-th free slot counted from `first_day`.
fn slot(first_day: NaiveDate, i: u32) -> (String, String) {
    let date = first_day + Days::days((i / SLOTS_PER_DAY) as i64);
    let minutes = 7 * 60 + (i % SLOTS_PER_DAY) * 90;
    let start = NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0).unwrap_or(time::opening_time());
    let end = start + Days::hours(1);
    let fmt = |t: NaiveTime| format!("{} {}", date.format("%Y-%m-%d"), t.format("%H:%M"));
    (fmt(start), fmt(end))
}

fn request(user: Ulid, trainer: Ulid, (start, end): (String, String)) -> BookingRequest {
    BookingRequest::Timed(TimedRequest {
        user_id: user,
        trainer_id: trainer,
        class_type: ClassType::Boxing,
        start,
        end,
        exclude_booking_id: None,
    })
}

async fn phase1_sequential(bench: &Bench) {
    let trainer = bench.trainer("Sequential".into());
    let user = bench.member();
    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let mut rejected = 0;

    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        let outcome = bench
            .engine
            .create_booking(request(user, trainer, slot(bench.first_day, i)), CallerContext::admin_override())
            .await
            .expect("engine error");
        latencies.push(t.elapsed());
        if !outcome.is_valid() {
            rejected += 1;
        }
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} bookings ({rejected} rejected) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(bench: &Bench) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = bench.engine.clone();
        let trainer = bench.trainer(format!("Concurrent {i}"));
        let user = bench.member();
        let first_day = bench.first_day;
        handles.push(tokio::spawn(async move {
            let mut ok = 0;
            for j in 0..n_per_task {
                let outcome = engine
                    .create_booking(request(user, trainer, slot(first_day, j)), CallerContext::admin_override())
                    .await
                    .expect("engine error");
                if outcome.is_valid() {
                    ok += 1;
                }
            }
            ok
        }));
    }

    let mut approved = 0;
    for h in handles {
        approved += h.await.expect("task panicked");
    }
    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total ({approved} approved) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(bench: &Bench) {
    let trainer = bench.trainer("Readable".into());
    let user = bench.member();
    for i in 0..200 {
        let _ = bench
            .engine
            .create_booking(request(user, trainer, slot(bench.first_day, i)), CallerContext::admin_override())
            .await;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let engine = bench.engine.clone();
        let stop = stop.clone();
        let wtrainer = bench.trainer(format!("Writer {w}"));
        let wuser = bench.member();
        let first_day = bench.first_day;
        writers.push(tokio::spawn(async move {
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) && i < 3000 {
                let _ = engine
                    .create_booking(request(wuser, wtrainer, slot(first_day, i)), CallerContext::admin_override())
                    .await;
                i += 1;
            }
        }));
    }

    let n = 500;
    let mut day_latencies = Vec::with_capacity(n);
    let mut listing_latencies = Vec::with_capacity(n);
    for i in 0..n {
        let date = bench.first_day + Days::days((i % 20) as i64);
        let t = Instant::now();
        let _ = bench.engine.trainer_day(trainer, date, None).await;
        day_latencies.push(t.elapsed());

        let t = Instant::now();
        let _ = bench
            .engine
            .available_trainers(ClassType::Boxing, date, SessionSlot::Evening)
            .await;
        listing_latencies.push(t.elapsed());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("trainer_day latency", &mut day_latencies);
    print_latency("available_trainers latency", &mut listing_latencies);
}

async fn phase4_block_and_sweep(bench: &Bench) {
    let trainer = bench.trainer("Blocked".into());
    let date = bench.first_day + Days::days(1);
    let mut booked = 0;
    for i in 0..SLOTS_PER_DAY {
        let user = bench.member();
        let (start, end) = slot(date, i);
        let outcome = bench
            .engine
            .create_booking(request(user, trainer, (start, end)), CallerContext::member())
            .await
            .expect("engine error");
        if outcome.is_valid() {
            booked += 1;
        }
    }

    let t = Instant::now();
    let outcome = bench
        .engine
        .add_admin_block(
            BlockRequest {
                trainer_id: trainer,
                date,
                all_day: true,
                start: None,
                end: None,
                reason: Some("Bench".into()),
            },
            Some(Ulid::new()),
        )
        .await
        .expect("block failed");
    let block_elapsed = t.elapsed();

    let t = Instant::now();
    let restored = bench
        .engine
        .remove_admin_block(outcome.block_id)
        .await
        .expect("unblock failed");
    let unblock_elapsed = t.elapsed();

    let t = Instant::now();
    let swept = bench.engine.auto_cancel_expired_blocks().await.expect("sweep failed");
    let sweep_elapsed = t.elapsed();

    println!(
        "  {} booked, {} blocked in {:.3}ms, {} restored in {:.3}ms, sweep of {} trainers in {:.3}ms ({swept} cancelled)",
        booked,
        outcome.affected.len(),
        block_elapsed.as_secs_f64() * 1000.0,
        restored.len(),
        unblock_elapsed.as_secs_f64() * 1000.0,
        bench.engine.state.len(),
        sweep_elapsed.as_secs_f64() * 1000.0,
    );

    let t = Instant::now();
    bench.engine.compact_wal().await.expect("compaction failed");
    println!("  compacted WAL in {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);
}

#[tokio::main]
async fn main() {
    let first_day = std::env::var("GYMBOOK_BENCH_START")
        .ok()
        .and_then(|s| time::parse_date(&s).ok())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(2026, 1, 5).unwrap_or_default());

    println!("=== gymbook stress benchmark ===");
    println!("first bookable day: {first_day}\n");

    let bench = Bench::new(first_day);

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&bench).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&bench).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&bench).await;

    println!("\n[phase 4] block, restore, sweep");
    phase4_block_and_sweep(&bench).await;

    println!("\n=== benchmark complete ===");
}
