use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotwise::auth::SlotwiseAuthSource;
use slotwise::clock::FixedClock;
use slotwise::config::Config;
use slotwise::engine::EngineSettings;
use slotwise::notify::LogNotifier;
use slotwise::tenant::TenantManager;
use slotwise::wire;

const PASSWORD: &str = "slotwise";
const AUTHORITY_PASSWORD: &str = "slotwise-admin";

// ── Test infrastructure ──────────────────────────────────────

/// Server whose clock is pinned to midnight UTC on Monday 2024-02-05.
async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let settings = EngineSettings {
        clock: Arc::new(FixedClock::at_date(date(2024, 2, 5))),
        ..EngineSettings::default()
    };
    let tm = Arc::new(TenantManager::new(dir, 1000, settings, Arc::new(LogNotifier)));
    let auth = Arc::new(SlotwiseAuthSource::new(&Config {
        authority_password: Some(AUTHORITY_PASSWORD.into()),
        ..Config::default()
    }));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, auth, None).await;
            });
        }
    });

    addr
}

fn pg_config(addr: SocketAddr, user: &str, password: &str) -> PgConfig {
    let mut config = PgConfig::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password(password);
    config
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let password = if user == "admin" { AUTHORITY_PASSWORD } else { PASSWORD };
    let (client, connection) = pg_config(addr, user, password).connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn ms(day: NaiveDate, hour: u32, minute: u32) -> i64 {
    day.and_hms_opt(hour, minute, 0).unwrap().and_utc().timestamp_millis()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Provider with two Monday slots, 10:00 and 11:00.
async fn seed_provider(admin: &Client) -> Ulid {
    let pid = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO providers (id, name) VALUES ('{pid}', 'Dr. Rao');
             INSERT INTO weekly_slots (provider_id, weekday, start_time, end_time) VALUES
                ('{pid}', 'mon', '10:00', '10:30'),
                ('{pid}', 'mon', '11:00', '11:30');"
        ))
        .await
        .unwrap();
    pid
}

async fn book(client: &Client, pid: Ulid, start: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, provider_id, start, "end") VALUES ('{id}', '{pid}', {start}, {})"#,
            start + 1_800_000
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_and_availability_round_trip() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;

    let providers = rows(&admin, "SELECT * FROM providers").await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].get("name"), Some("Dr. Rao"));

    let weekly = rows(&admin, &format!("SELECT * FROM weekly_slots WHERE provider_id = '{pid}'")).await;
    assert_eq!(weekly.len(), 2);

    // Close the second Monday
    admin
        .batch_execute(&format!(
            "INSERT INTO date_slots (provider_id, date, start_time, end_time) VALUES ('{pid}', '2024-02-12', NULL, NULL)"
        ))
        .await
        .unwrap();

    let avail = rows(
        &admin,
        &format!(
            "SELECT * FROM availability WHERE provider_id = '{pid}' AND date >= '2024-02-05' AND date <= '2024-02-12'"
        ),
    )
    .await;
    let dates: Vec<&str> = avail.iter().filter_map(|r| r.get("date")).collect();
    assert!(dates.contains(&"2024-02-05"));
    assert!(!dates.contains(&"2024-02-12"));

    let today = rows(&admin, &format!("SELECT * FROM today_availability WHERE provider_id = '{pid}'")).await;
    assert_eq!(today.len(), 1);
    assert_eq!(today[0].get("date"), Some("2024-02-05"));
    assert!(today[0].get("slots").unwrap().contains("\"10:00\""));

    let overrides = rows(&admin, &format!("SELECT * FROM date_slots WHERE provider_id = '{pid}'")).await;
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].get("start_time"), None);
}

#[tokio::test]
async fn authority_login_needs_its_own_password() {
    let addr = start_test_server().await;
    assert!(pg_config(addr, "admin", PASSWORD).connect(NoTls).await.is_err());
    assert!(pg_config(addr, "s1", AUTHORITY_PASSWORD).connect(NoTls).await.is_err());
    connect(addr, "admin").await;
}

#[tokio::test]
async fn second_booking_of_a_slot_conflicts() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;
    let s1 = connect(addr, "s1").await;
    let s2 = connect(addr, "s2").await;

    let ten = ms(date(2024, 2, 5), 10, 0);
    book(&s1, pid, ten).await.unwrap();

    let err = book(&s2, pid, ten).await.unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "23P01");
    assert!(db.message().contains("slot_taken"));

    // The taken slot is gone from today's availability
    let today = rows(&s2, &format!("SELECT * FROM today_availability WHERE provider_id = '{pid}'")).await;
    let slots = today[0].get("slots").unwrap();
    assert!(!slots.contains("\"10:00\""));
    assert!(slots.contains("\"11:00\""));
}

#[tokio::test]
async fn requester_cap_and_cooldown() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;
    let s1 = connect(addr, "s1").await;

    book(&s1, pid, ms(date(2024, 2, 5), 10, 0)).await.unwrap();
    book(&s1, pid, ms(date(2024, 2, 12), 10, 0)).await.unwrap();

    let err = book(&s1, pid, ms(date(2024, 2, 19), 10, 0)).await.unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "P0001");
    assert!(db.message().contains("booking_limit"));
    assert!(db.message().contains("2024-02-06"));

    // Capped requester sees no dates, only the cooldown
    let avail = rows(&s1, &format!("SELECT * FROM availability WHERE provider_id = '{pid}'")).await;
    assert_eq!(avail.len(), 1);
    assert_eq!(avail[0].get("date"), None);
    assert_eq!(avail[0].get("cooldown_until"), Some("2024-02-06"));

    let quota = rows(&s1, "SELECT * FROM booking_quota WHERE requester_id = 's1'").await;
    assert_eq!(quota[0].get("active_count"), Some("2"));
    assert_eq!(quota[0].get("blocked_until"), Some("2024-02-06"));

    // Today's view is capped the same way
    let today = rows(&s1, &format!("SELECT * FROM today_availability WHERE provider_id = '{pid}'")).await;
    assert_eq!(today.len(), 1);
    assert_eq!(today[0].get("date"), Some("2024-02-05"));
    assert_eq!(today[0].get("slots"), Some("[]"));
    assert_eq!(today[0].get("cooldown_until"), Some("2024-02-06"));
    let today = rows(&admin, &format!("SELECT * FROM today_availability WHERE provider_id = '{pid}'")).await;
    assert!(today[0].get("slots").unwrap().contains("\"11:00\""));
    assert_eq!(today[0].get("cooldown_until"), None);

    // Guests booked by the authority are not capped
    book(&admin, pid, ms(date(2024, 2, 19), 10, 0)).await.unwrap();
}

#[tokio::test]
async fn approval_requires_authority() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;
    let s1 = connect(addr, "s1").await;

    let id = book(&s1, pid, ms(date(2024, 2, 5), 11, 0)).await.unwrap();

    let approve = format!("UPDATE bookings SET status = 'approved' WHERE id = '{id}'");
    assert_eq!(error_code(&s1, &approve).await, "42501");
    admin.batch_execute(&approve).await.unwrap();

    let listed = rows(&s1, &format!("SELECT * FROM bookings WHERE provider_id = '{pid}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("status"), Some("approved"));
    assert_eq!(listed[0].get("requester_id"), Some("s1"));

    admin
        .batch_execute(&format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(error_code(&admin, &approve).await, "55000");
}

#[tokio::test]
async fn requesters_cannot_touch_schedules_or_others() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;
    let s1 = connect(addr, "s1").await;
    let s2 = connect(addr, "s2").await;

    let sql = format!(
        "INSERT INTO weekly_slots (provider_id, weekday, start_time, end_time) VALUES ('{pid}', 'tue', '09:00', '09:30')"
    );
    assert_eq!(error_code(&s1, &sql).await, "42501");

    let start = ms(date(2024, 2, 5), 10, 0);
    let sql = format!(
        r#"INSERT INTO bookings (id, provider_id, start, "end", requester_id) VALUES ('{}', '{pid}', {start}, {}, 's2')"#,
        Ulid::new(),
        start + 1_800_000
    );
    assert_eq!(error_code(&s1, &sql).await, "42501");

    let id = book(&s1, pid, start).await.unwrap();
    assert_eq!(error_code(&s2, &format!("DELETE FROM bookings WHERE id = '{id}'")).await, "42501");
    s1.batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'")).await.unwrap();
    // Release is idempotent
    s1.batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'")).await.unwrap();
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let pid = seed_provider(&admin).await;

    let pid_text = pid.to_string();
    let rows = admin
        .query(
            "SELECT * FROM weekly_slots WHERE provider_id = $1",
            &[&pid_text],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let start: &str = rows[0].get("start_time");
    assert_eq!(start, "10:00");
}
