use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use rentcar::engine::Engine;
use rentcar::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentcar_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("rental.wal")).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("rental")
        .user("rental");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn insert_nyc_car(client: &Client) -> String {
    let rows = data_rows(
        client
            .simple_query(
                "INSERT INTO cars (company, doors, big_luggage, small_luggage, seats, air_conditioner, min_age, price, locations, car_group, description) \
                 VALUES ('Kia', 4, 1, 2, 5, true, 100, 35, 'NYC,Boston', 14, 'Picanto') RETURNING id",
            )
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    rows[0].get("id").unwrap().to_string()
}

fn booking_sql(car_id: &str, from: &str, to: &str) -> String {
    format!(
        "INSERT INTO bookings (car_id, from_date, to_date, location, extras, discounts, age_group, car_group) \
         VALUES ('{car_id}', '{from}', '{to}', 'NYC', 'GPS', '', '130', 14) RETURNING id"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn car_roundtrip_over_simple_protocol() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let car_id = insert_nyc_car(&client).await;
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM cars WHERE id = '{car_id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("company"), Some("Kia"));
    assert_eq!(rows[0].get("seats"), Some("5"));
    assert_eq!(rows[0].get("air_conditioner"), Some("t"));
    assert_eq!(rows[0].get("locations"), Some("NYC,Boston"));

    client
        .batch_execute(&format!("UPDATE cars SET price = 40 WHERE id = '{car_id}'"))
        .await
        .unwrap();
    let rows = data_rows(client.simple_query("SELECT * FROM cars").await.unwrap());
    assert_eq!(rows[0].get("price"), Some("40"));
}

#[tokio::test]
async fn overlapping_booking_is_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let car_id = insert_nyc_car(&client).await;

    let rows = data_rows(
        client
            .simple_query(&booking_sql(&car_id, "2022-01-15T15:13:30Z", "2022-01-17T15:13:30Z"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);

    let err = client
        .simple_query(&booking_sql(&car_id, "2022-01-16T00:00:00Z", "2022-01-18T00:00:00Z"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Touching intervals do not overlap.
    client
        .simple_query(&booking_sql(&car_id, "2022-01-17T15:13:30Z", "2022-01-19T00:00:00Z"))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE car_id = '{car_id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    assert!(rows[0].get("details").unwrap().contains("Kia"));
}

#[tokio::test]
async fn policy_and_lookup_errors_map_to_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let car_id = insert_nyc_car(&client).await;

    // Age group below the car's minimum.
    let sql = booking_sql(&car_id, "2022-01-15T15:13:30Z", "2022-01-16T15:13:30Z")
        .replace("'130'", "'50'");
    let err = client.simple_query(&sql).await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .simple_query(&booking_sql(
            &Ulid::new().to_string(),
            "2022-01-15T15:13:30Z",
            "2022-01-16T15:13:30Z",
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    client
        .simple_query(&booking_sql(&car_id, "2022-01-15T15:13:30Z", "2022-01-16T15:13:30Z"))
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("DELETE FROM cars WHERE id = '{car_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23503");

    // Selecting by an unknown id is an empty result, not an error.
    let unknown = Ulid::new();
    for sql in [
        format!("SELECT * FROM cars WHERE id = '{unknown}'"),
        format!("SELECT * FROM bookings WHERE id = '{unknown}'"),
        format!("SELECT * FROM bookings WHERE car_id = '{unknown}'"),
    ] {
        assert!(data_rows(client.simple_query(&sql).await.unwrap()).is_empty());
    }

    let err = client
        .batch_execute("SELECT * FROM fleet")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn availability_and_search() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let car_id = insert_nyc_car(&client).await;
    client
        .simple_query(&booking_sql(&car_id, "2022-01-15T00:00:00Z", "2022-01-20T00:00:00Z"))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE car_id = '{car_id}' \
                 AND from_date = '2022-01-18T00:00:00Z' AND to_date = '2022-01-22T00:00:00Z'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("available"), Some("f"));

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE car_id = '{car_id}' AND from_date = '2022-01-20T00:00:00Z'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("available"), Some("t"));
    assert_eq!(rows[0].get("to_date"), None);

    let rows = data_rows(
        client
            .simple_query("SELECT * FROM car_search WHERE location IN ('Boston', 'Haifa') AND age = '100'")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(car_id.as_str()));

    let rows = data_rows(
        client
            .simple_query(
                "SELECT * FROM car_search WHERE location = 'NYC' \
                 AND from_date = '2022-01-16T00:00:00Z' AND to_date = '2022-01-17T00:00:00Z'",
            )
            .await
            .unwrap(),
    );
    assert!(rows.is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let inserted = client
        .execute(
            "INSERT INTO cars (company, doors, big_luggage, small_luggage, seats, air_conditioner, min_age, price, locations, car_group) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[&"O'Neil Motors", &"2", &"0", &"1", &"2", &"f", &"25", &"80", &"Eilat", &"7"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = client
        .query("SELECT * FROM car_search WHERE location = $1", &[&"Eilat"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let company: &str = rows[0].get("company");
    let seats: i32 = rows[0].get("seats");
    let air_conditioner: bool = rows[0].get("air_conditioner");
    assert_eq!(company, "O'Neil Motors");
    assert_eq!(seats, 2);
    assert!(!air_conditioner);

    let car_id: &str = rows[0].get("id");
    let rows = client
        .query(
            "SELECT * FROM availability WHERE car_id = $1 AND from_date = $2 AND to_date = $3",
            &[&car_id, &"2022-03-01T00:00:00Z", &"2022-03-02T00:00:00Z"],
        )
        .await
        .unwrap();
    let available: bool = rows[0].get("available");
    assert!(available);
}

#[tokio::test]
async fn committed_state_visible_through_engine() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let car_id = insert_nyc_car(&client).await;
    let booking = data_rows(
        client
            .simple_query(&booking_sql(&car_id, "2022-01-15T15:13:30Z", "2022-01-16T15:13:30Z"))
            .await
            .unwrap(),
    );
    let booking_id = Ulid::from_string(booking[0].get("id").unwrap()).unwrap();

    let stored = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(stored.car_id.to_string(), car_id);
    assert_eq!(stored.extras, vec!["GPS"]);

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    assert!(engine.get_booking(booking_id).await.is_err());
}
