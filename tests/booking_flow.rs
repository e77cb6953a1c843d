use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use quorum::tenant::TenantManager;
use quorum::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("quorum_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 15));
    let admins: Arc<HashSet<String>> = Arc::new(["root".to_string()].into_iter().collect());

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            let admins = admins.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "quorum".to_string(), admins, None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(
    addr: SocketAddr,
    user: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("quorum");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_room(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let room_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, capacity) VALUES ('{room_id}', 'Room A', {capacity})"
        ))
        .await
        .unwrap();
    room_id
}

fn booking_insert(room_id: Ulid, start: &str, end: &str, participants: u32) -> (Ulid, String) {
    let id = Ulid::new();
    let sql = format!(
        r#"INSERT INTO bookings (id, room_id, start, "end", title, participants) VALUES ('{id}', '{room_id}', '{start}', '{end}', 'sync', {participants})"#
    );
    (id, sql)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_room_and_read_it_back() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr, "root").await;

    let room_id = create_room(&client, 8).await;

    let rows = client.simple_query("SELECT * FROM rooms").await.unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(room_id.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("Room A"));
    assert_eq!(rows[0].get(2), Some("8"));
}

#[tokio::test]
async fn room_registry_requires_admin() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr, "ann").await;

    let room_id = Ulid::new();
    let result = client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, capacity) VALUES ('{room_id}', 'Rogue', 4)"
        ))
        .await;
    let err = result.err().expect("non-admin room creation must fail");
    assert!(err.to_string().contains("permission denied"), "{err}");
}

#[tokio::test]
async fn booking_auto_approves_and_lists() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let (_, sql) = booking_insert(room_id, "2030-06-03T10:00:00Z", "2030-06-03T11:00:00Z", 4);
    ann.batch_execute(&sql).await.unwrap();

    let rows = ann
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE room_id = '{room_id}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(3), Some("ann")); // owner
    assert_eq!(rows[0].get(8), Some("approved")); // status
}

#[tokio::test]
async fn conflicting_booking_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let (_, first) = booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    ann.batch_execute(&first).await.unwrap();

    let (_, second) = booking_insert(room_id, "2030-06-03T09:30:00Z", "2030-06-03T09:45:00Z", 4);
    let err = ann.batch_execute(&second).await.err().expect("overlap must fail");
    assert!(err.to_string().contains("conflicts"), "{err}");

    // Nothing partial: still one booking.
    let rows = ann
        .simple_query(&format!("SELECT * FROM bookings WHERE room_id = '{room_id}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 1);
}

#[tokio::test]
async fn recurring_insert_reports_occurrence_count() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let id = Ulid::new();
    let sql = format!(
        r#"INSERT INTO bookings (id, room_id, start, "end", title, participants, chairman, department, description, extra_requests, notes, equipment, repeat, repeat_until) VALUES ('{id}', '{room_id}', '2030-06-03T09:00:00Z', '2030-06-03T10:00:00Z', 'standup', 4, '', '', '', '', '', '', 'weekly', '2030-06-24')"#
    );
    let rows = ann.execute(&sql, &[]).await.unwrap();
    assert_eq!(rows, 4);
}

#[tokio::test]
async fn approval_workflow_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;
    let (kim, _) = connect(addr, "kim").await;

    // Room with a designated approver.
    let room_id = Ulid::new();
    root.batch_execute(&format!(
        "INSERT INTO rooms (id, name, capacity, location, approver) VALUES ('{room_id}', 'Guarded', 8, NULL, 'kim')"
    ))
    .await
    .unwrap();

    // A booking with notes goes to pending.
    let booking_id = Ulid::new();
    ann.batch_execute(&format!(
        r#"INSERT INTO bookings (id, room_id, start, "end", title, participants, chairman, department, description, extra_requests, notes) VALUES ('{booking_id}', '{room_id}', '2030-06-03T09:00:00Z', '2030-06-03T10:00:00Z', 'review', 4, '', '', '', '', 'needs sign-off')"#
    ))
    .await
    .unwrap();

    let rows = ann
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE room_id = '{room_id}' AND status = 'pending'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 1);

    // A stranger cannot decide it.
    let denied = ann
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'approved' WHERE id = '{booking_id}'"
        ))
        .await;
    assert!(denied.is_err());

    // The designated approver can.
    kim.batch_execute(&format!(
        "UPDATE bookings SET status = 'approved' WHERE id = '{booking_id}'"
    ))
    .await
    .unwrap();

    let rows = ann
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE room_id = '{room_id}' AND status = 'approved'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 1);
}

#[tokio::test]
async fn reschedule_over_own_slot_succeeds() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let (booking_id, sql) =
        booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    ann.batch_execute(&sql).await.unwrap();

    ann.batch_execute(&format!(
        r#"UPDATE bookings SET start = '2030-06-03T09:30:00Z', "end" = '2030-06-03T10:30:00Z' WHERE id = '{booking_id}'"#
    ))
    .await
    .unwrap();

    let rows = ann
        .simple_query(&format!("SELECT * FROM bookings WHERE room_id = '{room_id}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(4), Some("2030-06-03T09:30:00+00:00"));
}

#[tokio::test]
async fn cancellation_frees_the_slot() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let (booking_id, sql) =
        booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    ann.batch_execute(&sql).await.unwrap();

    ann.batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();

    let (_, again) = booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    ann.batch_execute(&again).await.unwrap();
}

// Notifications are delivered ahead of the next query response on the
// listening connection, so subscribers poke with any cheap query after
// mutations happen elsewhere.
#[tokio::test]
async fn listen_delivers_booking_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, mut rx_ann) = connect(addr, "ann").await;
    let (bob, _) = connect(addr, "bob").await;

    let room_id = create_room(&root, 8).await;
    ann.batch_execute(&format!("LISTEN room_{room_id}")).await.unwrap();

    let (_, sql) = booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    bob.batch_execute(&sql).await.unwrap();

    // Poke the listening connection to flush its subscription buffer.
    ann.simple_query("SELECT * FROM rooms").await.unwrap();

    let notif = recv_notification(&mut rx_ann, Duration::from_secs(5))
        .await
        .expect("expected a created notification");
    assert_eq!(notif.channel(), format!("room_{room_id}"));

    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["kind"], "created");
    assert_eq!(payload["requester"], "bob");
    assert_eq!(payload["status"], "approved");
    assert_eq!(payload["room"], "Room A");
}

#[tokio::test]
async fn listen_only_covers_subscribed_room() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, mut rx_ann) = connect(addr, "ann").await;
    let (bob, _) = connect(addr, "bob").await;

    let room_a = create_room(&root, 8).await;
    let room_b = create_room(&root, 8).await;
    ann.batch_execute(&format!("LISTEN room_{room_a}")).await.unwrap();

    // Activity in the other room only.
    let (_, sql) = booking_insert(room_b, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    bob.batch_execute(&sql).await.unwrap();

    ann.simple_query("SELECT * FROM rooms").await.unwrap();
    let notif = recv_notification(&mut rx_ann, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "unsubscribed room must stay silent");
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, mut rx_ann) = connect(addr, "ann").await;
    let (bob, _) = connect(addr, "bob").await;

    let room_id = create_room(&root, 8).await;
    ann.batch_execute(&format!("LISTEN room_{room_id}")).await.unwrap();
    ann.batch_execute(&format!("UNLISTEN room_{room_id}")).await.unwrap();

    let (_, sql) = booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    bob.batch_execute(&sql).await.unwrap();

    ann.simple_query("SELECT * FROM rooms").await.unwrap();
    let notif = recv_notification(&mut rx_ann, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "no notifications after UNLISTEN");
}

#[tokio::test]
async fn status_change_notification_carries_transition() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, mut rx_ann) = connect(addr, "ann").await;

    let room_id = create_room(&root, 30).await;

    // Pending booking (large meeting).
    let booking_id = Ulid::new();
    ann.batch_execute(&format!(
        r#"INSERT INTO bookings (id, room_id, start, "end", title, participants) VALUES ('{booking_id}', '{room_id}', '2030-06-03T09:00:00Z', '2030-06-03T10:00:00Z', 'all hands', 20)"#
    ))
    .await
    .unwrap();

    ann.batch_execute(&format!("LISTEN room_{room_id}")).await.unwrap();

    // Admin approves (room has no designated approver).
    root.batch_execute(&format!(
        "UPDATE bookings SET status = 'approved' WHERE id = '{booking_id}'"
    ))
    .await
    .unwrap();

    ann.simple_query("SELECT * FROM rooms").await.unwrap();
    let notif = recv_notification(&mut rx_ann, Duration::from_secs(5))
        .await
        .expect("expected a status_changed notification");
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["kind"], "status_changed");
    assert_eq!(payload["old"], "pending");
    assert_eq!(payload["new"], "approved");
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (root, _rx) = connect(addr, "root").await;

    let room_id = create_room(&root, 8).await;
    root.batch_execute(&format!("LISTEN room_{room_id}")).await.unwrap();

    // Drop the client — should not panic or leak.
    drop(root);
    drop(_rx);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Another connection still works fine.
    let (ann, _) = connect(addr, "ann").await;
    let (_, sql) = booking_insert(room_id, "2030-06-03T09:00:00Z", "2030-06-03T10:00:00Z", 4);
    ann.batch_execute(&sql).await.unwrap();
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let (root, _) = connect(addr, "root").await;
    let (ann, _) = connect(addr, "ann").await;

    let room_id = create_room(&root, 8).await;
    let booking_id = Ulid::new();
    let sql = r#"INSERT INTO bookings (id, room_id, start, "end", title, participants) VALUES ($1, $2, $3, $4, $5, '3')"#;
    let rows = ann
        .execute(
            sql,
            &[
                &booking_id.to_string(),
                &room_id.to_string(),
                &"2030-06-03T09:00:00Z",
                &"2030-06-03T10:00:00Z",
                &"parameterized",
            ],
        )
        .await
        .unwrap();
    assert_eq!(rows, 1);
}
