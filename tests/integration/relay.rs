use std::io::{Read, Write};
use std::net::TcpStream;

use crate::*;

/// A feeder sends frames and hangs up: the aggregator gets every byte and
/// the store records one closed connection with the full counters.
#[test]
fn test_relay_and_disconnect_record() {
    if !skip_unless_built() {
        return;
    }

    let upstream = FakeAggregator::start();
    let daemon = Daemon::spawn(upstream.port, 30).expect("daemon should start");
    let frames = sample_frames();

    {
        let mut feeder = TcpStream::connect(daemon.listen).unwrap();
        feeder.write_all(&frames).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || upstream.received() == frames),
        "aggregator did not receive the feeder's frames"
    );

    let db = daemon.db();
    let closed = wait_until(Duration::from_secs(5), || {
        db.query_row(
            "SELECT COUNT(*) FROM connections WHERE disconnected_at IS NOT NULL",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n == 1)
        .unwrap_or(false)
    });
    assert!(closed, "disconnect was not recorded");

    let (status, bytes, messages, positions): (String, i64, i64, i64) = db
        .query_row(
            "SELECT status, bytes_received, messages_received, positions_received
             FROM feeders WHERE ip_address = '127.0.0.1'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(status, "offline");
    assert_eq!(bytes, frames.len() as i64);
    assert_eq!(messages, 4);
    assert_eq!(positions, 1);

    let transferred: i64 = db
        .query_row("SELECT bytes_transferred FROM connections", [], |row| row.get(0))
        .unwrap();
    assert_eq!(transferred, frames.len() as i64);
}

/// With no aggregator listening the feeder is still recorded and closed.
#[test]
fn test_upstream_unavailable() {
    if !skip_unless_built() {
        return;
    }

    let dead_port = free_port();
    let daemon = Daemon::spawn(dead_port, 30).expect("daemon should start");

    let mut feeder = TcpStream::connect(daemon.listen).unwrap();
    feeder
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    let n = feeder.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "relay should close the feeder connection");

    let db = daemon.db();
    assert!(wait_until(Duration::from_secs(5), || {
        db.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE event_type = 'feeder_disconnected'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n == 1)
        .unwrap_or(false)
    }));
}
