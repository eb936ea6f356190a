use std::io::Write;
use std::net::TcpStream;

use crate::*;

/// Live sessions show up in the status API and their counters are flushed
/// by the reconciler while the feeder stays connected.
#[test]
fn test_status_api_and_periodic_flush() {
    if !skip_unless_built() {
        return;
    }

    let upstream = FakeAggregator::start();
    let daemon = Daemon::spawn(upstream.port, 1).expect("daemon should start");
    let frames = sample_frames();

    let mut feeder = TcpStream::connect(daemon.listen).unwrap();
    feeder.write_all(&frames).unwrap();

    let listed = wait_until(Duration::from_secs(5), || {
        api_get(daemon.api_port, "/api/sessions")
            .map(|v| {
                v["sessions"]
                    .as_array()
                    .map(|s| s.len() == 1 && s[0]["bytes"] == frames.len())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    });
    assert!(listed, "session not listed with its byte count");

    let sessions = api_get(daemon.api_port, "/api/sessions").unwrap();
    assert_eq!(sessions["sessions"][0]["origin"], "public");
    assert_eq!(sessions["sessions"][0]["messages"], 4);

    let status = api_get(daemon.api_port, "/api/status").unwrap();
    assert_eq!(status["live_sessions"], 1);
    assert_eq!(status["totals"]["positions"], 1);
    assert!(status["caches"].is_array());

    let refreshed = api_post(daemon.api_port, "/api/caches/refresh").unwrap();
    assert!(refreshed["invalidated"].is_number());

    // The reconciler flushes while the feeder is still connected.
    let db = daemon.db();
    let flushed = wait_until(Duration::from_secs(5), || {
        db.query_row(
            "SELECT bytes_received FROM feeders WHERE ip_address = '127.0.0.1'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|b| b == frames.len() as i64)
        .unwrap_or(false)
    });
    assert!(flushed, "reconciler did not flush live counters");

    drop(feeder);
}
